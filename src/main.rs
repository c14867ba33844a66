//! Binary entry point for the `mercount` command-line tool.

use clap::Parser;

use mercount::cli::args::{Cli, Cmd};
use mercount::cli::constants::{set_display_level, TOOL_NAME};

fn main() {
    let cli = Cli::parse();

    if cli.quiet {
        set_display_level(1);
    } else {
        set_display_level(2 + cli.verbose as u32);
    }

    let result = match &cli.command {
        Cmd::Count(a) => mercount::cli::count::run(a),
        Cmd::Merge(a) => mercount::cli::merge::run(a),
        Cmd::Stats(a) => mercount::cli::stats::run(a),
        Cmd::Dump(a) => mercount::cli::dump::run(a),
    };

    if let Err(e) = result {
        eprintln!("{}: {:#}", TOOL_NAME, e);
        std::process::exit(1);
    }
}
