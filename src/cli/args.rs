//! Command-line definitions for the `mercount` subcommands.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::cli::constants::DEFAULT_OUTPUT;
use crate::config::{DEFAULT_BUFFER_SIZE, DEFAULT_COUNTER_LEN, DEFAULT_REPROBE_LIMIT};

#[derive(Parser, Debug)]
#[command(
    name = "mercount",
    version,
    about = "Count k-mers in DNA sequence files",
    propagate_version = true
)]
pub struct Cli {
    /// Increase verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Errors only.
    #[arg(short = 'q', long = "quiet", global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Build a k-mer count database from sequence files
    Count(CountArgs),
    /// Merge count databases produced with identical parameters
    Merge(MergeArgs),
    /// Print the summary statistics of a database
    Stats(StatsArgs),
    /// Write the k-mer/count pairs of a database as text
    Dump(DumpArgs),
}

#[derive(Args, Debug)]
pub struct CountArgs {
    /// Length of mer (k)
    #[arg(short = 'm', long = "mer-len")]
    pub mer_len: usize,

    /// Initial hash table size (rounded up to a power of two)
    #[arg(short = 's', long = "size")]
    pub size: u64,

    /// Number of worker threads (0 = all cores)
    #[arg(short = 't', long = "threads", default_value_t = 0)]
    pub threads: usize,

    /// In-memory counter field width, in bits
    #[arg(short = 'c', long = "counter-len", default_value_t = DEFAULT_COUNTER_LEN)]
    pub counter_len: usize,

    /// Width of counters in the output database, in bytes
    #[arg(long = "out-counter-len", default_value_t = 4)]
    pub out_counter_len: usize,

    /// Output database path
    #[arg(short = 'o', long = "output", default_value = DEFAULT_OUTPUT)]
    pub output: PathBuf,

    /// Count both strands: store min(m, revcomp(m))
    #[arg(short = 'C', long = "canonical")]
    pub canonical: bool,

    /// Only count mers a pre-built Bloom counter has seen at least twice
    #[arg(long = "bf", value_name = "FILE")]
    pub bf: Option<PathBuf>,

    /// Only count mers occurring in these sequence files
    #[arg(long = "if", value_name = "FILE")]
    pub if_files: Vec<PathBuf>,

    /// Skip entries with count below this when dumping
    #[arg(short = 'L', long = "lower-count")]
    pub lower_count: Option<u64>,

    /// Skip entries with count above this when dumping
    #[arg(short = 'U', long = "upper-count")]
    pub upper_count: Option<u64>,

    /// Keep numbered intermediate files instead of merging them
    #[arg(long = "no-merge")]
    pub no_merge: bool,

    /// Never grow the table: dump to intermediate files when it fills
    #[arg(long = "disk")]
    pub disk: bool,

    /// Dump the raw block image instead of a compacted list
    #[arg(long = "raw", conflicts_with_all = ["disk", "lower_count", "upper_count"])]
    pub raw: bool,

    /// Use the hash matrix serialized in FILE instead of a random one, so
    /// separate runs produce mergeable databases
    #[arg(long = "matrix", value_name = "FILE")]
    pub matrix: Option<PathBuf>,

    /// Maximum reprobe count
    #[arg(short = 'p', long = "reprobe", default_value_t = DEFAULT_REPROBE_LIMIT)]
    pub reprobe_limit: usize,

    /// Dump buffer size in bytes
    #[arg(long = "buffer-size", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// File with one generator command per line; their output is counted
    /// through named pipes
    #[cfg(unix)]
    #[arg(short = 'g', long = "generator", value_name = "FILE")]
    pub generator: Option<PathBuf>,

    /// Number of generator commands to run concurrently
    #[cfg(unix)]
    #[arg(short = 'G', long = "Generators", default_value_t = 1)]
    pub nb_generators: usize,

    /// Input sequence files (FASTA or FASTQ)
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Output database path
    #[arg(short = 'o', long = "output", default_value = "mer_counts_merged.jf")]
    pub output: PathBuf,

    /// Width of counters in the output database, in bytes
    #[arg(long = "out-counter-len", default_value_t = 4)]
    pub out_counter_len: usize,

    /// Record buffer size in bytes
    #[arg(long = "buffer-size", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Input databases
    #[arg(value_name = "DB", required = true)]
    pub inputs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Database to summarize
    #[arg(value_name = "DB")]
    pub database: PathBuf,
}

#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Column format: `MER COUNT` per line instead of FASTA
    #[arg(short = 'c', long = "column")]
    pub column: bool,

    /// Tab separator (with -c)
    #[arg(short = 't', long = "tab", requires = "column")]
    pub tab: bool,

    /// FASTA output (the default)
    #[arg(short = 'f', long = "fasta", conflicts_with = "column")]
    pub fasta: bool,

    /// Don't print entries with count below this
    #[arg(short = 'L', long = "lower-count", default_value_t = 0)]
    pub lower_count: u64,

    /// Don't print entries with count above this
    #[arg(short = 'U', long = "upper-count", default_value_t = u64::MAX)]
    pub upper_count: u64,

    /// Output file (stdout when absent)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Database to dump
    #[arg(value_name = "DB")]
    pub database: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn count_requires_mer_len_and_size() {
        assert!(Cli::try_parse_from(["mercount", "count", "in.fa"]).is_err());
        let cli = Cli::try_parse_from([
            "mercount", "count", "-m", "21", "-s", "1000", "-t", "4", "in.fa",
        ])
        .unwrap();
        match cli.command {
            Cmd::Count(c) => {
                assert_eq!(c.mer_len, 21);
                assert_eq!(c.size, 1000);
                assert_eq!(c.threads, 4);
                assert_eq!(c.files, vec![PathBuf::from("in.fa")]);
            }
            _ => panic!("expected count"),
        }
    }

    #[test]
    fn raw_conflicts_with_disk() {
        assert!(Cli::try_parse_from([
            "mercount", "count", "-m", "4", "-s", "64", "--raw", "--disk", "in.fa"
        ])
        .is_err());
    }

    #[test]
    fn merge_requires_inputs() {
        assert!(Cli::try_parse_from(["mercount", "merge"]).is_err());
        assert!(Cli::try_parse_from(["mercount", "merge", "a.jf", "b.jf"]).is_ok());
    }
}
