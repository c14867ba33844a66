//! The `merge` subcommand.

use anyhow::{Context, Result};

use crate::cli::args::MergeArgs;
use crate::displaylevel;
use crate::merge::merge_files;

pub fn run(args: &MergeArgs) -> Result<()> {
    displaylevel!(3, "merging {} databases", args.inputs.len());
    let stats = merge_files(
        &args.inputs,
        &args.output,
        args.out_counter_len,
        args.buffer_size,
    )
    .with_context(|| format!("merging into '{}'", args.output.display()))?;
    displaylevel!(
        3,
        "distinct {} unique {} total {} max_count {}",
        stats.distinct,
        stats.unique,
        stats.total,
        stats.max_count
    );
    Ok(())
}
