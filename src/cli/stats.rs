//! The `stats` subcommand: print a database's summary counters.
//!
//! Compacted databases carry the counters in their header. Raw block images
//! do not, so those are reloaded and summed by iterating the table.

use anyhow::{Context, Result};

use crate::cli::args::StatsArgs;
use crate::dump::writer::DumpStats;
use crate::format::reader::{ListReader, RawDb};
use crate::format::{FormatError, RAW_MAGIC};

pub fn run(args: &StatsArgs) -> Result<()> {
    let stats = read_stats(args).with_context(|| format!("'{}'", args.database.display()))?;
    println!("Unique:    {}", stats.unique);
    println!("Distinct:  {}", stats.distinct);
    println!("Total:     {}", stats.total);
    println!("Max_count: {}", stats.max_count);
    Ok(())
}

fn read_stats(args: &StatsArgs) -> Result<DumpStats> {
    match ListReader::open(&args.database) {
        Ok(r) => {
            let h = r.header();
            Ok(DumpStats {
                unique: h.unique,
                distinct: h.distinct,
                total: h.total,
                max_count: h.max_count,
            })
        }
        Err(FormatError::BadMagic { found, .. }) if &found == RAW_MAGIC => {
            let db = RawDb::open(&args.database)?;
            let mut stats = DumpStats::default();
            for e in db.array().iter_all() {
                stats.unique += (e.val == 1) as u64;
                stats.distinct += 1;
                stats.total += e.val;
                stats.max_count = stats.max_count.max(e.val);
            }
            Ok(stats)
        }
        Err(e) => Err(e.into()),
    }
}
