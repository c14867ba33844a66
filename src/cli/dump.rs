//! The `dump` subcommand: database records as text.
//!
//! Default output is FASTA-style, one record per entry:
//!
//! ```text
//! >12
//! ACGTACGTACGTACGTACGTA
//! ```
//!
//! `-c` switches to one `MER COUNT` line per entry, `-t` makes the column
//! separator a tab.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};

use crate::cli::args::DumpArgs;
use crate::format::reader::{ListReader, RawDb};
use crate::format::{FormatError, RAW_MAGIC};
use crate::mer::mer_to_string;

pub fn run(args: &DumpArgs) -> Result<()> {
    let mut out: BufWriter<Box<dyn Write>> = BufWriter::new(match &args.output {
        Some(p) => Box::new(
            File::create(p).with_context(|| format!("creating '{}'", p.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    });

    dump_records(args, &mut out).with_context(|| format!("'{}'", args.database.display()))?;
    out.flush().context("flushing output")?;
    Ok(())
}

fn dump_records(args: &DumpArgs, out: &mut impl Write) -> Result<()> {
    match ListReader::open(&args.database) {
        Ok(mut r) => {
            let k = r.mer_len();
            while let Some((key, val)) = r.next()? {
                emit(args, out, key, val, k)?;
            }
            Ok(())
        }
        Err(FormatError::BadMagic { found, .. }) if &found == RAW_MAGIC => {
            let db = RawDb::open(&args.database)?;
            let k = db.header().key_len as usize / 2;
            for e in db.array().iter_all() {
                emit(args, out, e.key, e.val, k)?;
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn emit(args: &DumpArgs, out: &mut impl Write, key: u64, val: u64, k: usize) -> io::Result<()> {
    if val < args.lower_count || val > args.upper_count {
        return Ok(());
    }
    let mer = mer_to_string(key, k);
    // -f asks for FASTA explicitly; it is also the default when -c is absent
    // (clap rejects -f together with -c).
    let fasta = args.fasta || !args.column;
    if fasta {
        writeln!(out, ">{}\n{}", val, mer)
    } else {
        let sep = if args.tab { '\t' } else { ' ' };
        writeln!(out, "{}{}{}", mer, sep, val)
    }
}
