//! The `count` subcommand: sequence files in, count database out.
//!
//! Worker crew layout: every thread pulls overlap buffers from the shared
//! parser, rolls its mer window locally, and feeds the cooperative counter.
//! With `--if`, a first pass `set`s the include files' mers and the main
//! pass switches to `update_add`; with `--bf`, mers the Bloom counter has
//! seen fewer than twice are skipped before they touch the table.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context, Result};

use crate::bloom::BloomCounter;
use crate::cli::args::CountArgs;
use crate::config::MAX_MER_LEN;
use crate::displaylevel;
use crate::dump::raw::RawDumper;
use crate::dump::sorted::SortedDumper;
use crate::dump::Dumper;
use crate::hash::counter::{CounterError, HashCounter};
use crate::merge::merge_files;
use crate::parse::{each_mer, OverlapParser};

/// Sequence bytes handed to a worker per parser refill.
const SEQ_BUFFER_SIZE: usize = 1 << 20;

enum PassError {
    Io(std::io::Error),
    Counter(CounterError),
}

pub fn run(args: &CountArgs) -> Result<()> {
    if args.mer_len < 1 || args.mer_len > MAX_MER_LEN {
        bail!(
            "invalid mer length '{}' (must be between 1 and {})",
            args.mer_len,
            MAX_MER_LEN
        );
    }
    if args.counter_len < 1 || args.counter_len > 32 {
        bail!("invalid counter length '{}' bits", args.counter_len);
    }
    if args.out_counter_len < 1 || args.out_counter_len > 8 {
        bail!("invalid output counter length '{}' bytes", args.out_counter_len);
    }
    let threads = if args.threads == 0 {
        num_cpus::get()
    } else {
        args.threads
    };

    // Generator subprocesses contribute named pipes as extra inputs.
    #[cfg(unix)]
    let mut generators = match &args.generator {
        Some(f) => Some(
            crate::generator::GeneratorManager::start(f, args.nb_generators)
                .with_context(|| format!("starting generators from '{}'", f.display()))?,
        ),
        None => None,
    };
    let mut files: Vec<PathBuf> = args.files.clone();
    #[cfg(unix)]
    if let Some(g) = &generators {
        files.extend(g.pipes().iter().cloned());
    }
    if files.is_empty() {
        bail!("no input files");
    }

    let bloom = match &args.bf {
        Some(p) => {
            let b = BloomCounter::read_from(p)
                .with_context(|| format!("loading bloom filter '{}'", p.display()))?;
            if b.mer_len() != args.mer_len {
                bail!(
                    "bloom filter '{}' is for {}-mers, not {}-mers",
                    p.display(),
                    b.mer_len(),
                    args.mer_len
                );
            }
            Some(b)
        }
        None => None,
    };

    let key_len = 2 * args.mer_len;
    let mut counter = match &args.matrix {
        Some(p) => {
            let mut f = std::fs::File::open(p)
                .with_context(|| format!("opening matrix file '{}'", p.display()))?;
            let m = crate::hash::matrix::SquareMatrix::load(&mut f)
                .with_context(|| format!("reading matrix file '{}'", p.display()))?;
            if m.size() != key_len {
                bail!(
                    "matrix '{}' has size {}, expected {} for {}-mers",
                    p.display(),
                    m.size(),
                    key_len,
                    args.mer_len
                );
            }
            let inv = m
                .inverse()
                .with_context(|| format!("inverting matrix from '{}'", p.display()))?;
            HashCounter::with_matrices(
                args.size,
                key_len,
                args.counter_len,
                threads,
                args.reprobe_limit,
                m,
                inv,
            )
        }
        None => HashCounter::new(
            args.size,
            key_len,
            args.counter_len,
            threads,
            args.reprobe_limit,
        ),
    }
    .context("allocating the hash table")?;

    let mut sorted = SortedDumper::new(threads, &args.output, args.buffer_size, args.out_counter_len);
    sorted.set_bounds(
        args.lower_count.unwrap_or(0),
        args.upper_count.unwrap_or(u64::MAX),
    );
    let sorted = Arc::new(sorted);
    if args.disk {
        counter.dump_on_full(sorted.clone());
    }
    let counter = counter;

    // Include-set pre-pass: mark every mer of the listed files present.
    let use_update = !args.if_files.is_empty();
    if use_update {
        displaylevel!(3, "marking include set ({} files)", args.if_files.len());
        let parser = OverlapParser::new(args.if_files.clone(), args.mer_len, SEQ_BUFFER_SIZE);
        run_pass(&counter, &parser, args, threads, None, Mode::Set)?;
    }

    // Main counting pass.
    let parser = OverlapParser::new(files, args.mer_len, SEQ_BUFFER_SIZE);
    run_pass(
        &counter,
        &parser,
        args,
        threads,
        bloom.as_ref(),
        if use_update { Mode::UpdateAdd } else { Mode::Add },
    )?;

    #[cfg(unix)]
    if let Some(g) = &mut generators {
        if !g.wait().context("waiting for generators")? {
            bail!("some generator commands failed");
        }
    }

    // Final dump, and merge of intermediates when the table spilled.
    let ary = counter.ary();
    if args.raw {
        let raw = RawDumper::new(threads, &args.output, args.buffer_size);
        raw.set_one_file(true);
        raw.dump(&ary)
            .with_context(|| format!("writing '{}'", args.output.display()))?;
        return Ok(());
    }

    if sorted.nb_files() == 0 {
        sorted.set_one_file(true);
        sorted
            .dump(&ary)
            .with_context(|| format!("writing '{}'", args.output.display()))?;
        let s = sorted.last_stats();
        displaylevel!(
            3,
            "distinct {} unique {} total {} max_count {}",
            s.distinct,
            s.unique,
            s.total,
            s.max_count
        );
        return Ok(());
    }

    sorted
        .dump(&ary)
        .context("writing final intermediate file")?;
    let intermediates: Vec<PathBuf> = (0..sorted.nb_files()).map(|i| sorted.file_path(i)).collect();
    if args.no_merge {
        displaylevel!(
            2,
            "wrote {} intermediate files ({} .. {})",
            intermediates.len(),
            intermediates[0].display(),
            intermediates[intermediates.len() - 1].display()
        );
        return Ok(());
    }

    displaylevel!(3, "merging {} intermediate files", intermediates.len());
    merge_files(
        &intermediates,
        &args.output,
        args.out_counter_len,
        args.buffer_size,
    )
    .with_context(|| format!("merging into '{}'", args.output.display()))?;
    for p in &intermediates {
        std::fs::remove_file(p)
            .with_context(|| format!("removing intermediate '{}'", p.display()))?;
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Add,
    Set,
    UpdateAdd,
}

// Run one crew of workers over the parser until the inputs are exhausted,
// then have every worker call `done`.
fn run_pass(
    counter: &HashCounter,
    parser: &OverlapParser,
    args: &CountArgs,
    threads: usize,
    bloom: Option<&BloomCounter>,
    mode: Mode,
) -> Result<()> {
    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    thread::scope(|s| {
        for _ in 0..threads {
            let first_error = &first_error;
            s.spawn(move || {
                match pump(counter, parser, args, bloom, mode) {
                    Ok(()) => {
                        if let Err(e) = counter.done() {
                            first_error.lock().unwrap().get_or_insert(e.into());
                        }
                    }
                    Err(PassError::Io(e)) => {
                        first_error
                            .lock()
                            .unwrap()
                            .get_or_insert(anyhow::Error::from(e).context("reading input"));
                        // keep the crew's barrier protocol alive
                        let _ = counter.done();
                    }
                    Err(PassError::Counter(e)) => {
                        // the whole round failed; every worker got the error
                        first_error.lock().unwrap().get_or_insert(e.into());
                    }
                }
            });
        }
    });

    match first_error.into_inner().unwrap() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn pump(
    counter: &HashCounter,
    parser: &OverlapParser,
    args: &CountArgs,
    bloom: Option<&BloomCounter>,
    mode: Mode,
) -> std::result::Result<(), PassError> {
    let mut buf = Vec::new();
    loop {
        match parser.next_buffer(&mut buf) {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(e) => return Err(PassError::Io(e)),
        }
        let mut failed: Option<CounterError> = None;
        each_mer(&buf, args.mer_len, args.canonical, |m| {
            if failed.is_some() {
                return;
            }
            if let Some(b) = bloom {
                if b.check(m) <= 1 {
                    return;
                }
            }
            let r = match mode {
                Mode::Add => counter.add(m, 1),
                Mode::Set => counter.set(m).map(|_| ()),
                Mode::UpdateAdd => counter.update_add(m, 1).map(|_| ()),
            };
            if let Err(e) = r {
                failed = Some(e);
            }
        });
        if let Some(e) = failed {
            return Err(PassError::Counter(e));
        }
    }
}
