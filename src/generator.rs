//! Generator subprocesses feeding named pipes.
//!
//! `count -g FILE` reads one shell command per line and runs the commands
//! with their standard output redirected into named pipes under a scratch
//! directory (respecting `TMPDIR`). The pipe paths are handed to the
//! sequence parser as ordinary input files; a command blocks inside its
//! `open(2)` of the pipe until the parser starts reading it, so at most the
//! requested number of generators make progress at a time. The scratch
//! directory and pipes are removed on drop.

#![cfg(unix)]

use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

pub struct GeneratorManager {
    dir: PathBuf,
    pipes: Vec<PathBuf>,
    runners: Vec<JoinHandle<io::Result<bool>>>,
}

impl GeneratorManager {
    /// Parse `commands_file` (one `sh` command per line; blank lines and
    /// `#` comments skipped) and start the generators, `nb_pipes` at a time.
    pub fn start(commands_file: &Path, nb_pipes: usize) -> io::Result<GeneratorManager> {
        let nb_pipes = nb_pipes.max(1);
        let commands: Vec<String> = io::BufReader::new(fs::File::open(commands_file)?)
            .lines()
            .collect::<io::Result<Vec<_>>>()?
            .into_iter()
            .map(|l| l.trim().to_owned())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        if commands.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no generator commands in '{}'", commands_file.display()),
            ));
        }

        let dir = std::env::temp_dir().join(format!("mercount_gen_{}", std::process::id()));
        fs::create_dir_all(&dir)?;

        let nb_pipes = nb_pipes.min(commands.len());
        let mut pipes = Vec::with_capacity(nb_pipes);
        for i in 0..nb_pipes {
            let pipe = dir.join(format!("gen_{}", i));
            mkfifo(&pipe, Mode::from_bits_truncate(0o600))
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            pipes.push(pipe);
        }

        // One runner per pipe, executing its share of the command list
        // sequentially. Each command's `> pipe` open blocks until a reader
        // shows up, so consumption order throttles production.
        let mut runners = Vec::with_capacity(nb_pipes);
        for (slot, pipe) in pipes.iter().enumerate() {
            let cmds: Vec<String> = commands
                .iter()
                .skip(slot)
                .step_by(nb_pipes)
                .cloned()
                .collect();
            let pipe = pipe.clone();
            runners.push(std::thread::spawn(move || -> io::Result<bool> {
                let mut all_ok = true;
                for cmd in cmds {
                    let status = run_generator(&cmd, &pipe)?.wait()?;
                    all_ok &= status.success();
                }
                Ok(all_ok)
            }));
        }

        Ok(GeneratorManager {
            dir,
            pipes,
            runners,
        })
    }

    /// The pipe paths, in the order they should be appended to the parser's
    /// input list. Every pipe must be read to completion.
    pub fn pipes(&self) -> &[PathBuf] {
        &self.pipes
    }

    /// Wait for every generator command; true when all exited successfully.
    pub fn wait(&mut self) -> io::Result<bool> {
        let mut all_ok = true;
        for h in self.runners.drain(..) {
            match h.join() {
                Ok(r) => all_ok &= r?,
                Err(_) => all_ok = false,
            }
        }
        Ok(all_ok)
    }
}

fn run_generator(cmd: &str, pipe: &Path) -> io::Result<Child> {
    Command::new("/bin/sh")
        .arg("-c")
        .arg(format!("{} > '{}'", cmd, pipe.display()))
        .stdin(Stdio::null())
        .spawn()
}

impl Drop for GeneratorManager {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn generators_stream_through_pipes() {
        let dir = TempDir::new().unwrap();
        let cmds = dir.path().join("cmds");
        fs::write(&cmds, "printf 'ACGTACGT'\n# a comment\nprintf 'TTTT'\n").unwrap();

        let mut gm = GeneratorManager::start(&cmds, 2).unwrap();
        assert_eq!(gm.pipes().len(), 2);

        let mut out = Vec::new();
        for p in gm.pipes().to_vec() {
            let mut s = String::new();
            File::open(&p).unwrap().read_to_string(&mut s).unwrap();
            out.push(s);
        }
        assert!(gm.wait().unwrap());
        out.sort();
        assert_eq!(out, vec!["ACGTACGT".to_owned(), "TTTT".to_owned()]);
    }

    #[test]
    fn failing_generator_reported() {
        let dir = TempDir::new().unwrap();
        let cmds = dir.path().join("cmds");
        fs::write(&cmds, "exit 3\n").unwrap();

        let mut gm = GeneratorManager::start(&cmds, 1).unwrap();
        // drain the pipe so the command can run to completion
        let mut s = String::new();
        File::open(&gm.pipes()[0])
            .unwrap()
            .read_to_string(&mut s)
            .unwrap();
        assert!(!gm.wait().unwrap());
    }

    #[test]
    fn empty_command_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let cmds = dir.path().join("cmds");
        fs::write(&cmds, "\n# nothing\n").unwrap();
        assert!(GeneratorManager::start(&cmds, 2).is_err());
    }
}
