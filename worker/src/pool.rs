//! Link to a supervising parent in pooled mode.
//!
//! The parent shares a counter file holding the number of jobs currently
//! running across its pool. Each worker bumps it before claiming a job and
//! drops it afterwards, under an exclusive `flock`, then sends the parent
//! `SIGUSR1` so it can re-read the counter.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use fs2::FileExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getppid, Pid};
use tracing::{trace, warn};

use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Start,
    End,
}

#[derive(Debug, Clone)]
pub struct PoolLink {
    counter_path: Option<PathBuf>,
    parent: Option<Pid>,
}

impl PoolLink {
    /// No supervisor; every notification is a no-op.
    pub fn standalone() -> Self {
        Self {
            counter_path: None,
            parent: None,
        }
    }

    /// Report to the process that spawned us.
    pub fn pooled(counter_path: PathBuf) -> Self {
        Self {
            counter_path: Some(counter_path),
            parent: Some(getppid()),
        }
    }

    /// Counter updates without signalling anyone.
    pub fn counter_only(counter_path: PathBuf) -> Self {
        Self {
            counter_path: Some(counter_path),
            parent: None,
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.counter_path.is_some()
    }

    pub fn notify(&self, state: JobState) -> Result<(), WorkerError> {
        let Some(path) = self.counter_path.as_deref() else {
            return Ok(());
        };

        let delta = match state {
            JobState::Start => 1,
            JobState::End => -1,
        };
        let active = adjust_counter(path, delta).map_err(|source| WorkerError::Supervisor {
            path: path.to_path_buf(),
            source,
        })?;
        trace!(?state, active, "updated active job counter");

        if let Some(parent) = self.parent {
            if let Err(err) = kill(parent, Signal::SIGUSR1) {
                warn!(parent = parent.as_raw(), "failed to notify supervisor: {}", err);
            }
        }
        Ok(())
    }
}

/// Add `delta` to the counter stored in `path`, never dropping below zero.
fn adjust_counter(path: &Path, delta: i64) -> io::Result<i64> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path)?;

    file.lock_exclusive()?;
    let result = rewrite_locked(&mut file, delta);
    let unlocked = FileExt::unlock(&file);
    let value = result?;
    unlocked?;
    Ok(value)
}

fn rewrite_locked(file: &mut File, delta: i64) -> io::Result<i64> {
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;
    let current = raw.trim().parse::<i64>().unwrap_or(0);
    let next = (current + delta).max(0);

    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    writeln!(file, "{}", next)?;
    file.flush()?;
    Ok(next)
}

/// Current value of a counter file; 0 when missing or empty.
pub fn read_counter(path: &Path) -> io::Result<i64> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(raw.trim().parse::<i64>().unwrap_or(0)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}
