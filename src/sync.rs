//! Cross-process synchronization over shared storage.
//!
//! A `SharedCounter` is a named, persistent, monotonic 64-bit integer backed
//! by a file on the job directory. Worker processes on the same filesystem
//! use it three ways: as a work queue (`fetch_add` hands out the next unit),
//! as a progress tally, and as a barrier (`wait_for` blocks until the counter
//! reaches a target). Atomicity across processes comes from an advisory
//! exclusive lock held over the read-modify-write.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

use crate::error::PipelineError;

/// Polling floor and ceiling for `wait_for`. The interval doubles between
/// probes so a long barrier stall does not hammer shared storage.
const POLL_MIN: Duration = Duration::from_millis(10);
const POLL_MAX: Duration = Duration::from_millis(500);

/// Filesystem-backed monotonic counter shared by all workers of a job.
///
/// The counter file holds a single little-endian i64. There is no deletion
/// API; the file persists for the life of the job directory, which is what
/// lets late-attaching workers observe completed stages.
#[derive(Debug, Clone)]
pub struct SharedCounter {
    path: PathBuf,
}

impl SharedCounter {
    /// Open (creating if absent) the counter at `path`, initialized to zero.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| PipelineError::io(&path, "open counter", e))?;
        file.lock_exclusive()
            .map_err(|e| PipelineError::io(&path, "lock counter", e))?;
        let len = file
            .metadata()
            .map_err(|e| PipelineError::io(&path, "stat counter", e))?
            .len();
        if len < 8 {
            // First creator initializes; racing creators serialize on the lock.
            write_value(&file, &path, 0)?;
        }
        fs2::FileExt::unlock(&file).map_err(|e| PipelineError::io(&path, "unlock counter", e))?;
        Ok(SharedCounter { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically add `delta` and return the previous value.
    pub fn fetch_add(&self, delta: i64) -> Result<i64, PipelineError> {
        let file = self.open()?;
        file.lock_exclusive()
            .map_err(|e| PipelineError::io(&self.path, "lock counter", e))?;
        let prev = read_value(&file, &self.path)?;
        write_value(&file, &self.path, prev + delta)?;
        fs2::FileExt::unlock(&file)
            .map_err(|e| PipelineError::io(&self.path, "unlock counter", e))?;
        Ok(prev)
    }

    /// Read the current value.
    pub fn get(&self) -> Result<i64, PipelineError> {
        let file = self.open()?;
        file.lock_shared()
            .map_err(|e| PipelineError::io(&self.path, "lock counter", e))?;
        let value = read_value(&file, &self.path)?;
        fs2::FileExt::unlock(&file)
            .map_err(|e| PipelineError::io(&self.path, "unlock counter", e))?;
        Ok(value)
    }

    /// Block until the counter reaches `target`, polling with backoff.
    ///
    /// Barrier stalls are not errors: a worker that is slow (or that died and
    /// needs an operator restart) simply keeps the others polling.
    pub fn wait_for(&self, target: i64) -> Result<(), PipelineError> {
        let mut interval = POLL_MIN;
        loop {
            if self.get()? >= target {
                return Ok(());
            }
            std::thread::sleep(interval);
            interval = (interval * 2).min(POLL_MAX);
        }
    }

    fn open(&self) -> Result<File, PipelineError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| PipelineError::io(&self.path, "open counter", e))
    }
}

fn read_value(mut file: &File, path: &Path) -> Result<i64, PipelineError> {
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(0))
        .map_err(|e| PipelineError::io(path, "seek counter", e))?;
    file.read_exact(&mut buf)
        .map_err(|e| PipelineError::io(path, "read counter", e))?;
    Ok(i64::from_le_bytes(buf))
}

fn write_value(mut file: &File, path: &Path, value: i64) -> Result<(), PipelineError> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| PipelineError::io(path, "seek counter", e))?;
    file.write_all(&value.to_le_bytes())
        .map_err(|e| PipelineError::io(path, "write counter", e))?;
    file.sync_data()
        .map_err(|e| PipelineError::io(path, "sync counter", e))?;
    Ok(())
}
