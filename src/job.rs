//! Job state shared by cooperating worker processes.
//!
//! A job owns a directory on shared storage. Every process that attaches to
//! the same directory gets a distinct worker id from a shared counter and
//! then participates in the bag-of-tasks queues and barriers of each stage.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::error::PipelineError;
use crate::sync::SharedCounter;

pub struct Job {
    root: PathBuf,
    worker_id: i64,
    round: i32,
    round_count: i32,
    round_volumes: i64,
    round_records: i64,
}

impl Job {
    /// Attach to (creating if needed) the job rooted at `root`.
    pub fn attach(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| PipelineError::io(root, "create job dir", e))?;
        let worker_id = SharedCounter::new(root.join("worker_id"))?.fetch_add(1)?;
        Ok(Job {
            root: root.to_path_buf(),
            worker_id,
            round: 0,
            round_count: 1,
            round_volumes: 0,
            round_records: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working directory of the current round; stage directories nest here
    /// so stage names can repeat across rounds.
    pub fn base_dir(&self) -> PathBuf {
        self.root.join(format!("round_{}", self.round))
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    pub fn round(&self) -> i32 {
        self.round
    }

    pub fn round_count(&self) -> i32 {
        self.round_count
    }

    pub fn set_round_count(&mut self, count: i32) {
        self.round_count = count;
    }

    pub fn set_round(&mut self, volumes: i64, records: i64) -> Result<()> {
        self.round_volumes = volumes;
        self.round_records = records;
        let dir = self.base_dir();
        fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, "create round dir", e))?;
        Ok(())
    }

    pub fn next_round(&mut self) {
        self.round += 1;
    }

    pub fn round_records(&self) -> i64 {
        self.round_records
    }

    /// Progress line carrying this worker and round as the record target;
    /// the formatter in `logging` renders the tag.
    pub fn log(&self, msg: impl AsRef<str>) {
        log::info!(
            target: &format!(
                "{}worker {} round {}",
                crate::logging::JOB_TARGET_PREFIX,
                self.worker_id,
                self.round
            ),
            "{}",
            msg.as_ref()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_attach_assigns_distinct_worker_ids() -> Result<()> {
        let dir = tempdir()?;
        let a = Job::attach(dir.path())?;
        let b = Job::attach(dir.path())?;
        assert_ne!(a.worker_id(), b.worker_id());
        Ok(())
    }

    #[test]
    fn test_round_dirs_are_distinct() -> Result<()> {
        let dir = tempdir()?;
        let mut job = Job::attach(dir.path())?;
        let r0 = job.base_dir();
        job.next_round();
        let r1 = job.base_dir();
        assert_ne!(r0, r1);
        assert!(r1.ends_with("round_1"));
        Ok(())
    }
}
