//! Seed-table builder: stream sequences, emit radix-bucketed seed entries.
//!
//! Volumes are dequeued from a shared-counter queue so any number of worker
//! processes (each running its own thread pool) can chew through the round's
//! input. Each record is reduced, sketched under the round's shape, and its
//! keys scattered over buckets by a mixing hash; the unmixed high key bits
//! stay meaningful for the in-bucket sort that follows.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use needletail::parse_fastx_file;

use crate::config::{Config, Sensitivity};
use crate::error::PipelineError;
use crate::job::Job;
use crate::rfa::{BucketWriter, RadixFileArray, DEFAULT_BUF_SIZE};
use crate::seeds::{reduce_seq, mix64, Shape, SketchIterator};
use crate::sync::SharedCounter;
use crate::types::SeedEntry;
use crate::volumes::{parse_prev_oid, VolumedFile};

pub fn build_seed_table(
    job: &Job,
    cfg: &Config,
    volumes: &VolumedFile,
    sensitivity: Sensitivity,
    shapes: &[Shape],
    shape_idx: usize,
) -> Result<Vec<PathBuf>> {
    let sketch_size = cfg.effective_sketch_size(sensitivity);
    let base_dir = job.base_dir().join(format!("seed_table_{}", shape_idx));
    let radix_count = cfg.radix_count();
    let files = RadixFileArray::create(&base_dir, radix_count, job.worker_id(), None, "bin")?;
    let queue = SharedCounter::new(base_dir.join("queue"))?;
    let volumes_processed = AtomicI64::new(0);
    let shape = &shapes[shape_idx];

    std::thread::scope(|s| -> Result<()> {
        let mut handles = Vec::new();
        for _ in 0..cfg.threads {
            let files = &files;
            let queue = &queue;
            let volumes_processed = &volumes_processed;
            handles.push(s.spawn(move || -> Result<()> {
                let mut buffers = BucketWriter::new(files, DEFAULT_BUF_SIZE);
                let mut reduced = Vec::new();
                loop {
                    let v = queue.fetch_add(1)?;
                    if v >= volumes.len() as i64 {
                        break;
                    }
                    let volume = volumes.volume(v as usize);
                    job.log(format!(
                        "Building seed table. Shape={}/{} Volume={}/{} Records={}",
                        shape_idx + 1,
                        shapes.len(),
                        v + 1,
                        volumes.len(),
                        volume.record_count
                    ));

                    let mut oid_out = if job.round() > 0 {
                        let path = volume.oid_sidecar_path();
                        let file = File::create(&path)
                            .map_err(|e| PipelineError::io(&path, "create oid sidecar", e))?;
                        Some((BufWriter::new(file), path))
                    } else {
                        None
                    };

                    let mut reader = parse_fastx_file(&volume.path).with_context(|| {
                        format!("opening volume {}", volume.path.display())
                    })?;
                    let mut oid = volume.oid_begin;
                    while let Some(record) = reader.next() {
                        let record = record.with_context(|| {
                            format!("reading volume {}", volume.path.display())
                        })?;
                        if let Some((out, path)) = oid_out.as_mut() {
                            let prev_oid = parse_prev_oid(record.id(), &volume.path)?;
                            out.write_all(&prev_oid.to_le_bytes())
                                .map_err(|e| PipelineError::io(path, "write oid sidecar", e))?;
                        }
                        let seq = record.seq();
                        if seq.len() < shape.length() {
                            oid += 1;
                            continue;
                        }
                        reduce_seq(&seq, &mut reduced);
                        for key in SketchIterator::new(&reduced, shape, sketch_size) {
                            let radix = (mix64(key) as usize) & (radix_count - 1);
                            buffers.write(radix, &SeedEntry::new(key, oid, seq.len() as i32))?;
                        }
                        oid += 1;
                    }
                    if let Some((mut out, path)) = oid_out.take() {
                        out.flush()
                            .map_err(|e| PipelineError::io(&path, "flush oid sidecar", e))?;
                    }
                    volumes_processed.fetch_add(1, Ordering::Relaxed);
                }
                buffers.finish()
            }));
        }
        for h in handles {
            h.join().expect("seed table worker panicked")?;
        }
        Ok(())
    })?;

    let buckets = files.close()?;
    let finished = SharedCounter::new(base_dir.join("finished"))?;
    finished.fetch_add(volumes_processed.load(Ordering::Relaxed))?;
    finished.wait_for(volumes.len() as i64)?;
    Ok(buckets)
}
