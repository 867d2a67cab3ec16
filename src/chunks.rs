//! Chunk materializer: write each chunk's member sequences as multi-FASTA.
//!
//! Sorted chunk-table buckets are dequeued by workers; each bucket covers a
//! contiguous OID interval, so only the volumes overlapping that interval
//! are streamed. Threads pull volumes from a local counter and replay each
//! volume against the sorted table, appending every referenced sequence to
//! the chunks it belongs to. The output file array is capped so a single
//! chunk's FASTA rotates around one gigabyte.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use needletail::parse_fastx_file;
use rayon::prelude::*;

use crate::config::Config;
use crate::job::Job;
use crate::rfa::{self, BucketWriter, RadixFileArray};
use crate::sync::SharedCounter;
use crate::types::ChunkTableEntry;
use crate::volumes::{format_fasta, VolumedFile};

const OUTPUT_BUF_SIZE: usize = 64 * 1024;
const MAX_FASTA_FILE_SIZE: u64 = 1024 * 1024 * 1024;

pub fn build_chunks(
    job: &Job,
    cfg: &Config,
    db: &VolumedFile,
    chunk_table: &[PathBuf],
    chunk_count: i32,
) -> Result<()> {
    let base_dir = job.base_dir().join("chunks");
    let output_files = RadixFileArray::create(
        &base_dir,
        chunk_count as usize,
        job.worker_id(),
        Some(MAX_FASTA_FILE_SIZE),
        "fasta",
    )?;
    let queue = SharedCounter::new(base_dir.join("queue"))?;
    let oid_counter = AtomicI64::new(0);
    let distinct_oid_counter = AtomicI64::new(0);
    let mut buckets_processed = 0i64;

    loop {
        let bucket = queue.fetch_add(1)?;
        if bucket >= chunk_table.len() as i64 {
            break;
        }
        let dir = &chunk_table[bucket as usize];
        let mut data: Vec<ChunkTableEntry> = rfa::load_records(dir)?;
        job.log(format!(
            "Building chunks. Bucket={}/{} Records={}",
            bucket + 1,
            chunk_table.len(),
            data.len()
        ));
        if data.is_empty() {
            rfa::remove_bucket_files(dir)?;
            buckets_processed += 1;
            continue;
        }
        data.par_sort_unstable();
        let oid_begin = data[0].oid;
        let oid_end = data[data.len() - 1].oid + 1;
        let volumes = db.find(oid_begin, oid_end);
        let next = AtomicI64::new(0);

        std::thread::scope(|s| -> Result<()> {
            let mut handles = Vec::new();
            for _ in 0..cfg.threads.min(volumes.len()) {
                let data = &data;
                let next = &next;
                let output_files = &output_files;
                let oid_counter = &oid_counter;
                let distinct_oid_counter = &distinct_oid_counter;
                handles.push(s.spawn(move || -> Result<()> {
                    let mut cursor = 0usize;
                    let mut output_bufs = BucketWriter::new(output_files, OUTPUT_BUF_SIZE);
                    let mut buf = Vec::new();
                    loop {
                        let volume = next.fetch_add(1, Ordering::Relaxed);
                        if volume >= volumes.len() as i64 {
                            break;
                        }
                        let v = &volumes[volume as usize];
                        while cursor < data.len() && data[cursor].oid < v.oid_begin {
                            cursor += 1;
                        }
                        let mut reader = parse_fastx_file(&v.path)
                            .with_context(|| format!("opening volume {}", v.path.display()))?;
                        let mut file_oid = v.oid_begin;
                        while file_oid < oid_end && cursor < data.len() {
                            let Some(record) = reader.next() else {
                                break;
                            };
                            let record = record.with_context(|| {
                                format!("reading volume {}", v.path.display())
                            })?;
                            if data[cursor].oid > file_oid {
                                file_oid += 1;
                                continue;
                            }
                            buf.clear();
                            format_fasta(&file_oid.to_string(), &record.seq(), &mut buf);
                            let begin = cursor;
                            while cursor < data.len() && data[cursor].oid == file_oid {
                                // The same OID may repeat for one chunk;
                                // consecutive duplicates collapse.
                                if cursor == begin || data[cursor].chunk != data[cursor - 1].chunk
                                {
                                    output_bufs.write_bytes(data[cursor].chunk as usize, &buf)?;
                                    oid_counter.fetch_add(1, Ordering::Relaxed);
                                }
                                cursor += 1;
                            }
                            distinct_oid_counter.fetch_add(1, Ordering::Relaxed);
                            file_oid += 1;
                        }
                    }
                    output_bufs.finish()
                }));
            }
            for h in handles {
                h.join().expect("chunk materializer worker panicked")?;
            }
            Ok(())
        })?;

        rfa::remove_bucket_files(dir)?;
        buckets_processed += 1;
    }

    let _ = output_files.close()?;
    let finished = SharedCounter::new(base_dir.join("finished"))?;
    finished.fetch_add(buckets_processed)?;
    finished.wait_for(chunk_table.len() as i64)?;
    job.log(format!(
        "Built chunks. oids={}/{} distinct_oids={}",
        oid_counter.load(Ordering::Relaxed),
        db.records(),
        distinct_oid_counter.load(Ordering::Relaxed)
    ));
    Ok(())
}
