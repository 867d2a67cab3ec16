//! Baseline alignment stage over materialized chunks.
//!
//! Workers dequeue chunks, load each chunk's FASTA into memory, replay its
//! pairs frames, and score every pair by ungapped identity over the shorter
//! sequence. Pairs at or above the approximate-identity floor become edges,
//! written radix-partitioned by representative OID for the clustering stage.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use needletail::parse_fastx_file;

use crate::chunk_table::read_chunk_pairs;
use crate::config::Config;
use crate::job::Job;
use crate::rfa::{self, BucketWriter, RadixFileArray, DEFAULT_BUF_SIZE};
use crate::sync::SharedCounter;
use crate::types::{bit_length, Edge};
use crate::volumes::parse_prev_oid;

/// Fraction of identical residues over the shorter sequence, compared
/// position-wise from the start.
fn ungapped_identity(a: &[u8], b: &[u8]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let matches = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    matches as f32 / n as f32
}

pub fn align_chunks(
    job: &Job,
    cfg: &Config,
    chunk_count: i32,
    db_size: i64,
) -> Result<Vec<PathBuf>> {
    let shift = bit_length(db_size - 1).saturating_sub(cfg.radix_bits);
    let base_dir = job.base_dir().join("alignments");
    let chunks_dir = job.base_dir().join("chunks");
    let output_files =
        RadixFileArray::create(&base_dir, cfg.radix_count(), job.worker_id(), None, "bin")?;
    let queue = SharedCounter::new(chunks_dir.join("align_queue"))?;
    let min_identity = (cfg.approx_min_id / 100.0) as f32;
    let mut chunks_processed = 0i64;

    std::thread::scope(|s| -> Result<()> {
        let mut handles = Vec::new();
        for _ in 0..cfg.threads {
            let output_files = &output_files;
            let queue = &queue;
            let chunks_dir = &chunks_dir;
            handles.push(s.spawn(move || -> Result<i64> {
                let mut buffers = BucketWriter::new(output_files, DEFAULT_BUF_SIZE);
                let mut processed = 0i64;
                loop {
                    let chunk = queue.fetch_add(1)?;
                    if chunk >= chunk_count as i64 {
                        break;
                    }
                    let chunk_dir = chunks_dir.join(chunk.to_string());
                    job.log(format!("Aligning chunk {}/{}", chunk + 1, chunk_count));

                    let mut sequences: HashMap<i64, Vec<u8>> = HashMap::new();
                    for file in rfa::bucket_files(&chunk_dir)? {
                        if !file.extension().is_some_and(|e| e == "fasta") {
                            continue;
                        }
                        let mut reader = parse_fastx_file(&file).with_context(|| {
                            format!("opening chunk fasta {}", file.display())
                        })?;
                        while let Some(record) = reader.next() {
                            let record = record.with_context(|| {
                                format!("reading chunk fasta {}", file.display())
                            })?;
                            let oid = parse_prev_oid(record.id(), &file)?;
                            sequences.entry(oid).or_insert_with(|| record.seq().to_vec());
                        }
                    }

                    for pair in read_chunk_pairs(&chunk_dir.join("pairs"))? {
                        let (Some(rep), Some(member)) = (
                            sequences.get(&pair.rep_oid),
                            sequences.get(&pair.member_oid),
                        ) else {
                            continue;
                        };
                        let score = ungapped_identity(rep, member);
                        if score >= min_identity {
                            let radix = (pair.rep_oid as u64 >> shift) as usize;
                            buffers.write(
                                radix,
                                &Edge {
                                    rep_oid: pair.rep_oid,
                                    member_oid: pair.member_oid,
                                    score,
                                },
                            )?;
                        }
                    }
                    processed += 1;
                }
                buffers.finish()?;
                Ok(processed)
            }));
        }
        for h in handles {
            chunks_processed += h.join().expect("alignment worker panicked")?;
        }
        Ok(())
    })?;

    let buckets = output_files.close()?;
    let finished = SharedCounter::new(chunks_dir.join("align_finished"))?;
    finished.fetch_add(chunks_processed)?;
    finished.wait_for(chunk_count as i64)?;
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ungapped_identity() {
        assert_eq!(ungapped_identity(b"AAAA", b"AAAA"), 1.0);
        assert_eq!(ungapped_identity(b"AAAA", b"AATT"), 0.5);
        // Shorter sequence bounds the comparison.
        assert_eq!(ungapped_identity(b"AAAAAAAA", b"AAAA"), 1.0);
        assert_eq!(ungapped_identity(b"", b"AAAA"), 0.0);
    }
}
