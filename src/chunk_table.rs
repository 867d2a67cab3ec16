//! Chunk-table builder: assign representatives and members to bounded chunks.
//!
//! Chunks are job-global output partitions whose estimated residue mass is
//! capped. A shared counter hands out chunk ids; the process keeps a current
//! chunk that rotates once its HyperLogLog tile estimate reaches the target.
//! Worker threads snapshot the current chunk, stream their sorted pair
//! groups into it, and re-check under the job lock after every flushed
//! frame, so a rotation by any thread is picked up by all of them.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use rayon::prelude::*;

use crate::config::Config;
use crate::error::PipelineError;
use crate::hll::HyperLogLog;
use crate::job::Job;
use crate::pair_table::{key_groups, partition_at_key_boundaries};
use crate::rfa::{self, BucketWriter, RadixFileArray, DEFAULT_BUF_SIZE};
use crate::sync::SharedCounter;
use crate::types::{bit_length, ChunkTableEntry, PairEntry, PairEntryShort, WireRecord};

/// Residues per counted tile.
pub const TILE_WIDTH: i64 = 64;

/// Tile ids pack as `oid << TILE_SHIFT | tile`, so sequences are limited to
/// `2^17 * 64` residues.
const TILE_SHIFT: u32 = 17;

/// Counts distinct 64-residue tiles over the OIDs added to a chunk. Robust
/// to the same OID arriving again from another seed group.
#[derive(Default)]
pub struct SizeCounter {
    hll: HyperLogLog,
}

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, oid: i64, len: i32) {
        debug_assert!((len as i64) <= (1i64 << TILE_SHIFT) * TILE_WIDTH);
        let base = (oid as u64) << TILE_SHIFT;
        let tiles = (len as u64).div_ceil(TILE_WIDTH as u64);
        for i in 0..tiles {
            self.hll.add(base + i);
        }
    }
}

struct ChunkInner {
    pairs_out: BufWriter<File>,
    size: HyperLogLog,
}

/// One output chunk: an append-only pairs file written in length-prefixed
/// frames, plus the HLL sketch of its residue tiles. Shared by every thread
/// holding it as the current chunk; the pairs file closes when the last
/// holder drops its handle.
pub struct Chunk {
    pub id: i32,
    path: PathBuf,
    inner: Mutex<ChunkInner>,
}

impl Chunk {
    pub fn create(next_chunk: &SharedCounter, chunks_dir: &Path) -> Result<Arc<Chunk>> {
        let id = next_chunk.fetch_add(1)? as i32;
        let dir = chunks_dir.join(id.to_string());
        fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, "create chunk dir", e))?;
        let path = dir.join("pairs");
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| PipelineError::io(&path, "open chunk pairs", e))?;
        Ok(Arc::new(Chunk {
            id,
            path,
            inner: Mutex::new(ChunkInner {
                pairs_out: BufWriter::new(file),
                size: HyperLogLog::new(),
            }),
        }))
    }

    /// Append one frame of pairs and fold the caller's size sketch into the
    /// chunk's, clearing both.
    pub fn write(&self, pairs: &mut Vec<PairEntryShort>, size: &mut SizeCounter) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut frame = Vec::with_capacity(8 + pairs.len() * PairEntryShort::WIRE_SIZE);
        frame.extend_from_slice(&(pairs.len() as u64).to_le_bytes());
        for p in pairs.iter() {
            p.write_to(&mut frame);
        }
        inner
            .pairs_out
            .write_all(&frame)
            .map_err(|e| PipelineError::io(&self.path, "write pairs frame", e))?;
        inner
            .pairs_out
            .flush()
            .map_err(|e| PipelineError::io(&self.path, "flush pairs frame", e))?;
        pairs.clear();
        inner.size.merge(&size.hll);
        size.hll.clear();
        Ok(())
    }

    pub fn estimate(&self) -> i64 {
        self.inner.lock().unwrap().size.estimate()
    }
}

/// Read every frame of a chunk's pairs file.
pub fn read_chunk_pairs(path: &Path) -> Result<Vec<PairEntryShort>> {
    let mut data = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut data))
        .map_err(|e| PipelineError::io(path, "read chunk pairs", e))?;
    let mut pairs = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + 8 > data.len() {
            return Err(PipelineError::format(path, "truncated frame header").into());
        }
        let count = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap()) as usize;
        pos += 8;
        let bytes = count * PairEntryShort::WIRE_SIZE;
        if pos + bytes > data.len() {
            return Err(PipelineError::format(path, "truncated frame body").into());
        }
        pairs.extend(
            data[pos..pos + bytes]
                .chunks_exact(PairEntryShort::WIRE_SIZE)
                .map(PairEntryShort::read_from),
        );
        pos += bytes;
    }
    Ok(pairs)
}

pub fn build_chunk_table(
    job: &Job,
    cfg: &Config,
    pair_table: &[PathBuf],
    db_size: i64,
) -> Result<(Vec<PathBuf>, i32)> {
    let shift = bit_length(db_size - 1).saturating_sub(cfg.radix_bits);
    let max_chunk_size = (cfg.chunk_size_bytes()? / TILE_WIDTH).max(1);
    let max_processed = (max_chunk_size / cfg.threads as i64 / 16).clamp(1, 262144);
    let base_dir = job.base_dir().join("chunk_table");
    let chunks_dir = job.base_dir().join("chunks");
    fs::create_dir_all(&chunks_dir)
        .map_err(|e| PipelineError::io(&chunks_dir, "create chunks dir", e))?;

    let output_files =
        RadixFileArray::create(&base_dir, cfg.radix_count(), job.worker_id(), None, "bin")?;
    let queue = SharedCounter::new(base_dir.join("queue"))?;
    let next_chunk = SharedCounter::new(base_dir.join("next_chunk"))?;
    let current_chunk: Mutex<Arc<Chunk>> = Mutex::new(Chunk::create(&next_chunk, &chunks_dir)?);
    let total_pairs = AtomicI64::new(0);
    let distinct_pairs = AtomicI64::new(0);
    let mut buckets_processed = 0i64;

    loop {
        let bucket = queue.fetch_add(1)?;
        if bucket >= pair_table.len() as i64 {
            break;
        }
        let dir = &pair_table[bucket as usize];
        let mut data: Vec<PairEntry> = rfa::load_records(dir)?;
        job.log(format!(
            "Building chunk table. Bucket={}/{} Records={}",
            bucket + 1,
            pair_table.len(),
            data.len()
        ));
        total_pairs.fetch_add(data.len() as i64, Ordering::Relaxed);
        data.par_sort_unstable();

        let ranges = partition_at_key_boundaries(&data, cfg.threads, |p| p.rep_oid);
        std::thread::scope(|s| -> Result<()> {
            let mut handles = Vec::new();
            for range in &ranges {
                let slice = &data[range.clone()];
                let output_files = &output_files;
                let next_chunk = &next_chunk;
                let current_chunk = &current_chunk;
                let chunks_dir = &chunks_dir;
                let distinct_pairs = &distinct_pairs;
                handles.push(s.spawn(move || -> Result<()> {
                    let mut my_chunk = current_chunk.lock().unwrap().clone();
                    let mut buffers = BucketWriter::new(output_files, DEFAULT_BUF_SIZE);
                    let mut pairs_buffer: Vec<PairEntryShort> = Vec::new();
                    let mut size = SizeCounter::new();
                    let mut processed = 0i64;

                    for group in key_groups(slice, |p| p.rep_oid) {
                        let rep_oid = group[0].rep_oid;
                        let rep_len = group[0].rep_len;
                        let rep_radix = (rep_oid as u64 >> shift) as usize;
                        buffers.write(rep_radix, &ChunkTableEntry::new(rep_oid, my_chunk.id))?;
                        size.add(rep_oid, rep_len);
                        processed += rep_len as i64;

                        let mut prev_member = None;
                        for pair in group {
                            if prev_member == Some(pair.member_oid) {
                                continue;
                            }
                            prev_member = Some(pair.member_oid);
                            let member_radix = (pair.member_oid as u64 >> shift) as usize;
                            buffers.write(
                                member_radix,
                                &ChunkTableEntry::new(pair.member_oid, my_chunk.id),
                            )?;
                            size.add(pair.member_oid, pair.member_len);
                            pairs_buffer.push(PairEntryShort {
                                rep_oid,
                                member_oid: pair.member_oid,
                            });
                            distinct_pairs.fetch_add(1, Ordering::Relaxed);
                            processed += pair.member_len as i64;

                            if processed >= max_processed {
                                my_chunk.write(&mut pairs_buffer, &mut size)?;
                                processed = 0;
                                let mut new_chunk = false;
                                {
                                    let mut cur = current_chunk.lock().unwrap();
                                    if !Arc::ptr_eq(&my_chunk, &cur) {
                                        // Another thread rotated; rejoin.
                                        my_chunk = cur.clone();
                                        new_chunk = true;
                                    } else if my_chunk.estimate() >= max_chunk_size {
                                        job.log(format!(
                                            "Chunk {} reached {} tiles, rotating",
                                            cur.id,
                                            my_chunk.estimate()
                                        ));
                                        *cur = Chunk::create(next_chunk, chunks_dir)?;
                                        my_chunk = cur.clone();
                                        new_chunk = true;
                                    }
                                }
                                if new_chunk {
                                    // The open group's pairs continue in the
                                    // fresh chunk; its table needs the
                                    // representative again.
                                    buffers.write(
                                        (rep_oid as u64 >> shift) as usize,
                                        &ChunkTableEntry::new(rep_oid, my_chunk.id),
                                    )?;
                                    size.add(rep_oid, rep_len);
                                    processed += rep_len as i64;
                                }
                            }
                        }
                    }
                    my_chunk.write(&mut pairs_buffer, &mut size)?;
                    buffers.finish()
                }));
            }
            for h in handles {
                h.join().expect("chunk table worker panicked")?;
            }
            Ok(())
        })?;

        {
            let mut cur = current_chunk.lock().unwrap();
            if cur.estimate() >= max_chunk_size {
                *cur = Chunk::create(&next_chunk, &chunks_dir)?;
            }
        }
        rfa::remove_bucket_files(dir)?;
        buckets_processed += 1;
    }

    job.log(format!(
        "Chunk table done. total_pairs={} distinct_pairs={}",
        total_pairs.load(Ordering::Relaxed),
        distinct_pairs.load(Ordering::Relaxed)
    ));
    let buckets = output_files.close()?;
    drop(current_chunk);
    let finished = SharedCounter::new(base_dir.join("finished"))?;
    finished.fetch_add(buckets_processed)?;
    finished.wait_for(pair_table.len() as i64)?;
    let chunk_count = next_chunk.get()? as i32;
    Ok((buckets, chunk_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Sensitivity;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn test_config(job_dir: PathBuf, chunk_size: &str) -> Config {
        Config {
            database: PathBuf::new(),
            output_file: PathBuf::from("out.tsv"),
            job_dir,
            threads: 2,
            sensitivity: Some(Sensitivity::Faster),
            sketch_size: 0,
            member_cover: 80.0,
            mutual_cover: None,
            approx_min_id: 0.0,
            linclust_chunk_size: chunk_size.into(),
            promiscuous_seed_ratio: 0,
            radix_bits: 4,
            sort_memory: 1 << 30,
        }
    }

    fn write_pair_bucket(
        base: &Path,
        pairs: &[PairEntry],
        radix_bits: u32,
        db_size: i64,
    ) -> Vec<PathBuf> {
        let shift = bit_length(db_size - 1).saturating_sub(radix_bits);
        let files =
            RadixFileArray::create(base, 1usize << radix_bits, 0, None, "bin").unwrap();
        let mut w = BucketWriter::new(&files, 64);
        for p in pairs {
            w.write((p.rep_oid as u64 >> shift) as usize, p).unwrap();
        }
        w.finish().unwrap();
        files.close().unwrap()
    }

    fn run_chunk_table(
        dir: &Path,
        pairs: &[PairEntry],
        chunk_size: &str,
        db_size: i64,
    ) -> (Vec<ChunkTableEntry>, Vec<(i32, Vec<PairEntryShort>)>, i32) {
        let cfg = test_config(dir.join("job"), chunk_size);
        let mut job = Job::attach(&dir.join("job")).unwrap();
        job.set_round(1, db_size).unwrap();
        let buckets = write_pair_bucket(&dir.join("job/round_0/pair_table"), pairs, 4, db_size);
        let (table_buckets, chunk_count) =
            build_chunk_table(&job, &cfg, &buckets, db_size).unwrap();

        let mut entries = Vec::new();
        for b in &table_buckets {
            entries.extend(rfa::load_records::<ChunkTableEntry>(b).unwrap());
        }
        let mut chunks = Vec::new();
        for c in 0..chunk_count {
            let path = dir.join(format!("job/round_0/chunks/{}/pairs", c));
            if path.exists() {
                chunks.push((c, read_chunk_pairs(&path).unwrap()));
            }
        }
        (entries, chunks, chunk_count)
    }

    #[test]
    fn test_size_counter_counts_tiles() {
        let mut a = SizeCounter::new();
        a.add(1, 128); // 2 tiles
        a.add(2, 1); // 1 tile
        a.add(1, 128); // repeat, no growth
        let est = a.hll.estimate();
        assert!((2..=4).contains(&est), "estimate {est} for 3 tiles");
    }

    #[test]
    fn test_single_group_one_chunk() {
        let dir = tempdir().unwrap();
        let pairs = [
            PairEntry {
                rep_oid: 0,
                member_oid: 1,
                rep_len: 40,
                member_len: 40,
            },
        ];
        let (entries, chunks, chunk_count) = run_chunk_table(dir.path(), &pairs, "8G", 2);
        assert_eq!(chunk_count, 1);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.chunk == 0));
        let all: Vec<_> = chunks.into_iter().flat_map(|(_, p)| p).collect();
        assert_eq!(
            all,
            vec![PairEntryShort {
                rep_oid: 0,
                member_oid: 1
            }]
        );
    }

    #[test]
    fn test_consecutive_duplicate_members_collapse() {
        let dir = tempdir().unwrap();
        // Same (rep, member) from two seed groups of the same bucket.
        let pairs = [
            PairEntry {
                rep_oid: 0,
                member_oid: 1,
                rep_len: 100,
                member_len: 100,
            },
            PairEntry {
                rep_oid: 0,
                member_oid: 1,
                rep_len: 100,
                member_len: 100,
            },
        ];
        let (entries, chunks, _) = run_chunk_table(dir.path(), &pairs, "8G", 2);
        assert_eq!(entries.len(), 2);
        let all: Vec<_> = chunks.into_iter().flat_map(|(_, p)| p).collect();
        assert_eq!(all.len(), 1);
    }

    /// Chunk invariant: every pair's endpoints are table entries of the
    /// chunk that holds the pair; small chunk target forces rotation and
    /// the representative is re-emitted into each joined chunk.
    #[test]
    fn test_rotation_preserves_chunk_invariant() {
        let dir = tempdir().unwrap();
        // One group: rep 0 with members 1..=3, each 128 residues (2 tiles).
        // 128-byte chunk target = 2 tiles, so the group spans chunks.
        let pairs: Vec<PairEntry> = (1..=3)
            .map(|m| PairEntry {
                rep_oid: 0,
                member_oid: m,
                rep_len: 128,
                member_len: 128,
            })
            .collect();
        let (entries, chunks, chunk_count) = run_chunk_table(dir.path(), &pairs, "128", 4);
        assert!(chunk_count >= 2, "expected rotation, got {chunk_count}");

        let entry_set: HashSet<(i64, i32)> =
            entries.iter().map(|e| (e.oid, e.chunk)).collect();
        let mut seen_pairs = Vec::new();
        for (chunk_id, chunk_pairs) in &chunks {
            for p in chunk_pairs {
                assert!(
                    entry_set.contains(&(p.rep_oid, *chunk_id)),
                    "rep {} missing from chunk {}",
                    p.rep_oid,
                    chunk_id
                );
                assert!(
                    entry_set.contains(&(p.member_oid, *chunk_id)),
                    "member {} missing from chunk {}",
                    p.member_oid,
                    chunk_id
                );
                seen_pairs.push((p.rep_oid, p.member_oid));
            }
        }
        // Every pair appears exactly once across all chunks.
        seen_pairs.sort_unstable();
        seen_pairs.dedup();
        assert_eq!(seen_pairs.len(), 3);
    }
}
