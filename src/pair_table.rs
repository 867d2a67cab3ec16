//! Pair-table builder: group sorted seed entries, emit candidate pairs.
//!
//! Each sorted seed bucket is split into thread sub-ranges at seed-key
//! boundaries; every thread walks its groups of equal key and emits pairs
//! under the job's coverage policy, partitioned by the representative's OID
//! radix. Duplicate pairs from different seed groups are left in place; the
//! chunk-table stage eliminates them after its own sort.

use std::path::PathBuf;

use anyhow::Result;
use rayon::prelude::*;

use crate::config::Config;
use crate::job::Job;
use crate::rfa::{self, BucketWriter, RadixFileArray, DEFAULT_BUF_SIZE};
use crate::sync::SharedCounter;
use crate::types::{bit_length, PairEntry, SeedEntry};

/// Iterate runs of equal key over a sorted slice.
pub fn key_groups<'a, T, K, F>(data: &'a [T], key: F) -> impl Iterator<Item = &'a [T]>
where
    K: PartialEq,
    F: Fn(&T) -> K + 'a,
{
    let mut start = 0;
    std::iter::from_fn(move || {
        if start >= data.len() {
            return None;
        }
        let k = key(&data[start]);
        let mut end = start + 1;
        while end < data.len() && key(&data[end]) == k {
            end += 1;
        }
        let group = &data[start..end];
        start = end;
        Some(group)
    })
}

/// Split `data` into at most `parts` ranges whose boundaries never separate
/// records of equal key.
pub fn partition_at_key_boundaries<T, K, F>(data: &[T], parts: usize, key: F) -> Vec<std::ops::Range<usize>>
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let mut ranges = Vec::new();
    if data.is_empty() {
        return ranges;
    }
    let step = data.len().div_ceil(parts);
    let mut start = 0;
    while start < data.len() {
        let mut end = (start + step).min(data.len());
        while end < data.len() && key(&data[end]) == key(&data[end - 1]) {
            end += 1;
        }
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Index of the group's representative: longest member, ties broken by
/// smallest OID.
fn representative(group: &[SeedEntry]) -> usize {
    let mut rep = 0;
    for (i, e) in group.iter().enumerate().skip(1) {
        if e.len > group[rep].len || (e.len == group[rep].len && e.oid < group[rep].oid) {
            rep = i;
        }
    }
    rep
}

/// Uni-directional coverage: the representative anchors every pair, members
/// must reach `member_cover` percent of its length.
fn emit_pairs_uni_cov(
    group: &[SeedEntry],
    buffers: &mut BucketWriter<'_>,
    shift: u32,
    member_cover: f64,
) -> Result<()> {
    let rep = group[representative(group)];
    let threshold = member_cover / 100.0;
    for m in group {
        if m.oid == rep.oid {
            continue;
        }
        if m.len as f64 / rep.len as f64 >= threshold {
            let radix = (rep.oid as u64 >> shift) as usize;
            buffers.write(
                radix,
                &PairEntry {
                    rep_oid: rep.oid,
                    member_oid: m.oid,
                    rep_len: rep.len,
                    member_len: m.len,
                },
            )?;
        }
    }
    Ok(())
}

/// Mutual coverage: every in-group pair whose shorter side reaches
/// `mutual_cover` percent of the longer; the longer sequence is the
/// representative, equal lengths anchor on the smaller OID.
fn emit_pairs_mutual_cov(
    group: &[SeedEntry],
    buffers: &mut BucketWriter<'_>,
    shift: u32,
    mutual_cover: f64,
) -> Result<()> {
    let threshold = mutual_cover / 100.0;
    for (i, a) in group.iter().enumerate() {
        for b in &group[i + 1..] {
            if a.oid == b.oid {
                continue;
            }
            let (shorter, longer) = if a.len < b.len || (a.len == b.len && a.oid > b.oid) {
                (a, b)
            } else {
                (b, a)
            };
            if shorter.len as f64 / longer.len as f64 >= threshold {
                let radix = (longer.oid as u64 >> shift) as usize;
                buffers.write(
                    radix,
                    &PairEntry {
                        rep_oid: longer.oid,
                        member_oid: shorter.oid,
                        rep_len: longer.len,
                        member_len: shorter.len,
                    },
                )?;
            }
        }
    }
    Ok(())
}

pub fn build_pair_table(
    job: &Job,
    cfg: &Config,
    seed_table: &[PathBuf],
    db_size: i64,
    output_files: &RadixFileArray,
) -> Result<Vec<PathBuf>> {
    let shift = bit_length(db_size - 1).saturating_sub(cfg.radix_bits);
    let Some(stage_dir) = seed_table.first().and_then(|b| b.parent()) else {
        return Ok(output_files.buckets());
    };
    // Floor keeps the cutoff from degenerating on small databases.
    let promiscuous_cutoff = if cfg.promiscuous_seed_ratio > 0 {
        Some((db_size / cfg.promiscuous_seed_ratio).max(64))
    } else {
        None
    };
    let queue = SharedCounter::new(stage_dir.join("pair_table_queue"))?;
    let mut buckets_processed = 0i64;

    loop {
        let bucket = queue.fetch_add(1)?;
        if bucket >= seed_table.len() as i64 {
            break;
        }
        let dir = &seed_table[bucket as usize];
        let mut data: Vec<SeedEntry> = rfa::load_records(dir)?;
        job.log(format!(
            "Building pair table. Bucket={}/{} Records={}",
            bucket + 1,
            seed_table.len(),
            data.len()
        ));
        data.par_sort_unstable();

        let ranges = partition_at_key_boundaries(&data, cfg.threads, |e| e.key);
        std::thread::scope(|s| -> Result<()> {
            let mut handles = Vec::new();
            for range in &ranges {
                let slice = &data[range.clone()];
                handles.push(s.spawn(move || -> Result<()> {
                    let mut buffers = BucketWriter::new(output_files, DEFAULT_BUF_SIZE);
                    for group in key_groups(slice, |e| e.key) {
                        if let Some(cutoff) = promiscuous_cutoff {
                            if group.len() as i64 >= cutoff {
                                continue;
                            }
                        }
                        match cfg.mutual_cover {
                            None => {
                                emit_pairs_uni_cov(group, &mut buffers, shift, cfg.member_cover)?
                            }
                            Some(mc) => emit_pairs_mutual_cov(group, &mut buffers, shift, mc)?,
                        }
                    }
                    buffers.finish()
                }));
            }
            for h in handles {
                h.join().expect("pair table worker panicked")?;
            }
            Ok(())
        })?;

        rfa::remove_bucket_files(dir)?;
        buckets_processed += 1;
    }

    let finished = SharedCounter::new(stage_dir.join("pair_table_finished"))?;
    finished.fetch_add(buckets_processed)?;
    finished.wait_for(seed_table.len() as i64)?;
    Ok(output_files.buckets())
}
