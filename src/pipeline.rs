//! Round driver: stage glue, multi-shape loop, multi-round loop.
//!
//! One `run` call is one worker of the job. Every attached worker executes
//! the same stage sequence; the shared-counter queues spread the work and
//! the per-stage barriers keep the stages in lockstep across processes.

use std::path::PathBuf;

use anyhow::Result;

use crate::align::align_chunks;
use crate::chunk_table::build_chunk_table;
use crate::chunks::build_chunks;
use crate::cluster::{cluster, cluster_bidirectional, output};
use crate::config::{Config, Sensitivity};
use crate::job::Job;
use crate::pair_table::build_pair_table;
use crate::radix_sort::radix_sort;
use crate::rfa::RadixFileArray;
use crate::seed_table::build_seed_table;
use crate::sync::SharedCounter;
use crate::types::{bit_length, ChunkTableEntry, Edge, PairEntry, SeedEntry};
use crate::volumes::VolumedFile;

/// Run the whole multi-round clustering as one worker of the job.
pub fn run(cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let volumes = VolumedFile::open(&cfg.database)?;
    if volumes.records() == 0 {
        return Err(anyhow::anyhow!(
            "database {} contains no sequences",
            cfg.database.display()
        ));
    }
    let mut job = Job::attach(&cfg.job_dir)?;

    if job.worker_id() == 0 {
        match cfg.mutual_cover {
            Some(mc) => job.log(format!("Bi-directional coverage = {}", mc)),
            None => job.log(format!("Uni-directional coverage = {}", cfg.member_cover)),
        }
        job.log(format!("Approx. id = {}", cfg.approx_min_id));
        job.log(format!("#Volumes = {}", volumes.len()));
        job.log(format!("#Sequences = {}", volumes.records()));
    }

    let steps = cfg.steps();
    job.set_round_count(steps.len() as i32);
    let mut current = volumes.clone();
    for (i, &sensitivity) in steps.iter().enumerate() {
        let reps = round(&mut job, cfg, sensitivity, &current)?;
        if i + 1 < steps.len() {
            job.next_round();
            current = VolumedFile::open(&reps)?;
        }
    }

    let output_lock = SharedCounter::new(job.root().join("output_lock"))?;
    if output_lock.fetch_add(1)? == 0 {
        output(&job, cfg, steps.len() as i32, &volumes)?;
    }
    Ok(())
}

/// One clustering round: seed tables over every shape, pair table, chunk
/// table, chunk materialization, alignment, clustering. Returns the next
/// round's volume manifest.
fn round(
    job: &mut Job,
    cfg: &Config,
    sensitivity: Sensitivity,
    volumes: &VolumedFile,
) -> Result<PathBuf> {
    let shapes = sensitivity.shapes();
    job.set_round(volumes.len() as i64, volumes.records())?;
    job.log(format!(
        "Starting round {}/{} sensitivity {} {} shapes ({} sequences)",
        job.round() + 1,
        job.round_count(),
        sensitivity,
        shapes.len(),
        job.round_records()
    ));
    let db_size = volumes.records();
    let oid_bits = bit_length(db_size - 1);

    // The pair-table array accumulates pairs from every shape of the round
    // and closes before the chunk table reads it.
    let pair_base = job.base_dir().join("pair_table");
    let pair_files =
        RadixFileArray::create(&pair_base, cfg.radix_count(), job.worker_id(), None, "bin")?;
    let mut pair_table = Vec::new();
    for shape_idx in 0..shapes.len() {
        let buckets = build_seed_table(job, cfg, volumes, sensitivity, &shapes, shape_idx)?;
        let sorted_seed_table = radix_sort::<SeedEntry>(
            job,
            &buckets,
            shapes[shape_idx].bit_length(),
            cfg.radix_bits,
            cfg.sort_memory,
        )?;
        pair_table = build_pair_table(job, cfg, &sorted_seed_table, db_size, &pair_files)?;
    }
    pair_files.close()?;

    let sorted_pair_table =
        radix_sort::<PairEntry>(job, &pair_table, oid_bits, cfg.radix_bits, cfg.sort_memory)?;
    let (chunk_table, chunk_count) = build_chunk_table(job, cfg, &sorted_pair_table, db_size)?;
    let sorted_chunk_table =
        radix_sort::<ChunkTableEntry>(job, &chunk_table, oid_bits, cfg.radix_bits, cfg.sort_memory)?;
    build_chunks(job, cfg, volumes, &sorted_chunk_table, chunk_count)?;

    let edges = align_chunks(job, cfg, chunk_count, db_size)?;
    if cfg.mutual_cover.is_some() {
        cluster_bidirectional(job, cfg, &edges, volumes)
    } else {
        let sorted_edges =
            radix_sort::<Edge>(job, &edges, oid_bits, cfg.radix_bits, cfg.sort_memory)?;
        cluster(job, cfg, &sorted_edges, volumes)
    }
}
