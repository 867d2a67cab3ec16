//! Baseline clustering stage and final output composer.
//!
//! Clustering assigns every member to the representative of its best edge
//! (highest score, ties to the smaller representative OID), then compresses
//! representative chains so no representative is itself a member. The stage
//! runs on whichever worker reaches it first; the others block on its
//! barrier. Its products per round are a dense assignment table and the
//! representatives volume that seeds the next round.
//!
//! The output composer walks the per-round assignment tables through the
//! `.oid` sidecar chain back to round-0 OIDs and writes the user-visible
//! `representative<TAB>member` table.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use needletail::parse_fastx_file;

use crate::config::Config;
use crate::error::PipelineError;
use crate::job::Job;
use crate::rfa;
use crate::sync::SharedCounter;
use crate::types::Edge;
use crate::volumes::{format_fasta, read_oid_sidecar, VolumedFile};

/// Cluster a round's edges; returns the next round's volume manifest.
pub fn cluster(
    job: &Job,
    cfg: &Config,
    edges: &[PathBuf],
    volumes: &VolumedFile,
) -> Result<PathBuf> {
    run_clustering(job, cfg, edges, volumes)
}

/// Mutual-coverage variant: edges arrive unsorted, which the best-edge scan
/// does not care about.
pub fn cluster_bidirectional(
    job: &Job,
    cfg: &Config,
    edges: &[PathBuf],
    volumes: &VolumedFile,
) -> Result<PathBuf> {
    run_clustering(job, cfg, edges, volumes)
}

fn run_clustering(
    job: &Job,
    _cfg: &Config,
    edges: &[PathBuf],
    volumes: &VolumedFile,
) -> Result<PathBuf> {
    let round_dir = job.base_dir();
    let manifest_path = round_dir.join("reps.vol");
    let gate = SharedCounter::new(round_dir.join("cluster_lock"))?;
    let finished = SharedCounter::new(round_dir.join("cluster_finished"))?;
    if gate.fetch_add(1)? != 0 {
        finished.wait_for(1)?;
        return Ok(manifest_path);
    }

    let db_size = volumes.records();
    let mut best: HashMap<i64, Edge> = HashMap::new();
    for bucket in edges {
        for edge in rfa::load_records::<Edge>(bucket)? {
            let cur = best.entry(edge.member_oid).or_insert(edge);
            if edge.score > cur.score || (edge.score == cur.score && edge.rep_oid < cur.rep_oid) {
                *cur = edge;
            }
        }
    }

    // Path-compress: a member's representative must not itself be assigned
    // away. Chains are acyclic (edges always point to an equal-or-longer
    // sequence, ties to a smaller OID), the cap is a corruption guard.
    let mut assignment: Vec<i64> = (0..db_size).collect();
    for oid in 0..db_size {
        let mut rep = match best.get(&oid) {
            Some(e) => e.rep_oid,
            None => continue,
        };
        let mut steps = 0usize;
        while let Some(e) = best.get(&rep) {
            rep = e.rep_oid;
            steps += 1;
            if steps > best.len() {
                return Err(anyhow!("representative chain cycle at oid {}", oid));
            }
        }
        assignment[oid as usize] = rep;
    }

    write_assignments(&round_dir.join("assignments.bin"), &assignment)?;

    // Representatives (and singletons) seed the next round, ids carrying
    // this round's OIDs for the sidecar chain.
    let reps_path = round_dir.join("reps.fasta");
    let mut rep_count = 0i64;
    {
        let file = File::create(&reps_path)
            .map_err(|e| PipelineError::io(&reps_path, "create representatives", e))?;
        let mut out = BufWriter::new(file);
        let mut buf = Vec::new();
        let mut oid = 0i64;
        for volume in volumes.iter() {
            let mut reader = parse_fastx_file(&volume.path)
                .with_context(|| format!("opening volume {}", volume.path.display()))?;
            while let Some(record) = reader.next() {
                let record = record
                    .with_context(|| format!("reading volume {}", volume.path.display()))?;
                if assignment[oid as usize] == oid {
                    buf.clear();
                    format_fasta(&oid.to_string(), &record.seq(), &mut buf);
                    out.write_all(&buf)
                        .map_err(|e| PipelineError::io(&reps_path, "write representatives", e))?;
                    rep_count += 1;
                }
                oid += 1;
            }
        }
        out.flush()
            .map_err(|e| PipelineError::io(&reps_path, "flush representatives", e))?;
    }
    VolumedFile::create_manifest(&manifest_path, &[(reps_path, rep_count)])?;
    job.log(format!(
        "Clustering done. {} representatives of {} sequences",
        rep_count, db_size
    ));

    finished.fetch_add(1)?;
    Ok(manifest_path)
}

fn write_assignments(path: &Path, assignment: &[i64]) -> Result<()> {
    let file = File::create(path).map_err(|e| PipelineError::io(path, "create assignments", e))?;
    let mut out = BufWriter::new(file);
    for &rep in assignment {
        out.write_all(&rep.to_le_bytes())
            .map_err(|e| PipelineError::io(path, "write assignments", e))?;
    }
    out.flush()
        .map_err(|e| PipelineError::io(path, "flush assignments", e))?;
    Ok(())
}

fn read_assignments(path: &Path) -> Result<Vec<i64>> {
    let data = fs::read(path).map_err(|e| PipelineError::io(path, "read assignments", e))?;
    if data.len() % 8 != 0 {
        return Err(PipelineError::format(path, "assignment table length not a multiple of 8").into());
    }
    Ok(data
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

/// Compose all rounds' assignments into the final clustering and write the
/// user-visible `representative<TAB>member` table, keyed by the original
/// record ids.
pub fn output(job: &Job, cfg: &Config, rounds: i32, db: &VolumedFile) -> Result<()> {
    let mut assignments = Vec::with_capacity(rounds as usize);
    let mut prev_maps = Vec::with_capacity(rounds as usize);
    let mut inverse_maps = Vec::with_capacity(rounds as usize);
    for r in 0..rounds {
        let round_dir = job.root().join(format!("round_{}", r));
        assignments.push(read_assignments(&round_dir.join("assignments.bin"))?);
        if r > 0 {
            let prev_dir = job.root().join(format!("round_{}", r - 1));
            let sidecar = prev_dir.join("reps.fasta.oid");
            let prev_map = read_oid_sidecar(&sidecar)?;
            let inverse: HashMap<i64, i64> = prev_map
                .iter()
                .enumerate()
                .map(|(oid, &prev)| (prev, oid as i64))
                .collect();
            prev_maps.push(prev_map);
            inverse_maps.push(inverse);
        } else {
            prev_maps.push(Vec::new());
            inverse_maps.push(HashMap::new());
        }
    }

    let final_rep = |oid0: i64| -> Result<i64> {
        let mut rep = assignments[0][oid0 as usize];
        for r in 1..rounds as usize {
            let oid_r = *inverse_maps[r].get(&rep).ok_or_else(|| {
                anyhow!("representative {} missing from round {} volumes", rep, r)
            })?;
            rep = assignments[r][oid_r as usize];
        }
        for r in (1..rounds as usize).rev() {
            rep = prev_maps[r][rep as usize];
        }
        Ok(rep)
    };

    // Collect the original record ids so representative lines can name them.
    let mut ids: Vec<String> = Vec::with_capacity(db.records() as usize);
    for volume in db.iter() {
        let mut reader = parse_fastx_file(&volume.path)
            .with_context(|| format!("opening volume {}", volume.path.display()))?;
        while let Some(record) = reader.next() {
            let record =
                record.with_context(|| format!("reading volume {}", volume.path.display()))?;
            let id = record
                .id()
                .split(|&b| b.is_ascii_whitespace())
                .next()
                .unwrap_or(b"");
            ids.push(String::from_utf8_lossy(id).into_owned());
        }
    }

    let out_path = &cfg.output_file;
    let file =
        File::create(out_path).map_err(|e| PipelineError::io(out_path, "create output", e))?;
    let mut out = BufWriter::new(file);
    for oid in 0..db.records() {
        let rep = final_rep(oid)?;
        writeln!(out, "{}\t{}", ids[rep as usize], ids[oid as usize])
            .map_err(|e| PipelineError::io(out_path, "write output", e))?;
    }
    out.flush()
        .map_err(|e| PipelineError::io(out_path, "flush output", e))?;
    job.log(format!("Wrote clustering to {}", out_path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Sensitivity;
    use crate::rfa::{BucketWriter, RadixFileArray};
    use tempfile::tempdir;

    fn test_config(job_dir: PathBuf, output: PathBuf) -> Config {
        Config {
            database: PathBuf::new(),
            output_file: output,
            job_dir,
            threads: 1,
            sensitivity: Some(Sensitivity::Faster),
            sketch_size: 0,
            member_cover: 80.0,
            mutual_cover: None,
            approx_min_id: 0.0,
            linclust_chunk_size: "8G".into(),
            promiscuous_seed_ratio: 0,
            radix_bits: 4,
            sort_memory: 1 << 30,
        }
    }

    fn write_edges(base: &Path, edges: &[Edge]) -> Vec<PathBuf> {
        let files = RadixFileArray::create(base, 1, 0, None, "bin").unwrap();
        let mut w = BucketWriter::new(&files, 64);
        for e in edges {
            w.write(0, e).unwrap();
        }
        w.finish().unwrap();
        files.close().unwrap()
    }

    #[test]
    fn test_best_edge_assignment_and_chain_compression() -> Result<()> {
        let dir = tempdir()?;
        let db_path = dir.path().join("db.fasta");
        fs::write(
            &db_path,
            ">a\nAAAAAAAA\n>b\nCCCCCCCC\n>c\nGGGGGGGG\n>d\nTTTTTTTT\n",
        )?;
        let db = VolumedFile::open(&db_path)?;
        let mut job = Job::attach(&dir.path().join("job"))?;
        job.set_round(1, db.records())?;
        let cfg = test_config(dir.path().join("job"), dir.path().join("out.tsv"));

        // 3 -> 2 (weak), 3 -> 1 (strong), 2 -> 0: expect 3 -> 1, 2 -> 0.
        let edges = write_edges(
            &job.base_dir().join("alignments"),
            &[
                Edge {
                    rep_oid: 2,
                    member_oid: 3,
                    score: 0.5,
                },
                Edge {
                    rep_oid: 1,
                    member_oid: 3,
                    score: 0.9,
                },
                Edge {
                    rep_oid: 0,
                    member_oid: 2,
                    score: 0.8,
                },
            ],
        );

        let manifest = cluster(&job, &cfg, &edges, &db)?;
        let assignment = read_assignments(&job.base_dir().join("assignments.bin"))?;
        assert_eq!(assignment, vec![0, 1, 0, 1]);

        let reps = VolumedFile::open(&manifest)?;
        assert_eq!(reps.records(), 2);
        Ok(())
    }

    #[test]
    fn test_chain_compresses_through_assigned_rep() -> Result<()> {
        let dir = tempdir()?;
        let db_path = dir.path().join("db.fasta");
        fs::write(&db_path, ">a\nAAAAAAAA\n>b\nCCCCCCCC\n>c\nGGGGGGGG\n")?;
        let db = VolumedFile::open(&db_path)?;
        let mut job = Job::attach(&dir.path().join("job"))?;
        job.set_round(1, db.records())?;
        let cfg = test_config(dir.path().join("job"), dir.path().join("out.tsv"));

        // 2 -> 1 and 1 -> 0: member 2 must land on 0.
        let edges = write_edges(
            &job.base_dir().join("alignments"),
            &[
                Edge {
                    rep_oid: 1,
                    member_oid: 2,
                    score: 0.9,
                },
                Edge {
                    rep_oid: 0,
                    member_oid: 1,
                    score: 0.9,
                },
            ],
        );

        cluster(&job, &cfg, &edges, &db)?;
        let assignment = read_assignments(&job.base_dir().join("assignments.bin"))?;
        assert_eq!(assignment, vec![0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_second_caller_waits_and_reuses_result() -> Result<()> {
        let dir = tempdir()?;
        let db_path = dir.path().join("db.fasta");
        fs::write(&db_path, ">a\nAAAAAAAA\n")?;
        let db = VolumedFile::open(&db_path)?;
        let mut job = Job::attach(&dir.path().join("job"))?;
        job.set_round(1, db.records())?;
        let cfg = test_config(dir.path().join("job"), dir.path().join("out.tsv"));

        let edges = write_edges(&job.base_dir().join("alignments"), &[]);
        let first = cluster(&job, &cfg, &edges, &db)?;
        let second = cluster(&job, &cfg, &edges, &db)?;
        assert_eq!(first, second);
        assert_eq!(VolumedFile::open(&second)?.records(), 1);
        Ok(())
    }
}
