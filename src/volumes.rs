//! Sequence volumes: contiguous OID ranges backed by FASTA/FASTQ files.
//!
//! A `VolumedFile` is the ordered set of volumes a clustering round reads.
//! Round 0 opens the user database (a single sequence file or a `.vol`
//! manifest listing several); later rounds open the representatives volume
//! written by the previous round. OIDs are dense and globally ordered by
//! volume: `oid_begin(v) <= oid < oid_begin(v) + record_count(v)` for
//! exactly one volume.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use needletail::parse_fastx_file;

use crate::error::PipelineError;

/// Manifest extension: text lines of `record_count<TAB>path`.
pub const MANIFEST_EXT: &str = "vol";

#[derive(Debug, Clone)]
pub struct Volume {
    pub path: PathBuf,
    pub oid_begin: i64,
    pub record_count: i64,
}

impl Volume {
    /// Path of the sidecar mapping this volume's records to the previous
    /// round's OIDs (little-endian i64 per record).
    pub fn oid_sidecar_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".oid");
        PathBuf::from(name)
    }
}

#[derive(Debug, Clone)]
pub struct VolumedFile {
    volumes: Vec<Volume>,
    manifest: Option<PathBuf>,
}

impl VolumedFile {
    /// Open a database path: either a `.vol` manifest or a single sequence
    /// file (record count established by one streaming pass).
    pub fn open(path: &Path) -> Result<Self> {
        if path.extension().is_some_and(|e| e == MANIFEST_EXT) {
            Self::from_manifest(path)
        } else {
            let count = count_records(path)?;
            Ok(VolumedFile {
                volumes: vec![Volume {
                    path: path.to_path_buf(),
                    oid_begin: 0,
                    record_count: count,
                }],
                manifest: None,
            })
        }
    }

    fn from_manifest(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| PipelineError::io(path, "open manifest", e))?;
        let reader = BufReader::new(file);
        let base = path.parent().unwrap_or(Path::new("."));
        let mut volumes = Vec::new();
        let mut oid_begin = 0i64;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| PipelineError::io(path, "read manifest", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let (count, vol_path) = line.split_once('\t').ok_or_else(|| {
                PipelineError::format(path, format!("manifest line {} lacks a tab", lineno + 1))
            })?;
            let record_count: i64 = count.parse().map_err(|_| {
                PipelineError::format(
                    path,
                    format!("bad record count '{}' on line {}", count, lineno + 1),
                )
            })?;
            let vol_path = Path::new(vol_path);
            let vol_path = if vol_path.is_absolute() {
                vol_path.to_path_buf()
            } else {
                base.join(vol_path)
            };
            volumes.push(Volume {
                path: vol_path,
                oid_begin,
                record_count,
            });
            oid_begin += record_count;
        }
        if volumes.is_empty() {
            return Err(anyhow!("manifest {} lists no volumes", path.display()));
        }
        Ok(VolumedFile {
            volumes,
            manifest: Some(path.to_path_buf()),
        })
    }

    /// Write a manifest covering `volumes` and open it.
    pub fn create_manifest(path: &Path, volumes: &[(PathBuf, i64)]) -> Result<Self> {
        let file = File::create(path).map_err(|e| PipelineError::io(path, "create manifest", e))?;
        let mut writer = BufWriter::new(file);
        for (vol_path, count) in volumes {
            writeln!(writer, "{}\t{}", count, vol_path.display())
                .map_err(|e| PipelineError::io(path, "write manifest", e))?;
        }
        writer
            .flush()
            .map_err(|e| PipelineError::io(path, "write manifest", e))?;
        Self::from_manifest(path)
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn volume(&self, index: usize) -> &Volume {
        &self.volumes[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.iter()
    }

    /// Total records, equal to the global OID range.
    pub fn records(&self) -> i64 {
        self.volumes
            .last()
            .map(|v| v.oid_begin + v.record_count)
            .unwrap_or(0)
    }

    /// Inclusive range of volumes covering `[oid_begin, oid_end)`.
    pub fn find(&self, oid_begin: i64, oid_end: i64) -> &[Volume] {
        debug_assert!(oid_begin < oid_end);
        let first = self
            .volumes
            .partition_point(|v| v.oid_begin + v.record_count <= oid_begin);
        let last = self.volumes.partition_point(|v| v.oid_begin < oid_end);
        &self.volumes[first..last]
    }

    /// Delete the volume files, their sidecars, and the manifest. Only used
    /// for working volumes produced by a previous round.
    pub fn remove(&self) -> Result<()> {
        for v in &self.volumes {
            fs::remove_file(&v.path)
                .with_context(|| format!("removing volume {}", v.path.display()))?;
            let sidecar = v.oid_sidecar_path();
            if sidecar.exists() {
                fs::remove_file(&sidecar)
                    .with_context(|| format!("removing sidecar {}", sidecar.display()))?;
            }
        }
        if let Some(manifest) = &self.manifest {
            fs::remove_file(manifest)
                .with_context(|| format!("removing manifest {}", manifest.display()))?;
        }
        Ok(())
    }
}

/// Count records in a FASTA/FASTQ file (format auto-detected, gzip
/// transparent).
pub fn count_records(path: &Path) -> Result<i64> {
    let mut reader = parse_fastx_file(path)
        .with_context(|| format!("opening sequence file {}", path.display()))?;
    let mut count = 0i64;
    while let Some(record) = reader.next() {
        record.with_context(|| format!("reading sequence file {}", path.display()))?;
        count += 1;
    }
    Ok(count)
}

/// Append a record id to the FASTA buffer as `>id\nseq\n`.
pub fn format_fasta(id: &str, seq: &[u8], out: &mut Vec<u8>) {
    out.push(b'>');
    out.extend_from_slice(id.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(seq);
    out.push(b'\n');
}

/// Parse the leading integer token of a record id written by a previous
/// round's representatives file.
pub fn parse_prev_oid(id: &[u8], origin: &Path) -> Result<i64> {
    let token = id.split(|&b| b.is_ascii_whitespace()).next().unwrap_or(b"");
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            PipelineError::format(
                origin,
                format!(
                    "record id '{}' is not a previous-round OID",
                    String::from_utf8_lossy(id)
                ),
            )
            .into()
        })
}

/// Read an `.oid` sidecar: one little-endian i64 per record of the volume.
pub fn read_oid_sidecar(path: &Path) -> Result<Vec<i64>> {
    let mut data = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut data))
        .map_err(|e| PipelineError::io(path, "read oid sidecar", e))?;
    if data.len() % 8 != 0 {
        return Err(PipelineError::format(path, "sidecar length not a multiple of 8").into());
    }
    Ok(data
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}
