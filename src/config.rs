//! Job configuration: CLI options, optional TOML file, sensitivity presets.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::seeds::Shape;

/// Sensitivity preset: sketch size and spaced-seed shape set per round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    Faster,
    Fast,
    Default,
    Sensitive,
}

impl Sensitivity {
    /// Per-sequence sketch cap; 0 means unbounded.
    pub fn sketch_size(&self) -> usize {
        match self {
            Sensitivity::Faster => 16,
            Sensitivity::Fast => 32,
            Sensitivity::Default => 0,
            Sensitivity::Sensitive => 0,
        }
    }

    pub fn shape_masks(&self) -> &'static [&'static str] {
        match self {
            Sensitivity::Faster => &["111111111111"],
            Sensitivity::Fast => &["11011011011011011"],
            Sensitivity::Default => &["11011011011011011", "11101001101011111"],
            Sensitivity::Sensitive => &[
                "11011011011011011",
                "11101001101011111",
                "110100111010110111",
            ],
        }
    }

    pub fn shapes(&self) -> Vec<Shape> {
        self.shape_masks().iter().map(|m| Shape::from_mask(m)).collect()
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Sensitivity::Faster => "faster",
            Sensitivity::Fast => "fast",
            Sensitivity::Default => "default",
            Sensitivity::Sensitive => "sensitive",
        };
        f.write_str(s)
    }
}

impl FromStr for Sensitivity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "faster" => Ok(Sensitivity::Faster),
            "fast" => Ok(Sensitivity::Fast),
            "default" => Ok(Sensitivity::Default),
            "sensitive" => Ok(Sensitivity::Sensitive),
            other => Err(anyhow!(
                "unknown sensitivity '{}' (expected faster, fast, default, sensitive)",
                other
            )),
        }
    }
}

/// Round sequence for a target approximate identity. Higher identity needs
/// fewer, faster rounds; the final round is always the most sensitive one.
pub fn cluster_steps(approx_min_id: f64) -> Vec<Sensitivity> {
    if approx_min_id >= 90.0 {
        vec![Sensitivity::Faster]
    } else if approx_min_id >= 50.0 {
        vec![Sensitivity::Faster, Sensitivity::Fast]
    } else if approx_min_id > 0.0 {
        vec![Sensitivity::Faster, Sensitivity::Fast, Sensitivity::Default]
    } else {
        vec![
            Sensitivity::Faster,
            Sensitivity::Fast,
            Sensitivity::Sensitive,
        ]
    }
}

/// Parse a byte-size expression such as `"8G"`, `"512M"` or `"1024"`.
pub fn parse_bytes(expr: &str) -> Result<i64> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(anyhow!("empty byte-size expression"));
    }
    let (digits, suffix) = match expr.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(pos) => expr.split_at(pos),
        None => (expr, ""),
    };
    let value: f64 = digits
        .parse()
        .with_context(|| format!("bad byte-size expression '{}'", expr))?;
    let multiplier: i64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        other => return Err(anyhow!("unknown byte-size suffix '{}'", other)),
    };
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 1.0 {
        return Err(anyhow!("byte-size expression '{}' is out of range", expr));
    }
    Ok(bytes as i64)
}

/// Fully resolved job configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: PathBuf,
    pub output_file: PathBuf,
    pub job_dir: PathBuf,
    pub threads: usize,
    /// Forces a single round at this sensitivity; otherwise the round
    /// sequence comes from `approx_min_id`.
    pub sensitivity: Option<Sensitivity>,
    /// 0 selects the preset default.
    pub sketch_size: usize,
    pub member_cover: f64,
    pub mutual_cover: Option<f64>,
    pub approx_min_id: f64,
    pub linclust_chunk_size: String,
    /// Seed groups larger than `db_size / ratio` are skipped; 0 disables.
    pub promiscuous_seed_ratio: i64,
    pub radix_bits: u32,
    /// In-memory budget for the external sort, in bytes.
    pub sort_memory: i64,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.output_file.as_os_str().is_empty() {
            return Err(anyhow!("option missing: output file (--output/-o)"));
        }
        if self.threads == 0 {
            return Err(anyhow!("threads must be at least 1"));
        }
        if !(0.0..=100.0).contains(&self.member_cover) {
            return Err(anyhow!("member-cover must be between 0 and 100"));
        }
        if let Some(mc) = self.mutual_cover {
            if !(0.0..=100.0).contains(&mc) {
                return Err(anyhow!("mutual-cover must be between 0 and 100"));
            }
        }
        if !(0.0..=100.0).contains(&self.approx_min_id) {
            return Err(anyhow!("approx-min-id must be between 0 and 100"));
        }
        if self.radix_bits == 0 || self.radix_bits > 16 {
            return Err(anyhow!("radix-bits must be between 1 and 16"));
        }
        self.chunk_size_bytes()?;
        Ok(())
    }

    pub fn radix_count(&self) -> usize {
        1usize << self.radix_bits
    }

    pub fn chunk_size_bytes(&self) -> Result<i64> {
        parse_bytes(&self.linclust_chunk_size)
    }

    /// Per-sequence sketch cap for a round: explicit option wins, then the
    /// preset; a preset of 0 means unbounded.
    pub fn effective_sketch_size(&self, sensitivity: Sensitivity) -> usize {
        if self.sketch_size > 0 {
            self.sketch_size
        } else {
            sensitivity.sketch_size()
        }
    }

    /// Round sequence for this job.
    pub fn steps(&self) -> Vec<Sensitivity> {
        match self.sensitivity {
            Some(s) => vec![s],
            None => cluster_steps(self.approx_min_id),
        }
    }
}

// ============================================================================
// TOML job file
// ============================================================================

/// Optional TOML job file mirroring the CLI options; CLI flags win on merge.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub database: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub job_dir: Option<PathBuf>,
    pub threads: Option<usize>,
    pub sensitivity: Option<String>,
    pub sketch_size: Option<usize>,
    pub member_cover: Option<f64>,
    pub mutual_cover: Option<f64>,
    pub approx_min_id: Option<f64>,
    pub chunk_size: Option<String>,
    pub promiscuous_seed_ratio: Option<i64>,
    pub radix_bits: Option<u32>,
    pub sort_memory: Option<String>,
}

pub fn parse_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents).context("failed to parse TOML config")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            database: PathBuf::from("db.fasta"),
            output_file: PathBuf::from("clusters.tsv"),
            job_dir: PathBuf::from("job"),
            threads: 2,
            sensitivity: None,
            sketch_size: 0,
            member_cover: 80.0,
            mutual_cover: None,
            approx_min_id: 0.0,
            linclust_chunk_size: "8G".into(),
            promiscuous_seed_ratio: 32,
            radix_bits: 8,
            sort_memory: 1 << 30,
        }
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("1024").unwrap(), 1024);
        assert_eq!(parse_bytes("8G").unwrap(), 8 << 30);
        assert_eq!(parse_bytes("512m").unwrap(), 512 << 20);
        assert_eq!(parse_bytes("1.5K").unwrap(), 1536);
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("8Q").is_err());
        assert!(parse_bytes("0").is_err());
    }

    #[test]
    fn test_missing_output_fails_validation() {
        let mut cfg = base_config();
        cfg.output_file = PathBuf::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_steps_from_approx_min_id() {
        assert_eq!(cluster_steps(95.0), vec![Sensitivity::Faster]);
        assert_eq!(
            cluster_steps(60.0),
            vec![Sensitivity::Faster, Sensitivity::Fast]
        );
        assert_eq!(cluster_steps(0.0).len(), 3);
        let mut cfg = base_config();
        cfg.sensitivity = Some(Sensitivity::Fast);
        assert_eq!(cfg.steps(), vec![Sensitivity::Fast]);
    }

    #[test]
    fn test_sensitivity_parse_roundtrip() {
        for s in [
            Sensitivity::Faster,
            Sensitivity::Fast,
            Sensitivity::Default,
            Sensitivity::Sensitive,
        ] {
            assert_eq!(s.to_string().parse::<Sensitivity>().unwrap(), s);
        }
        assert!("turbo".parse::<Sensitivity>().is_err());
    }

    #[test]
    fn test_effective_sketch_size() {
        let mut cfg = base_config();
        assert_eq!(cfg.effective_sketch_size(Sensitivity::Faster), 16);
        assert_eq!(cfg.effective_sketch_size(Sensitivity::Default), 0);
        cfg.sketch_size = 7;
        assert_eq!(cfg.effective_sketch_size(Sensitivity::Faster), 7);
    }

    #[test]
    fn test_config_file_parse() {
        let toml = r#"
            database = "seqs.fasta"
            output = "out.tsv"
            threads = 8
            sensitivity = "fast"
            chunk_size = "2G"
        "#;
        let parsed: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(parsed.threads, Some(8));
        assert_eq!(parsed.sensitivity.as_deref(), Some("fast"));
        assert_eq!(parsed.chunk_size.as_deref(), Some("2G"));
    }

    #[test]
    fn test_config_file_rejects_unknown_keys() {
        let toml = r#"banana = 1"#;
        assert!(toml::from_str::<ConfigFile>(toml).is_err());
    }

    #[test]
    fn test_shapes_are_well_formed() {
        for s in [
            Sensitivity::Faster,
            Sensitivity::Fast,
            Sensitivity::Default,
            Sensitivity::Sensitive,
        ] {
            for shape in s.shapes() {
                assert!(shape.bit_length() <= 64);
                assert!(shape.length() >= 8);
            }
        }
    }
}
