//! Structured error type for the storage layer.
//!
//! The filesystem primitives (shared counters, radix file arrays, volumes)
//! attach path and operation context through `PipelineError`; higher-level
//! pipeline code uses `anyhow::Result` and wraps these transparently.

use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum PipelineError {
    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    /// Invalid on-disk structure (truncated record stream, bad sidecar, ...).
    Format { path: PathBuf, detail: String },

    /// Invalid parameters or violated data invariants.
    Validation(String),
}

impl PipelineError {
    pub fn io(path: &Path, operation: &'static str, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.to_path_buf(),
            operation,
            source,
        }
    }

    pub fn format(path: &Path, detail: impl Into<String>) -> Self {
        PipelineError::Format {
            path: path.to_path_buf(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Io {
                path,
                operation,
                source,
            } => {
                write!(
                    f,
                    "I/O error during {} on '{}': {}",
                    operation,
                    path.display(),
                    source
                )
            }
            PipelineError::Format { path, detail } => {
                write!(f, "Invalid data in '{}': {}", path.display(), detail)
            }
            PipelineError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
