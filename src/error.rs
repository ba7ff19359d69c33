use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ContextError>;

/// Failures that end a walk, an assembly job, or a watch operation.
///
/// Per-file and per-subdirectory read failures are not represented here: they
/// are absorbed where they happen (inline marker or logged warning).
#[derive(Error, Debug)]
pub enum ContextError {
    /// Combined tree + file-content output went over the byte ceiling.
    #[error(
        "context is too long: content limit of {limit} bytes exceeded {detail} (size: {size} bytes)"
    )]
    TooLong {
        limit: usize,
        size: usize,
        detail: String,
    },

    /// The job was superseded or the host is shutting down.
    #[error("context generation was cancelled")]
    Cancelled,

    /// A top-level path (scan root, watch root) could not be read.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("watch backend error: {0}")]
    Watch(#[from] notify::Error),
}

impl ContextError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_too_long(&self) -> bool {
        matches!(self, Self::TooLong { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
