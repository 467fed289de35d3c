//! Error type shared by the watch table, pipeline, consumers and store.

use std::io;
use std::path::PathBuf;

use fim_common::DecodeError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum FimError {
    /// A file could not be stat'ed when adding it to the watch set.
    #[error("cannot stat {}: {source}", path.display())]
    Lookup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `remove` was called for a path that was never added.
    #[error("path is not watched: {}", _0.display())]
    NotFound(PathBuf),

    #[error("failed to decode event record: {0}")]
    Decode(#[from] DecodeError),

    /// Update or delete against the kernel rules table failed.
    #[error("kernel table {op} failed for key {key}: {source}")]
    KernelOp {
        op: &'static str,
        key: u64,
        #[source]
        source: BoxError,
    },

    /// The probe reported an inode nobody is watching any more.
    #[error("event for stale kernel key {0}, registration purged")]
    StaleKey(u64),

    /// Records were dropped by the kernel before userspace read them.
    #[error("kernel lost {0} event(s)")]
    EventsLost(u64),

    #[error("baseline store: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("baseline encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

impl FimError {
    pub fn lookup(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Lookup {
            path: path.into(),
            source,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kernel(op: &'static str, key: u64, source: impl Into<BoxError>) -> Self {
        Self::KernelOp {
            op,
            key,
            source: source.into(),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    /// Failures of the baseline store; fatal during startup.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Encoding(_))
    }
}
