use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrawlError>;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Area not found: {0}")]
    NotFound(String),

    #[error("Corrupt checkpoint {path}: {reason}. Run `placescout clear` to discard it")]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("Storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid tile: {0}")]
    InvalidTile(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl CrawlError {
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CrawlError::Storage {
            path: path.into(),
            source,
        }
    }

    /// Storage failures that retrying later will not fix.
    pub fn is_unrecoverable_storage(&self) -> bool {
        match self {
            CrawlError::Storage { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::StorageFull
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CrawlError {
    fn from(err: serde_json::Error) -> Self {
        CrawlError::Serialization(err.to_string())
    }
}
