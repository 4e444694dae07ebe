use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use placescout_common::{CrawlError, Result, Tile, TileKey};

/// Version written into every checkpoint. Loads reject anything else.
pub const FORMAT_VERSION: &str = "3.0";

/// Durable snapshot of crawl progress for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: String,
    pub timestamp: DateTime<Utc>,
    pub identity: String,
    /// Category the crawl queries. A checkpoint only resumes a crawl of the
    /// same place type.
    pub place_type: String,
    pub initial_tiles: Vec<Tile>,
    /// Initial tiles already queried. Equal to `initial_tiles.len()` once the
    /// initial scan is complete.
    #[serde(default)]
    pub initial_cursor: usize,
    pub high_density_stack: Vec<Tile>,
    pub processed: BTreeSet<TileKey>,
    pub record_ids: Vec<String>,
    pub deep_count: u64,
}

impl Checkpoint {
    pub fn initial_complete(&self) -> bool {
        self.initial_cursor >= self.initial_tiles.len()
    }
}

/// Checkpoint files under one directory, one file per identity.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("checkpoint_{identity}.json"))
    }

    /// Write the checkpoint atomically: temp file, fsync, rename.
    ///
    /// A crash at any point leaves either the previous file or the new one.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.path_for(&checkpoint.identity);
        let body = serde_json::to_vec_pretty(checkpoint)?;
        let dir = self.dir.clone();
        let target = path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&dir, &target, &body))
            .await
            .map_err(|e| CrawlError::Anyhow(anyhow::anyhow!("checkpoint writer panicked: {e}")))??;

        debug!(
            path = %path.display(),
            stack = checkpoint.high_density_stack.len(),
            processed = checkpoint.processed.len(),
            records = checkpoint.record_ids.len(),
            "Checkpoint saved"
        );
        Ok(path)
    }

    /// Load the checkpoint for `identity`.
    ///
    /// A missing file is `Ok(None)`. An unreadable, unparseable, mismatched or
    /// wrong-version file is [`CrawlError::CorruptCheckpoint`]: the crawl stops
    /// rather than silently starting over.
    pub async fn load(&self, identity: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(identity);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CrawlError::storage(&path, e)),
        };

        let corrupt = |reason: String| CrawlError::CorruptCheckpoint {
            path: path.clone(),
            reason,
        };

        let value: Value =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(format!("invalid JSON: {e}")))?;
        match value.get("format_version").and_then(Value::as_str) {
            Some(FORMAT_VERSION) => {}
            Some(other) => {
                return Err(corrupt(format!(
                    "format version {other:?}, expected {FORMAT_VERSION:?}"
                )))
            }
            None => return Err(corrupt("missing format_version".into())),
        }
        let checkpoint: Checkpoint =
            serde_json::from_value(value).map_err(|e| corrupt(format!("malformed fields: {e}")))?;
        if checkpoint.identity != identity {
            return Err(corrupt(format!(
                "belongs to {:?}, expected {identity:?}",
                checkpoint.identity
            )));
        }

        info!(
            path = %path.display(),
            saved_at = %checkpoint.timestamp,
            stack = checkpoint.high_density_stack.len(),
            processed = checkpoint.processed.len(),
            records = checkpoint.record_ids.len(),
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Remove the checkpoint for `identity`. Returns whether a file existed.
    pub async fn delete(&self, identity: &str) -> Result<bool> {
        let path = self.path_for(identity);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "Deleted checkpoint");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CrawlError::storage(&path, e)),
        }
    }
}

fn write_atomic(dir: &Path, target: &Path, body: &[u8]) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| CrawlError::storage(dir, e))?;

    let mut tmp_name = target.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let written = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(body)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written {
        if let Err(cleanup) = std::fs::remove_file(&tmp) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temp checkpoint");
            }
        }
        return Err(CrawlError::storage(&tmp, e));
    }

    std::fs::rename(&tmp, target).map_err(|e| CrawlError::storage(target, e))
}
