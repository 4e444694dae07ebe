use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use placescout_common::{CrawlIdentity, CrawlPhaseKey, Result};

use crate::store::{Checkpoint, CheckpointStore};

/// Counters from one checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub identity: String,
    pub place_type: String,
    pub saved_at: DateTime<Utc>,
    pub initial_tiles: usize,
    pub initial_cursor: usize,
    pub stack: usize,
    pub processed: usize,
    pub records: usize,
    pub deep_count: u64,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            identity: checkpoint.identity.clone(),
            place_type: checkpoint.place_type.clone(),
            saved_at: checkpoint.timestamp,
            initial_tiles: checkpoint.initial_tiles.len(),
            initial_cursor: checkpoint.initial_cursor,
            stack: checkpoint.high_density_stack.len(),
            processed: checkpoint.processed.len(),
            records: checkpoint.record_ids.len(),
            deep_count: checkpoint.deep_count,
        }
    }
}

/// Persisted progress for one area.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlStatus {
    pub identity: String,
    pub initial_scan: Option<CheckpointSummary>,
    pub deep_dive: Option<CheckpointSummary>,
}

impl CrawlStatus {
    pub fn is_empty(&self) -> bool {
        self.initial_scan.is_none() && self.deep_dive.is_none()
    }
}

/// Read both checkpoints for `identity`. Corrupt files surface as errors.
pub async fn crawl_status(store: &CheckpointStore, identity: &CrawlIdentity) -> Result<CrawlStatus> {
    let initial = store
        .load(&identity.checkpoint_key(CrawlPhaseKey::InitialScan))
        .await?;
    let deep = store
        .load(&identity.checkpoint_key(CrawlPhaseKey::DeepDive))
        .await?;
    Ok(CrawlStatus {
        identity: identity.slug().to_string(),
        initial_scan: initial.as_ref().map(CheckpointSummary::from),
        deep_dive: deep.as_ref().map(CheckpointSummary::from),
    })
}

/// Delete both checkpoints for `identity`. Works on corrupt files too.
pub async fn clear_checkpoints(store: &CheckpointStore, identity: &CrawlIdentity) -> Result<usize> {
    let mut removed = 0;
    for phase in [CrawlPhaseKey::InitialScan, CrawlPhaseKey::DeepDive] {
        if store.delete(&identity.checkpoint_key(phase)).await? {
            removed += 1;
        }
    }
    Ok(removed)
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Checkpoints for {}", self.identity)?;
        if self.is_empty() {
            return write!(f, "  none (next run starts fresh)");
        }
        if let Some(initial) = &self.initial_scan {
            writeln!(
                f,
                "  initial scan: {} {}/{} tiles, {} queued, {} records (saved {})",
                initial.place_type,
                initial.initial_cursor,
                initial.initial_tiles,
                initial.stack,
                initial.records,
                initial.saved_at
            )?;
        }
        if let Some(deep) = &self.deep_dive {
            writeln!(
                f,
                "  deep dive:    {} {} dives, {} queued, {} processed, {} records (saved {})",
                deep.place_type,
                deep.deep_count, deep.stack, deep.processed, deep.records, deep.saved_at
            )?;
        }
        Ok(())
    }
}
