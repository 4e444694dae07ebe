use std::collections::HashSet;

use tracing::debug;

use placescout_common::{record_id, RecordPayload};

/// Every record identifier the crawl has accepted.
///
/// Membership is the only dedup authority: a record is emitted to the sink at
/// most once, no matter how many overlapping tiles return it.
#[derive(Debug, Clone, Default)]
pub struct RecordLedger {
    ids: HashSet<String>,
    unidentified: u64,
}

impl RecordLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            unidentified: 0,
        }
    }

    /// Keep only records whose id has not been seen, recording the new ids.
    ///
    /// Duplicates within `records` itself are also dropped. Records without a
    /// usable id are discarded and counted.
    pub fn filter_new(&mut self, records: Vec<RecordPayload>) -> Vec<RecordPayload> {
        let mut fresh = Vec::with_capacity(records.len());
        for record in records {
            let Some(id) = record_id(&record) else {
                self.unidentified += 1;
                debug!("Dropping record without an identifier");
                continue;
            };
            if self.ids.contains(id) {
                continue;
            }
            self.ids.insert(id.to_string());
            fresh.push(record);
        }
        fresh
    }

    /// Record ids seeded from elsewhere, e.g. rows already exported.
    pub fn extend(&mut self, ids: impl IntoIterator<Item = String>) {
        self.ids.extend(ids);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn unidentified(&self) -> u64 {
        self.unidentified
    }

    /// Ids in sorted order, for stable checkpoint output.
    pub fn sorted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids.iter().cloned().collect();
        ids.sort_unstable();
        ids
    }
}
