use chrono::Utc;
use tracing::{error, warn};

use placescout_common::{CrawlError, Result};

use crate::frontier::Frontier;
use crate::ledger::RecordLedger;
use crate::metrics::CrawlMetrics;
use crate::store::{Checkpoint, ResultSink, FORMAT_VERSION};
use crate::traits::QueryOutcome;

/// Unrecoverable storage errors tolerated in a row before the crawl aborts.
const MAX_UNRECOVERABLE_STRIKES: u32 = 1;

/// Everything the crawl mutates. Checkpoints are taken from this as a whole so
/// the ledger and frontier always describe the same moment.
#[derive(Debug)]
pub struct CrawlState {
    pub frontier: Frontier,
    pub ledger: RecordLedger,
    pub sink: ResultSink,
    io_failures: IoFailures,
}

impl CrawlState {
    pub fn new(frontier: Frontier, ledger: RecordLedger, sink: ResultSink) -> Self {
        Self {
            frontier,
            ledger,
            sink,
            io_failures: IoFailures::default(),
        }
    }

    pub fn from_checkpoint(checkpoint: Checkpoint, sink: ResultSink) -> Self {
        let frontier = Frontier::restore(
            checkpoint.initial_tiles,
            checkpoint.initial_cursor,
            checkpoint.high_density_stack,
            checkpoint.processed,
            checkpoint.deep_count,
        );
        Self::new(frontier, RecordLedger::from_ids(checkpoint.record_ids), sink)
    }

    /// Dedup a query's records into the sink, flushing at the threshold.
    ///
    /// Returns how many records were new. A failed flush is tolerated (the
    /// buffer is kept) unless it is a repeated unrecoverable storage error.
    pub async fn absorb(&mut self, outcome: QueryOutcome, metrics: &CrawlMetrics) -> Result<usize> {
        let returned = outcome.records.len();
        let fresh = self.ledger.filter_new(outcome.records);
        let added = self.sink.append(fresh);
        metrics.record_results(returned as u64, added as u64);

        if self.sink.should_flush(added) {
            self.flush().await?;
        }
        Ok(added)
    }

    /// Flush the sink under the storage failure policy.
    pub async fn flush(&mut self) -> Result<()> {
        match self.sink.flush().await {
            Ok(_) => {
                self.io_failures.reset();
                Ok(())
            }
            Err(e) => self.io_failures.absorb(e, "flush"),
        }
    }

    /// Like [`flush`](Self::flush), but any failure is an error. Used when no
    /// later flush will come.
    pub async fn flush_final(&mut self) -> Result<()> {
        self.sink.flush().await.map(|_| ())
    }

    /// Snapshot for persistence. In-flight deep dives are recorded as still
    /// pending so a resume re-queries them.
    pub fn snapshot(&self, identity: String, place_type: &str) -> Checkpoint {
        Checkpoint {
            format_version: FORMAT_VERSION.to_string(),
            timestamp: Utc::now(),
            identity,
            place_type: place_type.to_string(),
            initial_tiles: self.frontier.initial_tiles().to_vec(),
            initial_cursor: self.frontier.initial_cursor(),
            high_density_stack: self.frontier.persisted_stack(),
            processed: self.frontier.persisted_processed(),
            record_ids: self.ledger.sorted_ids(),
            deep_count: self.frontier.completed_dives(),
        }
    }

    /// Flush, then snapshot. `None` when records are still buffered after a
    /// tolerated flush failure: persisting their ids without the rows would
    /// lose them on a crash.
    pub async fn checkpoint_ready(
        &mut self,
        identity: String,
        place_type: &str,
    ) -> Result<Option<Checkpoint>> {
        self.flush().await?;
        if self.sink.buffered() > 0 {
            warn!(
                buffered = self.sink.buffered(),
                identity = identity.as_str(),
                "Skipping checkpoint until buffered records are flushed"
            );
            return Ok(None);
        }
        Ok(Some(self.snapshot(identity, place_type)))
    }

    /// Route a checkpoint save failure through the same policy as flushes.
    pub fn note_storage_result(&mut self, result: Result<()>, what: &str) -> Result<()> {
        match result {
            Ok(()) => {
                self.io_failures.reset();
                Ok(())
            }
            Err(e) => self.io_failures.absorb(e, what),
        }
    }
}

/// Storage failure policy: warn and retry at the next interval, but abort on a
/// second consecutive unrecoverable error (permission denied, disk full).
#[derive(Debug, Default)]
struct IoFailures {
    unrecoverable: u32,
}

impl IoFailures {
    fn absorb(&mut self, err: CrawlError, what: &str) -> Result<()> {
        if err.is_unrecoverable_storage() {
            self.unrecoverable += 1;
            if self.unrecoverable > MAX_UNRECOVERABLE_STRIKES {
                error!(error = %err, operation = what, "Storage is unusable, aborting");
                return Err(err);
            }
        }
        warn!(error = %err, operation = what, "Storage operation failed, will retry at the next interval");
        Ok(())
    }

    fn reset(&mut self) {
        self.unrecoverable = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{place, saturated_outcome, FailingWriter, MemoryWriter};
    use placescout_common::Tile;
    use std::io::ErrorKind;

    fn state_with(writer: Box<dyn crate::store::RecordWriter>, threshold: usize) -> CrawlState {
        CrawlState::new(
            Frontier::new(vec![Tile::new(0.0, 0.0, 0.01).unwrap()]),
            RecordLedger::new(),
            ResultSink::new(writer, threshold),
        )
    }

    #[tokio::test]
    async fn absorb_dedups_and_counts() {
        let metrics = CrawlMetrics::new();
        let mut state = state_with(Box::new(MemoryWriter::new()), 100);

        let first = QueryOutcome::from_records(vec![place("a"), place("b")], 1);
        let second = QueryOutcome::from_records(vec![place("b"), place("c")], 1);
        assert_eq!(state.absorb(first, &metrics).await.unwrap(), 2);
        assert_eq!(state.absorb(second, &metrics).await.unwrap(), 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.results_returned, 4);
        assert_eq!(snap.unique_results, 3);
        assert_eq!(state.sink.buffered(), 3);
    }

    #[tokio::test]
    async fn absorb_flushes_at_threshold() {
        let metrics = CrawlMetrics::new();
        let writer = MemoryWriter::new();
        let mut state = state_with(Box::new(writer.clone()), 60);

        state.absorb(saturated_outcome("t1"), &metrics).await.unwrap();
        assert_eq!(writer.batches().len(), 1);
        assert_eq!(state.sink.buffered(), 0);
    }

    #[tokio::test]
    async fn transient_flush_failure_is_tolerated() {
        let metrics = CrawlMetrics::new();
        let writer = FailingWriter::new(3, ErrorKind::Other);
        let mut state = state_with(Box::new(writer.clone()), 1);

        for id in ["a", "b", "c"] {
            let outcome = QueryOutcome::from_records(vec![place(id)], 1);
            assert!(state.absorb(outcome, &metrics).await.is_ok());
        }
        assert_eq!(state.sink.buffered(), 3);

        state.flush().await.unwrap();
        assert_eq!(writer.written().len(), 3);
    }

    #[tokio::test]
    async fn second_unrecoverable_failure_aborts() {
        let metrics = CrawlMetrics::new();
        let writer = FailingWriter::new(5, ErrorKind::PermissionDenied);
        let mut state = state_with(Box::new(writer), 1);

        let first = QueryOutcome::from_records(vec![place("a")], 1);
        assert!(state.absorb(first, &metrics).await.is_ok());
        let second = QueryOutcome::from_records(vec![place("b")], 1);
        let err = state.absorb(second, &metrics).await.unwrap_err();
        assert!(err.is_unrecoverable_storage());
    }

    #[tokio::test]
    async fn snapshot_excludes_in_flight_work() {
        let metrics = CrawlMetrics::new();
        let mut state = state_with(Box::new(MemoryWriter::new()), 100);
        let tile = Tile::new(0.0, 0.0, 0.01).unwrap();
        state.frontier.advance_initial();
        state.frontier.push_saturated(tile);
        state
            .absorb(QueryOutcome::from_records(vec![place("a")], 1), &metrics)
            .await
            .unwrap();
        state.frontier.claim_next(10);

        let checkpoint = state.snapshot("x".into(), "bakery");
        assert_eq!(checkpoint.place_type, "bakery");
        assert_eq!(checkpoint.high_density_stack, vec![tile]);
        assert!(checkpoint.processed.is_empty());
        assert_eq!(checkpoint.deep_count, 0);
        assert_eq!(checkpoint.record_ids, vec!["a"]);
        assert!(checkpoint.initial_complete());

        let restored = CrawlState::from_checkpoint(checkpoint, ResultSink::new(Box::new(MemoryWriter::new()), 100));
        assert!(restored.ledger.contains("a"));
        assert_eq!(restored.frontier.stack(), &[tile]);
    }
}
