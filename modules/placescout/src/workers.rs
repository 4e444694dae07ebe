//! Deep-dive worker pool.
//!
//! Workers share one [`CrawlState`] behind a mutex. The mutex is held only for
//! claim and settle steps, never across a provider query, so queries overlap
//! while stack, processed set, ledger and deep-dive count stay consistent.
//! With one worker this runs inline and reduces to the sequential LIFO crawl.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info};
use typed_builder::TypedBuilder;

use placescout_common::{CrawlError, Result};

use crate::frontier::{Claim, SaturationPolicy};
use crate::metrics::CrawlMetrics;
use crate::state::CrawlState;
use crate::store::CheckpointStore;
use crate::traits::PlacesQuery;

#[derive(TypedBuilder)]
pub struct DiveShared {
    state: Mutex<CrawlState>,
    places: Arc<dyn PlacesQuery>,
    metrics: Arc<CrawlMetrics>,
    store: CheckpointStore,
    cancel: Arc<AtomicBool>,
    policy: SaturationPolicy,
    checkpoint_key: String,
    category: String,
    session_id: String,
    min_step: f64,
    max_deep_dives: u64,
    checkpoint_every: u64,
    #[builder(default)]
    save_lock: Mutex<()>,
    #[builder(default)]
    work_ready: Notify,
    #[builder(default)]
    aborted: AtomicBool,
}

impl DiveShared {
    pub fn into_state(self) -> CrawlState {
        self.state.into_inner()
    }

    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.aborted.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.work_ready.notify_waiters();
    }

    /// Periodic deep-dive checkpoint. Saves are serialized so an older
    /// snapshot never overwrites a newer one.
    async fn checkpoint(&self) -> Result<()> {
        let _serial = self.save_lock.lock().await;
        let snapshot = {
            let mut state = self.state.lock().await;
            match state
                .checkpoint_ready(self.checkpoint_key.clone(), &self.category)
                .await?
            {
                Some(snapshot) => snapshot,
                None => return Ok(()),
            }
        };
        let result = self.store.save(&snapshot).await.map(|_| ());
        self.state.lock().await.note_storage_result(result, "checkpoint")
    }
}

/// Run `workers` dive workers until the stack drains, the ceiling is hit, a
/// stop is requested, or a worker fails. The first failure is returned.
pub async fn run_deep_dive(shared: Arc<DiveShared>, workers: usize) -> Result<()> {
    if workers <= 1 {
        return dive_worker(shared, 0).await;
    }

    let mut set = JoinSet::new();
    for worker in 0..workers {
        set.spawn(dive_worker(shared.clone(), worker));
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        let result = joined
            .map_err(|e| CrawlError::Anyhow(anyhow::anyhow!("dive worker panicked: {e}")))
            .and_then(|r| r);
        if let Err(e) = result {
            shared.abort();
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn dive_worker(shared: Arc<DiveShared>, worker: usize) -> Result<()> {
    loop {
        if shared.should_stop() {
            debug!(worker, "Dive worker stopping");
            return Ok(());
        }

        // Registered before the claim so a completion between the claim and
        // the await still wakes us.
        let ready = shared.work_ready.notified();
        let claim = shared
            .state
            .lock()
            .await
            .frontier
            .claim_next(shared.max_deep_dives);
        let tile = match claim {
            Claim::Tile(tile) => tile,
            Claim::Wait => {
                ready.await;
                continue;
            }
            Claim::Exhausted => {
                shared.work_ready.notify_waiters();
                return Ok(());
            }
        };

        shared.metrics.record_tile_query();
        let outcome = shared
            .places
            .query(tile.lat(), tile.lng(), tile.search_radius_m(), &shared.category)
            .await;
        let returned = outcome.records.len();
        let saturated = shared.policy.is_saturated(&outcome);

        let (due, stack_len) = {
            let mut state = shared.state.lock().await;
            let added = state.absorb(outcome, &shared.metrics).await?;
            let subdivided = state.frontier.complete(&tile, saturated, shared.min_step);
            info!(
                worker,
                tile = %tile,
                deep_count = state.frontier.deep_count(),
                returned,
                added,
                subdivided,
                stack = state.frontier.stack().len(),
                "Deep dive"
            );
            (
                state.frontier.completed_dives() % shared.checkpoint_every == 0,
                state.frontier.stack().len(),
            )
        };
        shared.work_ready.notify_waiters();

        if stack_len % 3 == 0 {
            shared.metrics.log_summary(&shared.session_id, "deep_dive");
        }
        if due {
            shared.checkpoint().await?;
        }
    }
}
