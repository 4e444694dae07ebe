use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use placescout_common::{
    generate_grid, CrawlConfig, CrawlError, CrawlIdentity, CrawlPhaseKey, Result,
};

use crate::frontier::{Frontier, SaturationPolicy};
use crate::ledger::RecordLedger;
use crate::metrics::{CrawlMetrics, MetricsSnapshot};
use crate::state::CrawlState;
use crate::store::{Checkpoint, CheckpointStore, CsvExport, RecordWriter, ResultSink};
use crate::traits::{Geocoder, PlacesQuery};
use crate::workers::{self, DiveShared};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlPhase {
    Idle,
    InitialScan,
    DeepDive,
    Done,
    Interrupted,
    Error,
}

/// Which phases a run may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PhaseSelection {
    /// Initial scan, then deep dive.
    #[default]
    All,
    /// Stop after the initial scan, keeping its checkpoint.
    Initial,
    /// Deep dive from an existing checkpoint only.
    Deep,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlOutcome {
    /// Deep dive drained or hit its ceiling. Checkpoints are gone.
    Completed,
    /// Initial scan done; deep dive left for a later run.
    InitialScanComplete,
    /// Stopped on request after a final checkpoint.
    Interrupted,
}

/// External collaborators and shared handles for a [`Crawler`].
#[derive(TypedBuilder)]
pub struct CrawlDeps {
    pub places: Arc<dyn PlacesQuery>,
    pub geocoder: Arc<dyn Geocoder>,
    #[builder(default = Arc::new(CrawlMetrics::new()))]
    pub metrics: Arc<CrawlMetrics>,
    /// Defaults to a CSV export under the configured data directory.
    #[builder(default, setter(strip_option))]
    pub writer: Option<Box<dyn RecordWriter>>,
    #[builder(default)]
    pub cancel: Arc<AtomicBool>,
}

/// Drives one crawl of one area for one place type.
pub struct Crawler {
    config: CrawlConfig,
    identity: CrawlIdentity,
    session_id: String,
    policy: SaturationPolicy,
    places: Arc<dyn PlacesQuery>,
    geocoder: Arc<dyn Geocoder>,
    metrics: Arc<CrawlMetrics>,
    store: CheckpointStore,
    writer: Option<Box<dyn RecordWriter>>,
    cancel: Arc<AtomicBool>,
    phase: CrawlPhase,
    failed_in: Option<CrawlPhase>,
    initial_scanned: usize,
}

impl Crawler {
    pub fn new(config: CrawlConfig, deps: CrawlDeps) -> Result<Self> {
        config.validate()?;
        let identity = CrawlIdentity::new(&config.city)?;
        let store = CheckpointStore::new(config.checkpoint_dir());
        Ok(Self {
            identity,
            session_id: Uuid::new_v4().to_string(),
            policy: SaturationPolicy::default(),
            places: deps.places,
            geocoder: deps.geocoder,
            metrics: deps.metrics,
            store,
            writer: deps.writer,
            cancel: deps.cancel,
            phase: CrawlPhase::Idle,
            failed_in: None,
            initial_scanned: 0,
            config,
        })
    }

    pub fn identity(&self) -> &CrawlIdentity {
        &self.identity
    }

    pub fn phase(&self) -> CrawlPhase {
        self.phase
    }

    /// Phase the last failed run was in when it hit its error.
    pub fn failed_in(&self) -> Option<CrawlPhase> {
        self.failed_in
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Set to `true` to stop at the next tile boundary with a checkpoint.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    fn stop_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn transition(&mut self, to: CrawlPhase) {
        info!(
            city = self.config.city.as_str(),
            session_id = self.session_id.as_str(),
            from = ?self.phase,
            to = ?to,
            "Phase transition"
        );
        self.phase = to;
    }

    /// Run the selected phases, resuming from checkpoints when present.
    pub async fn run(&mut self, selection: PhaseSelection) -> Result<CrawlReport> {
        let started = Instant::now();
        info!(
            city = self.config.city.as_str(),
            place_type = self.config.place_type.as_str(),
            session_id = self.session_id.as_str(),
            ?selection,
            "Starting crawl"
        );

        match self.run_phases(selection).await {
            Ok((outcome, state)) => {
                let report = self.report(outcome, &state, started.elapsed());
                info!(
                    city = report.city.as_str(),
                    session_id = report.session_id.as_str(),
                    outcome = ?report.outcome,
                    unique_records = report.unique_records,
                    deep_dives = report.deep_dives,
                    elapsed_secs = report.elapsed.as_secs(),
                    "Crawl finished"
                );
                Ok(report)
            }
            Err(e) => {
                let failed_in = self.phase;
                self.failed_in = Some(failed_in);
                self.transition(CrawlPhase::Error);
                tracing::error!(
                    city = self.config.city.as_str(),
                    session_id = self.session_id.as_str(),
                    phase = ?failed_in,
                    error = %e,
                    "Crawl failed"
                );
                Err(e)
            }
        }
    }

    async fn run_phases(&mut self, selection: PhaseSelection) -> Result<(CrawlOutcome, CrawlState)> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => Box::new(CsvExport::new(
                self.config
                    .export_dir()
                    .join(self.identity.export_file_name(&self.config.place_type)),
            )),
        };
        let sink = ResultSink::new(writer, self.config.chunk_size);
        let mut state = self.load_or_start(selection, sink).await?;

        let exported = state.sink.existing_ids()?;
        if !exported.is_empty() {
            let before = state.ledger.len();
            state.ledger.extend(exported);
            info!(
                seeded = state.ledger.len() - before,
                destination = %state.sink.destination(),
                "Seeded ledger from existing export"
            );
        }

        if state.frontier.initial_complete() {
            info!(
                high_density = state.frontier.stack().len(),
                "Initial scan already complete"
            );
        } else if !self.initial_scan(&mut state).await? {
            self.transition(CrawlPhase::Interrupted);
            return Ok((CrawlOutcome::Interrupted, state));
        }

        if selection == PhaseSelection::Initial {
            self.transition(CrawlPhase::Idle);
            return Ok((CrawlOutcome::InitialScanComplete, state));
        }

        let (finished, state) = self.deep_dive(state).await?;
        if finished {
            self.transition(CrawlPhase::Done);
            Ok((CrawlOutcome::Completed, state))
        } else {
            self.transition(CrawlPhase::Interrupted);
            Ok((CrawlOutcome::Interrupted, state))
        }
    }

    /// Deep-dive checkpoint first, then initial-scan checkpoint, then a fresh
    /// grid from the geocoded viewport.
    async fn load_or_start(&self, selection: PhaseSelection, sink: ResultSink) -> Result<CrawlState> {
        let deep_key = self.identity.checkpoint_key(CrawlPhaseKey::DeepDive);
        if let Some(checkpoint) = self.store.load(&deep_key).await? {
            self.ensure_place_type(&checkpoint)?;
            info!(identity = deep_key.as_str(), "Resuming deep dive from checkpoint");
            return Ok(CrawlState::from_checkpoint(checkpoint, sink));
        }

        let initial_key = self.identity.checkpoint_key(CrawlPhaseKey::InitialScan);
        if let Some(checkpoint) = self.store.load(&initial_key).await? {
            self.ensure_place_type(&checkpoint)?;
            if selection == PhaseSelection::Deep && !checkpoint.initial_complete() {
                return Err(CrawlError::Config(format!(
                    "initial scan for {} is incomplete; finish it before --phase deep",
                    self.identity
                )));
            }
            info!(
                identity = initial_key.as_str(),
                cursor = checkpoint.initial_cursor,
                total = checkpoint.initial_tiles.len(),
                "Resuming from initial scan checkpoint"
            );
            return Ok(CrawlState::from_checkpoint(checkpoint, sink));
        }

        if selection == PhaseSelection::Deep {
            return Err(CrawlError::Config(format!(
                "no checkpoint for {}; run the initial scan first",
                self.identity
            )));
        }

        let area = self.geocoder.geocode(&self.config.city).await?;
        let grid = generate_grid(
            &area.viewport,
            self.config.initial_step,
            self.config.viewport_padding,
        )?;
        info!(
            city = self.config.city.as_str(),
            center_lat = area.center.lat,
            center_lng = area.center.lng,
            tiles = grid.len(),
            step = self.config.initial_step,
            "Generated initial grid"
        );
        Ok(CrawlState::new(Frontier::new(grid), RecordLedger::new(), sink))
    }

    /// A checkpoint only resumes a crawl of the same place type. Anything else
    /// is refused and left on disk.
    fn ensure_place_type(&self, checkpoint: &Checkpoint) -> Result<()> {
        if checkpoint.place_type == self.config.place_type {
            return Ok(());
        }
        Err(CrawlError::Config(format!(
            "checkpoint {} belongs to a {:?} crawl, not {:?}; finish it or run `placescout clear` first",
            checkpoint.identity, checkpoint.place_type, self.config.place_type
        )))
    }

    /// Query every initial tile once. Returns `false` if stopped early.
    async fn initial_scan(&mut self, state: &mut CrawlState) -> Result<bool> {
        self.transition(CrawlPhase::InitialScan);
        let total = state.frontier.initial_tiles().len();
        let interval = (self.config.checkpoint_every as usize).saturating_mul(10).max(1);
        if state.frontier.initial_cursor() > 0 {
            info!(position = state.frontier.initial_cursor(), total, "Resuming initial scan");
        }

        while let Some(tile) = state.frontier.next_initial() {
            if self.stop_requested() {
                info!(position = state.frontier.initial_cursor(), total, "Stop requested during initial scan");
                self.save_checkpoint(state, CrawlPhaseKey::InitialScan).await?;
                return Ok(false);
            }

            let position = state.frontier.initial_cursor() + 1;
            let radius = self
                .config
                .initial_radius_m
                .unwrap_or_else(|| tile.search_radius_m());
            self.metrics.record_tile_query();
            let outcome = self
                .places
                .query(tile.lat(), tile.lng(), radius, &self.config.place_type)
                .await;
            let returned = outcome.records.len();
            let saturated = self.policy.is_saturated(&outcome);
            let added = state.absorb(outcome, &self.metrics).await?;

            if saturated {
                state.frontier.push_saturated(tile);
                info!(tile = %tile, "High-density tile queued for deep dive");
            }
            state.frontier.advance_initial();
            self.initial_scanned += 1;
            tracing::debug!(tile = %tile, position, total, returned, added, "Scanned tile");

            if position % 5 == 0 || position == total {
                self.metrics.log_summary(&self.session_id, "initial_scan");
            }
            if position % interval == 0 && position < total {
                self.save_checkpoint(state, CrawlPhaseKey::InitialScan).await?;
            }
        }

        self.save_checkpoint(state, CrawlPhaseKey::InitialScan).await?;
        info!(
            tiles = total,
            high_density = state.frontier.stack().len(),
            unique_records = state.ledger.len(),
            "Initial scan complete"
        );
        Ok(true)
    }

    /// Drain the high-density stack with `max_workers` workers.
    ///
    /// Returns `(true, state)` when the crawl is finished and checkpoints are
    /// removed, `(false, state)` when stopped on request.
    async fn deep_dive(&mut self, state: CrawlState) -> Result<(bool, CrawlState)> {
        self.transition(CrawlPhase::DeepDive);
        info!(
            stack = state.frontier.stack().len(),
            deep_count = state.frontier.deep_count(),
            max_deep_dives = self.config.max_deep_dives,
            workers = self.config.max_workers,
            "Starting deep dive"
        );

        let deep_key = self.identity.checkpoint_key(CrawlPhaseKey::DeepDive);
        let shared = Arc::new(
            DiveShared::builder()
                .state(tokio::sync::Mutex::new(state))
                .places(self.places.clone())
                .metrics(self.metrics.clone())
                .store(self.store.clone())
                .cancel(self.cancel.clone())
                .policy(self.policy)
                .checkpoint_key(deep_key.clone())
                .category(self.config.place_type.clone())
                .session_id(self.session_id.clone())
                .min_step(self.config.min_step)
                .max_deep_dives(self.config.max_deep_dives)
                .checkpoint_every(self.config.checkpoint_every)
                .build(),
        );
        let result = workers::run_deep_dive(shared.clone(), self.config.max_workers).await;
        let shared = Arc::try_unwrap(shared).map_err(|_| {
            CrawlError::Anyhow(anyhow::anyhow!("deep dive workers outlived the pool"))
        })?;
        result?;
        let mut state = shared.into_state();

        let ceiling_hit = state.frontier.deep_count() >= self.config.max_deep_dives;
        if self.stop_requested() && !state.frontier.is_drained() && !ceiling_hit {
            info!(
                stack = state.frontier.stack().len(),
                deep_count = state.frontier.deep_count(),
                "Stop requested during deep dive"
            );
            self.save_checkpoint(&mut state, CrawlPhaseKey::DeepDive).await?;
            return Ok((false, state));
        }

        state.flush_final().await?;
        if ceiling_hit && !state.frontier.stack().is_empty() {
            warn!(
                remaining = state.frontier.stack().len(),
                max_deep_dives = self.config.max_deep_dives,
                "Deep dive ceiling reached, remaining tiles dropped"
            );
        }
        self.metrics.log_summary(&self.session_id, "deep_dive");
        self.store.delete(&deep_key).await?;
        self.store
            .delete(&self.identity.checkpoint_key(CrawlPhaseKey::InitialScan))
            .await?;
        Ok((true, state))
    }

    async fn save_checkpoint(&self, state: &mut CrawlState, phase: CrawlPhaseKey) -> Result<()> {
        let Some(snapshot) = state
            .checkpoint_ready(self.identity.checkpoint_key(phase), &self.config.place_type)
            .await?
        else {
            return Ok(());
        };
        let result = self.store.save(&snapshot).await.map(|_| ());
        state.note_storage_result(result, "checkpoint")
    }

    fn report(&self, outcome: CrawlOutcome, state: &CrawlState, elapsed: Duration) -> CrawlReport {
        CrawlReport {
            city: self.config.city.clone(),
            place_type: self.config.place_type.clone(),
            session_id: self.session_id.clone(),
            outcome,
            initial_tiles: state.frontier.initial_tiles().len(),
            initial_scanned: self.initial_scanned,
            deep_dives: state.frontier.deep_count(),
            skipped_tiles: state.frontier.skipped(),
            subdivisions: state.frontier.subdivisions(),
            remaining_stack: state.frontier.stack().len(),
            unique_records: state.ledger.len(),
            rows_written: state.sink.rows_written(),
            flushes: state.sink.flushes(),
            destination: state.sink.destination(),
            elapsed,
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub city: String,
    pub place_type: String,
    pub session_id: String,
    pub outcome: CrawlOutcome,
    pub initial_tiles: usize,
    /// Initial tiles queried by this run (excludes ones done before a resume).
    pub initial_scanned: usize,
    pub deep_dives: u64,
    pub skipped_tiles: u64,
    pub subdivisions: u64,
    pub remaining_stack: usize,
    pub unique_records: usize,
    pub rows_written: u64,
    pub flushes: u64,
    pub destination: String,
    pub elapsed: Duration,
    pub metrics: MetricsSnapshot,
}

impl fmt::Display for CrawlReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Crawl Complete ===")?;
        writeln!(f, "City:               {}", self.city)?;
        writeln!(f, "Place type:         {}", self.place_type)?;
        writeln!(f, "Outcome:            {:?}", self.outcome)?;
        writeln!(f, "Initial tiles:      {} ({} this run)", self.initial_tiles, self.initial_scanned)?;
        writeln!(f, "Deep dives:         {}", self.deep_dives)?;
        writeln!(f, "Subdivisions:       {}", self.subdivisions)?;
        writeln!(f, "Skipped tiles:      {}", self.skipped_tiles)?;
        writeln!(f, "Remaining stack:    {}", self.remaining_stack)?;
        writeln!(f, "Unique records:     {}", self.unique_records)?;
        writeln!(f, "Rows written:       {} in {} flushes", self.rows_written, self.flushes)?;
        writeln!(f, "Export:             {}", self.destination)?;
        writeln!(f, "Elapsed:            {:.1}s", self.elapsed.as_secs_f64())?;
        writeln!(f, "\n--- API Usage ---")?;
        write!(f, "{}", self.metrics)
    }
}
