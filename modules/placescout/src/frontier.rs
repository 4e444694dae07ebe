//! Crawl frontier: the initial grid, the high-density stack, and the processed set.
//!
//! The stack is LIFO, so a saturated tile's children are explored before its
//! siblings (depth-first). A tile key enters `processed` when the tile is
//! claimed, which makes each tile get at most one deep-dive query even when it
//! was pushed several times.

use std::collections::BTreeSet;

use tracing::debug;

use places_client::{MAX_PAGES, MAX_RESULTS_PER_PAGE};
use placescout_common::{Tile, TileKey};

use crate::traits::QueryOutcome;

/// When a query counts as truncated by the provider's result cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaturationPolicy {
    pub max_pages: u32,
    pub max_per_page: u32,
}

impl Default for SaturationPolicy {
    fn default() -> Self {
        Self {
            max_pages: MAX_PAGES,
            max_per_page: MAX_RESULTS_PER_PAGE,
        }
    }
}

impl SaturationPolicy {
    pub fn cap(&self) -> u32 {
        self.max_pages * self.max_per_page
    }

    /// Every page was served and the result cap was hit exactly.
    pub fn is_saturated(&self, outcome: &QueryOutcome) -> bool {
        outcome.pages_consumed == self.max_pages && outcome.total_count == self.cap()
    }
}

/// Result of asking the frontier for deep-dive work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Claim {
    /// Query this tile.
    Tile(Tile),
    /// Nothing queued, but in-flight tiles may still push children.
    Wait,
    /// Stack drained or the deep-dive ceiling is reached.
    Exhausted,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontier {
    initial_tiles: Vec<Tile>,
    initial_cursor: usize,
    stack: Vec<Tile>,
    processed: BTreeSet<TileKey>,
    deep_count: u64,
    in_flight: Vec<Tile>,
    skipped: u64,
    subdivisions: u64,
}

impl Frontier {
    pub fn new(initial_tiles: Vec<Tile>) -> Self {
        Self {
            initial_tiles,
            ..Self::default()
        }
    }

    /// Rebuild from persisted parts. Nothing is in flight after a restore.
    pub fn restore(
        initial_tiles: Vec<Tile>,
        initial_cursor: usize,
        stack: Vec<Tile>,
        processed: BTreeSet<TileKey>,
        deep_count: u64,
    ) -> Self {
        Self {
            initial_cursor: initial_cursor.min(initial_tiles.len()),
            initial_tiles,
            stack,
            processed,
            deep_count,
            ..Self::default()
        }
    }

    // --- Initial scan ---

    pub fn initial_tiles(&self) -> &[Tile] {
        &self.initial_tiles
    }

    /// Index of the next initial tile to query.
    pub fn initial_cursor(&self) -> usize {
        self.initial_cursor
    }

    pub fn next_initial(&self) -> Option<Tile> {
        self.initial_tiles.get(self.initial_cursor).copied()
    }

    pub fn advance_initial(&mut self) {
        if self.initial_cursor < self.initial_tiles.len() {
            self.initial_cursor += 1;
        }
    }

    pub fn initial_complete(&self) -> bool {
        self.initial_cursor >= self.initial_tiles.len()
    }

    /// Queue a saturated initial tile for the deep dive.
    pub fn push_saturated(&mut self, tile: Tile) {
        self.stack.push(tile);
    }

    // --- Deep dive ---

    /// Pop the next unprocessed tile, marking it processed and counting it
    /// against `max_deep_dives`.
    pub fn claim_next(&mut self, max_deep_dives: u64) -> Claim {
        loop {
            if self.deep_count >= max_deep_dives {
                return Claim::Exhausted;
            }
            let Some(tile) = self.stack.pop() else {
                return if self.in_flight.is_empty() {
                    Claim::Exhausted
                } else {
                    Claim::Wait
                };
            };
            let key = tile.key();
            if self.processed.contains(&key) {
                self.skipped += 1;
                debug!(tile = %tile, "Skipping already processed tile");
                continue;
            }
            self.processed.insert(key);
            self.deep_count += 1;
            self.in_flight.push(tile);
            return Claim::Tile(tile);
        }
    }

    /// Settle a claimed tile. A saturated tile wider than `min_step` has its
    /// children pushed SW, SE, NW, NE, so NE is explored first.
    ///
    /// Returns whether the tile was subdivided.
    pub fn complete(&mut self, tile: &Tile, saturated: bool, min_step: f64) -> bool {
        if let Some(pos) = self.in_flight.iter().position(|t| t.key() == tile.key()) {
            self.in_flight.swap_remove(pos);
        }
        if !saturated || tile.side() <= min_step {
            return false;
        }
        self.stack.extend(tile.subdivide());
        self.subdivisions += 1;
        true
    }

    pub fn stack(&self) -> &[Tile] {
        &self.stack
    }

    pub fn processed(&self) -> &BTreeSet<TileKey> {
        &self.processed
    }

    pub fn deep_count(&self) -> u64 {
        self.deep_count
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Deep dives whose query has been settled.
    pub fn completed_dives(&self) -> u64 {
        self.deep_count - self.in_flight.len() as u64
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn subdivisions(&self) -> u64 {
        self.subdivisions
    }

    pub fn is_drained(&self) -> bool {
        self.stack.is_empty() && self.in_flight.is_empty()
    }

    // --- Persistence view ---

    /// The stack as it should be persisted: in-flight tiles go back on top,
    /// since their results have not been absorbed yet.
    pub fn persisted_stack(&self) -> Vec<Tile> {
        let mut stack = self.stack.clone();
        stack.extend(self.in_flight.iter().copied());
        stack
    }

    /// The processed set without in-flight tiles.
    pub fn persisted_processed(&self) -> BTreeSet<TileKey> {
        if self.in_flight.is_empty() {
            return self.processed.clone();
        }
        let pending: BTreeSet<TileKey> = self.in_flight.iter().map(Tile::key).collect();
        self.processed.difference(&pending).cloned().collect()
    }
}
