//! Shared setup for crawl integration tests: a small fixed area, mock
//! collaborators, and a temp data directory per test.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use placescout::crawler::{CrawlDeps, Crawler};
use placescout::store::CheckpointStore;
use placescout::testing::{area, MemoryWriter, MockGeocoder, MockPlaces};
use placescout::traits::GeocodedArea;
use placescout_common::{CrawlConfig, Tile};

/// 0.01° square at (10, 20). With no padding and a 0.01 step the grid is the
/// four corners, each of side 0.01.
pub fn test_area() -> GeocodedArea {
    area(10.0, 20.0, 10.01, 20.01)
}

pub const INITIAL_TILES: usize = 4;

/// Deep dives per initial tile when every query saturates: 1 + 4 + 16.
pub const DIVES_PER_SATURATED_TILE: u64 = 21;

pub fn test_config(dir: &Path) -> CrawlConfig {
    CrawlConfig {
        city: "Test Town".into(),
        place_type: "restaurant".into(),
        initial_step: 0.01,
        min_step: 0.0025,
        viewport_padding: 0.0,
        chunk_size: 100,
        checkpoint_every: 2,
        max_workers: 1,
        data_dir: dir.to_path_buf(),
        ..CrawlConfig::default()
    }
}

/// `"lat,lng"` at 6 places, matching how mocks label query points.
pub fn point(lat: f64, lng: f64) -> String {
    format!("{lat:.6},{lng:.6}")
}

pub fn store(dir: &Path) -> CheckpointStore {
    CheckpointStore::new(dir.join("checkpoints"))
}

pub struct TestCrawl {
    pub places: Arc<MockPlaces>,
    pub geocoder: Arc<MockGeocoder>,
    pub writer: MemoryWriter,
    pub config: CrawlConfig,
}

impl TestCrawl {
    pub fn new(dir: &Path, places: MockPlaces) -> Self {
        Self {
            places: Arc::new(places),
            geocoder: Arc::new(MockGeocoder::new(test_area())),
            writer: MemoryWriter::new(),
            config: test_config(dir),
        }
    }

    pub fn with_writer(mut self, writer: MemoryWriter) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_geocoder(mut self, geocoder: MockGeocoder) -> Self {
        self.geocoder = Arc::new(geocoder);
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut CrawlConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn crawler(&self) -> Crawler {
        let deps = CrawlDeps::builder()
            .places(self.places.clone())
            .geocoder(self.geocoder.clone())
            .writer(Box::new(self.writer.clone()))
            .build();
        Crawler::new(self.config.clone(), deps).expect("valid test config")
    }

    /// Query points in call order.
    pub fn query_points(&self) -> Vec<String> {
        self.places
            .calls()
            .iter()
            .map(|c| point(c.lat, c.lng))
            .collect()
    }
}

pub fn initial_grid() -> Vec<Tile> {
    placescout_common::generate_grid(&test_area().viewport, 0.01, 0.0).unwrap()
}

pub fn assert_no_duplicates(ids: &[String]) {
    let unique: std::collections::HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len(), "a record id was emitted twice");
}
