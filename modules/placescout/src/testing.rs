// Test mocks for the crawl.
//
// Mocks matching the trait boundaries:
// - MockPlaces (PlacesQuery): closure-driven responses, records every call
// - MockGeocoder (Geocoder): fixed area or not-found
// - MemoryWriter / FailingWriter (RecordWriter): in-memory batches, scripted I/O errors
//
// Plus helpers for building records and outcomes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use placescout_common::{
    Bounds, CrawlError, GeoPoint, RecordPayload, Result, RECORD_ID_FIELD,
};

use crate::store::RecordWriter;
use crate::traits::{GeocodedArea, Geocoder, PlacesQuery, QueryOutcome};

// ---------------------------------------------------------------------------
// Test constants
// ---------------------------------------------------------------------------

/// Small box in lower Manhattan.
pub const MANHATTAN: (f64, f64, f64, f64) = (40.70, -74.02, 40.72, -74.00);

// ---------------------------------------------------------------------------
// Records and outcomes
// ---------------------------------------------------------------------------

/// A record carrying only an identifier.
pub fn place(id: &str) -> RecordPayload {
    let mut record = RecordPayload::new();
    record.insert(RECORD_ID_FIELD.into(), json!(id));
    record
}

/// `count` distinct records over `pages` pages.
pub fn outcome_with(count: u32, pages: u32) -> QueryOutcome {
    let records = (0..count).map(|i| place(&format!("r{i}"))).collect();
    QueryOutcome::from_records(records, pages)
}

/// A full provider response: 3 pages, 60 records with ids `<prefix>-<n>`.
pub fn saturated_outcome(prefix: &str) -> QueryOutcome {
    let records = (0..60).map(|i| place(&format!("{prefix}-{i}"))).collect();
    QueryOutcome::from_records(records, 3)
}

pub fn area(south: f64, west: f64, north: f64, east: f64) -> GeocodedArea {
    GeocodedArea {
        center: GeoPoint {
            lat: (south + north) / 2.0,
            lng: (west + east) / 2.0,
        },
        viewport: Bounds {
            south,
            west,
            north,
            east,
        },
    }
}

// ---------------------------------------------------------------------------
// MockPlaces
// ---------------------------------------------------------------------------

/// One recorded query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCall {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: f64,
    pub category: String,
}

type Responder = dyn Fn(&QueryCall) -> QueryOutcome + Send + Sync;

/// Places backend driven by a closure. Records every call.
pub struct MockPlaces {
    respond: Box<Responder>,
    calls: Mutex<Vec<QueryCall>>,
    delay: Option<Duration>,
}

impl MockPlaces {
    pub fn new(respond: impl Fn(&QueryCall) -> QueryOutcome + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Every query comes back empty.
    pub fn empty() -> Self {
        Self::new(|_| QueryOutcome::empty())
    }

    /// Every query is saturated with records unique to the query point.
    pub fn always_saturated() -> Self {
        Self::new(|call| saturated_outcome(&format!("{:.6},{:.6}", call.lat, call.lng)))
    }

    /// Sleep before answering, to let concurrent workers interleave.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<QueryCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PlacesQuery for MockPlaces {
    async fn query(&self, lat: f64, lng: f64, radius_m: f64, category: &str) -> QueryOutcome {
        let call = QueryCall {
            lat,
            lng,
            radius_m,
            category: category.to_string(),
        };
        self.calls.lock().unwrap().push(call.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(&call)
    }
}

// ---------------------------------------------------------------------------
// MockGeocoder
// ---------------------------------------------------------------------------

pub struct MockGeocoder {
    area: Option<GeocodedArea>,
    calls: Mutex<u32>,
}

impl MockGeocoder {
    pub fn new(area: GeocodedArea) -> Self {
        Self {
            area: Some(area),
            calls: Mutex::new(0),
        }
    }

    pub fn not_found() -> Self {
        Self {
            area: None,
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Geocoder for MockGeocoder {
    async fn geocode(&self, area_name: &str) -> Result<GeocodedArea> {
        *self.calls.lock().unwrap() += 1;
        self.area
            .ok_or_else(|| CrawlError::NotFound(area_name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

/// Keeps every flushed batch in memory. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryWriter {
    batches: Arc<Mutex<Vec<Vec<RecordPayload>>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<RecordPayload>> {
        self.batches.lock().unwrap().clone()
    }

    /// Every written record id, in write order.
    pub fn ids(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .filter_map(|r| placescout_common::record_id(r).map(str::to_string))
            .collect()
    }
}

impl RecordWriter for MemoryWriter {
    fn write_batch(&mut self, records: &[RecordPayload]) -> Result<()> {
        self.batches.lock().unwrap().push(records.to_vec());
        Ok(())
    }

    fn existing_ids(&self) -> Result<Vec<String>> {
        Ok(self.ids())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Fails the first `failures` writes with `kind`, then behaves like
/// [`MemoryWriter`].
#[derive(Clone)]
pub struct FailingWriter {
    remaining: Arc<Mutex<u32>>,
    kind: std::io::ErrorKind,
    inner: MemoryWriter,
}

impl FailingWriter {
    pub fn new(failures: u32, kind: std::io::ErrorKind) -> Self {
        Self {
            remaining: Arc::new(Mutex::new(failures)),
            kind,
            inner: MemoryWriter::new(),
        }
    }

    pub fn written(&self) -> Vec<RecordPayload> {
        self.inner.batches().into_iter().flatten().collect()
    }
}

impl RecordWriter for FailingWriter {
    fn write_batch(&mut self, records: &[RecordPayload]) -> Result<()> {
        {
            let mut remaining = self.remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CrawlError::storage(
                    "failing-writer",
                    std::io::Error::new(self.kind, "scripted failure"),
                ));
            }
        }
        self.inner.write_batch(records)
    }

    fn describe(&self) -> String {
        "failing".to_string()
    }
}
