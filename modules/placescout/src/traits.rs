// Trait abstractions for the crawl's external collaborators.
//
// PlacesQuery: one page-aggregated nearby search per tile.
// Geocoder:    area name to center point and viewport.
//
// The controller only sees these traits, so tests drive it with MockPlaces and
// MockGeocoder from `testing`: no network, no API key.

use async_trait::async_trait;

use placescout_common::{Bounds, GeoPoint, RecordPayload, Result};

/// What one tile query produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    pub records: Vec<RecordPayload>,
    /// Aggregate result count across all pages.
    pub total_count: u32,
    /// Pages the provider actually served.
    pub pages_consumed: u32,
}

impl QueryOutcome {
    /// The degraded result for a failed query: nothing found, not saturated.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<RecordPayload>, pages_consumed: u32) -> Self {
        Self {
            total_count: records.len() as u32,
            records,
            pages_consumed,
        }
    }
}

#[async_trait]
pub trait PlacesQuery: Send + Sync {
    /// Nearby search around `(lat, lng)`.
    ///
    /// Infallible by contract: quota exhaustion and other provider failures
    /// come back as [`QueryOutcome::empty`] so one bad tile never aborts a crawl.
    async fn query(&self, lat: f64, lng: f64, radius_m: f64, category: &str) -> QueryOutcome;
}

/// A geocoded search area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeocodedArea {
    pub center: GeoPoint,
    pub viewport: Bounds,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Resolve an area name. No match is [`placescout_common::CrawlError::NotFound`].
    async fn geocode(&self, area_name: &str) -> Result<GeocodedArea>;
}
