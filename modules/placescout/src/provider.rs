use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use places_client::{PlacesClient, PlacesError};
use placescout_common::{Bounds, CrawlConfig, CrawlError, GeoPoint, Result};

use crate::metrics::CrawlMetrics;
use crate::traits::{GeocodedArea, Geocoder, PlacesQuery, QueryOutcome};

/// Google Places backend for both crawl collaborators.
pub struct GooglePlaces {
    client: PlacesClient,
    metrics: Arc<CrawlMetrics>,
}

impl GooglePlaces {
    pub fn new(client: PlacesClient, metrics: Arc<CrawlMetrics>) -> Self {
        Self { client, metrics }
    }

    pub fn from_config(config: &CrawlConfig, metrics: Arc<CrawlMetrics>) -> Result<Self> {
        let api_key = config.require_api_key()?.to_string();
        let client = PlacesClient::with_timeout(api_key, config.request_timeout)
            .map_err(|e| CrawlError::Provider(e.to_string()))?
            .max_retries(config.max_quota_retries);
        Ok(Self::new(client, metrics))
    }
}

#[async_trait]
impl PlacesQuery for GooglePlaces {
    async fn query(&self, lat: f64, lng: f64, radius_m: f64, category: &str) -> QueryOutcome {
        match self.client.nearby_search(lat, lng, radius_m, category).await {
            Ok(results) => {
                self.metrics.record_http_requests(results.requests as u64);
                self.metrics.record_quota_retries(results.retries as u64);
                QueryOutcome::from_records(results.places, results.pages)
            }
            Err(e) => {
                self.metrics.record_http_requests(1);
                self.metrics.record_failed_query();
                if let PlacesError::RetriesExhausted { attempts, .. } = &e {
                    self.metrics.record_quota_retries(*attempts as u64);
                }
                warn!(lat, lng, radius_m, category, error = %e, "Nearby search failed, treating tile as empty");
                QueryOutcome::empty()
            }
        }
    }
}

#[async_trait]
impl Geocoder for GooglePlaces {
    async fn geocode(&self, area_name: &str) -> Result<GeocodedArea> {
        self.metrics.record_http_requests(1);
        let result = self.client.geocode(area_name).await.map_err(|e| match e {
            PlacesError::NotFound(_) => CrawlError::NotFound(area_name.to_string()),
            other => CrawlError::Provider(other.to_string()),
        })?;

        let geometry = result.geometry;
        let viewport = Bounds::from_corners(
            GeoPoint {
                lat: geometry.viewport.southwest.lat,
                lng: geometry.viewport.southwest.lng,
            },
            GeoPoint {
                lat: geometry.viewport.northeast.lat,
                lng: geometry.viewport.northeast.lng,
            },
        )?;
        info!(
            area = area_name,
            formatted_address = result.formatted_address.as_deref().unwrap_or(""),
            "Geocoded area"
        );
        Ok(GeocodedArea {
            center: GeoPoint {
                lat: geometry.location.lat,
                lng: geometry.location.lng,
            },
            viewport,
        })
    }
}
