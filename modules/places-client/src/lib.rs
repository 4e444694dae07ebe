pub mod error;
pub mod types;

pub use error::{PlacesError, Result};
pub use types::{
    ApiStatus, GeocodeResult, Geometry, LatLng, NearbyResults, PlaceJson, Viewport,
};

use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use types::{GeocodeResponse, NearbySearchResponse};

const BASE_URL: &str = "https://maps.googleapis.com/maps/api";

/// Hard provider cap on pages per nearby search.
pub const MAX_PAGES: u32 = 3;
/// Hard provider cap on results per page.
pub const MAX_RESULTS_PER_PAGE: u32 = 20;

/// A `next_page_token` is rejected with INVALID_REQUEST until it activates.
const PAGE_TOKEN_DELAY: Duration = Duration::from_secs(2);
/// Base delay for quota retries. Actual delay is base * 2^attempt + jitter.
const RETRY_BASE: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RETRIES: u32 = 4;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PlacesClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    max_retries: u32,
    retry_base: Duration,
    page_token_delay: Duration,
}

impl PlacesClient {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_timeout(api_key, DEFAULT_TIMEOUT)
    }

    /// Build a client whose every HTTP request is bounded by `timeout`.
    pub fn with_timeout(api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: BASE_URL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: RETRY_BASE,
            page_token_delay: PAGE_TOKEN_DELAY,
        })
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    /// Point the client at a different host (proxies, recorded fixtures).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Nearby search aggregated over up to [`MAX_PAGES`] pages.
    ///
    /// OVER_QUERY_LIMIT pauses and retries the same page; so does INVALID_REQUEST
    /// on a page-token request, since that is how the provider reports a token
    /// that has not activated yet. Retries are capped by `max_retries` and
    /// exhausting them returns [`PlacesError::RetriesExhausted`].
    pub async fn nearby_search(
        &self,
        lat: f64,
        lng: f64,
        radius_m: f64,
        place_type: &str,
    ) -> Result<NearbyResults> {
        let url = format!("{}/place/nearbysearch/json", self.base_url);
        let mut params: Vec<(&str, String)> = vec![
            ("location", format!("{lat},{lng}")),
            ("radius", format!("{}", radius_m.ceil().max(1.0) as u64)),
            ("type", place_type.to_string()),
        ];
        let mut out = NearbyResults::default();
        let mut attempt: u32 = 0;

        while out.pages < MAX_PAGES {
            debug!(lat, lng, page = out.pages + 1, "Requesting nearby page");
            let page: NearbySearchResponse = self.get_json(&url, &params).await?;
            out.requests += 1;

            let status = ApiStatus::parse(&page.status);
            let on_token = params.iter().any(|(k, _)| *k == "pagetoken");
            match &status {
                ApiStatus::Ok => {}
                ApiStatus::ZeroResults => break,
                ApiStatus::OverQueryLimit | ApiStatus::InvalidRequest
                    if status == ApiStatus::OverQueryLimit || on_token =>
                {
                    if attempt >= self.max_retries {
                        return Err(PlacesError::RetriesExhausted {
                            status: status.as_str().to_string(),
                            attempts: attempt,
                        });
                    }
                    let delay = self.retry_delay(attempt);
                    attempt += 1;
                    out.retries += 1;
                    warn!(
                        status = status.as_str(),
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "Places API asked us to slow down, retrying page"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                other => {
                    return Err(PlacesError::Status {
                        status: other.as_str().to_string(),
                        message: page.error_message.unwrap_or_default(),
                    });
                }
            }

            attempt = 0;
            out.pages += 1;
            debug!(
                page = out.pages,
                results = page.results.len(),
                "Fetched nearby page"
            );
            out.places.extend(page.results);

            match page.next_page_token {
                Some(token) if out.pages < MAX_PAGES => {
                    tokio::time::sleep(self.page_token_delay).await;
                    params = vec![("pagetoken", token)];
                }
                _ => break,
            }
        }

        Ok(out)
    }

    /// Geocode a free-text area name. The first match wins.
    pub async fn geocode(&self, address: &str) -> Result<GeocodeResult> {
        let url = format!("{}/geocode/json", self.base_url);
        let resp: GeocodeResponse = self
            .get_json(&url, &[("address", address.to_string())])
            .await?;

        match ApiStatus::parse(&resp.status) {
            ApiStatus::Ok => resp
                .results
                .into_iter()
                .next()
                .ok_or_else(|| PlacesError::NotFound(address.to_string())),
            ApiStatus::ZeroResults => Err(PlacesError::NotFound(address.to_string())),
            other => Err(PlacesError::Status {
                status: other.as_str().to_string(),
                message: resp.error_message.unwrap_or_default(),
            }),
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
        backoff(self.retry_base, attempt) + jitter
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, params: &[(&str, String)]) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .query(params)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PlacesError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(resp.json().await?)
    }
}

/// Exponential backoff without jitter, capped at 2^6 times the base.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    base * 2u32.pow(attempt.min(6))
}
