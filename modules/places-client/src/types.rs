use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A raw place result exactly as the provider returned it.
pub type PlaceJson = Map<String, Value>;

// --- Provider status codes ---

/// The `status` field carried by every Places/Geocoding response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiStatus {
    Ok,
    ZeroResults,
    OverQueryLimit,
    InvalidRequest,
    RequestDenied,
    NotFound,
    Other(String),
}

impl ApiStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "OK" => ApiStatus::Ok,
            "ZERO_RESULTS" => ApiStatus::ZeroResults,
            "OVER_QUERY_LIMIT" => ApiStatus::OverQueryLimit,
            "INVALID_REQUEST" => ApiStatus::InvalidRequest,
            "REQUEST_DENIED" => ApiStatus::RequestDenied,
            "NOT_FOUND" => ApiStatus::NotFound,
            other => ApiStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ApiStatus::Ok => "OK",
            ApiStatus::ZeroResults => "ZERO_RESULTS",
            ApiStatus::OverQueryLimit => "OVER_QUERY_LIMIT",
            ApiStatus::InvalidRequest => "INVALID_REQUEST",
            ApiStatus::RequestDenied => "REQUEST_DENIED",
            ApiStatus::NotFound => "NOT_FOUND",
            ApiStatus::Other(s) => s,
        }
    }
}

// --- Nearby search ---

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NearbySearchResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<PlaceJson>,
    pub next_page_token: Option<String>,
    pub error_message: Option<String>,
}

/// Page-aggregated outcome of one nearby search.
#[derive(Debug, Clone, Default)]
pub struct NearbyResults {
    pub places: Vec<PlaceJson>,
    /// Pages that returned an OK body.
    pub pages: u32,
    /// HTTP requests issued, including retried ones.
    pub requests: u32,
    pub retries: u32,
}

// --- Geocoding ---

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GeocodeResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<GeocodeResult>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub formatted_address: Option<String>,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geometry {
    pub location: LatLng,
    pub viewport: Viewport,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub northeast: LatLng,
    pub southwest: LatLng,
}
