use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlacesError>;

#[derive(Debug, Error)]
pub enum PlacesError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The HTTP call succeeded but the provider answered with a non-OK status field.
    #[error("Provider status {status}: {message}")]
    Status { status: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No geocoding match for {0:?}")]
    NotFound(String),

    #[error("Gave up after {attempts} retries on provider status {status}")]
    RetriesExhausted { status: String, attempts: u32 },
}

impl From<reqwest::Error> for PlacesError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PlacesError::Timeout(err.to_string())
        } else if err.is_decode() {
            PlacesError::Parse(err.to_string())
        } else {
            PlacesError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PlacesError {
    fn from(err: serde_json::Error) -> Self {
        PlacesError::Parse(err.to_string())
    }
}
