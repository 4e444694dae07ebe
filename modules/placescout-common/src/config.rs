use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::{CrawlError, Result};
use crate::types::DEFAULT_VIEWPORT_PADDING;

/// Crawl configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    // Provider
    pub google_api_key: String,
    pub request_timeout: Duration,
    pub max_quota_retries: u32,

    // Area
    pub city: String,
    pub place_type: String,

    // Tiling
    pub initial_step: f64,
    pub min_step: f64,
    /// Fixed radius for initial-scan queries. `None` uses the tile's
    /// circumscribing radius.
    pub initial_radius_m: Option<f64>,
    pub viewport_padding: f64,

    // Deep dive
    pub max_deep_dives: u64,
    pub checkpoint_every: u64,
    pub max_workers: usize,

    // Output
    pub chunk_size: usize,
    pub data_dir: PathBuf,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            google_api_key: String::new(),
            request_timeout: Duration::from_secs(30),
            max_quota_retries: 4,
            city: String::new(),
            place_type: "restaurant".to_string(),
            initial_step: 0.01,
            min_step: 0.0025,
            initial_radius_m: None,
            viewport_padding: DEFAULT_VIEWPORT_PADDING,
            max_deep_dives: 1000,
            checkpoint_every: 3,
            max_workers: 1,
            chunk_size: 500,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl CrawlConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            google_api_key: get("GOOGLE_PLACES_API_KEY").unwrap_or_default(),
            request_timeout: Duration::from_secs(parsed(
                &get,
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            max_quota_retries: parsed(&get, "MAX_QUOTA_RETRIES", defaults.max_quota_retries)?,
            city: get("PLACESCOUT_CITY").unwrap_or_default(),
            place_type: get("LOCATION_TYPE").unwrap_or(defaults.place_type),
            initial_step: parsed(&get, "INITIAL_STEP", defaults.initial_step)?,
            min_step: parsed(&get, "MIN_STEP", defaults.min_step)?,
            initial_radius_m: get("INITIAL_RADIUS")
                .map(|raw| parse_value("INITIAL_RADIUS", &raw))
                .transpose()?,
            viewport_padding: parsed(&get, "VIEWPORT_PADDING", defaults.viewport_padding)?,
            max_deep_dives: parsed(&get, "MAX_DEEP_DIVES", defaults.max_deep_dives)?,
            checkpoint_every: parsed(&get, "CHECKPOINT_EVERY", defaults.checkpoint_every)?,
            max_workers: parsed(&get, "MAX_WORKERS", defaults.max_workers)?,
            chunk_size: parsed(&get, "CHUNK_SIZE", defaults.chunk_size)?,
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
        })
    }

    /// Reject settings the crawl cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(CrawlError::Config(format!("{name} must be positive, got {v}")))
            }
        };
        positive("INITIAL_STEP", self.initial_step)?;
        positive("MIN_STEP", self.min_step)?;
        if let Some(radius) = self.initial_radius_m {
            positive("INITIAL_RADIUS", radius)?;
        }
        if self.min_step > self.initial_step {
            return Err(CrawlError::Config(format!(
                "MIN_STEP ({}) exceeds INITIAL_STEP ({})",
                self.min_step, self.initial_step
            )));
        }
        if !(self.viewport_padding.is_finite() && self.viewport_padding >= 0.0) {
            return Err(CrawlError::Config(format!(
                "VIEWPORT_PADDING must be non-negative, got {}",
                self.viewport_padding
            )));
        }
        if self.chunk_size == 0 {
            return Err(CrawlError::Config("CHUNK_SIZE must be at least 1".into()));
        }
        if self.checkpoint_every == 0 {
            return Err(CrawlError::Config("CHECKPOINT_EVERY must be at least 1".into()));
        }
        if self.max_workers == 0 {
            return Err(CrawlError::Config("MAX_WORKERS must be at least 1".into()));
        }
        if self.place_type.trim().is_empty() {
            return Err(CrawlError::Config("LOCATION_TYPE must not be empty".into()));
        }
        Ok(())
    }

    pub fn require_api_key(&self) -> Result<&str> {
        if self.google_api_key.is_empty() {
            return Err(CrawlError::Config(
                "GOOGLE_PLACES_API_KEY environment variable is required".into(),
            ));
        }
        Ok(&self.google_api_key)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn export_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }

    /// Log the effective configuration with the API key masked.
    pub fn log_redacted(&self) {
        info!(
            google_api_key = redact(&self.google_api_key),
            city = self.city.as_str(),
            place_type = self.place_type.as_str(),
            initial_step = self.initial_step,
            min_step = self.min_step,
            initial_radius_m = ?self.initial_radius_m,
            viewport_padding = self.viewport_padding,
            max_deep_dives = self.max_deep_dives,
            checkpoint_every = self.checkpoint_every,
            max_workers = self.max_workers,
            chunk_size = self.chunk_size,
            data_dir = %self.data_dir.display(),
            request_timeout_secs = self.request_timeout.as_secs(),
            max_quota_retries = self.max_quota_retries,
            "Crawl configuration"
        );
    }
}

fn parsed<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| CrawlError::Config(format!("{key} has an invalid value: {raw:?}")))
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        return "<unset>".to_string();
    }
    let visible: String = secret.chars().take(4).collect();
    format!("{visible}…")
}
