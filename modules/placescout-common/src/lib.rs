pub mod config;
pub mod error;
pub mod types;

pub use config::CrawlConfig;
pub use error::{CrawlError, Result};
pub use types::*;
