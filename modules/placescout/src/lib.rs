pub mod crawler;
pub mod frontier;
pub mod ledger;
pub mod metrics;
pub mod provider;
pub mod state;
pub mod status;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
pub mod workers;
