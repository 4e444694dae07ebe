pub mod checkpoint;
pub mod export;

pub use checkpoint::{Checkpoint, CheckpointStore, FORMAT_VERSION};
pub use export::{CsvExport, RecordWriter, ResultSink};
