use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, info, warn};

use placescout_common::{CrawlError, RecordPayload, Result, RECORD_ID_FIELD};

/// Destination for flushed record batches.
///
/// A batch is written entirely or the call fails; callers keep the batch and
/// retry on the next flush.
pub trait RecordWriter: Send {
    fn write_batch(&mut self, records: &[RecordPayload]) -> Result<()>;

    /// Record ids already present at the destination.
    fn existing_ids(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn describe(&self) -> String;
}

/// Appends records as CSV rows to one file.
///
/// The header comes from the first batch (union of its keys) or from the
/// existing file; later keys outside the header are dropped.
#[derive(Debug)]
pub struct CsvExport {
    path: PathBuf,
    columns: Option<Vec<String>>,
}

impl CsvExport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            columns: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_rows(&self) -> Result<Option<Vec<Vec<String>>>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(None),
            Ok(text) => Ok(Some(parse_rows(&text))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CrawlError::storage(&self.path, e)),
        }
    }

    fn existing_header(&self) -> Result<Option<Vec<String>>> {
        Ok(self.read_rows()?.and_then(|rows| rows.into_iter().next()))
    }

    /// Append `bytes` with `write`, truncating back to the previous length if
    /// it fails so a retried batch never lands after a partial row.
    fn append<F>(&self, bytes: &[u8], write: F) -> Result<()>
    where
        F: FnOnce(&mut File, &[u8]) -> std::io::Result<()>,
    {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CrawlError::storage(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CrawlError::storage(&self.path, e))?;
        let previous_len = file
            .metadata()
            .map_err(|e| CrawlError::storage(&self.path, e))?
            .len();

        if let Err(e) = write(&mut file, bytes) {
            if let Err(rollback) = file.set_len(previous_len).and_then(|()| file.sync_data()) {
                warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "Failed to truncate partial batch"
                );
            }
            return Err(CrawlError::storage(&self.path, e));
        }
        Ok(())
    }
}

impl RecordWriter for CsvExport {
    fn write_batch(&mut self, records: &[RecordPayload]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut out = String::new();
        let columns = match &self.columns {
            Some(columns) => columns.clone(),
            None => match self.existing_header()? {
                Some(header) => header,
                None => {
                    let columns = columns_for(records);
                    push_row(&mut out, columns.iter().map(String::as_str));
                    columns
                }
            },
        };

        for record in records {
            let cells: Vec<String> = columns
                .iter()
                .map(|col| record.get(col).map(render_cell).unwrap_or_default())
                .collect();
            push_row(&mut out, cells.iter().map(String::as_str));
        }

        self.append(out.as_bytes(), |file, bytes| {
            file.write_all(bytes)?;
            file.sync_data()
        })?;

        self.columns = Some(columns);
        debug!(path = %self.path.display(), rows = records.len(), "Appended rows");
        Ok(())
    }

    fn existing_ids(&self) -> Result<Vec<String>> {
        let Some(rows) = self.read_rows()? else {
            return Ok(Vec::new());
        };
        let mut rows = rows.into_iter();
        let Some(header) = rows.next() else {
            return Ok(Vec::new());
        };
        let Some(idx) = header.iter().position(|c| c == RECORD_ID_FIELD) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .filter_map(|row| row.into_iter().nth(idx))
            .filter(|id| !id.is_empty())
            .collect())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Union of keys across the batch, in first-seen order.
fn columns_for(records: &[RecordPayload]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn push_row<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>) {
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            out.push(',');
        }
        if cell.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }
    out.push('\n');
}

/// Minimal RFC 4180 reader, enough to read back what `push_row` writes.
fn parse_rows(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if quoted {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => quoted = false,
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' => quoted = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(ch),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

/// Buffer between the ledger and a [`RecordWriter`].
///
/// Records accumulate until `threshold`, then the whole buffer goes out in one
/// batch on the blocking pool. A failed flush leaves the buffer untouched.
pub struct ResultSink {
    buffer: Vec<RecordPayload>,
    threshold: usize,
    writer: Arc<Mutex<Box<dyn RecordWriter>>>,
    flushes: u64,
    rows_written: u64,
}

impl ResultSink {
    pub fn new(writer: Box<dyn RecordWriter>, threshold: usize) -> Self {
        Self {
            buffer: Vec::new(),
            threshold: threshold.max(1),
            writer: Arc::new(Mutex::new(writer)),
            flushes: 0,
            rows_written: 0,
        }
    }

    fn writer(&self) -> MutexGuard<'_, Box<dyn RecordWriter>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&mut self, records: Vec<RecordPayload>) -> usize {
        let added = records.len();
        self.buffer.extend(records);
        added
    }

    /// Only a query that added records can trigger a flush.
    pub fn should_flush(&self, added: usize) -> bool {
        added > 0 && self.buffer.len() >= self.threshold
    }

    /// Write everything buffered. Returns the number of rows written.
    pub async fn flush(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let batch = self.buffer.clone();
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_batch(&batch)
        })
        .await
        .map_err(|e| CrawlError::Anyhow(anyhow::anyhow!("record writer panicked: {e}")))??;

        let written = self.buffer.len();
        self.buffer.clear();
        self.flushes += 1;
        self.rows_written += written as u64;
        info!(rows = written, destination = %self.destination(), "Flushed records");
        Ok(written)
    }

    pub fn existing_ids(&self) -> Result<Vec<String>> {
        self.writer().existing_ids()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn destination(&self) -> String {
        self.writer().describe()
    }
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink")
            .field("buffered", &self.buffer.len())
            .field("threshold", &self.threshold)
            .field("destination", &self.destination())
            .field("flushes", &self.flushes)
            .finish()
    }
}
