//! Event source adapters.
//!
//! A source is an offset-addressed, replayable log: `pull(cursor, n)` returns
//! up to `n` records starting at `cursor` in non-decreasing offset order,
//! plus the offset to resume from. Pulling the same range twice returns the
//! same records, which is what lets the raw ingestor retry a batch into the
//! same deterministic files.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::{PipelineError, Result};

/// Payload of a source record before framing.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    /// Already-structured key/value envelope.
    Structured(Map<String, Value>),
    /// Undecoded bytes; must decode to a JSON object to be framed.
    Bytes(Bytes),
}

/// One record pulled from a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Position of the record in the source log.
    pub offset: u64,
    /// Record contents.
    pub payload: RecordPayload,
}

/// Result of one pull.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    /// Records in offset order.
    pub records: Vec<SourceRecord>,
    /// Offset to pass to the next pull.
    pub next_offset: u64,
}

/// A pull-based, offset-addressed event source.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Stable source identifier, used in raw-tier paths and cursor records.
    fn source_id(&self) -> &str;

    /// Pulls up to `max_records` records starting at offset `cursor`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::SourceUnavailable` if the source cannot be
    /// reached.
    async fn pull(&self, cursor: u64, max_records: usize) -> Result<SourceBatch>;
}

/// In-memory source with scripted outages, for tests and embedding.
#[derive(Debug, Clone)]
pub struct MemoryEventSource {
    source_id: String,
    log: Arc<RwLock<Vec<RecordPayload>>>,
    outages: Arc<AtomicU32>,
}

impl MemoryEventSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            log: Arc::new(RwLock::new(Vec::new())),
            outages: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Appends a structured record; non-object values are appended as bytes.
    pub fn push_json(&self, value: Value) {
        let payload = match value {
            Value::Object(map) => RecordPayload::Structured(map),
            other => RecordPayload::Bytes(Bytes::from(other.to_string())),
        };
        self.push(payload);
    }

    /// Appends raw bytes.
    pub fn push_bytes(&self, bytes: impl Into<Bytes>) {
        self.push(RecordPayload::Bytes(bytes.into()));
    }

    fn push(&self, payload: RecordPayload) {
        if let Ok(mut log) = self.log.write() {
            log.push(payload);
        }
    }

    /// Makes the next `pulls` pulls fail with `SourceUnavailable`.
    pub fn fail_next(&self, pulls: u32) {
        self.outages.store(pulls, Ordering::SeqCst);
    }

    /// Number of records appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.read().map(|log| log.len()).unwrap_or_default()
    }

    /// Returns true if nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn pull(&self, cursor: u64, max_records: usize) -> Result<SourceBatch> {
        let outage = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(PipelineError::SourceUnavailable {
                source_id: self.source_id.clone(),
                message: "scripted outage".into(),
            });
        }

        let log = self.log.read().map_err(|_| PipelineError::SourceUnavailable {
            source_id: self.source_id.clone(),
            message: "source log lock poisoned".into(),
        })?;
        Ok(slice_log(&log, cursor, max_records))
    }
}

fn slice_log(log: &[RecordPayload], cursor: u64, max_records: usize) -> SourceBatch {
    let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(log.len());
    let records: Vec<SourceRecord> = log[start..]
        .iter()
        .take(max_records)
        .enumerate()
        .map(|(i, payload)| SourceRecord {
            offset: cursor + i as u64,
            payload: payload.clone(),
        })
        .collect();
    let next_offset = cursor + records.len() as u64;
    SourceBatch {
        records,
        next_offset,
    }
}

/// File-backed source: one record per line, offset = zero-based line number.
///
/// Blank lines occupy an offset but yield no record. Lines are handed to the
/// ingestor as bytes so malformed ones (including invalid UTF-8) are
/// quarantined rather than failing the pull. A trailing line without its
/// newline is left for a later pull.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    source_id: String,
    path: PathBuf,
}

impl JsonLinesSource {
    /// Creates a source reading `path`.
    #[must_use]
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl EventSource for JsonLinesSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn pull(&self, cursor: u64, max_records: usize) -> Result<SourceBatch> {
        let unavailable = |e: std::io::Error| PipelineError::SourceUnavailable {
            source_id: self.source_id.clone(),
            message: format!("read {}: {e}", self.path.display()),
        };
        let file = tokio::fs::File::open(&self.path).await.map_err(unavailable)?;
        let mut reader = BufReader::new(file);

        let mut records = Vec::new();
        let mut next_offset = cursor;
        let mut line_no = 0_u64;
        let mut line = Vec::new();
        let max_lines = max_records as u64;
        while next_offset - cursor < max_lines {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).await.map_err(unavailable)?;
            // A line without its newline is still being written.
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            let offset = line_no;
            line_no += 1;
            if offset < cursor {
                continue;
            }
            next_offset = line_no;
            if line.trim_ascii().is_empty() {
                continue;
            }
            records.push(SourceRecord {
                offset,
                payload: RecordPayload::Bytes(Bytes::copy_from_slice(line.trim_ascii_end())),
            });
        }
        Ok(SourceBatch {
            records,
            next_offset,
        })
    }
}
