//! Downstream sinks
//!
//! A sink receives the outputs it [accepts](Sink::accepts) and reports either
//! success or a [`SinkError`]. Transient errors are retried by the
//! dispatcher; permanent ones go straight to the dead-letter queue.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::storage::StoragePoint;
use crate::core::{Output, OutputKind};
use crate::error::{SinkError, SinkResult};

/// Destination for snapshots, alerts, or late events
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in logs, metrics, and dead-letter entries
    fn name(&self) -> &str;

    /// Whether this sink wants the given output
    fn accepts(&self, output: &Output) -> bool;

    /// Write one output
    async fn write(&self, output: &Output) -> SinkResult<()>;

    /// Flush buffered writes; called once when the dispatcher drains
    async fn flush(&self) -> SinkResult<()> {
        Ok(())
    }
}

/// Which outputs a sink receives
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFilter {
    #[default]
    All,
    Only(Vec<OutputKind>),
}

impl OutputFilter {
    pub fn only(kind: OutputKind) -> Self {
        OutputFilter::Only(vec![kind])
    }

    pub fn matches(&self, output: &Output) -> bool {
        match self {
            OutputFilter::All => true,
            OutputFilter::Only(kinds) => kinds.contains(&output.kind()),
        }
    }
}

/// In-memory sink with optional failure injection
///
/// `fail_next(n)` makes the next `n` writes return a transient
/// [`SinkError::Unavailable`].
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    filter: OutputFilter,
    records: Mutex<Vec<Output>>,
    failures_remaining: AtomicU32,
    reject_all: bool,
    attempts: AtomicU64,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: OutputFilter::All,
            records: Mutex::new(Vec::new()),
            failures_remaining: AtomicU32::new(0),
            reject_all: false,
            attempts: AtomicU64::new(0),
        }
    }

    pub fn with_filter(mut self, filter: OutputFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Reject every write with a permanent error
    pub fn rejecting(mut self) -> Self {
        self.reject_all = true;
        self
    }

    /// Fail the next `n` writes with a transient error
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Outputs written successfully, in order
    pub fn records(&self) -> Vec<Output> {
        self.records.lock().clone()
    }

    /// Write attempts, successful or not
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, output: &Output) -> bool {
        self.filter.matches(output)
    }

    async fn write(&self, output: &Output) -> SinkResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.reject_all {
            return Err(SinkError::Rejected {
                sink: self.name.clone(),
                reason: "sink rejects all writes".to_string(),
            });
        }

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Unavailable {
                sink: self.name.clone(),
                reason: "injected failure".to_string(),
            });
        }

        self.records.lock().push(output.clone());
        Ok(())
    }
}

/// Record encoding for [`FileSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkEncoding {
    /// One JSON object per line
    #[default]
    JsonLines,
    /// Line protocol for snapshots; other outputs are rejected
    LineProtocol,
}

/// Appends encoded outputs to a file or stdout, one record per line
pub struct FileSink {
    name: String,
    filter: OutputFilter,
    encoding: SinkEncoding,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl FileSink {
    /// Open `path` for appending, creating it if needed
    pub async fn create(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        filter: OutputFilter,
        encoding: SinkEncoding,
    ) -> SinkResult<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        Ok(Self::from_writer(name, Box::new(file), filter, encoding))
    }

    /// Write to the process's standard output
    pub fn stdout(name: impl Into<String>, filter: OutputFilter, encoding: SinkEncoding) -> Self {
        Self::from_writer(name, Box::new(tokio::io::stdout()), filter, encoding)
    }

    pub fn from_writer(
        name: impl Into<String>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        filter: OutputFilter,
        encoding: SinkEncoding,
    ) -> Self {
        Self {
            name: name.into(),
            filter,
            encoding,
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    fn encode(&self, output: &Output) -> SinkResult<String> {
        match (self.encoding, output) {
            (SinkEncoding::JsonLines, _) => Ok(serde_json::to_string(output)?),
            (SinkEncoding::LineProtocol, Output::Snapshot(snapshot)) => {
                Ok(StoragePoint::from(snapshot).to_line_protocol())
            }
            (SinkEncoding::LineProtocol, other) => Err(SinkError::Rejected {
                sink: self.name.clone(),
                reason: format!("line protocol cannot encode {} outputs", other.kind()),
            }),
        }
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, output: &Output) -> bool {
        self.filter.matches(output)
    }

    async fn write(&self, output: &Output) -> SinkResult<()> {
        let mut line = self.encode(output)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> SinkResult<()> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }
}
