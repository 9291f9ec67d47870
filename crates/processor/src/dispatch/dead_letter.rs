//! Dead-letter side-output for outputs that could not be delivered

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::Output;
use crate::error::{DeadLetterError, DeadLetterResult};

/// An output that permanently failed delivery to one sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    /// Sink the output was meant for
    pub sink: String,
    pub output: Output,
    pub last_error: String,
    /// Delivery attempts made before giving up
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(sink: impl Into<String>, output: Output, last_error: String, attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            sink: sink.into(),
            output,
            last_error,
            attempts,
            failed_at: Utc::now(),
        }
    }
}

/// Storage for dead-lettered outputs
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    /// Add entry to the queue
    async fn push(&self, entry: DeadLetterEntry) -> DeadLetterResult<()>;

    /// Number of entries added, including any a bounded queue has since dropped
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Entries an [`InMemoryDeadLetterQueue`] keeps unless told otherwise
pub const DEFAULT_IN_MEMORY_CAPACITY: usize = 10_000;

/// Dead-letter queue held in memory
///
/// Holds at most `capacity` entries. When full, the oldest entry is dropped
/// and counted in [`InMemoryDeadLetterQueue::overflowed`].
#[derive(Debug)]
pub struct InMemoryDeadLetterQueue {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    overflowed: AtomicUsize,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_IN_MEMORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            overflowed: AtomicUsize::new(0),
        }
    }

    /// Retained entries, oldest first
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Entries dropped to stay within capacity
    pub fn overflowed(&self) -> usize {
        self.overflowed.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDeadLetterQueue {
    async fn push(&self, entry: DeadLetterEntry) -> DeadLetterResult<()> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            if let Some(dropped) = entries.pop_front() {
                let total = self.overflowed.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(id = %dropped.id, sink = %dropped.sink, overflowed = total, "dead-letter queue full, oldest entry dropped");
            }
        }
        entries.push_back(entry);
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.lock().len() + self.overflowed()
    }
}

/// Dead-letter queue appended to a JSON-lines file
#[derive(Debug)]
pub struct FileDeadLetterQueue {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
    written: AtomicUsize,
}

impl FileDeadLetterQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
            written: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry currently in the file
    pub async fn read_all(&self) -> DeadLetterResult<Vec<DeadLetterEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<DeadLetterEntry>(line).map_err(DeadLetterError::from))
            .collect()
    }
}

#[async_trait]
impl DeadLetterQueue for FileDeadLetterQueue {
    async fn push(&self, entry: DeadLetterEntry) -> DeadLetterResult<()> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        self.written.fetch_add(1, Ordering::SeqCst);
        debug!(id = %entry.id, sink = %entry.sink, path = %self.path.display(), "dead-letter entry written");
        Ok(())
    }

    fn len(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}
