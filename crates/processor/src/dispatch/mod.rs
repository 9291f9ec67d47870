//! Output dispatch to downstream sinks
//!
//! Lanes hand finalized snapshots, alerts, and late events to a per-lane
//! dispatcher task through a bounded channel. The dispatcher writes each
//! output to every accepting [`Sink`], retrying transient failures with
//! bounded exponential backoff and dead-lettering what cannot be delivered.

mod dead_letter;
mod dispatcher;
mod retry;
mod sink;
mod storage;

pub use dead_letter::{
    DeadLetterEntry, DeadLetterQueue, FileDeadLetterQueue, InMemoryDeadLetterQueue,
    DEFAULT_IN_MEMORY_CAPACITY,
};
pub use dispatcher::{spawn_dispatcher, DispatchHandle, DispatchStats, OutputDispatcher};
pub use retry::RetryPolicy;
pub use sink::{FileSink, MemorySink, OutputFilter, Sink, SinkEncoding};
pub use storage::{FieldValue, StoragePoint};
