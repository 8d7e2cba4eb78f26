//! Impls - ports のプロセス内実装
//!
//! - InMemoryStore: UnderlyingStore
//! - TracingLogSink / RecordingLogSink: LogSink

pub mod log_sinks;
pub mod memory_store;

pub use self::log_sinks::{RecordingLogSink, TracingLogSink};
pub use self::memory_store::InMemoryStore;
