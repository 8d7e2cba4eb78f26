//! LogSink 実装
//!
//! - TracingLogSink: severity に応じた `tracing` レベルで出力
//! - RecordingLogSink: イベントをメモリに貯める

use std::sync::{Mutex, PoisonError};

use crate::domain::Severity;
use crate::ports::{LogEvent, LogSink};

/// Forwards events to the `tracing` subscriber installed by the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn record(&self, event: LogEvent) {
        let correlation_id = event
            .correlation_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        match event.severity {
            Severity::Debug => tracing::debug!(
                operation = %event.operation,
                correlation_id = %correlation_id,
                attributes = ?event.attributes,
                "{}",
                event.message
            ),
            Severity::Info => tracing::info!(
                operation = %event.operation,
                correlation_id = %correlation_id,
                attributes = ?event.attributes,
                "{}",
                event.message
            ),
            Severity::Warning => tracing::warn!(
                operation = %event.operation,
                correlation_id = %correlation_id,
                attributes = ?event.attributes,
                "{}",
                event.message
            ),
            Severity::Error => tracing::error!(
                operation = %event.operation,
                correlation_id = %correlation_id,
                attributes = ?event.attributes,
                "{}",
                event.message
            ),
        }
    }
}

/// Buffers every event in memory.
#[derive(Debug, Default)]
pub struct RecordingLogSink {
    events: Mutex<Vec<LogEvent>>,
}

impl RecordingLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for RecordingLogSink {
    fn record(&self, event: LogEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
