//! LogSink port - 構造化ログの記録先
//!
//! # 実装
//! - TracingLogSink: `tracing` に流す（デフォルト）
//! - RecordingLogSink: メモリに貯める（テスト・検査用）

use std::collections::BTreeMap;

use crate::domain::{CorrelationId, ErrorRecord, Severity};

/// One structured event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub severity: Severity,
    pub operation: String,
    pub correlation_id: Option<CorrelationId>,
    pub message: String,
    pub attributes: BTreeMap<String, String>,
}

impl LogEvent {
    pub fn new(severity: Severity, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            operation: operation.into(),
            correlation_id: None,
            message: message.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(key.into(), value.to_string());
        self
    }
}

impl From<&ErrorRecord> for LogEvent {
    fn from(record: &ErrorRecord) -> Self {
        let mut event = LogEvent::new(record.severity(), record.operation.clone(), record.message.clone())
            .with_correlation(record.correlation_id);
        event.attributes = record.attributes.clone();
        let event = event
            .with_attribute("kind", record.kind)
            .with_attribute("status", record.status_code());
        match &record.cause {
            Some(cause) => event.with_attribute("cause", cause),
            None => event,
        }
    }
}

/// LogSink は構造化イベントを受け取る
///
/// 同期メソッドです。ログ出力で呼び出し側を suspend させません。
pub trait LogSink: Send + Sync {
    fn record(&self, event: LogEvent);
}
