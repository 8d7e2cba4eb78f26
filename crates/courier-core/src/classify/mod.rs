//! Classify - 失敗の分類・enrich・ログ出力
//!
//! ErrorClassifier は cache と runner の両方から使われます。
//!
//! # 分類の優先順位
//! 1. cancellation → Canceled
//! 2. connectivity → Unavailable
//! 3. deadline → Timeout
//! 4. malformed input / argument → InvalidRequest
//! 5. remote 5xx → RemoteServerError
//! 6. remote 4xx → RemoteClientError
//! 7. それ以外 → Unexpected
//!
//! correlation id は呼び出し側から受け取ったものをそのまま使い、再生成しません。

mod enriched;
mod rules;

pub use self::enriched::EnrichedError;

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::Arc;

use crate::domain::{CorrelationId, ErrorKind, ErrorRecord};
use crate::impls::TracingLogSink;
use crate::ports::{Clock, LogEvent, LogSink, SystemClock};

/// Extra key/value attributes attached to a record.
pub type ErrorContext = BTreeMap<String, String>;

pub struct ErrorClassifier {
    sink: Arc<dyn LogSink>,
    clock: Arc<dyn Clock>,
}

impl ErrorClassifier {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the ErrorRecord for `failure`. Pure: nothing is logged.
    pub fn classify(
        &self,
        failure: &(dyn StdError + 'static),
        operation: &str,
        correlation_id: CorrelationId,
        context: ErrorContext,
    ) -> ErrorRecord {
        let signal = rules::detect(failure);
        let kind = signal.map_or(ErrorKind::Unexpected, |s| s.kind);

        let mut attributes = context;
        if let Some(status) = signal.and_then(|s| s.remote_status) {
            attributes.insert("remote_status".to_string(), status.to_string());
        }

        let causes: Vec<String> = rules::chain(failure).skip(1).map(|e| e.to_string()).collect();

        ErrorRecord {
            kind,
            correlation_id,
            operation: operation.to_string(),
            message: failure.to_string(),
            cause: (!causes.is_empty()).then(|| causes.join(": ")),
            attributes,
            occurred_at: self.clock.now(),
        }
    }

    /// Emit a record to the log sink at the record's severity.
    pub fn report(&self, record: &ErrorRecord) {
        self.sink.record(LogEvent::from(record));
    }

    /// Classify, log, and wrap `failure` so it can be re-raised with its
    /// record attached.
    pub fn enrich<E>(
        &self,
        failure: E,
        operation: &str,
        correlation_id: CorrelationId,
        context: ErrorContext,
    ) -> EnrichedError
    where
        E: StdError + Send + Sync + 'static,
    {
        let record = self.classify(&failure, operation, correlation_id, context);
        self.report(&record);
        EnrichedError::new(record, Box::new(failure))
    }

    /// `Err` branch of `result` goes through [`Self::enrich`]; `Ok` passes untouched.
    pub fn enrich_and_rethrow<T, E>(
        &self,
        result: Result<T, E>,
        operation: &str,
        correlation_id: CorrelationId,
        context: ErrorContext,
    ) -> Result<T, EnrichedError>
    where
        E: StdError + Send + Sync + 'static,
    {
        result.map_err(|failure| self.enrich(failure, operation, correlation_id, context))
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Severity;
    use crate::error::CourierError;
    use crate::impls::RecordingLogSink;
    use crate::ports::{ManualClock, RemoteError};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use std::io;
    use std::time::Duration;
    use ulid::Ulid;

    fn corr() -> CorrelationId {
        CorrelationId::from_ulid(Ulid::new())
    }

    fn classify(failure: &(dyn StdError + 'static)) -> ErrorRecord {
        ErrorClassifier::default().classify(failure, "op", corr(), ErrorContext::new())
    }

    /// Wraps another error to build multi-link chains.
    #[derive(Debug, thiserror::Error)]
    #[error("wrapper")]
    struct Wrapper(#[source] Box<dyn StdError + Send + Sync>);

    #[rstest]
    #[case::canceled(RemoteError::Canceled, ErrorKind::Canceled)]
    #[case::connect(RemoteError::Connect("refused".into()), ErrorKind::Unavailable)]
    #[case::timeout(RemoteError::Timeout(Duration::from_secs(1)), ErrorKind::Timeout)]
    #[case::invalid(RemoteError::InvalidRequest("bad".into()), ErrorKind::InvalidRequest)]
    #[case::server(RemoteError::status(503, "down"), ErrorKind::RemoteServerError)]
    #[case::client(RemoteError::status(404, "missing"), ErrorKind::RemoteClientError)]
    #[case::redirect(RemoteError::status(302, "moved"), ErrorKind::Unexpected)]
    fn remote_errors_map_to_kinds(#[case] failure: RemoteError, #[case] expected: ErrorKind) {
        assert_eq!(classify(&failure).kind, expected);
    }

    #[rstest]
    #[case::refused(io::ErrorKind::ConnectionRefused, ErrorKind::Unavailable)]
    #[case::reset(io::ErrorKind::ConnectionReset, ErrorKind::Unavailable)]
    #[case::timed_out(io::ErrorKind::TimedOut, ErrorKind::Timeout)]
    #[case::invalid_input(io::ErrorKind::InvalidInput, ErrorKind::InvalidRequest)]
    #[case::not_found(io::ErrorKind::NotFound, ErrorKind::Unexpected)]
    fn io_errors_map_to_kinds(#[case] io_kind: io::ErrorKind, #[case] expected: ErrorKind) {
        let failure = io::Error::new(io_kind, "io");
        assert_eq!(classify(&failure).kind, expected);
    }

    #[test]
    fn json_errors_are_invalid_requests() {
        let failure = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(classify(&failure).kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn invalid_key_is_invalid_request() {
        let failure = CourierError::InvalidKey(String::new());
        assert_eq!(classify(&failure).kind, ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn elapsed_is_timeout() {
        let failure = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(classify(&failure).kind, ErrorKind::Timeout);
    }

    #[test]
    fn cancellation_outranks_timeout_in_the_chain() {
        // io::Error::source() yields the wrapper's source, so the chain is
        // TimedOut -> Canceled
        let failure = io::Error::new(
            io::ErrorKind::TimedOut,
            Wrapper(Box::new(RemoteError::Canceled)),
        );
        assert_eq!(classify(&failure).kind, ErrorKind::Canceled);

        let plain = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(classify(&plain).kind, ErrorKind::Timeout);
    }

    #[test]
    fn nested_io_error_is_found_through_other() {
        let failure = Wrapper(Box::new(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        let chained = RemoteError::Other(Box::new(failure));
        assert_eq!(classify(&chained).kind, ErrorKind::Unavailable);
    }

    #[test]
    fn record_keeps_correlation_context_and_cause_chain() {
        let id = corr();
        let mut context = ErrorContext::new();
        context.insert("task_id".to_string(), "3".to_string());

        let failure = Wrapper(Box::new(RemoteError::status(500, "kaput")));
        let record =
            ErrorClassifier::default().classify(&failure, "runner.invoke", id, context);

        assert_eq!(record.kind, ErrorKind::RemoteServerError);
        assert_eq!(record.correlation_id, id);
        assert_eq!(record.operation, "runner.invoke");
        assert_eq!(record.message, "wrapper");
        assert_eq!(record.cause.as_deref(), Some("remote answered 500: kaput"));
        assert_eq!(record.attributes.get("task_id").map(String::as_str), Some("3"));
        assert_eq!(
            record.attributes.get("remote_status").map(String::as_str),
            Some("500")
        );
        assert_eq!(record.status_code(), 500);
    }

    #[test]
    fn occurred_at_comes_from_the_clock() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let classifier = ErrorClassifier::default().with_clock(clock.clone());
        let later = Utc.with_ymd_and_hms(2026, 3, 2, 8, 30, 0).unwrap();
        clock.set(later);

        let record =
            classifier.classify(&RemoteError::Canceled, "op", corr(), ErrorContext::new());

        assert_eq!(record.occurred_at, later);
    }

    #[test]
    fn unknown_failures_are_unexpected() {
        let failure = CourierError::Other("???".to_string());
        let record = classify(&failure);
        assert_eq!(record.kind, ErrorKind::Unexpected);
        assert!(record.cause.is_none());
    }

    #[test]
    fn enrich_logs_and_keeps_original_cause() {
        let sink = Arc::new(RecordingLogSink::new());
        let classifier = ErrorClassifier::new(sink.clone());
        let id = corr();

        let enriched =
            classifier.enrich(RemoteError::Canceled, "fetch", id, ErrorContext::new());

        assert_eq!(enriched.record().kind, ErrorKind::Canceled);
        assert!(matches!(
            enriched.downcast_original::<RemoteError>(),
            Some(RemoteError::Canceled)
        ));
        assert!(enriched.source().is_some());

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Info);
        assert_eq!(events[0].correlation_id, Some(id));
        assert_eq!(events[0].attributes.get("kind").map(String::as_str), Some("canceled"));
    }

    #[test]
    fn re_enriching_reuses_the_first_classification() {
        let classifier = ErrorClassifier::default();
        let id = corr();
        let first = classifier.enrich(RemoteError::status(404, "nope"), "inner", id, ErrorContext::new());
        let second = classifier.enrich(first, "outer", id, ErrorContext::new());

        assert_eq!(second.record().kind, ErrorKind::RemoteClientError);
        assert_eq!(second.record().correlation_id, id);
        assert_eq!(second.record().status_code(), 404);
    }

    #[test]
    fn enrich_and_rethrow_passes_ok_through() {
        let classifier = ErrorClassifier::default();
        let ok: Result<u8, RemoteError> = Ok(7);
        assert_eq!(
            classifier
                .enrich_and_rethrow(ok, "op", corr(), ErrorContext::new())
                .unwrap(),
            7
        );

        let err: Result<u8, RemoteError> = Err(RemoteError::Connect("x".into()));
        let enriched = classifier
            .enrich_and_rethrow(err, "op", corr(), ErrorContext::new())
            .unwrap_err();
        assert_eq!(enriched.record().kind, ErrorKind::Unavailable);
    }
}
