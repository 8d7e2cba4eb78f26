//! Errors - 失敗の分類と ErrorRecord
//!
//! ErrorKind は「何が起きたか」の運用分類です。
//! 分類そのもの（どの failure がどの kind になるか）は `classify` モジュールが決めます。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::CorrelationId;

/// ErrorKind は失敗の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The operation was canceled by its caller. Loggable, not erroneous.
    Canceled,
    /// The remote side could not be reached.
    Unavailable,
    /// A deadline elapsed.
    Timeout,
    /// Malformed input or argument.
    InvalidRequest,
    /// The remote side answered with a 5xx-class status.
    RemoteServerError,
    /// The remote side answered with a 4xx-class status.
    RemoteClientError,
    Unexpected,
}

impl ErrorKind {
    /// Status code used in uniform error payloads.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Canceled => 499,
            ErrorKind::Unavailable => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::RemoteServerError => 502,
            ErrorKind::RemoteClientError => 424,
            ErrorKind::Unexpected => 500,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::Canceled => Severity::Info,
            ErrorKind::InvalidRequest | ErrorKind::RemoteClientError => Severity::Warning,
            ErrorKind::Unavailable
            | ErrorKind::Timeout
            | ErrorKind::RemoteServerError
            | ErrorKind::Unexpected => Severity::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Canceled => "canceled",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::RemoteServerError => "remote_server_error",
            ErrorKind::RemoteClientError => "remote_client_error",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log severity, shared by ErrorRecord and the log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Authoritative description of one failure.
///
/// Created where the failure is observed and never mutated afterwards.
/// The original cause itself travels in `EnrichedError`; the record keeps its
/// rendered form so it can be cloned, logged and serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub correlation_id: CorrelationId,
    pub operation: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    /// Status of the uniform payload. A remote status, when known, wins for
    /// remote-classified failures.
    pub fn status_code(&self) -> u16 {
        match self.kind {
            ErrorKind::RemoteServerError | ErrorKind::RemoteClientError => self
                .attributes
                .get("remote_status")
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| self.kind.status_code()),
            kind => kind.status_code(),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind,
            status: self.status_code(),
            correlation_id: self.correlation_id.to_string(),
            message: self.message.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed ({}, {}): {}",
            self.operation, self.kind, self.correlation_id, self.message
        )
    }
}

/// Uniform error body handed to callers / API layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub status: u16,
    pub correlation_id: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}
