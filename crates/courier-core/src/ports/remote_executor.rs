//! RemoteExecutor port - 実際にリモート呼び出しを行う実装
//!
//! HTTP クライアントや gRPC スタブなどホストアプリケーション側が実装します。
//! retry / circuit breaker はこの trait をラップする形で差し込みます。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::{CorrelationId, RemoteResponse, RequestDescriptor};

/// Failure of a remote call, distinguishing the classes the classifier
/// needs to tell apart.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("call canceled")]
    Canceled,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("remote answered {code}: {message}")]
    Status { code: u16, message: String },

    #[error("{0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RemoteError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        RemoteError::Status {
            code,
            message: message.into(),
        }
    }
}

/// RemoteExecutor は 1 回のリモート呼び出しを実行
///
/// # 契約
/// - `cancel` を協調的に尊重する（発火したら `RemoteError::Canceled` を返してよい）
/// - network / timeout / status class の失敗を `RemoteError` で区別して返す
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn invoke(
        &self,
        request: &RequestDescriptor,
        correlation_id: CorrelationId,
        cancel: &CancellationToken,
    ) -> Result<RemoteResponse, RemoteError>;
}
