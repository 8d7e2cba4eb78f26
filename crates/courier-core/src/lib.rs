//! courier-core
//!
//! Building blocks for resilient remote calls inside a long-running service.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, request, task, errors）
//! - **ports**: 抽象化レイヤー（RemoteExecutor, UnderlyingStore, LogSink, Clock, CorrelationIdGenerator）
//! - **impls**: ports のプロセス内実装（InMemoryStore, TracingLogSink, RecordingLogSink）
//! - **cache**: KeyedCache（TTL キャッシュ + キー単位の mutex）
//! - **runner**: ConcurrentTaskRunner（並行数制限つきの一括実行）
//! - **classify**: ErrorClassifier（失敗の分類・enrich・ログ出力）
//! - **config**: CourierConfig（JSON から読み込める設定）
//! - **error**: CourierError（この crate の公開エラー型）

pub mod cache;
pub mod classify;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod runner;

pub use crate::cache::KeyedCache;
pub use crate::classify::{EnrichedError, ErrorClassifier, ErrorContext};
pub use crate::config::{CacheConfig, CourierConfig, RunnerConfig};
pub use crate::error::CourierError;
pub use crate::runner::{ConcurrentTaskRunner, FailurePolicy};
