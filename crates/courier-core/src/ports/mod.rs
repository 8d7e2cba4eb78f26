//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。
//! 各 trait はホストアプリケーションが差し込む外部コラボレーター
//! （リモート呼び出し、key-value store、ログ出力、時刻、ID 生成）への
//! インターフェースを提供します。

pub mod clock;
pub mod id_generator;
pub mod log_sink;
pub mod remote_executor;
pub mod store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{CorrelationIdGenerator, UlidGenerator};
pub use self::log_sink::{LogEvent, LogSink};
pub use self::remote_executor::{RemoteError, RemoteExecutor};
pub use self::store::UnderlyingStore;
