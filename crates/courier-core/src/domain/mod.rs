//! Domain model (IDs, request shapes, task results, error records).
//!
//! - ids: CorrelationId / LockOwnerId（ULID）と TaskId（連番）
//! - request: executor に渡す RequestDescriptor と RemoteResponse
//! - task: TaskState と TaskResult
//! - errors: ErrorKind / Severity / ErrorRecord / ErrorPayload

pub mod errors;
pub mod ids;
pub mod request;
pub mod task;

pub use self::errors::{ErrorKind, ErrorPayload, ErrorRecord, Severity};
pub use self::ids::{CorrelationId, Id, IdMarker, LockOwnerId, TaskId};
pub use self::request::{RemoteResponse, RequestDescriptor};
pub use self::task::{TaskOutcome, TaskResult, TaskState};
