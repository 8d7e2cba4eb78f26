//! Per-task state machine and the result record returned by the runner.

use serde::{Deserialize, Serialize};

use super::errors::{ErrorKind, ErrorRecord};
use super::ids::TaskId;
use super::request::RequestDescriptor;

/// Task state inside one runner invocation.
///
/// State transitions:
/// - Pending -> Running -> Succeeded
/// - Pending -> Running -> Failed
/// - Pending -> Running -> Canceled
/// - Pending -> Skipped (fail-fast run aborted before admission)
/// - Pending -> Canceled (caller canceled before admission)
///
/// The admission permit is held exactly while a task is Running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled | TaskState::Skipped
        )
    }

    /// Only Pending -> Running and Running -> terminal are legal, plus the
    /// Pending -> Skipped / Canceled shortcuts.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        match (self, next) {
            (
                TaskState::Pending,
                TaskState::Running | TaskState::Skipped | TaskState::Canceled,
            ) => true,
            (
                TaskState::Running,
                TaskState::Succeeded | TaskState::Failed | TaskState::Canceled,
            ) => true,
            _ => false,
        }
    }
}

/// Outcome marker of a task: the status code the call produced and whether it
/// counts as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: u16,
    pub success: bool,
}

impl TaskOutcome {
    pub fn from_status(status: u16) -> Self {
        Self {
            status,
            success: (200..300).contains(&status),
        }
    }

    pub fn failed(record: &ErrorRecord) -> Self {
        Self {
            status: record.status_code(),
            success: false,
        }
    }
}

/// Result of one task. Immutable once built; owned by the caller of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub request: RequestDescriptor,
    pub outcome: TaskOutcome,
    pub duration_ms: u64,

    /// Present iff the task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl TaskResult {
    pub fn succeeded(
        task_id: TaskId,
        request: RequestDescriptor,
        status: u16,
        duration_ms: u64,
    ) -> Self {
        Self {
            task_id,
            request,
            outcome: TaskOutcome::from_status(status),
            duration_ms,
            error: None,
        }
    }

    pub fn failed(
        task_id: TaskId,
        request: RequestDescriptor,
        record: ErrorRecord,
        duration_ms: u64,
    ) -> Self {
        Self {
            task_id,
            request,
            outcome: TaskOutcome::failed(&record),
            duration_ms,
            error: Some(record),
        }
    }

    pub fn state(&self) -> TaskState {
        match &self.error {
            None => TaskState::Succeeded,
            Some(record) if record.kind == ErrorKind::Canceled => TaskState::Canceled,
            Some(_) => TaskState::Failed,
        }
    }
}
