//! Structured error types for orchestration operations.

use serde::Serialize;
use thiserror::Error;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Admission errors (returned synchronously, no state mutated)
    SessionNotFound,
    TaskNotFound,
    AgentNotFound,
    AgentDisabled,
    ParentAlreadyReported,
    DepthExceeded,
    InvalidName,

    // Lifecycle errors
    InvalidTransition,
    NotADescendant,

    // Collaborator errors
    ProvisioningFailed,
    SendFailed,
    DeliveryFailed,

    // Foreground wait outcomes
    WaitTimeout,
    WaitCancelled,
    TaskTerminated,

    // Guard
    AutoResumeStuck,

    // Internal errors
    IntegrityViolation,
    StoreError,
}

/// Structured error carrying a code, a human-readable message, and the task
/// the operation was acting on (when known).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct OrchestratorError {
    pub code: ErrorCode,
    pub message: String,
    pub task_id: Option<String>,
}

impl OrchestratorError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            task_id: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    // Convenience constructors

    pub fn session_not_found(session_id: &str) -> Self {
        Self::new(
            ErrorCode::SessionNotFound,
            format!("Session not found: {}", session_id),
        )
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
        .with_task(task_id)
    }

    pub fn agent_not_found(agent_id: &str) -> Self {
        Self::new(
            ErrorCode::AgentNotFound,
            format!("Agent not registered: {}", agent_id),
        )
    }

    pub fn agent_disabled(agent_id: &str) -> Self {
        Self::new(
            ErrorCode::AgentDisabled,
            format!("Agent is disabled: {}", agent_id),
        )
    }

    pub fn parent_already_reported(parent_id: &str) -> Self {
        Self::new(
            ErrorCode::ParentAlreadyReported,
            format!(
                "Parent task {} has already reported; no further delegation permitted",
                parent_id
            ),
        )
    }

    pub fn depth_exceeded(requested: usize, max: usize) -> Self {
        Self::new(
            ErrorCode::DepthExceeded,
            format!(
                "Requested nesting depth {} exceeds the configured limit of {}",
                requested, max
            ),
        )
    }

    pub fn invalid_name(name: &str) -> Self {
        Self::new(
            ErrorCode::InvalidName,
            format!("Generated session name failed validation: {}", name),
        )
    }

    pub fn invalid_transition(task_id: &str, from: &str, to: &str) -> Self {
        Self::new(
            ErrorCode::InvalidTransition,
            format!("Invalid transition from '{}' to '{}'", from, to),
        )
        .with_task(task_id)
    }

    pub fn not_a_descendant(ancestor_id: &str, task_id: &str) -> Self {
        Self::new(
            ErrorCode::NotADescendant,
            format!("Task {} is not a descendant of {}", task_id, ancestor_id),
        )
        .with_task(task_id)
    }

    pub fn provisioning_failed(err: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::ProvisioningFailed,
            format!("Environment provisioning failed: {}", err),
        )
    }

    pub fn send_failed(session_id: &str, err: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::SendFailed,
            format!("Failed to send message to session {}: {}", session_id, err),
        )
    }

    pub fn wait_timeout(task_id: &str) -> Self {
        Self::new(
            ErrorCode::WaitTimeout,
            format!("Timed out waiting for task {} to report", task_id),
        )
        .with_task(task_id)
    }

    pub fn wait_cancelled(task_id: &str) -> Self {
        Self::new(
            ErrorCode::WaitCancelled,
            format!("Wait for task {} was cancelled", task_id),
        )
        .with_task(task_id)
    }

    pub fn task_terminated(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskTerminated,
            format!("Task {} was terminated", task_id),
        )
        .with_task(task_id)
    }

    pub fn auto_resume_stuck(session_id: &str, count: i32) -> Self {
        Self::new(
            ErrorCode::AutoResumeStuck,
            format!(
                "Session {} hit the auto-resume ceiling ({} consecutive resumes) with descendants still active",
                session_id, count
            ),
        )
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IntegrityViolation, message)
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::StoreError, err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<OrchestratorError>() {
            Ok(orch_err) => orch_err,
            Err(err) => OrchestratorError::store(err),
        }
    }
}

/// Result type for orchestration operations.
pub type TaskResult<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_code_and_task() {
        let err = OrchestratorError::task_not_found("abc");
        assert_eq!(err.code, ErrorCode::TaskNotFound);
        assert_eq!(err.task_id.as_deref(), Some("abc"));
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn anyhow_downcast_preserves_code() {
        let orig = OrchestratorError::depth_exceeded(4, 3);
        let any: anyhow::Error = orig.into();
        let back: OrchestratorError = any.into();
        assert_eq!(back.code, ErrorCode::DepthExceeded);
    }

    #[test]
    fn opaque_anyhow_becomes_store_error() {
        let any = anyhow::anyhow!("disk on fire");
        let err: OrchestratorError = any.into();
        assert_eq!(err.code, ErrorCode::StoreError);
    }
}
