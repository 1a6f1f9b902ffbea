//! Task state machine.
//!
//! All status changes funnel through [`Orchestrator::transition`], which owns
//! the side effects of a transition: durable write and observer notification.
//! Status is monotonic within a lifecycle except for the explicit
//! `awaiting_report -> running` demotion (late-discovered active descendants)
//! and `interrupted -> running` (manual resume).

use crate::error::{OrchestratorError, TaskResult};
use crate::orchestrator::Orchestrator;
use crate::store::now_ms;
use crate::types::{TaskRecord, TaskStatus};

/// Whether `from -> to` is a valid status transition.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    match (from, to) {
        (Queued, Running) => true,
        (Running, AwaitingReport) => true,
        (AwaitingReport, Running) => true,
        (Running, Reported) | (AwaitingReport, Reported) => true,
        // Any active status can be interrupted by a user-driven cascade.
        (Queued, Interrupted) | (Running, Interrupted) | (AwaitingReport, Interrupted) => true,
        (Interrupted, Running) => true,
        _ => false,
    }
}

impl Orchestrator {
    /// Apply a status transition: validate, persist against the latest
    /// snapshot, notify observers. Returns the updated record.
    pub(crate) async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
    ) -> TaskResult<TaskRecord> {
        let mut rejected: Option<OrchestratorError> = None;
        let updated = self
            .store
            .edit_task(task_id, |task| {
                if task.status == to {
                    return; // idempotent no-op
                }
                if !is_valid_transition(task.status, to) {
                    rejected = Some(OrchestratorError::invalid_transition(
                        task_id,
                        task.status.as_str(),
                        to.as_str(),
                    ));
                    return;
                }
                task.status = to;
                if to == TaskStatus::Reported {
                    task.reported_at = Some(now_ms());
                }
            })
            .map_err(OrchestratorError::store)?;

        if let Some(err) = rejected {
            return Err(err);
        }

        let task = updated.ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
        self.events.emit(task_id, Some(task.clone()));

        if to == TaskStatus::Running {
            // A wait registered while the task was queued starts its timeout
            // clock here.
            self.resolve_start_waiters(task_id);
        }

        Ok(task)
    }
}
