//! Startup recovery and the parent auto-resume guard.
//!
//! Everything here reconstructs behavior from durable state alone: waiters
//! and the report cache do not survive a restart, the task rows and report
//! artifacts do.

use crate::admission::RESUME_PROMPT;
use crate::error::{OrchestratorError, TaskResult};
use crate::interfaces::SendOptions;
use crate::orchestrator::Orchestrator;
use crate::report::{REMINDER_PROMPT, WAIT_DIRECTIVE};
use crate::types::TaskStatus;
use tracing::{info, warn};

impl Orchestrator {
    /// Re-derive in-flight work from durable state after a process restart.
    ///
    /// Nudges every interrupted-in-flight task exactly once, resumes pending
    /// artifact generation, then dequeues. Individual failures are logged
    /// and skipped so one bad row cannot block the rest of recovery.
    pub async fn recover_on_startup(&self) -> TaskResult<()> {
        let tasks = self.store.all_tasks().map_err(OrchestratorError::store)?;
        info!(count = tasks.len(), "startup recovery scanning tasks");

        for task in &tasks {
            match task.status {
                TaskStatus::Running | TaskStatus::AwaitingReport => {
                    if self.index()?.has_active_descendants(&task.id) {
                        continue; // a child's own report will wake it
                    }
                    if self.collab.streams.is_streaming(&task.id).await {
                        continue;
                    }
                    let prompt = if task.status == TaskStatus::AwaitingReport {
                        REMINDER_PROMPT
                    } else {
                        RESUME_PROMPT
                    };
                    let options = SendOptions {
                        model: task.model.clone(),
                        thinking_level: task.thinking_level.clone(),
                    };
                    if let Err(err) = self
                        .collab
                        .streams
                        .send_message(&task.id, prompt, options)
                        .await
                    {
                        warn!(task_id = %task.id, "recovery nudge failed: {}", err);
                    }
                }
                TaskStatus::Reported if task.artifact_pending => {
                    match self.collab.artifacts.generate(&task.id).await {
                        Ok(()) => {
                            self.edit_and_notify(&task.id, |t| t.artifact_pending = false)?;
                            if let Err(err) = self.cleanup_reported_leaf_task(&task.id).await {
                                warn!(task_id = %task.id, "post-recovery cleanup failed: {}", err);
                            }
                        }
                        Err(err) => {
                            warn!(task_id = %task.id, "artifact generation retry failed: {}", err);
                        }
                    }
                }
                _ => {}
            }
        }

        let started = self.maybe_start_queued_tasks().await?;
        if started > 0 {
            info!(started, "recovery started queued tasks");
        }
        Ok(())
    }

    /// A parent session's turn ended. If it still has active descendant
    /// tasks, synthesize a directive to keep waiting and resume the parent.
    ///
    /// Returns `Ok(true)` if a resume was issued, `Ok(false)` if none was
    /// needed or the session is hard-interrupted. Errors with `AutoResumeStuck`
    /// once the per-session ceiling is hit; only
    /// [`Orchestrator::reset_auto_resume_count`] clears that state.
    pub async fn handle_parent_turn_ended(&self, session_id: &str) -> TaskResult<bool> {
        if !self.index()?.has_active_descendants(session_id) {
            return Ok(false);
        }
        let flags = self
            .store
            .session_flags(session_id)
            .map_err(OrchestratorError::store)?;
        if flags.hard_interrupted {
            return Ok(false);
        }
        let ceiling = self.config.load_full().auto_resume_ceiling;
        if flags.auto_resume_count >= ceiling {
            return Err(OrchestratorError::auto_resume_stuck(
                session_id,
                flags.auto_resume_count,
            ));
        }

        let count = self
            .store
            .bump_auto_resume(session_id)
            .map_err(OrchestratorError::store)?;
        self.collab
            .streams
            .send_message(session_id, WAIT_DIRECTIVE, SendOptions::default())
            .await
            .map_err(|e| OrchestratorError::send_failed(session_id, e))?;
        info!(session_id, count, "parent auto-resumed to await descendants");
        Ok(true)
    }
}
