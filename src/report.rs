//! Completion and report-delivery protocol.
//!
//! Stream-end handling is serialized per session. Delivery writes the durable
//! artifact before any notification, so a crash between the two is recovered
//! by re-reading the artifact rather than re-running the child.

use crate::error::{OrchestratorError, TaskResult};
use crate::interfaces::{ConversationMessage, PLAN_TOOL, REPORT_TOOL, SendOptions, StreamEnded};
use crate::orchestrator::Orchestrator;
use crate::store::now_ms;
use crate::types::{TaskRecord, TaskReport, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Sent once when a task's stream ends without a completion-tool call.
pub(crate) const REMINDER_PROMPT: &str = "Your turn ended without reporting a result. \
     Call the report tool now with a summary of what you accomplished.";

/// Sent to a parent that went idle while descendant tasks are still active.
pub(crate) const WAIT_DIRECTIVE: &str = "Delegated tasks are still in progress. \
     Wait for their reports before concluding; do not repeat their work yourself.";

/// Sent to an idle parent after a child's report has been delivered.
pub(crate) const INTEGRATE_REPORTS_DIRECTIVE: &str = "A delegated task has reported its result \
     (see the message above). Integrate it and continue with your own task.";

const FALLBACK_REPORT_PREFIX: &str =
    "Task ended twice without an explicit report. Last output follows.";

impl Orchestrator {
    /// Handle a sub-agent session's stream ending.
    ///
    /// Demotes a task with outstanding descendants, detects the completion
    /// signal, issues at most one reminder, and otherwise synthesizes a
    /// fallback report so a silent child is an explicit failure mode.
    pub async fn handle_stream_ended(&self, session_id: &str, ended: StreamEnded) -> TaskResult<()> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let Some(mut task) = self.get_task(session_id)? else {
            // Not a task session; root-session turns are handled elsewhere.
            return Ok(());
        };
        match task.status {
            TaskStatus::Reported | TaskStatus::Interrupted => return Ok(()),
            TaskStatus::Queued => {
                // The stream outran the status flip at dequeue time.
                task = self.transition(&task.id, TaskStatus::Running).await?;
            }
            TaskStatus::Running | TaskStatus::AwaitingReport => {}
        }

        // A task must never finalize while its own children are outstanding.
        if self.index()?.has_active_descendants(&task.id) {
            if task.status == TaskStatus::AwaitingReport {
                debug!(task_id = %task.id, "active descendants found; demoting to running");
                self.transition(&task.id, TaskStatus::Running).await?;
            }
            return Ok(());
        }

        if let Some((report_text, title)) = self.completion_signal(&task, &ended) {
            let report = self.build_report(&task, report_text, title)?;
            return self.deliver_report(&task.id, report).await;
        }

        if task.reminder_count >= 1 {
            // Second consecutive signal-less ending. Explicit failure, not
            // silent loss.
            let text = match ended.last_text {
                Some(t) if !t.is_empty() => format!("{}\n\n{}", FALLBACK_REPORT_PREFIX, t),
                _ => FALLBACK_REPORT_PREFIX.to_string(),
            };
            warn!(task_id = %task.id, "synthesizing fallback report");
            let report = self.build_report(&task, text, None)?;
            return self.deliver_report(&task.id, report).await;
        }

        // First signal-less ending: exactly one reminder.
        let options = SendOptions {
            model: task.model.clone(),
            thinking_level: task.thinking_level.clone(),
        };
        self.collab
            .streams
            .send_message(&task.id, REMINDER_PROMPT, options)
            .await
            .map_err(|e| OrchestratorError::send_failed(&task.id, e))?;
        self.edit_and_notify(&task.id, |t| t.reminder_count += 1)?;
        self.transition(&task.id, TaskStatus::AwaitingReport).await?;
        Ok(())
    }

    /// Scan an ended stream's tool calls for the completion signal. Plan-mode
    /// agents may complete via the plan-proposal tool instead.
    fn completion_signal(
        &self,
        task: &TaskRecord,
        ended: &StreamEnded,
    ) -> Option<(String, Option<String>)> {
        let config = self.config.load_full();
        let plan_mode = config
            .agents
            .get(&task.agent_id)
            .map(|a| a.plan_mode)
            .unwrap_or(false);

        for call in &ended.tool_calls {
            if !call.succeeded {
                continue;
            }
            let is_signal =
                call.name == REPORT_TOOL || (plan_mode && call.name == PLAN_TOOL);
            if !is_signal {
                continue;
            }
            let text = call
                .input
                .get("report")
                .or_else(|| call.input.get("plan"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| call.input.to_string());
            let title = call
                .input
                .get("title")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            return Some((text, title));
        }
        None
    }

    fn build_report(
        &self,
        task: &TaskRecord,
        report: String,
        title: Option<String>,
    ) -> TaskResult<TaskReport> {
        let ancestor_ids = self.index()?.ancestors(&task.id)?;
        Ok(TaskReport {
            task_id: task.id.clone(),
            report,
            title,
            model: task.model.clone(),
            thinking_level: task.thinking_level.clone(),
            ancestor_ids,
            created_at: now_ms(),
        })
    }

    /// Deliver a task's report: persist the artifact under every ancestor,
    /// generate derived artifacts, notify the parent, resolve waiters, free
    /// the slot, and reduce the finished lineage.
    ///
    /// Idempotent: a task already `reported` is a no-op.
    pub async fn deliver_report(&self, task_id: &str, report: TaskReport) -> TaskResult<()> {
        let Some(task) = self.get_task(task_id)? else {
            return Ok(());
        };
        if task.status == TaskStatus::Reported {
            debug!(task_id, "report already delivered; skipping");
            return Ok(());
        }

        self.transition(task_id, TaskStatus::Reported).await?;

        // Durable before any notification. Everything after this point is
        // recoverable from the artifact.
        self.store
            .put_report(&report)
            .map_err(OrchestratorError::store)?;
        self.report_cache.lock().unwrap().insert(report.clone());

        self.edit_and_notify(task_id, |t| t.artifact_pending = true)?;
        match self.collab.artifacts.generate(task_id).await {
            Ok(()) => {
                self.edit_and_notify(task_id, |t| t.artifact_pending = false)?;
            }
            Err(err) => {
                // Flag stays set; startup recovery retries generation.
                warn!(task_id, "artifact generation failed: {}", err);
            }
        }

        if let Err(err) = self.notify_parent(&task, &report).await {
            // The artifact is durable; the parent sees the report through it
            // even if this append never lands.
            warn!(task_id, "parent delivery failed: {}", err);
        }

        self.resolve_waiters(task_id, &report);
        info!(task_id, "report delivered");

        if let Err(err) = self.maybe_start_queued_tasks().await {
            warn!("dequeue after report failed: {}", err);
        }
        self.cleanup_reported_leaf_task(task_id).await?;

        self.maybe_auto_resume_parent(&task.parent_session_id).await;
        Ok(())
    }

    /// Put the report in front of the parent. If the parent's interrupted
    /// turn left the delegation tool call pending, finalize that call in
    /// place; otherwise append a synthetic message. History is append-only
    /// either way.
    async fn notify_parent(&self, task: &TaskRecord, report: &TaskReport) -> anyhow::Result<()> {
        let parent = &task.parent_session_id;

        if let Some(mut turn) = self.collab.history.read_partial_turn(parent).await? {
            if let Some(pending) = turn.pending_task_call.as_mut() {
                if pending.task_id == task.id && pending.resolved_result.is_none() {
                    pending.resolved_result = Some(report.report.clone());
                    self.collab.history.write_partial_turn(parent, turn).await?;
                    return Ok(());
                }
            }
        }

        let heading = report.title.as_deref().unwrap_or(&task.title);
        let text = format!("Report from task \"{}\":\n\n{}", heading, report.report);
        self.collab
            .history
            .append_message(parent, ConversationMessage::synthetic(text))
            .await
    }

    /// Nudge an idle parent to integrate a freshly delivered report. Guarded
    /// by the auto-resume counter so a parent that keeps ending its turn
    /// without progress is not resumed forever. Failures are logged only.
    async fn maybe_auto_resume_parent(&self, parent_session_id: &str) {
        let result: TaskResult<()> = async {
            if self.collab.streams.is_streaming(parent_session_id).await {
                return Ok(());
            }
            match self.index() {
                Ok(index) if index.has_active_descendants(parent_session_id) => return Ok(()),
                Ok(_) => {}
                Err(err) => return Err(err),
            }
            let flags = self
                .store
                .session_flags(parent_session_id)
                .map_err(OrchestratorError::store)?;
            if flags.hard_interrupted {
                debug!(session_id = parent_session_id, "auto-resume suppressed (hard interrupt)");
                return Ok(());
            }
            let ceiling = self.config.load_full().auto_resume_ceiling;
            if flags.auto_resume_count >= ceiling {
                return Err(OrchestratorError::auto_resume_stuck(
                    parent_session_id,
                    flags.auto_resume_count,
                ));
            }
            self.store
                .bump_auto_resume(parent_session_id)
                .map_err(OrchestratorError::store)?;
            self.collab
                .streams
                .send_message(
                    parent_session_id,
                    INTEGRATE_REPORTS_DIRECTIVE,
                    SendOptions::default(),
                )
                .await
                .map_err(|e| OrchestratorError::send_failed(parent_session_id, e))?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            warn!(session_id = parent_session_id, "parent auto-resume failed: {}", err);
        }
    }

    /// Block until a task's report is available.
    ///
    /// Fast-paths the cache and the durable artifacts, fails fast on a
    /// missing or interrupted task, and for a queued task starts the timeout
    /// clock only once the task actually begins running. While blocked, the
    /// requesting session is excluded from the active count.
    pub async fn wait_for_report(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
        cancel: Option<Arc<Notify>>,
        requesting_session: Option<&str>,
    ) -> TaskResult<TaskReport> {
        if let Some(report) = self.lookup_report(task_id, requesting_session)? {
            return Ok(report);
        }

        let task = self.get_task(task_id)?;
        let status = match task {
            None => return Err(OrchestratorError::task_not_found(task_id)),
            Some(t) if t.status == TaskStatus::Interrupted => {
                return Err(OrchestratorError::task_terminated(task_id));
            }
            Some(t) => t.status,
        };

        let (waiter_id, mut rx) = self.register_waiter(task_id);
        // A report delivered between the lookup above and registration would
        // never resolve this waiter; one re-check closes the window.
        match self.lookup_report(task_id, requesting_session) {
            Ok(Some(report)) => {
                self.remove_waiter(task_id, waiter_id);
                return Ok(report);
            }
            Ok(None) => {}
            Err(err) => {
                self.remove_waiter(task_id, waiter_id);
                return Err(err);
            }
        }
        let _blocked = requesting_session.map(|s| BlockedGuard::new(self, s));

        // The queue is not the task's fault; only running time counts.
        if status == TaskStatus::Queued {
            let start_rx = self.register_start_waiter(task_id);
            tokio::select! {
                _ = start_rx => {}
                _ = wait_cancelled(&cancel) => {
                    self.remove_waiter(task_id, waiter_id);
                    return Err(OrchestratorError::wait_cancelled(task_id));
                }
            }
        }

        let timeout = timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.load_full().wait_timeout_ms));

        tokio::select! {
            result = &mut rx => match result {
                Ok(outcome) => outcome,
                // Waiter dropped without resolution: the task went away.
                Err(_) => Err(OrchestratorError::task_terminated(task_id)),
            },
            _ = wait_cancelled(&cancel) => {
                self.remove_waiter(task_id, waiter_id);
                Err(OrchestratorError::wait_cancelled(task_id))
            }
            _ = tokio::time::sleep(timeout) => {
                self.remove_waiter(task_id, waiter_id);
                Err(OrchestratorError::wait_timeout(task_id))
            }
        }
    }

    /// Cached or durable report lookup, scoped to the requester's ancestor
    /// scope when one is given.
    fn lookup_report(
        &self,
        task_id: &str,
        requesting_session: Option<&str>,
    ) -> TaskResult<Option<TaskReport>> {
        if let Some(report) = self.report_cache.lock().unwrap().get(task_id) {
            match requesting_session {
                Some(scope) if !report.in_scope_of(scope) => {}
                _ => return Ok(Some(report.clone())),
            }
        }
        let durable = match requesting_session {
            Some(scope) => self.store.get_report_for_ancestor(scope, task_id),
            None => self.store.get_report(task_id),
        }
        .map_err(OrchestratorError::store)?;
        Ok(durable)
    }
}

async fn wait_cancelled(cancel: &Option<Arc<Notify>>) {
    match cancel {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

/// Marks a session as foreground-blocked for the duration of a wait.
struct BlockedGuard<'a> {
    orchestrator: &'a Orchestrator,
    session_id: String,
}

impl<'a> BlockedGuard<'a> {
    fn new(orchestrator: &'a Orchestrator, session_id: &str) -> Self {
        orchestrator.block_session(session_id);
        Self {
            orchestrator,
            session_id: session_id.to_string(),
        }
    }
}

impl Drop for BlockedGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.unblock_session(&self.session_id);
    }
}
