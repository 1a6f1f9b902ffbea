//! Termination and lineage-reduction cleanup.
//!
//! Both cascades run leaf-first: a child's environment is always gone (or its
//! record interrupted) before its parent's, so no orphan can outlive the node
//! that knows about it.

use crate::error::{OrchestratorError, TaskResult};
use crate::orchestrator::Orchestrator;
use crate::types::{MAX_TRAVERSAL_HOPS, TaskStatus};
use std::collections::HashSet;
use tracing::{debug, info, warn};

impl Orchestrator {
    /// Hard-terminate a task and its whole subtree, leaf-first. Records and
    /// environments are deleted; waiters are rejected. Any record or
    /// environment deletion failure fails the operation (partial progress
    /// stays deleted).
    pub async fn terminate_descendant_task(
        &self,
        ancestor_id: &str,
        task_id: &str,
    ) -> TaskResult<()> {
        let index = self.index()?;
        if index.get(task_id).is_none() {
            return Err(OrchestratorError::task_not_found(task_id));
        }
        if !index.is_descendant(ancestor_id, task_id) {
            return Err(OrchestratorError::not_a_descendant(ancestor_id, task_id));
        }

        let parent_session_id = index
            .get(task_id)
            .map(|t| t.parent_session_id.clone())
            .unwrap_or_default();

        for id in index.subtree_leaf_first(task_id) {
            let record = self.get_task(&id)?;
            if let Err(err) = self.collab.streams.stop_stream(&id).await {
                warn!(task_id = %id, "stop stream failed: {}", err);
            }
            self.reject_waiters(&id, OrchestratorError::task_terminated(&id));
            self.resolve_start_waiters(&id);

            self.store.delete_task(&id).map_err(OrchestratorError::store)?;
            self.events.emit(&id, None);

            if let Some(path) = record.as_ref().and_then(|t| t.session_path.as_deref()) {
                self.collab
                    .provisioner
                    .delete(path, true)
                    .await
                    .map_err(|err| OrchestratorError::provisioning_failed(err).with_task(&id))?;
            }
            if let Err(err) = self.store.delete_session_data(&id) {
                warn!(task_id = %id, "session data delete failed: {}", err);
            }
            info!(task_id = %id, "task terminated");
        }

        // The parent may have just become a finished leaf, and the subtree
        // freed slots.
        self.cleanup_reported_leaf_task(&parent_session_id).await?;
        if let Err(err) = self.maybe_start_queued_tasks().await {
            warn!("dequeue after termination failed: {}", err);
        }
        Ok(())
    }

    /// Interrupt every descendant task of a session, leaf-first. Records are
    /// retained in `interrupted` for manual resume; a queued task keeps its
    /// stored prompt. Suppresses auto-resume for the session afterwards.
    pub async fn terminate_all_descendant_tasks(&self, session_id: &str) -> TaskResult<usize> {
        let index = self.index()?;
        let mut interrupted = 0usize;

        for id in index.subtree_leaf_first(session_id) {
            let Some(task) = self.get_task(&id)? else {
                continue;
            };
            if matches!(task.status, TaskStatus::Reported | TaskStatus::Interrupted) {
                continue;
            }
            if let Err(err) = self.collab.streams.stop_stream(&id).await {
                warn!(task_id = %id, "stop stream failed: {}", err);
            }
            self.transition(&id, TaskStatus::Interrupted).await?;
            self.reject_waiters(&id, OrchestratorError::task_terminated(&id));
            self.resolve_start_waiters(&id);
            interrupted += 1;
        }

        self.store
            .set_hard_interrupted(session_id, true)
            .map_err(OrchestratorError::store)?;
        info!(session_id, interrupted, "descendant tasks interrupted");
        Ok(interrupted)
    }

    /// Lineage reduction: delete a finished leaf and re-evaluate its parent
    /// as the new candidate, walking up until a survivor is found.
    ///
    /// A node is removable only when it is `reported`, not streaming, a
    /// structural leaf (zero children regardless of their status), and has no
    /// pending artifact generation. Bounded and cycle-checked.
    pub async fn cleanup_reported_leaf_task(&self, task_id: &str) -> TaskResult<()> {
        let mut current = task_id.to_string();
        let mut visited: HashSet<String> = HashSet::new();

        for _ in 0..MAX_TRAVERSAL_HOPS {
            if !visited.insert(current.clone()) {
                return Err(OrchestratorError::integrity(format!(
                    "cycle detected during cleanup at {}",
                    current
                )));
            }
            let Some(task) = self.get_task(&current)? else {
                return Ok(());
            };

            let index = self.index()?;
            let removable = task.status == TaskStatus::Reported
                && !self.collab.streams.is_streaming(&current).await
                && index.children(&current).is_empty()
                && !task.artifact_pending;
            if !removable {
                debug!(task_id = %current, "not a removable leaf; cleanup stops");
                return Ok(());
            }

            self.store
                .delete_task(&current)
                .map_err(OrchestratorError::store)?;
            self.events.emit(&current, None);
            if let Some(path) = task.session_path.as_deref() {
                if let Err(err) = self.collab.provisioner.delete(path, false).await {
                    warn!(task_id = %current, "environment delete failed: {}", err);
                }
            }
            if let Err(err) = self.store.delete_session_data(&current) {
                warn!(task_id = %current, "session data delete failed: {}", err);
            }
            info!(task_id = %current, "finished leaf cleaned up");

            let parent = task.parent_session_id;
            if self.get_task(&parent)?.is_none() {
                return Ok(()); // reached a root session
            }
            current = parent;
        }

        Err(OrchestratorError::integrity(format!(
            "cleanup traversal exceeded {} hops starting from {}",
            MAX_TRAVERSAL_HOPS, task_id
        )))
    }
}
