//! Admission controller: queue-vs-start decisions and depth checks.
//!
//! `create_task` and `maybe_start_queued_tasks` both run under the global
//! admission mutex so the active count can never change under an admission
//! decision. `maybe_start_queued_tasks` additionally re-reads capacity after
//! every suspension point, because a slot granted before a slow provisioning
//! call may be gone by the time it returns.

use crate::config::{generate_session_name, validate_session_name};
use crate::error::{OrchestratorError, TaskResult};
use crate::index::TaskIndex;
use crate::interfaces::SendOptions;
use crate::orchestrator::Orchestrator;
use crate::store::tasks::new_task_record;
use crate::types::{CreateOutcome, TaskRecord, TaskStatus};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Continuation sent when dequeuing a legacy record whose prompt was not
/// retained.
pub(crate) const RESUME_PROMPT: &str =
    "Continue with your assigned task. When finished, call the report tool with your result.";

/// Parameters for [`Orchestrator::create_task`].
#[derive(Debug, Clone)]
pub struct CreateTaskParams {
    pub parent_session_id: String,
    pub agent_id: String,
    pub prompt: String,
    pub title: String,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
}

impl Orchestrator {
    /// Count of tasks holding a parallelism slot: active status, excluding
    /// sessions blocked in a foreground wait. The exclusion is what keeps a
    /// task awaiting its own nested child from deadlocking a saturated pool.
    pub(crate) fn active_count(&self, index: &TaskIndex) -> usize {
        index
            .tasks()
            .filter(|task| task.status.is_active() && !self.is_blocked(&task.id))
            .count()
    }

    /// Delegate a bounded unit of work to a new sub-agent session.
    ///
    /// Either starts it immediately (environment provisioned, prompt sent)
    /// or persists it as queued when the parallelism cap is reached.
    /// Admission failures are returned synchronously with no state mutated.
    pub async fn create_task(&self, params: CreateTaskParams) -> TaskResult<CreateOutcome> {
        let _admission = self.admission.lock().await;

        if !self
            .store
            .session_known(&params.parent_session_id)
            .map_err(OrchestratorError::store)?
        {
            return Err(OrchestratorError::session_not_found(
                &params.parent_session_id,
            ));
        }

        // A finished task may not delegate further.
        if let Some(parent_task) = self.get_task(&params.parent_session_id)? {
            if parent_task.status == TaskStatus::Reported {
                return Err(OrchestratorError::parent_already_reported(
                    &params.parent_session_id,
                ));
            }
        }

        let config = self.config.load_full();
        let agent = config
            .agents
            .get(&params.agent_id)
            .ok_or_else(|| OrchestratorError::agent_not_found(&params.agent_id))?;
        if !agent.enabled {
            return Err(OrchestratorError::agent_disabled(&params.agent_id));
        }

        let env_name = generate_session_name();
        if !validate_session_name(&env_name) {
            return Err(OrchestratorError::invalid_name(&env_name));
        }

        let index = self.index()?;
        let requested_depth = index.depth(&params.parent_session_id)? + 1;
        if requested_depth > config.max_task_nesting_depth {
            return Err(OrchestratorError::depth_exceeded(
                requested_depth,
                config.max_task_nesting_depth,
            ));
        }

        let model = params.model.clone().or_else(|| agent.model.clone());
        let thinking_level = params
            .thinking_level
            .clone()
            .or_else(|| agent.thinking_level.clone());
        let task_id = Uuid::now_v7().to_string();

        if self.active_count(&index) >= config.max_parallel_agent_tasks {
            // No environment provisioning and no conversation writes for a
            // queued task; the prompt is retained until dequeue.
            let record = new_task_record(
                task_id,
                params.parent_session_id,
                params.agent_id,
                params.title,
                params.prompt,
                model,
                thinking_level,
                TaskStatus::Queued,
            );
            self.store
                .insert_task(&record)
                .map_err(OrchestratorError::store)?;
            self.events.emit(&record.id, Some(record.clone()));
            info!(task_id = %record.id, "task queued (parallelism cap reached)");
            return Ok(CreateOutcome::Queued(record));
        }

        let fork = self
            .collab
            .provisioner
            .fork(&params.parent_session_id, &env_name)
            .await
            .map_err(OrchestratorError::provisioning_failed)?;

        let mut record = new_task_record(
            task_id,
            params.parent_session_id,
            params.agent_id,
            params.title,
            params.prompt.clone(),
            model.clone(),
            thinking_level.clone(),
            TaskStatus::Running,
        );
        record.session_path = Some(fork.path.clone());
        record.trunk_branch = Some(fork.trunk_branch.clone());
        self.store
            .insert_task(&record)
            .map_err(OrchestratorError::store)?;
        self.events.emit(&record.id, Some(record.clone()));

        let options = SendOptions {
            model,
            thinking_level,
        };
        if let Err(err) = self
            .collab
            .streams
            .send_message(&record.id, &params.prompt, options)
            .await
        {
            // Roll back every partially-created piece of state.
            warn!(task_id = %record.id, "initial send failed, rolling back: {}", err);
            if let Err(e) = self.store.delete_task(&record.id) {
                warn!(task_id = %record.id, "rollback: record delete failed: {}", e);
            }
            self.events.emit(&record.id, None);
            if let Err(e) = self.collab.provisioner.delete(&fork.path, true).await {
                warn!(task_id = %record.id, "rollback: environment delete failed: {}", e);
            }
            if let Err(e) = self.store.delete_session_data(&record.id) {
                warn!(task_id = %record.id, "rollback: session data delete failed: {}", e);
            }
            return Err(OrchestratorError::send_failed(&record.id, err));
        }

        // Prompt is only retained while queued.
        let record = self
            .edit_and_notify(&record.id, |t| t.prompt = None)?
            .unwrap_or(record);
        info!(task_id = %record.id, agent = %record.agent_id, "task started");
        Ok(CreateOutcome::Started(record))
    }

    /// Start as many queued tasks as capacity allows, oldest first.
    /// Idempotent and re-entrant-safe: serialized by the admission mutex,
    /// with capacity re-read after every slow step.
    pub async fn maybe_start_queued_tasks(&self) -> TaskResult<usize> {
        let _admission = self.admission.lock().await;
        let mut started = 0usize;
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            let config = self.config.load_full();
            let index = self.index()?;
            if self.active_count(&index) >= config.max_parallel_agent_tasks {
                break;
            }

            let queued = self.store.queued_tasks().map_err(OrchestratorError::store)?;
            let Some(candidate) = queued.into_iter().find(|t| !attempted.contains(&t.id)) else {
                break;
            };
            attempted.insert(candidate.id.clone());

            match self.start_queued_task(candidate).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(err) => {
                    // Leave the task queued; the next trigger retries it.
                    warn!("failed to start queued task: {}", err);
                }
            }
        }

        Ok(started)
    }

    /// Attempt to start one queued candidate. Returns `Ok(true)` if it was
    /// promoted to running by this call.
    async fn start_queued_task(&self, task: TaskRecord) -> TaskResult<bool> {
        // Defend against races where the task began streaming before its
        // persisted status caught up: fix the status field, send nothing.
        if self.collab.streams.is_streaming(&task.id).await {
            debug!(task_id = %task.id, "queued task already streaming; fixing status");
            self.transition(&task.id, TaskStatus::Running).await?;
            self.edit_and_notify(&task.id, |t| t.prompt = None)?;
            return Ok(false);
        }

        // Provision (or re-provision) the environment if it is missing.
        let mut task = task;
        let env_ok = match &task.session_path {
            Some(path) => self.collab.provisioner.stat(path).await.unwrap_or(false),
            None => false,
        };
        if !env_ok {
            let env_name = generate_session_name();
            let fork = self
                .collab
                .provisioner
                .fork(&task.parent_session_id, &env_name)
                .await
                .map_err(OrchestratorError::provisioning_failed)?;
            match self.edit_and_notify(&task.id, |t| {
                t.session_path = Some(fork.path.clone());
                t.trunk_branch = Some(fork.trunk_branch.clone());
            })? {
                Some(updated) => task = updated,
                None => return Ok(false), // deleted while we were provisioning
            }
        }

        // Capacity and status may both have changed across the awaits above.
        let config = self.config.load_full();
        let index = self.index()?;
        if self.active_count(&index) >= config.max_parallel_agent_tasks {
            return Ok(false);
        }
        let Some(current) = self.get_task(&task.id)? else {
            return Ok(false);
        };
        if current.status != TaskStatus::Queued {
            return Ok(false);
        }

        let prompt = current
            .prompt
            .clone()
            .unwrap_or_else(|| RESUME_PROMPT.to_string());
        let options = SendOptions {
            model: current.model.clone(),
            thinking_level: current.thinking_level.clone(),
        };
        self.collab
            .streams
            .send_message(&current.id, &prompt, options)
            .await
            .map_err(|e| OrchestratorError::send_failed(&current.id, e))?;

        self.transition(&current.id, TaskStatus::Running).await?;
        self.edit_and_notify(&current.id, |t| t.prompt = None)?;
        info!(task_id = %current.id, "queued task started");
        Ok(true)
    }
}
