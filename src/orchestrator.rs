//! The orchestration engine handle and its query surface.
//!
//! Operation implementations are spread across the sibling modules the way
//! the store spreads its impl blocks: admission in `admission.rs`, the
//! completion protocol in `report.rs`, termination/cleanup in `cleanup.rs`,
//! and startup recovery plus the auto-resume guard in `recovery.rs`.

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, TaskResult};
use crate::events::{EventBus, TaskEvent};
use crate::index::TaskIndex;
use crate::interfaces::{ArtifactGenerator, EnvironmentProvisioner, HistoryStore, StreamLayer};
use crate::store::Store;
use crate::types::{TaskRecord, TaskReport, TaskStatus};
use arc_swap::ArcSwap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, broadcast, oneshot};

/// External collaborators the engine consumes through narrow interfaces.
#[derive(Clone)]
pub struct Collaborators {
    pub provisioner: Arc<dyn EnvironmentProvisioner>,
    pub history: Arc<dyn HistoryStore>,
    pub streams: Arc<dyn StreamLayer>,
    pub artifacts: Arc<dyn ArtifactGenerator>,
}

/// One registered foreground wait.
pub(crate) struct Waiter {
    pub id: u64,
    pub resolve: oneshot::Sender<TaskResult<TaskReport>>,
}

/// Bounded FIFO cache of recently delivered reports, keyed by task id.
/// Answers "is task X a descendant of ancestor Y" even after the task record
/// has been deleted; the durable artifacts remain the source of truth.
pub(crate) struct ReportCache {
    map: HashMap<String, TaskReport>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ReportCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, report: TaskReport) {
        let task_id = report.task_id.clone();
        if self.map.insert(task_id.clone(), report).is_none() {
            self.order.push_back(task_id);
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskReport> {
        self.map.get(task_id)
    }
}

/// Task orchestration engine.
///
/// Single-process authority over delegated-task lifecycle: admission,
/// status transitions, report delivery, termination, and recovery.
pub struct Orchestrator {
    pub(crate) store: Store,
    pub(crate) config: ArcSwap<OrchestratorConfig>,
    pub(crate) collab: Collaborators,
    pub(crate) events: EventBus,

    /// Serializes `create_task` and `maybe_start_queued_tasks` so admission
    /// decisions are never made against a stale concurrently-changing count.
    pub(crate) admission: Mutex<()>,

    /// Per-originating-session locks serializing stream-end handling.
    session_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,

    /// Foreground waiters per task id.
    pub(crate) waiters: StdMutex<HashMap<String, Vec<Waiter>>>,
    waiter_seq: AtomicU64,

    /// Start waiters per queued task id, resolved on `queued -> running` so
    /// a foreground wait's timeout clock starts only once the task runs.
    pub(crate) start_waiters: StdMutex<HashMap<String, Vec<oneshot::Sender<()>>>>,

    /// Refcounted set of sessions currently blocked in a foreground wait.
    /// These are excluded from the active count so that a task awaiting its
    /// own nested child under a saturated cap cannot deadlock the pool.
    blocked: StdMutex<HashMap<String, usize>>,

    pub(crate) report_cache: StdMutex<ReportCache>,
}

impl Orchestrator {
    pub fn new(store: Store, config: OrchestratorConfig, collab: Collaborators) -> Arc<Self> {
        let cache_capacity = config.report_cache_capacity;
        Arc::new(Self {
            store,
            config: ArcSwap::from_pointee(config),
            collab,
            events: EventBus::default(),
            admission: Mutex::new(()),
            session_locks: StdMutex::new(HashMap::new()),
            waiters: StdMutex::new(HashMap::new()),
            waiter_seq: AtomicU64::new(0),
            start_waiters: StdMutex::new(HashMap::new()),
            blocked: StdMutex::new(HashMap::new()),
            report_cache: StdMutex::new(ReportCache::new(cache_capacity)),
        })
    }

    /// Swap in a new configuration at runtime.
    pub fn update_config(&self, config: OrchestratorConfig) {
        self.config.store(Arc::new(config));
    }

    /// Subscribe to task metadata-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Register a root (non-task) session as a valid delegation parent.
    pub fn register_root_session(&self, session_id: &str) -> TaskResult<()> {
        self.store
            .register_session(session_id)
            .map_err(OrchestratorError::store)
    }

    /// Build a fresh index from the durable records. Always recomputed;
    /// callers must not hold one across a suspension point.
    pub(crate) fn index(&self) -> TaskResult<TaskIndex> {
        let tasks = self.store.all_tasks().map_err(OrchestratorError::store)?;
        Ok(TaskIndex::build(tasks))
    }

    /// Durable read-modify-write plus observer notification. Returns `None`
    /// when the record is already gone (delete race, treated as success).
    pub(crate) fn edit_and_notify<F>(&self, task_id: &str, f: F) -> TaskResult<Option<TaskRecord>>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let updated = self
            .store
            .edit_task(task_id, f)
            .map_err(OrchestratorError::store)?;
        if let Some(task) = &updated {
            self.events.emit(task_id, Some(task.clone()));
        }
        Ok(updated)
    }

    pub(crate) fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().unwrap();
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    // ---- blocked set ------------------------------------------------------

    pub(crate) fn block_session(&self, session_id: &str) {
        let mut blocked = self.blocked.lock().unwrap();
        *blocked.entry(session_id.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn unblock_session(&self, session_id: &str) {
        let mut blocked = self.blocked.lock().unwrap();
        if let Some(count) = blocked.get_mut(session_id) {
            *count -= 1;
            if *count == 0 {
                blocked.remove(session_id);
            }
        }
    }

    pub(crate) fn is_blocked(&self, session_id: &str) -> bool {
        self.blocked.lock().unwrap().contains_key(session_id)
    }

    // ---- waiter tables ----------------------------------------------------

    pub(crate) fn register_waiter(
        &self,
        task_id: &str,
    ) -> (u64, oneshot::Receiver<TaskResult<TaskReport>>) {
        let id = self.waiter_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push(Waiter { id, resolve: tx });
        (id, rx)
    }

    /// Drop one waiter without resolving it (timeout or cancellation path).
    pub(crate) fn remove_waiter(&self, task_id: &str, waiter_id: u64) {
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(list) = waiters.get_mut(task_id) {
            list.retain(|w| w.id != waiter_id);
            if list.is_empty() {
                waiters.remove(task_id);
            }
        }
    }

    pub(crate) fn resolve_waiters(&self, task_id: &str, report: &TaskReport) {
        let taken = self.waiters.lock().unwrap().remove(task_id);
        if let Some(list) = taken {
            for waiter in list {
                let _ = waiter.resolve.send(Ok(report.clone()));
            }
        }
    }

    pub(crate) fn reject_waiters(&self, task_id: &str, err: OrchestratorError) {
        let taken = self.waiters.lock().unwrap().remove(task_id);
        if let Some(list) = taken {
            for waiter in list {
                let _ = waiter.resolve.send(Err(err.clone()));
            }
        }
    }

    pub(crate) fn register_start_waiter(&self, task_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.start_waiters
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub(crate) fn resolve_start_waiters(&self, task_id: &str) {
        let taken = self.start_waiters.lock().unwrap().remove(task_id);
        if let Some(list) = taken {
            for tx in list {
                let _ = tx.send(());
            }
        }
    }

    // ---- query surface ----------------------------------------------------

    /// Current status of a task, if its record still exists.
    pub fn task_status(&self, task_id: &str) -> TaskResult<Option<TaskStatus>> {
        Ok(self
            .store
            .get_task(task_id)
            .map_err(OrchestratorError::store)?
            .map(|t| t.status))
    }

    /// Full record of a task, if it still exists.
    pub fn get_task(&self, task_id: &str) -> TaskResult<Option<TaskRecord>> {
        self.store.get_task(task_id).map_err(OrchestratorError::store)
    }

    /// All descendant tasks of a session, breadth-first.
    pub fn list_descendant_tasks(&self, session_id: &str) -> TaskResult<Vec<TaskRecord>> {
        let index = self.index()?;
        Ok(index
            .descendants(session_id)
            .iter()
            .filter_map(|id| index.get(id).cloned())
            .collect())
    }

    /// Whether `task_id` is a descendant of `ancestor_id`. Checks the live
    /// tree first, then the report cache, then the durable artifacts, so the
    /// answer survives the task record's deletion.
    pub fn is_descendant_task(&self, ancestor_id: &str, task_id: &str) -> TaskResult<bool> {
        if self.index()?.is_descendant(ancestor_id, task_id) {
            return Ok(true);
        }
        if let Some(report) = self.report_cache.lock().unwrap().get(task_id) {
            return Ok(report.in_scope_of(ancestor_id));
        }
        let artifact = self
            .store
            .get_report_for_ancestor(ancestor_id, task_id)
            .map_err(OrchestratorError::store)?;
        Ok(artifact.is_some())
    }

    /// Reports delivered within a session's descendant scope, oldest first.
    pub fn reports_for_session(&self, session_id: &str) -> TaskResult<Vec<TaskReport>> {
        self.store
            .reports_for_ancestor(session_id)
            .map_err(OrchestratorError::store)
    }

    /// Manual resume of a preserved (interrupted) task.
    pub async fn mark_interrupted_task_running(&self, task_id: &str) -> TaskResult<TaskRecord> {
        let task = self
            .get_task(task_id)?
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
        if task.status != TaskStatus::Interrupted {
            return Err(OrchestratorError::invalid_transition(
                task_id,
                task.status.as_str(),
                TaskStatus::Running.as_str(),
            ));
        }
        self.transition(task_id, TaskStatus::Running).await
    }

    /// Put a task back to `interrupted` after a manual resume attempt failed
    /// downstream, so the preserved record reflects reality.
    pub async fn restore_interrupted_task_after_resume_failure(
        &self,
        task_id: &str,
    ) -> TaskResult<TaskRecord> {
        let task = self
            .get_task(task_id)?
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
        if task.status != TaskStatus::Running {
            return Err(OrchestratorError::invalid_transition(
                task_id,
                task.status.as_str(),
                TaskStatus::Interrupted.as_str(),
            ));
        }
        self.transition(task_id, TaskStatus::Interrupted).await
    }

    /// Suppress auto-resume for a session after a user hard-interrupt that
    /// did not cascade. Cleared only by [`Orchestrator::reset_auto_resume_count`].
    pub fn mark_parent_session_hard_interrupted(&self, session_id: &str) -> TaskResult<()> {
        self.store
            .set_hard_interrupted(session_id, true)
            .map_err(OrchestratorError::store)
    }

    /// Reset the auto-resume counter and clear hard-interrupt suppression.
    /// Call this only for a genuine user-originated message, never for a
    /// synthetic one.
    pub fn reset_auto_resume_count(&self, session_id: &str) -> TaskResult<()> {
        self.store
            .reset_session_flags(session_id)
            .map_err(OrchestratorError::store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(task_id: &str) -> TaskReport {
        TaskReport {
            task_id: task_id.into(),
            report: "r".into(),
            title: None,
            model: None,
            thinking_level: None,
            ancestor_ids: vec!["root".into()],
            created_at: 0,
        }
    }

    #[test]
    fn report_cache_evicts_oldest() {
        let mut cache = ReportCache::new(2);
        cache.insert(report("a"));
        cache.insert(report("b"));
        cache.insert(report("c"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn report_cache_reinsert_does_not_duplicate() {
        let mut cache = ReportCache::new(2);
        cache.insert(report("a"));
        cache.insert(report("a"));
        cache.insert(report("b"));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_some());
    }
}
