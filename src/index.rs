//! Derived task index.
//!
//! A read-only view (`by_id`, `children_by_parent`, `parent_by_id`) rebuilt
//! from the durable task records on every query. Never persisted or cached:
//! after any suspension point callers must fetch a fresh index rather than
//! reusing a stale one.
//!
//! Parent pointers are a DAG by construction (depth-checked at creation), but
//! every traversal is still bounded and cycle-checked; exceeding the bound is
//! a detected-cycle integrity failure, never an infinite loop.

use crate::error::{OrchestratorError, TaskResult};
use crate::types::{MAX_TRAVERSAL_HOPS, TaskRecord};
use std::collections::{HashMap, HashSet, VecDeque};

pub struct TaskIndex {
    by_id: HashMap<String, TaskRecord>,
    children_by_parent: HashMap<String, Vec<String>>,
    parent_by_id: HashMap<String, String>,
}

impl TaskIndex {
    /// Build the index from a snapshot of all task records.
    pub fn build(tasks: Vec<TaskRecord>) -> Self {
        let mut by_id = HashMap::new();
        let mut children_by_parent: HashMap<String, Vec<String>> = HashMap::new();
        let mut parent_by_id = HashMap::new();

        for task in tasks {
            children_by_parent
                .entry(task.parent_session_id.clone())
                .or_default()
                .push(task.id.clone());
            parent_by_id.insert(task.id.clone(), task.parent_session_id.clone());
            by_id.insert(task.id.clone(), task);
        }

        Self {
            by_id,
            children_by_parent,
            parent_by_id,
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskRecord> {
        self.by_id.get(task_id)
    }

    /// Every task record in the snapshot, in no particular order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.by_id.values()
    }

    /// Direct children of a session (task or root), in insertion order.
    pub fn children(&self, session_id: &str) -> &[String] {
        self.children_by_parent
            .get(session_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Nesting depth of a session. A root session (no task record) is depth
    /// 0; each task is one deeper than its parent.
    pub fn depth(&self, session_id: &str) -> TaskResult<usize> {
        let mut depth = 0;
        let mut current = session_id;
        let mut visited: HashSet<&str> = HashSet::new();

        while self.by_id.contains_key(current) {
            if !visited.insert(current) {
                return Err(OrchestratorError::integrity(format!(
                    "Cycle detected in parent chain at {}",
                    current
                )));
            }
            if depth >= MAX_TRAVERSAL_HOPS {
                return Err(OrchestratorError::integrity(format!(
                    "Parent chain of {} exceeds {} hops",
                    session_id, MAX_TRAVERSAL_HOPS
                )));
            }
            depth += 1;
            current = &self.parent_by_id[current];
        }

        Ok(depth)
    }

    /// Full ancestor chain of a task, nearest first, ending with the root
    /// session id.
    pub fn ancestors(&self, task_id: &str) -> TaskResult<Vec<String>> {
        let mut chain = Vec::new();
        let mut current = task_id;
        let mut visited: HashSet<&str> = HashSet::new();

        while let Some(parent) = self.parent_by_id.get(current) {
            if !visited.insert(current) || chain.len() >= MAX_TRAVERSAL_HOPS {
                return Err(OrchestratorError::integrity(format!(
                    "Ancestor chain of {} exceeds {} hops or cycles",
                    task_id, MAX_TRAVERSAL_HOPS
                )));
            }
            chain.push(parent.clone());
            current = parent;
        }

        Ok(chain)
    }

    /// All descendants of a session, breadth-first.
    pub fn descendants(&self, session_id: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(session_id.to_string());
        visited.insert(session_id.to_string());

        while let Some(current) = queue.pop_front() {
            for child in self.children(&current) {
                if visited.insert(child.clone()) {
                    result.push(child.clone());
                    queue.push_back(child.clone());
                }
            }
        }

        result
    }

    /// Whether the session has any descendant in an active status.
    pub fn has_active_descendants(&self, session_id: &str) -> bool {
        self.descendants(session_id)
            .iter()
            .any(|id| self.by_id.get(id).is_some_and(|t| t.status.is_active()))
    }

    /// Whether `task_id` is a (transitive) descendant of `ancestor_id`,
    /// according to this snapshot.
    pub fn is_descendant(&self, ancestor_id: &str, task_id: &str) -> bool {
        let mut current = task_id;
        let mut hops = 0;
        while let Some(parent) = self.parent_by_id.get(current) {
            if hops >= MAX_TRAVERSAL_HOPS {
                return false;
            }
            if parent == ancestor_id {
                return true;
            }
            current = parent;
            hops += 1;
        }
        false
    }

    /// The subtree rooted at a session, ordered leaf-first (deepest
    /// descendants before their ancestors). When `session_id` is itself a
    /// task, it appears last. Ensures no node is ever removed while its
    /// children still reference it as parent.
    pub fn subtree_leaf_first(&self, session_id: &str) -> Vec<String> {
        let mut with_depth: Vec<(String, usize)> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();

        if self.by_id.contains_key(session_id) {
            with_depth.push((session_id.to_string(), 0));
        }
        visited.insert(session_id.to_string());
        queue.push_back((session_id.to_string(), 0));

        while let Some((current, depth)) = queue.pop_front() {
            for child in self.children(&current) {
                if visited.insert(child.clone()) {
                    with_depth.push((child.clone(), depth + 1));
                    queue.push_back((child.clone(), depth + 1));
                }
            }
        }

        with_depth.sort_by(|a, b| b.1.cmp(&a.1));
        with_depth.into_iter().map(|(id, _)| id).collect()
    }
}
