//! Core types for the task orchestration engine.

use serde::{Deserialize, Serialize};

/// Upper bound on any walk of the parent/child relationship. Exceeding it is
/// treated as a detected cycle (data-integrity failure), never an infinite
/// loop.
pub const MAX_TRAVERSAL_HOPS: usize = 32;

/// Lifecycle status of a delegated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    AwaitingReport,
    Reported,
    Interrupted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingReport => "awaiting_report",
            TaskStatus::Reported => "reported",
            TaskStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "awaiting_report" => Some(TaskStatus::AwaitingReport),
            "reported" => Some(TaskStatus::Reported),
            "interrupted" => Some(TaskStatus::Interrupted),
            _ => None,
        }
    }

    /// Active tasks count against the parallelism cap (unless their session
    /// is blocked in a foreground wait).
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::AwaitingReport)
    }
}

/// A delegated unit of work, persisted durably.
///
/// The task id doubles as the sub-agent session id; `parent_session_id`
/// points either at another task or at a registered root session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub parent_session_id: String,
    pub agent_id: String,
    pub title: String,
    /// Retained only while queued; cleared once dequeued and sent.
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub status: TaskStatus,
    /// Provisioned environment path, owned by the external provisioner.
    pub session_path: Option<String>,
    pub trunk_branch: Option<String>,
    pub base_commit_sha: Option<String>,
    /// Consecutive stream endings without a completion signal. One reminder
    /// is issued at 1; the second ending synthesizes a fallback report.
    pub reminder_count: i32,
    /// Derived-artifact generation requested but not yet finished.
    pub artifact_pending: bool,
    pub created_at: i64,
    pub reported_at: Option<i64>,
}

/// A task's completion report, as persisted under each ancestor session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub report: String,
    pub title: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    /// Ancestor session ids valid at delivery time, nearest first. Lets
    /// descendant-scope queries outlive the task record itself.
    pub ancestor_ids: Vec<String>,
    pub created_at: i64,
}

impl TaskReport {
    /// Whether this report was delivered within the given ancestor's scope.
    pub fn in_scope_of(&self, ancestor_session_id: &str) -> bool {
        self.ancestor_ids.iter().any(|a| a == ancestor_session_id)
    }
}

/// Outcome of an admission decision.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// Environment provisioned and prompt sent; the task is running.
    Started(TaskRecord),
    /// Parallelism cap reached; the task is persisted as queued.
    Queued(TaskRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &TaskRecord {
        match self {
            CreateOutcome::Started(t) | CreateOutcome::Queued(t) => t,
        }
    }
}

/// Per-session auto-resume bookkeeping.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionFlags {
    pub auto_resume_count: i32,
    /// Set by a user hard-interrupt; suppresses all auto-resume until a
    /// genuine user message resets it.
    pub hard_interrupted: bool,
}
