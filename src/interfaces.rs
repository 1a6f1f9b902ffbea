//! Collaborator interfaces.
//!
//! The engine consumes the execution environment, conversation history, and
//! model stream layer through these narrow traits; it never reaches around
//! them. Hosts implement the traits against their real infrastructure.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tool name a sub-agent calls to report its result.
pub const REPORT_TOOL: &str = "report_result";
/// Tool name a plan-mode sub-agent may call instead of the report tool.
pub const PLAN_TOOL: &str = "propose_plan";

/// Result of forking an execution environment for a new session.
#[derive(Debug, Clone)]
pub struct ForkResult {
    pub path: String,
    pub runtime_config: serde_json::Value,
    pub trunk_branch: String,
}

/// Creates and destroys the underlying execution environment for a task
/// (worktree/container provisioning).
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    /// Fork the source session's environment under a new name.
    async fn fork(&self, source_session_id: &str, new_name: &str) -> Result<ForkResult>;

    /// Delete a provisioned environment.
    async fn delete(&self, path: &str, force: bool) -> Result<()>;

    /// Whether the environment at `path` still exists.
    async fn stat(&self, path: &str) -> Result<bool>;
}

/// A message appended to a session's conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub text: String,
    /// Synthetic/system-attributed messages are excluded from the session's
    /// literal transcript semantics.
    pub synthetic: bool,
}

impl ConversationMessage {
    pub fn synthetic(text: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            text: text.into(),
            synthetic: true,
        }
    }
}

/// A delegation tool call left pending when the parent's stream was
/// interrupted before the result arrived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub call_id: String,
    pub task_id: String,
    /// Set when the call is finalized in place with the task's report.
    pub resolved_result: Option<String>,
}

/// A session's in-flight partial turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialTurn {
    pub pending_task_call: Option<PendingToolCall>,
}

/// Conversation/history storage. The engine never rewrites already-committed
/// turns; it only appends or finalizes an in-flight partial.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_message(&self, session_id: &str, message: ConversationMessage) -> Result<()>;

    async fn read_last_messages(&self, session_id: &str, n: usize)
    -> Result<Vec<ConversationMessage>>;

    async fn read_partial_turn(&self, session_id: &str) -> Result<Option<PartialTurn>>;

    async fn write_partial_turn(&self, session_id: &str, turn: PartialTurn) -> Result<()>;
}

/// Options for sending a prompt into a session.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub model: Option<String>,
    pub thinking_level: Option<String>,
}

/// Model/stream layer: prompt delivery and stream control. Stream-ended
/// events are pushed into the engine by the host calling
/// [`crate::Orchestrator::handle_stream_ended`].
#[async_trait]
pub trait StreamLayer: Send + Sync {
    async fn send_message(&self, session_id: &str, prompt: &str, options: SendOptions)
    -> Result<()>;

    async fn is_streaming(&self, session_id: &str) -> bool;

    async fn stop_stream(&self, session_id: &str) -> Result<()>;
}

/// Generates derived artifacts (e.g. a git patch) for a reported task.
/// Lineage-reduction cleanup waits for generation to finish.
#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    async fn generate(&self, task_id: &str) -> Result<()>;
}

/// One tool-call part observed in an ended stream.
#[derive(Debug, Clone)]
pub struct ToolCallPart {
    pub name: String,
    pub input: serde_json::Value,
    pub succeeded: bool,
}

/// Payload of a stream-ended event: the turn's tool-call parts plus the last
/// textual output (used to synthesize a fallback report).
#[derive(Debug, Clone, Default)]
pub struct StreamEnded {
    pub tool_calls: Vec<ToolCallPart>,
    pub last_text: Option<String>,
}

impl StreamEnded {
    pub fn with_tool_call(mut self, name: &str, input: serde_json::Value, succeeded: bool) -> Self {
        self.tool_calls.push(ToolCallPart {
            name: name.to_string(),
            input,
            succeeded,
        });
        self
    }
}
