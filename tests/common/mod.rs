//! Shared test harness: an engine wired to in-memory mocks.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use task_orchestrator::interfaces::{
    ArtifactGenerator, ConversationMessage, EnvironmentProvisioner, ForkResult, HistoryStore,
    PartialTurn, SendOptions, StreamLayer,
};
use task_orchestrator::store::Store;
use task_orchestrator::{
    AgentDefinition, AgentsConfig, Collaborators, Orchestrator, OrchestratorConfig,
};

pub const ROOT: &str = "root";

#[derive(Default)]
pub struct MockProvisioner {
    pub fail_fork: AtomicBool,
    pub fail_delete: AtomicBool,
    /// (source_session_id, new_name) per fork call.
    pub forks: StdMutex<Vec<(String, String)>>,
    /// Deleted environment paths, in deletion order.
    pub deleted: StdMutex<Vec<String>>,
    /// Paths `stat` reports as existing.
    pub existing: StdMutex<HashSet<String>>,
}

#[async_trait]
impl EnvironmentProvisioner for MockProvisioner {
    async fn fork(&self, source_session_id: &str, new_name: &str) -> anyhow::Result<ForkResult> {
        if self.fail_fork.load(Ordering::SeqCst) {
            anyhow::bail!("fork refused");
        }
        let path = format!("/envs/{}", new_name);
        self.forks
            .lock()
            .unwrap()
            .push((source_session_id.to_string(), new_name.to_string()));
        self.existing.lock().unwrap().insert(path.clone());
        Ok(ForkResult {
            path,
            runtime_config: serde_json::json!({}),
            trunk_branch: "main".to_string(),
        })
    }

    async fn delete(&self, path: &str, _force: bool) -> anyhow::Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            anyhow::bail!("delete refused");
        }
        self.existing.lock().unwrap().remove(path);
        self.deleted.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn stat(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.existing.lock().unwrap().contains(path))
    }
}

#[derive(Default)]
pub struct MockHistory {
    pub messages: StdMutex<HashMap<String, Vec<ConversationMessage>>>,
    pub partials: StdMutex<HashMap<String, PartialTurn>>,
}

impl MockHistory {
    pub fn messages_for(&self, session_id: &str) -> Vec<ConversationMessage> {
        self.messages
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for MockHistory {
    async fn append_message(
        &self,
        session_id: &str,
        message: ConversationMessage,
    ) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn read_last_messages(
        &self,
        session_id: &str,
        n: usize,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        let messages = self.messages_for(session_id);
        let start = messages.len().saturating_sub(n);
        Ok(messages[start..].to_vec())
    }

    async fn read_partial_turn(&self, session_id: &str) -> anyhow::Result<Option<PartialTurn>> {
        Ok(self.partials.lock().unwrap().get(session_id).cloned())
    }

    async fn write_partial_turn(&self, session_id: &str, turn: PartialTurn) -> anyhow::Result<()> {
        self.partials
            .lock()
            .unwrap()
            .insert(session_id.to_string(), turn);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockStreams {
    pub fail_send: AtomicBool,
    /// (session_id, prompt) per send, in order.
    pub sent: StdMutex<Vec<(String, String)>>,
    pub streaming: StdMutex<HashSet<String>>,
    pub stopped: StdMutex<Vec<String>>,
}

impl MockStreams {
    pub fn sent_to(&self, session_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == session_id)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn set_streaming(&self, session_id: &str, streaming: bool) {
        let mut set = self.streaming.lock().unwrap();
        if streaming {
            set.insert(session_id.to_string());
        } else {
            set.remove(session_id);
        }
    }
}

#[async_trait]
impl StreamLayer for MockStreams {
    async fn send_message(
        &self,
        session_id: &str,
        prompt: &str,
        _options: SendOptions,
    ) -> anyhow::Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            anyhow::bail!("stream layer unavailable");
        }
        self.sent
            .lock()
            .unwrap()
            .push((session_id.to_string(), prompt.to_string()));
        Ok(())
    }

    async fn is_streaming(&self, session_id: &str) -> bool {
        self.streaming.lock().unwrap().contains(session_id)
    }

    async fn stop_stream(&self, session_id: &str) -> anyhow::Result<()> {
        self.set_streaming(session_id, false);
        self.stopped.lock().unwrap().push(session_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockArtifacts {
    pub fail: AtomicBool,
    pub generated: AtomicUsize,
}

#[async_trait]
impl ArtifactGenerator for MockArtifacts {
    async fn generate(&self, _task_id: &str) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("artifact generation unavailable");
        }
        self.generated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub orch: Arc<Orchestrator>,
    pub provisioner: Arc<MockProvisioner>,
    pub history: Arc<MockHistory>,
    pub streams: Arc<MockStreams>,
    pub artifacts: Arc<MockArtifacts>,
}

/// Agent registry used by every test: a plain worker and a plan-mode agent,
/// plus one permanently disabled entry.
pub fn test_agents() -> AgentsConfig {
    let mut definitions = HashMap::new();
    definitions.insert("worker".to_string(), AgentDefinition::default());
    definitions.insert(
        "planner".to_string(),
        AgentDefinition {
            plan_mode: true,
            ..AgentDefinition::default()
        },
    );
    definitions.insert(
        "retired".to_string(),
        AgentDefinition {
            enabled: false,
            ..AgentDefinition::default()
        },
    );
    AgentsConfig { definitions }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        agents: test_agents(),
        ..OrchestratorConfig::default()
    }
}

pub fn setup() -> Harness {
    setup_with(test_config())
}

pub fn setup_with(config: OrchestratorConfig) -> Harness {
    task_orchestrator::logging::init();
    let store = Store::open_in_memory().expect("in-memory store");
    let provisioner = Arc::new(MockProvisioner::default());
    let history = Arc::new(MockHistory::default());
    let streams = Arc::new(MockStreams::default());
    let artifacts = Arc::new(MockArtifacts::default());
    let collab = Collaborators {
        provisioner: provisioner.clone(),
        history: history.clone(),
        streams: streams.clone(),
        artifacts: artifacts.clone(),
    };
    let orch = Orchestrator::new(store, config, collab);
    orch.register_root_session(ROOT).unwrap();
    Harness {
        orch,
        provisioner,
        history,
        streams,
        artifacts,
    }
}

pub fn create_params(parent: &str, agent: &str) -> task_orchestrator::CreateTaskParams {
    task_orchestrator::CreateTaskParams {
        parent_session_id: parent.to_string(),
        agent_id: agent.to_string(),
        prompt: "do the thing".to_string(),
        title: "the thing".to_string(),
        model: None,
        thinking_level: None,
    }
}

/// A stream-ended payload carrying a successful report-tool call.
pub fn report_ending(text: &str) -> task_orchestrator::interfaces::StreamEnded {
    task_orchestrator::interfaces::StreamEnded::default().with_tool_call(
        task_orchestrator::interfaces::REPORT_TOOL,
        serde_json::json!({ "report": text }),
        true,
    )
}
