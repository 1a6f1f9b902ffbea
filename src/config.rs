//! Engine configuration and the agent registry.
//!
//! Plain serde types with per-field defaults, loadable from YAML. The
//! orchestrator holds the config behind an `ArcSwap` so a host can swap in a
//! rebuilt config at runtime without restarting.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum tasks in `running`/`awaiting_report` at once, excluding tasks
    /// blocked in a foreground wait.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_agent_tasks: usize,

    /// Maximum nesting depth for delegated tasks. A root session is depth 0.
    #[serde(default = "default_max_depth")]
    pub max_task_nesting_depth: usize,

    /// Default foreground-wait timeout in milliseconds (default: 10 minutes).
    /// The clock starts only once the awaited task is running, not while it
    /// sits in the queue.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Consecutive auto-resumes of one parent before the guard gives up and
    /// surfaces a stuck state.
    #[serde(default = "default_auto_resume_ceiling")]
    pub auto_resume_ceiling: i32,

    /// Capacity of the in-memory completed-report cache.
    #[serde(default = "default_report_cache_capacity")]
    pub report_cache_capacity: usize,

    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_agent_tasks: default_max_parallel(),
            max_task_nesting_depth: default_max_depth(),
            wait_timeout_ms: default_wait_timeout_ms(),
            auto_resume_ceiling: default_auto_resume_ceiling(),
            report_cache_capacity: default_report_cache_capacity(),
            agents: AgentsConfig::default(),
        }
    }
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_depth() -> usize {
    3
}

fn default_wait_timeout_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_auto_resume_ceiling() -> i32 {
    3
}

fn default_report_cache_capacity() -> usize {
    128
}

/// Registry of agents that may be delegated to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub definitions: HashMap<String, AgentDefinition>,
}

impl AgentsConfig {
    pub fn get(&self, agent_id: &str) -> Option<&AgentDefinition> {
        self.definitions.get(agent_id)
    }
}

/// Definition of a delegatable agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Disabled agents are rejected at admission.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Plan-mode agents may signal completion via the plan-proposal tool
    /// instead of the report tool.
    #[serde(default)]
    pub plan_mode: bool,

    /// Default model when the create call does not supply one.
    #[serde(default)]
    pub model: Option<String>,

    /// Default thinking level when the create call does not supply one.
    #[serde(default)]
    pub thinking_level: Option<String>,
}

impl Default for AgentDefinition {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            plan_mode: false,
            model: None,
            thinking_level: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

impl OrchestratorConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }
}

/// Default config file location: `<config dir>/task-orchestrator/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("task-orchestrator").join("config.yaml"))
}

/// Generate a session name for a newly provisioned environment: two petname
/// words plus a short unique suffix.
pub fn generate_session_name() -> String {
    let base = petname::petname(2, "-").unwrap_or_else(|| "task".to_string());
    let suffix = uuid::Uuid::now_v7().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}

/// Validate a generated session name: lowercase alphanumerics and dashes,
/// non-empty, at most 64 characters, no leading/trailing dash.
pub fn validate_session_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    if name.starts_with('-') || name.ends_with('-') {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
