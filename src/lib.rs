//! Task Orchestration Engine
//!
//! Lets a running agent session delegate bounded units of work to sub-agent
//! sessions, tracks their lifecycle, enforces concurrency and nesting limits,
//! and returns each task's report to its delegating parent. The durable state
//! machine survives process restarts and partial failures.

pub mod admission;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod interfaces;
pub mod logging;
pub mod orchestrator;
pub mod recovery;
pub mod report;
pub mod store;
pub mod transitions;
pub mod types;

pub use admission::CreateTaskParams;
pub use config::{AgentDefinition, AgentsConfig, OrchestratorConfig};
pub use error::{ErrorCode, OrchestratorError, TaskResult};
pub use events::TaskEvent;
pub use orchestrator::{Collaborators, Orchestrator};
pub use types::{CreateOutcome, TaskRecord, TaskReport, TaskStatus};
