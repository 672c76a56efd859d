//! The long-running agent operation, as seen by a task worker.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::agent::profile::PermissionMode;
use crate::error::AgentError;

/// Parameters for one agent conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRunParams {
    pub prompt: String,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub working_dir: PathBuf,
    pub system_prompt: Option<String>,
    /// Advisory memory ceiling for the agent process.
    pub max_memory_mb: Option<u64>,
}

/// Final metadata reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentResult {
    pub session_id: Option<String>,
    pub result: Option<String>,
    pub is_error: bool,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<u64>,
    pub total_cost_usd: Option<Decimal>,
}

/// One incremental event from a running agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The agent opened (or resumed) a session.
    SessionStarted { session_id: String },
    /// A chunk of assistant text.
    Text { text: String },
    /// The agent invoked a tool.
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    /// Terminal event carrying cost and turn metadata.
    Result(AgentResult),
}

/// Event stream of a running agent. Dropping it cancels the agent.
pub type AgentEventStream = BoxStream<'static, Result<AgentEvent, AgentError>>;

/// Starts agent conversations.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, params: AgentRunParams) -> Result<AgentEventStream, AgentError>;
}
