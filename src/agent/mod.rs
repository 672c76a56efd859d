//! Agent collaborators: configuration resolution and the long-running agent call.
//!
//! The engine treats both as opaque:
//! - `profile` — `AgentResolver` turns an agent reference into model, permission
//!   mode, tools and defaults
//! - `runner` — `AgentRunner` starts one agent conversation and yields a stream
//!   of typed events; dropping the stream cancels the call
//! - `cli` — `CliAgentRunner`, a runner backed by an agent CLI speaking JSON lines

pub mod cli;
pub mod profile;
pub mod runner;

pub use cli::CliAgentRunner;
pub use profile::{AgentProfile, AgentResolver, DirectoryAgentResolver, PermissionMode, StaticAgentResolver};
pub use runner::{AgentEvent, AgentEventStream, AgentResult, AgentRunParams, AgentRunner};
