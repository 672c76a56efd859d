//! Agent profiles and their resolution.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::AgentError;

/// Names that are safe to use as a single path component.
pub(crate) static SAFE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap());

/// How much the agent may do without asking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    /// Flag value understood by the agent CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved configuration for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProfile {
    pub name: String,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    pub default_timeout_ms: Option<u64>,
    pub default_max_turns: Option<u32>,
    pub system_prompt: Option<String>,
}

impl AgentProfile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Resolves an agent reference into its profile.
#[async_trait]
pub trait AgentResolver: Send + Sync {
    async fn resolve(&self, agent: &str) -> Result<AgentProfile, AgentError>;
}

/// Reads `<dir>/<agent>.json`, falling back to a default profile when the file
/// does not exist.
pub struct DirectoryAgentResolver {
    dir: PathBuf,
    fallback: AgentProfile,
}

impl DirectoryAgentResolver {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            fallback: AgentProfile::default(),
        }
    }

    /// Profile used for agents without a file.
    pub fn with_fallback(mut self, fallback: AgentProfile) -> Self {
        self.fallback = fallback;
        self
    }
}

#[async_trait]
impl AgentResolver for DirectoryAgentResolver {
    async fn resolve(&self, agent: &str) -> Result<AgentProfile, AgentError> {
        if !SAFE_NAME.is_match(agent) {
            return Err(AgentError::InvalidProfile {
                name: agent.to_string(),
                reason: "agent names may only contain letters, digits, '.', '_' and '-'"
                    .to_string(),
            });
        }

        let path = self.dir.join(format!("{agent}.json"));
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(agent = %agent, "No agent profile on disk, using fallback");
                let mut profile = self.fallback.clone();
                profile.name = agent.to_string();
                return Ok(profile);
            }
            Err(e) => return Err(e.into()),
        };

        let mut profile: AgentProfile =
            serde_json::from_str(&raw).map_err(|e| AgentError::InvalidProfile {
                name: agent.to_string(),
                reason: e.to_string(),
            })?;
        if profile.name.is_empty() {
            profile.name = agent.to_string();
        }
        Ok(profile)
    }
}

/// In-memory profiles, optionally with a catch-all default.
#[derive(Default)]
pub struct StaticAgentResolver {
    profiles: HashMap<String, AgentProfile>,
    default: Option<AgentProfile>,
}

impl StaticAgentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, profile: AgentProfile) -> Self {
        self.profiles.insert(profile.name.clone(), profile);
        self
    }

    pub fn with_default(mut self, profile: AgentProfile) -> Self {
        self.default = Some(profile);
        self
    }
}

#[async_trait]
impl AgentResolver for StaticAgentResolver {
    async fn resolve(&self, agent: &str) -> Result<AgentProfile, AgentError> {
        if let Some(profile) = self.profiles.get(agent) {
            return Ok(profile.clone());
        }
        match &self.default {
            Some(default) => Ok(AgentProfile {
                name: agent.to_string(),
                ..default.clone()
            }),
            None => Err(AgentError::NotFound {
                name: agent.to_string(),
            }),
        }
    }
}
