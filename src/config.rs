//! Configuration types.
//!
//! Every struct has a `Default` and a `from_env()` that overlays environment
//! variables on top of it. Unset variables keep the default; set but
//! unparseable ones are a `ConfigError`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Largest delay a single-shot timer is allowed to sleep before re-evaluating
/// (2^31 - 1 milliseconds, about 24.8 days).
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

/// Number of execution records kept per schedule.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{}': {}", raw.trim(), e),
                })
        }
        _ => Ok(None),
    }
}

/// Like `env_parse`, for counts that must be at least one.
fn env_positive(key: &str) -> Result<Option<usize>, ConfigError> {
    match env_parse::<usize>(key)? {
        Some(0) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        }),
        other => Ok(other),
    }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Ceiling on simultaneous task workers.
    pub max_concurrent: usize,
    /// Timeout used when a task omits its own.
    pub default_timeout: Duration,
    /// Advisory memory ceiling forwarded to the agent runner.
    pub max_memory_mb: u64,
    /// How long a terminated worker gets before it is aborted.
    pub termination_grace: Duration,
    /// Capacity of the live log broadcast channel.
    pub log_buffer: usize,
    /// Finished task statuses retained for `get_task_status`.
    pub max_finished_statuses: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            default_timeout: Duration::from_secs(30 * 60),
            max_memory_mb: 512,
            termination_grace: Duration::from_secs(5),
            log_buffer: 256,
            max_finished_statuses: 1000,
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_concurrent: env_positive("SCHEDULER_MAX_CONCURRENT")?
                .unwrap_or(defaults.max_concurrent),
            default_timeout: env_parse::<u64>("SCHEDULER_DEFAULT_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_timeout),
            max_memory_mb: env_parse("SCHEDULER_MAX_MEMORY_MB")?
                .unwrap_or(defaults.max_memory_mb),
            termination_grace: env_parse::<u64>("SCHEDULER_TERMINATION_GRACE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.termination_grace),
            ..defaults
        })
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Soft ceiling on concurrently running scheduled tasks. Firings above it
    /// are skipped rather than queued.
    pub max_concurrent: usize,
    /// Longest single sleep before a trigger re-evaluates its fire time.
    pub max_timer_delay: Duration,
    /// Execution records kept per schedule.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: ExecutorConfig::default().max_concurrent,
            max_timer_delay: MAX_TIMER_DELAY,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl SchedulerConfig {
    /// Build from env; the soft ceiling follows the executor unless overridden.
    pub fn from_env(executor: &ExecutorConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            max_concurrent: env_positive("SCHEDULER_SOFT_MAX_CONCURRENT")?
                .unwrap_or(executor.max_concurrent),
            ..Self::default()
        })
    }
}

/// Where schedules, execution history and agent profiles live on disk.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("SCHEDULER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::default().data_dir),
        }
    }

    pub fn schedules_path(&self) -> PathBuf {
        self.data_dir.join("schedules.json")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.data_dir.join("history")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.data_dir.join("agents")
    }
}

/// Settings for the CLI-backed agent runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Agent CLI program.
    pub program: String,
    /// Extra arguments appended to every invocation.
    pub extra_args: Vec<String>,
    /// API key passed to the child process, if set.
    pub api_key: Option<SecretString>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            extra_args: Vec::new(),
            api_key: None,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        Self {
            program: std::env::var("AGENT_CLI").unwrap_or_else(|_| Self::default().program),
            extra_args: std::env::var("AGENT_CLI_ARGS")
                .unwrap_or_default()
                .split_whitespace()
                .map(String::from)
                .collect(),
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
        }
    }
}

/// Everything the binary needs.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub runner: RunnerConfig,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let executor = ExecutorConfig::from_env()?;
        let scheduler = SchedulerConfig::from_env(&executor)?;
        Ok(Self {
            executor,
            scheduler,
            store: StoreConfig::from_env(),
            runner: RunnerConfig::from_env(),
            log_dir: std::env::var("SCHEDULER_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}
