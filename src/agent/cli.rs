//! Agent runner backed by an agent CLI.
//!
//! Spawns `<program> -p <prompt> --output-format stream-json ...` in the task's
//! working directory and maps each stdout JSON line to an `AgentEvent`. The
//! child is killed when the event stream is dropped.

use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio_stream::wrappers::LinesStream;

use crate::agent::profile::PermissionMode;
use crate::agent::runner::{AgentEvent, AgentEventStream, AgentResult, AgentRunParams, AgentRunner};
use crate::config::RunnerConfig;
use crate::error::AgentError;

/// Runs agents through a CLI that emits newline-delimited JSON events.
pub struct CliAgentRunner {
    config: RunnerConfig,
}

impl CliAgentRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Argument list for one invocation.
    pub fn build_args(&self, params: &AgentRunParams) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            params.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(ref model) = params.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if params.permission_mode != PermissionMode::Default {
            args.push("--permission-mode".to_string());
            args.push(params.permission_mode.to_string());
        }
        if let Some(max_turns) = params.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if !params.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(params.allowed_tools.join(","));
        }
        if let Some(ref prompt) = params.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    async fn run(&self, params: AgentRunParams) -> Result<AgentEventStream, AgentError> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.build_args(&params))
            .current_dir(&params.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref key) = self.config.api_key {
            cmd.env("ANTHROPIC_API_KEY", key.expose_secret());
        }

        tracing::debug!(
            program = %self.config.program,
            cwd = %params.working_dir.display(),
            max_memory_mb = ?params.max_memory_mb,
            "Spawning agent process"
        );

        let mut child = cmd.spawn().map_err(|e| AgentError::SpawnFailed {
            program: self.config.program.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| AgentError::SpawnFailed {
            program: self.config.program.clone(),
            reason: "stdout was not captured".to_string(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "agent_stderr", "{}", line);
                }
            });
        }

        let state = CliStream {
            lines: LinesStream::new(BufReader::new(stdout).lines()),
            child,
            pending: VecDeque::new(),
            done: false,
        };

        Ok(futures::stream::unfold(state, next_event).boxed())
    }
}

struct CliStream {
    lines: LinesStream<BufReader<ChildStdout>>,
    child: Child,
    pending: VecDeque<AgentEvent>,
    done: bool,
}

async fn next_event(
    mut st: CliStream,
) -> Option<(Result<AgentEvent, AgentError>, CliStream)> {
    loop {
        if let Some(event) = st.pending.pop_front() {
            return Some((Ok(event), st));
        }
        if st.done {
            return None;
        }

        match st.lines.next().await {
            Some(Ok(line)) => match parse_stream_line(&line) {
                Ok(events) => st.pending.extend(events),
                Err(e) => tracing::debug!(error = %e, "Skipping unparseable agent output line"),
            },
            Some(Err(e)) => {
                st.done = true;
                return Some((Err(e.into()), st));
            }
            None => {
                st.done = true;
                return match st.child.wait().await {
                    Ok(status) if status.success() => None,
                    Ok(status) => Some((
                        Err(AgentError::Reported(format!("agent process exited with {status}"))),
                        st,
                    )),
                    Err(e) => Some((Err(e.into()), st)),
                };
            }
        }
    }
}

/// Map one stream-json line to zero or more events.
pub fn parse_stream_line(line: &str) -> Result<Vec<AgentEvent>, AgentError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(line)?;

    let events = match value.get("type").and_then(Value::as_str) {
        Some("system") => value
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|_| value.get("subtype").and_then(Value::as_str) == Some("init"))
            .map(|id| {
                vec![AgentEvent::SessionStarted {
                    session_id: id.to_string(),
                }]
            })
            .unwrap_or_default(),
        Some("assistant") => value
            .pointer("/message/content")
            .and_then(Value::as_array)
            .map(|blocks| blocks.iter().filter_map(content_block_event).collect())
            .unwrap_or_default(),
        Some("result") => vec![AgentEvent::Result(AgentResult {
            session_id: value
                .get("session_id")
                .and_then(Value::as_str)
                .map(String::from),
            result: value.get("result").and_then(Value::as_str).map(String::from),
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            num_turns: value
                .get("num_turns")
                .and_then(Value::as_u64)
                .map(|n| n as u32),
            duration_ms: value.get("duration_ms").and_then(Value::as_u64),
            total_cost_usd: value
                .get("total_cost_usd")
                .and_then(Value::as_f64)
                .and_then(Decimal::from_f64),
        })],
        _ => Vec::new(),
    };

    Ok(events)
}

fn content_block_event(block: &Value) -> Option<AgentEvent> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => block.get("text").and_then(Value::as_str).map(|t| AgentEvent::Text {
            text: t.to_string(),
        }),
        "tool_use" => Some(AgentEvent::ToolUse {
            name: block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rust_decimal_macros::dec;

    use super::*;

    fn params() -> AgentRunParams {
        AgentRunParams {
            prompt: "check the build".to_string(),
            model: Some("sonnet".to_string()),
            permission_mode: PermissionMode::AcceptEdits,
            allowed_tools: vec!["Read".to_string(), "Bash".to_string()],
            max_turns: Some(5),
            working_dir: PathBuf::from("/tmp"),
            system_prompt: None,
            max_memory_mb: Some(512),
        }
    }

    #[test]
    fn builds_cli_arguments() {
        let runner = CliAgentRunner::new(RunnerConfig::default());
        let args = runner.build_args(&params());
        assert_eq!(&args[..2], &["-p".to_string(), "check the build".to_string()]);
        let joined = args.join(" ");
        assert!(joined.contains("--output-format stream-json"));
        assert!(joined.contains("--model sonnet"));
        assert!(joined.contains("--permission-mode acceptEdits"));
        assert!(joined.contains("--max-turns 5"));
        assert!(joined.contains("--allowedTools Read,Bash"));
    }

    #[test]
    fn default_permission_mode_is_omitted() {
        let runner = CliAgentRunner::new(RunnerConfig::default());
        let mut p = params();
        p.permission_mode = PermissionMode::Default;
        assert!(!runner.build_args(&p).contains(&"--permission-mode".to_string()));
    }

    #[test]
    fn parses_init_line() {
        let events =
            parse_stream_line(r#"{"type":"system","subtype":"init","session_id":"abc"}"#).unwrap();
        assert_eq!(
            events,
            vec![AgentEvent::SessionStarted {
                session_id: "abc".into()
            }]
        );
    }

    #[test]
    fn parses_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Looking"},
            {"type":"tool_use","name":"Read","input":{"path":"a.rs"}}
        ]}}"#
            .replace('\n', "");
        let events = parse_stream_line(&line).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], AgentEvent::Text { text } if text == "Looking"));
        assert!(matches!(&events[1], AgentEvent::ToolUse { name, .. } if name == "Read"));
    }

    #[test]
    fn parses_result_line() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","session_id":"abc","num_turns":3,"duration_ms":1200,"total_cost_usd":0.25}"#;
        let events = parse_stream_line(line).unwrap();
        match &events[0] {
            AgentEvent::Result(r) => {
                assert_eq!(r.result.as_deref(), Some("done"));
                assert_eq!(r.num_turns, Some(3));
                assert_eq!(r.total_cost_usd, Some(dec!(0.25)));
                assert!(!r.is_error);
            }
            other => panic!("Expected result event, got {other:?}"),
        }
    }

    #[test]
    fn ignores_unknown_and_blank_lines() {
        assert!(parse_stream_line("").unwrap().is_empty());
        assert!(parse_stream_line(r#"{"type":"user"}"#).unwrap().is_empty());
        assert!(parse_stream_line("not json").is_err());
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let runner = CliAgentRunner::new(RunnerConfig {
            program: "definitely-not-an-agent-cli".to_string(),
            ..Default::default()
        });
        let err = runner.run(params()).await.err().unwrap();
        assert!(matches!(err, AgentError::SpawnFailed { .. }));
    }
}
