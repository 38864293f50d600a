//! Agent Invoker (C4): spawns the configured coding-agent CLI preset,
//! streams/parses its output, enforces a timeout, and propagates exit
//! codes (§4.4).

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncReadExt as _;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Grace period between sending the terminate signal and force-killing
/// an agent process that has not exited on its own (§4.4(e)).
const GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent binary '{0}' not found")]
    AgentUnavailable(String),
    #[error("timed out after {0} seconds")]
    Timeout(u64),
    #[error("agent exited with code {0}: {1}")]
    ExitCode(i32, String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// One supported external coding-agent CLI (§4.4 `AgentPreset`).
#[derive(Debug, Clone)]
pub struct AgentPreset {
    pub name: String,
    pub command: String,
    pub subcommand: Option<String>,
    pub prompt_flag: Option<String>,
    pub autonomous_flag: Option<String>,
    pub autonomous_env: Vec<(String, String)>,
    pub stream_json: bool,
}

impl AgentPreset {
    pub fn claude() -> Self {
        Self {
            name: "claude".to_string(),
            command: "claude".to_string(),
            subcommand: None,
            prompt_flag: Some("-p".to_string()),
            autonomous_flag: Some("--dangerously-skip-permissions".to_string()),
            autonomous_env: Vec::new(),
            stream_json: false,
        }
    }

    pub fn opencode() -> Self {
        Self {
            name: "opencode".to_string(),
            command: "opencode".to_string(),
            subcommand: Some("run".to_string()),
            prompt_flag: None,
            autonomous_flag: Some("--yolo".to_string()),
            autonomous_env: Vec::new(),
            stream_json: false,
        }
    }

    pub fn gemini() -> Self {
        Self {
            name: "gemini".to_string(),
            command: "gemini".to_string(),
            subcommand: None,
            prompt_flag: Some("-p".to_string()),
            autonomous_flag: Some("--yolo".to_string()),
            autonomous_env: Vec::new(),
            stream_json: false,
        }
    }

    pub fn custom(
        name: impl Into<String>,
        command: impl Into<String>,
        prompt_flag: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            subcommand: None,
            prompt_flag,
            autonomous_flag: None,
            autonomous_env: Vec::new(),
            stream_json: false,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "claude" => Some(Self::claude()),
            "opencode" => Some(Self::opencode()),
            "gemini" => Some(Self::gemini()),
            _ => None,
        }
    }

    /// Build argv (minus the binary itself) per §4.4: `[subcommand?,
    /// autonomous-flag?, prompt-flag?, prompt]`.
    fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(sub) = &self.subcommand {
            args.push(sub.clone());
        }
        if let Some(flag) = &self.autonomous_flag {
            args.push(flag.clone());
        }
        if let Some(flag) = &self.prompt_flag {
            args.push(flag.clone());
        }
        args.push(prompt.to_string());
        args
    }
}

/// One parsed line of stream-json output, post system-reminder filter.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Value,
}

fn is_system_reminder(msg: &StreamMessage) -> bool {
    msg.rest
        .get("content")
        .and_then(|v| v.as_str())
        .is_some_and(|s| s.contains("system-reminder"))
}

#[derive(Debug, Clone, Default)]
pub struct InvocationResult {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub messages: Vec<StreamMessage>,
}

/// Spawn `preset` with `prompt`, wait up to `timeout_duration`, and
/// return the captured output. The prompt is always a single argv
/// element; it is never passed through a shell.
pub async fn invoke(
    preset: &AgentPreset,
    prompt: &str,
    working_dir: &Path,
    timeout_duration: Duration,
    extra_env: &[(String, String)],
) -> Result<InvocationResult> {
    let start = std::time::Instant::now();

    let mut cmd = Command::new(&preset.command);
    for arg in preset.build_args(prompt) {
        cmd.arg(arg);
    }
    cmd.current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in preset.autonomous_env.iter().chain(extra_env.iter()) {
        cmd.env(k, v);
    }

    debug!(agent = %preset.name, working_dir = %working_dir.display(), "spawning agent process");

    let mut child: Child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AgentError::AgentUnavailable(preset.command.clone())
        } else {
            AgentError::Io(e)
        }
    })?;

    let mut stdout_pipe = child.stdout.take().expect("stdout was piped at spawn");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped at spawn");
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    let drain = async {
        tokio::join!(
            stdout_pipe.read_to_end(&mut stdout_buf),
            stderr_pipe.read_to_end(&mut stderr_buf),
        )
    };

    let status = match timeout(timeout_duration, async { tokio::join!(child.wait(), drain) }).await {
        Ok((status, _)) => status?,
        Err(_) => {
            warn!(agent = %preset.name, timeout_sec = timeout_duration.as_secs(), "agent invocation timed out, sending terminate signal");
            if let Some(pid) = child.id() {
                // SAFETY: `pid` is this child's own process id, obtained
                // from `Child::id()` while the child has not yet been reaped.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            match timeout(GRACE_PERIOD, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(agent = %preset.name, "agent did not exit after terminate signal, killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
            return Err(AgentError::Timeout(timeout_duration.as_secs()));
        }
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    let stdout = String::from_utf8_lossy(&stdout_buf).to_string();
    let stderr = String::from_utf8_lossy(&stderr_buf).to_string();
    let exit_code = status.code().unwrap_or(-1);

    let messages = if preset.stream_json {
        parse_stream_json(&stdout)
    } else {
        Vec::new()
    };

    info!(
        agent = %preset.name,
        exit_code = exit_code,
        duration_ms = duration_ms,
        "agent invocation complete"
    );

    if exit_code != 0 {
        let tail = tail_lines(&stderr, 40);
        return Err(AgentError::ExitCode(exit_code, tail));
    }

    Ok(InvocationResult {
        exit_code,
        duration_ms,
        stdout,
        stderr,
        messages,
    })
}

/// Parse line-delimited JSON stdout, dropping lines that aren't valid
/// JSON objects and filtering out "system-reminder" content (§4.4).
fn parse_stream_json(stdout: &str) -> Vec<StreamMessage> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<StreamMessage>(line.trim()).ok())
        .filter(|msg| !is_system_reminder(msg))
        .collect()
}

fn tail_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Write the rendered prompt to a log file for postmortem inspection,
/// mirroring the teacher's `prompt.txt` artifact convention.
pub fn write_prompt_log(run_dir: &Path, prompt: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(run_dir)?;
    let path = run_dir.join("prompt.txt");
    let mut file = std::fs::File::create(&path)?;
    file.write_all(prompt.as_bytes())?;
    Ok(path)
}

/// Write the iteration output log and its 200-line tail, mirroring the
/// teacher's `iter-XX.log` / `iter-XX.tail.txt` artifacts.
pub fn write_iteration_logs(run_dir: &Path, attempt: u32, output: &str) -> std::io::Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(run_dir)?;
    let log_path = run_dir.join(format!("iter-{attempt:02}.log"));
    let tail_path = run_dir.join(format!("iter-{attempt:02}.tail.txt"));
    std::fs::write(&log_path, output)?;
    std::fs::write(&tail_path, tail_lines(output, 200))?;
    Ok((log_path, tail_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_preset_builds_expected_argv() {
        let preset = AgentPreset::claude();
        let args = preset.build_args("do the thing");
        assert_eq!(
            args,
            vec!["--dangerously-skip-permissions", "-p", "do the thing"]
        );
    }

    #[test]
    fn opencode_preset_includes_subcommand() {
        let preset = AgentPreset::opencode();
        let args = preset.build_args("hi");
        assert_eq!(args[0], "run");
    }

    #[test]
    fn by_name_resolves_known_presets() {
        assert!(AgentPreset::by_name("claude").is_some());
        assert!(AgentPreset::by_name("unknown-agent").is_none());
    }

    #[test]
    fn system_reminder_messages_are_filtered() {
        let stdout = r#"{"type":"assistant","content":"hello"}
{"type":"system","content":"<system-reminder>ignore me</system-reminder>"}"#;
        let messages = parse_stream_json(stdout);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, "assistant");
    }

    #[tokio::test]
    async fn invoking_missing_binary_reports_unavailable() {
        let preset = AgentPreset::custom("missing", "definitely-not-a-real-binary-xyz", None);
        let result = invoke(
            &preset,
            "prompt",
            Path::new("."),
            Duration::from_secs(5),
            &[],
        )
        .await;
        assert!(matches!(result, Err(AgentError::AgentUnavailable(_))));
    }
}
