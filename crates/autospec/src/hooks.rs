//! Hook Runner (C10): executes user-configured hook commands around
//! stage and lifecycle boundaries (§4.10).

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::time::Duration;

use autospec_core::config::{HookConfig, HookMode};
use autospec_core::context::Context;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook '{0}' failed: {1}")]
    Failed(String, String),
    #[error("hook '{0}' timed out after {1}s")]
    TimedOut(String, u64),
    #[error("hook '{0}' has a circular dependency in depends_on")]
    Cycle(String),
    #[error("io error running hook '{0}': {1}")]
    Io(String, std::io::Error),
}

/// Outcome of running a single hook.
#[derive(Debug, Clone)]
pub struct HookResult {
    pub name: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Context describing the command/stage that triggered an event, passed
/// to every hook command as `AUTOSPEC_*` environment variables (§4.10,
/// §6 "Environment variables").
#[derive(Debug, Clone)]
pub struct HookEventContext {
    pub command: String,
    pub stage: Option<String>,
    pub spec: std::path::PathBuf,
    pub success: bool,
    pub duration: Duration,
    pub exit_code: i32,
}

/// Topologically order `names` by their `depends_on` edges within
/// `hooks`. Sibling hooks with no relation keep their original
/// relative order (stable sort via insertion as they become ready).
fn order_by_dependencies<'a>(
    names: &[&'a str],
    hooks: &HashMap<String, HookConfig>,
) -> Result<Vec<&'a str>, HookError> {
    let mut ordered = Vec::with_capacity(names.len());
    let mut done: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&str> = names.to_vec();

    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|name| {
            let ready = hooks
                .get(*name)
                .map(|h| h.depends_on.iter().all(|d| done.contains(d.as_str())))
                .unwrap_or(true);
            if ready {
                ordered.push(*name);
                done.insert(name);
            }
            !ready
        });
        if remaining.len() == before {
            return Err(HookError::Cycle(remaining[0].to_string()));
        }
    }
    Ok(ordered)
}

/// Run a single hook command with `AUTOSPEC_*` environment variables
/// describing the current context, honoring its configured timeout.
async fn run_one(
    name: &str,
    hook: &HookConfig,
    ctx: &Context,
    event: &HookEventContext,
    default_timeout: Duration,
) -> Result<HookResult, HookError> {
    let timeout_dur = hook
        .timeout_sec
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&hook.command)
        .current_dir(&ctx.repo_root)
        .env("AUTOSPEC_COMMAND", &event.command)
        .env("AUTOSPEC_STAGE", event.stage.as_deref().unwrap_or(""))
        .env("AUTOSPEC_SPEC", event.spec.display().to_string())
        .env("AUTOSPEC_SUCCESS", if event.success { "true" } else { "false" })
        .env("AUTOSPEC_DURATION", event.duration.as_secs().to_string())
        .env("AUTOSPEC_EXIT_CODE", event.exit_code.to_string())
        .env("AUTOSPEC_FEATURE_ID", &ctx.feature_id)
        .env("AUTOSPEC_REPO_ROOT", ctx.repo_root.display().to_string())
        .env("AUTOSPEC_FEATURE_DIR", ctx.feature_dir.display().to_string())
        .env("AUTOSPEC_VERSION", &ctx.autospec_version)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|e| HookError::Io(name.to_string(), e))?;
    let wait = child.wait_with_output();
    let output = match timeout(timeout_dur, wait).await {
        Ok(result) => result.map_err(|e| HookError::Io(name.to_string(), e))?,
        Err(_) => return Err(HookError::TimedOut(name.to_string(), timeout_dur.as_secs())),
    };

    Ok(HookResult {
        name: name.to_string(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Evaluate a hook's `when` shell condition (§4.10 `{..., when?, ...}`):
/// the hook only runs if this exits zero. A condition that cannot even
/// be spawned is treated as not holding.
async fn when_condition_holds(when: &str, ctx: &Context) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(when)
        .current_dir(&ctx.repo_root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Whether a configured hook key (e.g. `stage.complete`,
/// `stage.complete[implement]`) matches the event `event_key` fired for
/// the (optional) `qualifier` (e.g. a stage name). A bare key matches
/// the event regardless of qualifier; a bracketed key only matches
/// when the qualifier is identical (§4.10 `event-key` examples).
fn key_matches(key: &str, event_key: &str, qualifier: Option<&str>) -> bool {
    let Some(base) = key.strip_prefix(event_key) else { return false };
    match base.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        Some(bracketed) => Some(bracketed) == qualifier,
        None => base.is_empty(),
    }
}

/// Run every hook bound to `event_key` (optionally qualified, e.g. a
/// stage name for `stage.complete[implement]`) in dependency order,
/// honoring each hook's execution mode (§4.10):
/// - `gate`: synchronous, a non-zero exit aborts the command.
/// - `checkpoint`: synchronous, a non-zero exit warns and continues.
/// - `best-effort`: synchronous, failures are logged at debug level.
/// - `fire-and-forget`: spawned and not awaited at all.
pub async fn run_event_hooks(
    event_key: &str,
    qualifier: Option<&str>,
    hooks: &HashMap<String, HookConfig>,
    ctx: &Context,
    event: &HookEventContext,
    default_timeout: Duration,
) -> Result<Vec<HookResult>, HookError> {
    let matching: Vec<&str> = hooks
        .keys()
        .filter(|k| key_matches(k, event_key, qualifier))
        .map(|k| k.as_str())
        .collect();
    if matching.is_empty() {
        return Ok(Vec::new());
    }
    let ordered = order_by_dependencies(&matching, hooks)?;

    let mut results = Vec::new();
    for name in ordered {
        let hook = &hooks[name];
        if hook.only_on_success && !event.success {
            continue;
        }
        if let Some(when) = &hook.when {
            if !when_condition_holds(when, ctx).await {
                continue;
            }
        }
        match hook.mode {
            HookMode::FireAndForget => {
                let command = hook.command.clone();
                let repo_root = ctx.repo_root.clone();
                tokio::spawn(async move {
                    let _ = Command::new("sh")
                        .arg("-c")
                        .arg(&command)
                        .current_dir(&repo_root)
                        .stdin(Stdio::null())
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .spawn();
                });
                continue;
            }
            HookMode::Gate => {
                let result = run_one(name, hook, ctx, event, default_timeout).await?;
                if result.exit_code != Some(0) {
                    return Err(HookError::Failed(name.to_string(), result.stderr));
                }
                results.push(result);
            }
            HookMode::Checkpoint => {
                let result = run_one(name, hook, ctx, event, default_timeout).await?;
                if result.exit_code != Some(0) {
                    warn!(hook = name, "checkpoint hook failed, continuing");
                }
                results.push(result);
            }
            HookMode::BestEffort => {
                match run_one(name, hook, ctx, event, default_timeout).await {
                    Ok(result) => {
                        if result.exit_code != Some(0) {
                            tracing::debug!(hook = name, "best-effort hook failed");
                        }
                        results.push(result);
                    }
                    Err(e) => {
                        error!(hook = name, error = %e, "best-effort hook could not be run");
                    }
                }
            }
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(command: &str, mode: HookMode, depends_on: &[&str]) -> HookConfig {
        HookConfig {
            command: command.to_string(),
            mode,
            when: None,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            timeout_sec: None,
            only_on_success: false,
        }
    }

    #[test]
    fn order_respects_depends_on() {
        let mut hooks = HashMap::new();
        hooks.insert("b".to_string(), hook("echo b", HookMode::BestEffort, &["a"]));
        hooks.insert("a".to_string(), hook("echo a", HookMode::BestEffort, &[]));
        let ordered = order_by_dependencies(&["b", "a"], &hooks).unwrap();
        assert_eq!(ordered, vec!["a", "b"]);
    }

    #[test]
    fn cyclic_depends_on_is_rejected() {
        let mut hooks = HashMap::new();
        hooks.insert("a".to_string(), hook("echo a", HookMode::BestEffort, &["b"]));
        hooks.insert("b".to_string(), hook("echo b", HookMode::BestEffort, &["a"]));
        let result = order_by_dependencies(&["a", "b"], &hooks);
        assert!(matches!(result, Err(HookError::Cycle(_))));
    }

    #[test]
    fn bare_key_matches_any_qualifier() {
        assert!(key_matches("command.complete", "command.complete", None));
        assert!(key_matches("stage.complete", "stage.complete", Some("implement")));
    }

    #[test]
    fn bracketed_key_matches_only_its_qualifier() {
        assert!(key_matches("stage.complete[implement]", "stage.complete", Some("implement")));
        assert!(!key_matches("stage.complete[implement]", "stage.complete", Some("plan")));
        assert!(!key_matches("stage.complete[implement]", "stage.complete", None));
    }
}
