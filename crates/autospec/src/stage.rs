//! Stage Executor (C6): runs a single pipeline stage end to end —
//! prerequisite check, template render, agent invocation, artifact
//! validation, and retry bookkeeping (§4.6).

use std::path::Path;
use std::time::{Duration, Instant};

use autospec_core::artifacts::{ArtifactError, TasksDocument, ValidationError};
use autospec_core::config::Configuration;
use autospec_core::context::{required_artifacts, Context};
use autospec_core::error::{AutospecError, Result};
use autospec_core::events::{Event, EventBus, EventType};
use autospec_core::retry::RetryStore;
use autospec_core::types::Stage;
use tracing::warn;

use crate::agent::{self, AgentError, AgentPreset};
use crate::hooks;
use crate::renderer;

/// Outcome of one stage invocation, including the render that produced
/// it and however many attempts it took.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: Stage,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Verify every artifact `stage` depends on already exists on disk
/// (§4.2 `GetRequiredArtifacts`, §4.6 step 1).
pub fn check_prerequisites(ctx: &Context, stage: Stage) -> Result<()> {
    for artifact in required_artifacts(stage) {
        let path = ctx.artifact_path(*artifact, &ctx.repo_root);
        if !path.exists() {
            return Err(AutospecError::PrerequisiteMissing(format!(
                "{} (expected at {})",
                artifact.file_name(),
                path.display()
            )));
        }
    }
    Ok(())
}

/// Validate a just-produced artifact file, if `stage` produces one
/// subject to C1 validation (only `tasks.yaml` carries structural
/// invariants beyond "is it present and parses").
fn validate_artifact(stage: Stage, path: &Path) -> Result<Vec<ValidationError>> {
    if !stage.produces_artifact() {
        return Ok(Vec::new());
    }
    if !path.exists() {
        return Err(AutospecError::ArtifactInvalid(format!(
            "expected {} to produce {}, but it does not exist",
            stage.as_str(),
            path.display()
        )));
    }
    if stage == Stage::Tasks {
        let doc = TasksDocument::load(path).map_err(|e| match e {
            ArtifactError::Read { path, source } => {
                AutospecError::ArtifactInvalid(format!("reading {}: {source}", path.display()))
            }
            ArtifactError::Parse { path, source } => {
                AutospecError::ArtifactInvalid(format!("parsing {}: {source}", path.display()))
            }
        })?;
        return Ok(doc.validate());
    }
    // Other stages still must parse as YAML with a `_meta` block, but
    // carry no further structural invariants in this spec.
    let content = std::fs::read_to_string(path)?;
    if serde_yaml::from_str::<serde_yaml::Value>(&content).is_err() {
        return Err(AutospecError::ArtifactInvalid(format!(
            "{} is not valid YAML",
            path.display()
        )));
    }
    Ok(Vec::new())
}

/// Render structured validation errors into feedback text to append to
/// the next retry's prompt (§4.6 step 5).
fn feedback_for(errors: &[ValidationError]) -> String {
    let mut out = String::from("\nThe previous attempt produced an invalid artifact:\n");
    for e in errors {
        out.push_str(&format!("- [{}] {}: {}\n", e.kind, e.path, e.message));
    }
    out.push_str("\nFix these issues and produce the artifact again.\n");
    out
}

/// Run `stage` to completion, retrying on agent failure or artifact
/// validation failure up to `config.max_retries` times, persisting
/// retry counters via `retry_store` so a resumed `autospec` process
/// picks up where a previous one left off.
pub async fn run_stage(
    stage: Stage,
    ctx: &Context,
    config: &Configuration,
    preset: &AgentPreset,
    retry_store: &RetryStore,
    events: &EventBus,
    run_dir: &Path,
    extra_instructions: Option<&str>,
) -> Result<StageOutcome> {
    check_prerequisites(ctx, stage)?;

    let started = Instant::now();
    events
        .publish(Event::new(EventType::StageStart, stage.as_str()))
        .await;

    let mut base_prompt = renderer::render(stage.as_str(), ctx)
        .map_err(|e| AutospecError::ArtifactInvalid(e.to_string()))?;
    if let Some(extra) = extra_instructions {
        base_prompt.push('\n');
        base_prompt.push_str(extra);
    }

    let artifact_path = artifact_path_for(stage, ctx);
    let feature = ctx.feature_id.clone();
    let mut prompt = base_prompt.clone();
    let mut last_err: Option<String> = None;
    let mut attempt: u32 = retry_store.load(&feature, stage.as_str())?.attempt_count;

    loop {
        attempt += 1;
        agent::write_prompt_log(run_dir, &prompt).ok();

        let invocation = agent::invoke(
            preset,
            &prompt,
            &ctx.repo_root,
            Duration::from_secs(config.agent_timeout_sec),
            &[],
        )
        .await;

        let outcome = match invocation {
            Ok(result) => {
                agent::write_iteration_logs(run_dir, attempt, &result.stdout).ok();
                match &artifact_path {
                    None => Ok(()),
                    Some(path) => match validate_artifact(stage, path) {
                        Ok(errors) if errors.is_empty() => Ok(()),
                        Ok(errors) => Err(AutospecError::ArtifactInvalid(feedback_for(&errors))),
                        Err(e) => Err(e),
                    },
                }
            }
            Err(AgentError::Timeout(secs)) => Err(AutospecError::AgentTimeout(secs)),
            Err(AgentError::AgentUnavailable(bin)) => Err(AutospecError::DependencyMissing(bin)),
            Err(e) => Err(AutospecError::AgentFailed(e.to_string())),
        };

        match outcome {
            Ok(()) => {
                retry_store.reset(&feature, stage.as_str())?;
                events
                    .publish(
                        Event::new(EventType::StageComplete, stage.as_str())
                            .with_success(true)
                            .with_duration(started.elapsed()),
                    )
                    .await;
                run_stage_complete_hooks(stage, ctx, config, true, started.elapsed(), 0).await?;
                return Ok(StageOutcome {
                    stage,
                    attempts: attempt,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(err) => {
                let kind = error_kind(&err);
                let record = retry_store.increment(&feature, stage.as_str(), kind, &err.to_string())?;
                last_err = Some(err.to_string());

                if record.attempt_count >= config.max_retries {
                    events
                        .publish(
                            Event::new(EventType::StageComplete, stage.as_str())
                                .with_success(false)
                                .with_error(err.to_string())
                                .with_duration(started.elapsed()),
                        )
                        .await;
                    return Err(AutospecError::RetryExhausted {
                        feature,
                        stage: stage.as_str().to_string(),
                        attempts: record.attempt_count,
                        last_error: last_err.unwrap_or_default(),
                    });
                }

                warn!(
                    feature = %feature,
                    stage = stage.as_str(),
                    attempt = record.attempt_count,
                    max = config.max_retries,
                    error = %err,
                    "stage attempt failed, retrying"
                );
                prompt = format!("{base_prompt}\n{}", feedback_for_error(&err));
            }
        }
    }
}

fn error_kind(err: &AutospecError) -> &'static str {
    match err {
        AutospecError::AgentFailed(_) => "AgentFailed",
        AutospecError::AgentTimeout(_) => "AgentTimeout",
        AutospecError::ArtifactInvalid(_) => "ArtifactInvalid",
        AutospecError::DependencyMissing(_) => "DependencyMissing",
        _ => "Unknown",
    }
}

fn feedback_for_error(err: &AutospecError) -> String {
    match err {
        AutospecError::ArtifactInvalid(msg) => msg.clone(),
        other => format!("\nThe previous attempt failed: {other}\n"),
    }
}

pub fn artifact_path_for(stage: Stage, ctx: &Context) -> Option<std::path::PathBuf> {
    use autospec_core::artifacts::ArtifactType;
    let kind = match stage {
        Stage::Constitution => ArtifactType::Constitution,
        Stage::Specify => ArtifactType::Spec,
        Stage::Clarify => ArtifactType::Clarification,
        Stage::Plan => ArtifactType::Plan,
        Stage::Tasks => ArtifactType::Tasks,
        Stage::Checklist => ArtifactType::Checklist,
        Stage::Analyze => ArtifactType::Analysis,
        Stage::Implement => return None,
    };
    Some(ctx.artifact_path(kind, &ctx.repo_root))
}

/// Run any `stage.complete`/`stage.complete[<stage>]` hooks (§4.10).
/// A failed `gate` hook surfaces as `ArtifactInvalid` so it aborts the
/// run the same way a validation failure would (exit code 1).
async fn run_stage_complete_hooks(
    stage: Stage,
    ctx: &Context,
    config: &Configuration,
    success: bool,
    duration: Duration,
    exit_code: i32,
) -> Result<()> {
    let event = hooks::HookEventContext {
        command: stage.as_str().to_string(),
        stage: Some(stage.as_str().to_string()),
        spec: ctx.feature_spec.clone(),
        success,
        duration,
        exit_code,
    };
    hooks::run_event_hooks(
        "stage.complete",
        Some(stage.as_str()),
        &config.hooks,
        ctx,
        &event,
        Duration::from_secs(config.hook_timeout_sec),
    )
    .await
    .map(|_| ())
    .map_err(|e| AutospecError::ArtifactInvalid(e.to_string()))
}

pub fn default_agent_preset(config: &Configuration) -> Result<AgentPreset> {
    AgentPreset::by_name(&config.agent)
        .ok_or_else(|| AutospecError::DependencyMissing(format!("unknown agent preset '{}'", config.agent)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use autospec_core::artifacts::ArtifactType;
    use tempfile::tempdir;

    fn ctx_in(repo_root: &Path) -> Context {
        Context::compute(
            Path::new("specs"),
            repo_root,
            true,
            Some("007-user-auth"),
            None,
            "0.2.0",
        )
        .unwrap()
    }

    #[test]
    fn check_prerequisites_fails_when_constitution_missing() {
        let dir = tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        let err = check_prerequisites(&ctx, Stage::Specify).unwrap_err();
        assert!(matches!(err, AutospecError::PrerequisiteMissing(_)));
    }

    #[test]
    fn check_prerequisites_passes_with_no_required_artifacts() {
        let dir = tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        assert!(check_prerequisites(&ctx, Stage::Constitution).is_ok());
    }

    #[test]
    fn validate_artifact_rejects_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");
        let err = validate_artifact(Stage::Tasks, &path).unwrap_err();
        assert!(matches!(err, AutospecError::ArtifactInvalid(_)));
    }

    #[test]
    fn artifact_path_for_implement_is_none() {
        let dir = tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        assert!(artifact_path_for(Stage::Implement, &ctx).is_none());
        assert!(artifact_path_for(Stage::Plan, &ctx)
            .unwrap()
            .ends_with(ArtifactType::Plan.file_name()));
    }
}
