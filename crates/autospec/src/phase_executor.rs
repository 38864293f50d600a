//! Phase/Task Sub-Executor (C7): drives `implement` through a tasks
//! document one actionable task (or whole phase) at a time, resuming
//! from wherever a prior run left off (§4.7).

use std::path::Path;

use autospec_core::artifacts::TasksDocument;
use autospec_core::config::Configuration;
use autospec_core::context::Context;
use autospec_core::error::{AutospecError, Result};
use autospec_core::events::{Event, EventBus, EventType};
use autospec_core::retry::RetryStore;
use autospec_core::types::{PhaseInfo, Stage, TaskStatus};
use tracing::info;

use crate::agent::AgentPreset;
use crate::renderer;
use crate::stage;

/// Granularity at which `implement` drives the agent (§4.7 "execution
/// modes"). `PerTask` is the default; `SingleSession` hands the whole
/// tasks document to one agent invocation; `PerPhase` batches a phase
/// at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    SingleSession,
    PerPhase,
    PerTask,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::PerTask
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub phase: u32,
    pub attempts: u32,
}

/// Render a prompt asking the agent to complete exactly one task,
/// including its id/title and the ids of any dependencies so the agent
/// has enough context without re-reading the whole document.
fn task_prompt(base: &str, phase: u32, task_id: &str, title: &str, deps: &[String]) -> String {
    let mut out = format!("{base}\n\nWork on task {task_id} (phase {phase}): {title}\n");
    if !deps.is_empty() {
        out.push_str(&format!("Dependencies already completed: {}\n", deps.join(", ")));
    }
    out.push_str("Mark the task complete in tasks.yaml once finished.\n");
    out
}

fn phase_prompt(base: &str, phase: u32, task_ids: &[String]) -> String {
    format!(
        "{base}\n\nComplete every task in phase {phase}: {}.\nMark each complete in tasks.yaml as you go.\n",
        task_ids.join(", ")
    )
}

/// Drive `implement` to completion for `ctx.feature_id`, re-reading
/// `tasks.yaml` after every agent invocation so externally-applied
/// edits (e.g. a human marking a task done) are respected on resume.
pub async fn run_implement(
    mode: ExecutionMode,
    ctx: &Context,
    config: &Configuration,
    preset: &AgentPreset,
    retry_store: &RetryStore,
    events: &EventBus,
    run_dir: &Path,
) -> Result<Vec<TaskOutcome>> {
    stage::check_prerequisites(ctx, Stage::Implement)?;

    let base_prompt = renderer::render(Stage::Implement.as_str(), ctx)
        .map_err(|e| AutospecError::ArtifactInvalid(e.to_string()))?;

    let mut outcomes = Vec::new();

    match mode {
        ExecutionMode::SingleSession => {
            let outcome = stage::run_stage(
                Stage::Implement,
                ctx,
                config,
                preset,
                retry_store,
                events,
                run_dir,
                None,
            )
            .await?;
            outcomes.push(TaskOutcome {
                task_id: "*".to_string(),
                phase: 0,
                attempts: outcome.attempts,
            });
        }
        ExecutionMode::PerPhase => loop {
            let doc = TasksDocument::load(&ctx.tasks_file)?;
            let Some(phase_number) = doc.first_incomplete_phase() else {
                break;
            };
            let task_ids: Vec<String> = doc.tasks_of_phase(phase_number).iter().map(|t| t.id.clone()).collect();
            let instructions = phase_prompt(&base_prompt, phase_number, &task_ids);

            events
                .publish(Event::new(EventType::StageStart, &format!("implement:phase-{phase_number}")))
                .await;
            let outcome = stage::run_stage(
                Stage::Implement,
                ctx,
                config,
                preset,
                retry_store,
                events,
                run_dir,
                Some(&instructions),
            )
            .await?;
            outcomes.push(TaskOutcome {
                task_id: format!("phase-{phase_number}"),
                phase: phase_number,
                attempts: outcome.attempts,
            });

            let refreshed = TasksDocument::load(&ctx.tasks_file)?;
            if refreshed.is_phase_complete(phase_number) {
                let info = refreshed.phase_info(phase_number).unwrap_or(PhaseInfo {
                    total: task_ids.len(),
                    completed: task_ids.len(),
                    blocked: 0,
                    actionable: 0,
                });
                events
                    .publish(
                        Event::new(EventType::StageComplete, &format!("implement:phase-{phase_number}")).with_metadata(
                            serde_json::json!({
                                "phase": phase_number,
                                "total_tasks": info.total,
                                "completed": info.completed,
                                "blocked": info.blocked,
                            }),
                        ),
                    )
                    .await;
                println!("✓ Phase {phase_number} complete ({}/{} tasks, {} blocked)", info.completed, info.total, info.blocked);
                continue;
            }
            return Err(AutospecError::ArtifactInvalid(format!(
                "phase {phase_number} still has incomplete tasks after agent invocation"
            )));
        },
        ExecutionMode::PerTask => loop {
            let doc = TasksDocument::load(&ctx.tasks_file)?;
            if doc.all_tasks_complete() {
                break;
            }
            let actionable = doc.actionable_tasks();
            let Some((phase, task)) = actionable.first() else {
                return Err(AutospecError::ArtifactInvalid(
                    "tasks remain but none are actionable: dependency chain is stuck".to_string(),
                ));
            };
            let task_id = task.id.clone();
            let title = task.title.clone();
            let deps = task.dependencies.clone();
            let phase = *phase;

            // `parallel: true` on a task is advisory only in this
            // executor — tasks still run strictly one at a time here;
            // true concurrency is the DAG scheduler's job across
            // features, not across tasks within one feature.
            let instructions = task_prompt(&base_prompt, phase, &task_id, &title, &deps);

            events
                .publish(Event::new(EventType::StageStart, &format!("implement:{task_id}")))
                .await;
            let outcome = stage::run_stage(
                Stage::Implement,
                ctx,
                config,
                preset,
                retry_store,
                events,
                run_dir,
                Some(&instructions),
            )
            .await?;

            let refreshed = TasksDocument::load(&ctx.tasks_file)?;
            let still_pending = refreshed
                .tasks_of_phase(phase)
                .iter()
                .find(|t| t.id == task_id)
                .map(|t| t.status != TaskStatus::Completed)
                .unwrap_or(false);
            if still_pending {
                return Err(AutospecError::ArtifactInvalid(format!(
                    "task {task_id} was not marked completed after agent invocation"
                )));
            }

            info!(task_id = %task_id, phase, "task completed");
            outcomes.push(TaskOutcome {
                task_id,
                phase,
                attempts: outcome.attempts,
            });
        },
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_per_task() {
        assert_eq!(ExecutionMode::default(), ExecutionMode::PerTask);
    }

    #[test]
    fn task_prompt_lists_dependencies() {
        let prompt = task_prompt("base", 1, "T2", "do the thing", &["T1".to_string()]);
        assert!(prompt.contains("T2"));
        assert!(prompt.contains("T1"));
    }

    #[test]
    fn phase_prompt_lists_all_task_ids() {
        let prompt = phase_prompt("base", 2, &["T1".to_string(), "T2".to_string()]);
        assert!(prompt.contains("phase 2"));
        assert!(prompt.contains("T1, T2"));
    }
}
