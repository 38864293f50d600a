//! Workflow Orchestrator (C8): the public `Specify`/`Plan`/`Tasks`/
//! `Implement`/`Run` operations, with canonical stage ordering and
//! preflight checks (§4.8).

use std::path::Path;

use autospec_core::config::Configuration;
use autospec_core::context::Context;
use autospec_core::error::{AutospecError, Result};
use autospec_core::events::EventBus;
use autospec_core::retry::RetryStore;
use autospec_core::types::Stage;
use tracing::info;

use crate::agent::AgentPreset;
use crate::phase_executor::{self, ExecutionMode};
use crate::stage;

/// Which stages a `Run` invocation should execute, independent of the
/// order the caller spelled the flags in (§4.8).
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    pub constitution: bool,
    pub specify: bool,
    pub clarify: bool,
    pub plan: bool,
    pub tasks: bool,
    pub checklist: bool,
    pub analyze: bool,
    pub implement: bool,
}

impl RunFlags {
    pub fn prep() -> Self {
        Self {
            specify: true,
            plan: true,
            tasks: true,
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self {
            specify: true,
            plan: true,
            tasks: true,
            implement: true,
            ..Default::default()
        }
    }

    /// The requested stages, in canonical pipeline order, regardless of
    /// how the flags were supplied on the command line.
    fn ordered(&self) -> Vec<Stage> {
        let mut stages = Vec::new();
        if self.constitution {
            stages.push(Stage::Constitution);
        }
        if self.specify {
            stages.push(Stage::Specify);
        }
        if self.clarify {
            stages.push(Stage::Clarify);
        }
        if self.plan {
            stages.push(Stage::Plan);
        }
        if self.tasks {
            stages.push(Stage::Tasks);
        }
        if self.checklist {
            stages.push(Stage::Checklist);
        }
        if self.analyze {
            stages.push(Stage::Analyze);
        }
        if self.implement {
            stages.push(Stage::Implement);
        }
        stages
    }
}

/// Preflight: the agent binary resolves, the constitution exists
/// (unless the constitution stage is what's about to run), and — in a
/// git repo — the working tree is on a feature branch (§4.8).
pub fn preflight(ctx: &Context, config: &Configuration, preset: &AgentPreset, first_stage: Stage) -> Result<()> {
    if config.skip_preflight {
        return Ok(());
    }
    which_binary(&preset.command)
        .ok_or_else(|| AutospecError::DependencyMissing(preset.command.clone()))?;

    if first_stage != Stage::Constitution {
        let constitution = ctx.repo_root.join(".autospec/constitution.yaml");
        if !constitution.exists() {
            return Err(AutospecError::ConstitutionMissing(constitution.display().to_string()));
        }
    }

    if ctx.is_git_repo && !autospec_core::context::is_feature_branch(&ctx.feature_id) {
        return Err(AutospecError::PrerequisiteMissing(format!(
            "not on a feature branch (current: {})",
            ctx.feature_id
        )));
    }
    Ok(())
}

fn which_binary(name: &str) -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Decide whether to overwrite an existing artifact before running a
/// stage that would produce one. `--yes` always proceeds;
/// `--no-overwrite` always aborts; otherwise the caller (the CLI
/// layer, which owns the terminal) is responsible for the interactive
/// prompt and passes its answer in as `confirmed`.
pub fn should_overwrite(path: &Path, yes: bool, no_overwrite: bool, confirmed: bool) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    if no_overwrite {
        return Ok(false);
    }
    if yes {
        return Ok(true);
    }
    Ok(confirmed)
}

/// Run the requested subset of stages in canonical order. Only the
/// first stage's prerequisites are checked explicitly — later stages
/// consume artifacts the earlier ones in this same `Run` just produced,
/// so `stage::run_stage`'s own prerequisite check is a no-op for them
/// in the common case but still guards against a stage being requested
/// out of dependency order by itself (e.g. `tasks` without `plan`).
pub async fn run(
    flags: RunFlags,
    ctx: &Context,
    config: &Configuration,
    preset: &AgentPreset,
    retry_store: &RetryStore,
    events: &EventBus,
    run_dir: &Path,
    implement_mode: ExecutionMode,
    yes: bool,
    no_overwrite: bool,
) -> Result<Vec<Stage>> {
    let stages = flags.ordered();
    let Some(first) = stages.first().copied() else {
        return Ok(Vec::new());
    };
    preflight(ctx, config, preset, first)?;

    let mut completed = Vec::new();
    for s in stages {
        if let Some(path) = stage::artifact_path_for(s, ctx) {
            // No interactive terminal layer exists yet: an unanswered
            // prompt is treated the same as a declined overwrite, same
            // as `clean` without `--yes` (§4.8).
            if !should_overwrite(&path, yes, no_overwrite, false)? {
                return Err(AutospecError::ArgumentsInvalid(format!(
                    "{} already exists at {}; pass --yes to overwrite",
                    s.as_str(),
                    path.display()
                )));
            }
        }
        info!(stage = s.as_str(), feature = %ctx.feature_id, "running stage");
        if s == Stage::Implement {
            phase_executor::run_implement(implement_mode, ctx, config, preset, retry_store, events, run_dir).await?;
        } else {
            stage::run_stage(s, ctx, config, preset, retry_store, events, run_dir, None).await?;
        }
        completed.push(s);
    }
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_ignores_flag_declaration_order() {
        let flags = RunFlags {
            implement: true,
            tasks: true,
            plan: true,
            specify: true,
            ..Default::default()
        };
        assert_eq!(
            flags.ordered(),
            vec![Stage::Specify, Stage::Plan, Stage::Tasks, Stage::Implement]
        );
    }

    #[test]
    fn prep_is_specify_plan_tasks() {
        assert_eq!(RunFlags::prep().ordered(), vec![Stage::Specify, Stage::Plan, Stage::Tasks]);
    }

    #[test]
    fn all_is_full_pipeline() {
        assert_eq!(RunFlags::all().ordered(), Stage::canonical_run_order().to_vec());
    }

    #[test]
    fn should_overwrite_respects_no_overwrite_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.yaml");
        std::fs::write(&path, "x").unwrap();
        assert!(!should_overwrite(&path, false, true, true).unwrap());
    }

    #[test]
    fn should_overwrite_allows_new_file_without_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.yaml");
        assert!(should_overwrite(&path, false, false, false).unwrap());
    }
}
