//! autospec - spec-driven AI coding orchestrator CLI.

use std::path::{Path, PathBuf};

use autospec::{cli, dag, git, lifecycle, orchestrator, phase_executor, renderer, stage, worktree};

use autospec_core::config::Configuration;
use autospec_core::context::Context;
use autospec_core::error::AutospecError;
use autospec_core::events::EventBus;
use autospec_core::retry::{self, RetryStore};
use autospec_core::types::Stage;
use clap::Parser;
use cli::{Cli, Command, DagAction, WorktreeAction};
use phase_executor::ExecutionMode;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub type AppResult<T> = eyre::Result<T>;

fn init_tracing(debug: bool, verbose: bool) {
    let default_level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

fn repo_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn current_branch(repo_root: &Path) -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(repo_root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn is_git_repo(repo_root: &Path) -> bool {
    repo_root.join(".git").exists()
}

fn state_dir(repo_root: &Path) -> PathBuf {
    std::env::var("AUTOSPEC_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| repo_root.join(".autospec/state"))
}

fn log_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(".autospec/logs")
}

fn user_config_path() -> Option<PathBuf> {
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
        .ok()?;
    Some(config_home.join("autospec/config.yml"))
}

fn load_configuration(repo_root: &Path, cli: &cli::GlobalArgs) -> eyre::Result<Configuration> {
    let project_config = repo_root.join(".autospec/config.yml");
    let mut config = Configuration::load(
        cli.config.as_deref().or(user_config_path().as_deref()),
        Some(project_config.as_path()),
    )?;
    if let Some(dir) = &cli.specs_dir {
        config.specs_dir = dir.clone();
    }
    if let Some(agent) = &cli.agent {
        config.agent = agent.clone();
    }
    if let Some(n) = cli.max_retries {
        config.max_retries = n;
    }
    if cli.skip_preflight {
        config.skip_preflight = true;
    }
    if cli.auto_commit {
        config.auto_commit = true;
    }
    if cli.no_auto_commit {
        config.auto_commit = false;
    }
    config.resolve_paths(repo_root);
    Ok(config)
}

fn build_context(repo_root: &Path, config: &Configuration, explicit_spec: Option<&str>) -> eyre::Result<Context> {
    let branch = current_branch(repo_root);
    Ok(Context::compute(
        &config.specs_dir,
        repo_root,
        is_git_repo(repo_root),
        explicit_spec,
        branch.as_deref(),
        env!("CARGO_PKG_VERSION"),
    )?)
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.debug, cli.global.verbose);

    let repo_root = repo_root();
    let config = load_configuration(&repo_root, &cli.global)?;
    let events = EventBus::new();
    let retry_store = RetryStore::new(retry::default_retry_store_path(&state_dir(&repo_root)));

    let command_name = cli.command.name();
    let result = lifecycle::run_command(command_name, &events, || {
        dispatch(cli, &repo_root, &config, &events, &retry_store)
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            eprintln!("error: {err}");
            if let Some(hint) = err.remediation() {
                eprintln!("  hint: {hint}");
            }
            std::process::exit(err.exit_code());
        }
    }
}

async fn dispatch(
    cli: Cli,
    repo_root: &Path,
    config: &Configuration,
    events: &EventBus,
    retry_store: &RetryStore,
) -> Result<(), AutospecError> {
    let explicit_spec = cli.global.spec.clone();
    let run_dir = log_dir(repo_root).join("runs");

    match cli.command {
        Command::Init { .. } => {
            std::fs::create_dir_all(repo_root.join(".autospec/scripts"))?;
            std::fs::create_dir_all(repo_root.join(".claude/commands"))?;
            println!("initialized .autospec/ and .claude/ in {}", repo_root.display());
            Ok(())
        }

        Command::Constitution => {
            let ctx = build_context(repo_root, config, explicit_spec.as_deref())
                .map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            let preset = stage::default_agent_preset(config)?;
            stage::run_stage(Stage::Constitution, &ctx, config, &preset, retry_store, events, &run_dir, None).await?;
            Ok(())
        }

        Command::Specify { description } => {
            let ctx = build_context(repo_root, config, explicit_spec.as_deref())
                .map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            let preset = stage::default_agent_preset(config)?;
            stage::run_stage(Stage::Specify, &ctx, config, &preset, retry_store, events, &run_dir, Some(&description)).await?;
            Ok(())
        }

        Command::Clarify => run_single_stage(Stage::Clarify, repo_root, config, events, retry_store, explicit_spec.as_deref(), &run_dir).await,
        Command::Checklist | Command::Ck => {
            run_single_stage(Stage::Checklist, repo_root, config, events, retry_store, explicit_spec.as_deref(), &run_dir).await
        }
        Command::Analyze => run_single_stage(Stage::Analyze, repo_root, config, events, retry_store, explicit_spec.as_deref(), &run_dir).await,

        Command::Plan { prompt } => {
            let ctx = build_context(repo_root, config, explicit_spec.as_deref())
                .map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            let preset = stage::default_agent_preset(config)?;
            stage::run_stage(Stage::Plan, &ctx, config, &preset, retry_store, events, &run_dir, prompt.as_deref()).await?;
            Ok(())
        }

        Command::Tasks { prompt } => {
            let ctx = build_context(repo_root, config, explicit_spec.as_deref())
                .map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            let preset = stage::default_agent_preset(config)?;
            stage::run_stage(Stage::Tasks, &ctx, config, &preset, retry_store, events, &run_dir, prompt.as_deref()).await?;
            Ok(())
        }

        Command::Implement { phases, single_session, .. } => {
            let ctx = build_context(repo_root, config, explicit_spec.as_deref())
                .map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            let preset = stage::default_agent_preset(config)?;
            let mode = if single_session {
                ExecutionMode::SingleSession
            } else if phases {
                ExecutionMode::PerPhase
            } else {
                ExecutionMode::PerTask
            };
            phase_executor::run_implement(mode, &ctx, config, &preset, retry_store, events, &run_dir).await?;
            Ok(())
        }

        Command::Run {
            specify,
            plan,
            tasks,
            implement,
            clarify,
            checklist,
            analyze,
            constitution,
            all,
            yes,
            no_overwrite,
            ..
        } => {
            let flags = orchestrator::RunFlags {
                constitution,
                specify: specify || all,
                clarify,
                plan: plan || all,
                tasks: tasks || all,
                checklist,
                analyze,
                implement: implement || all,
            };
            run_with_flags(flags, repo_root, config, events, retry_store, explicit_spec.as_deref(), &run_dir, yes, no_overwrite).await
        }

        Command::Prep { yes } => {
            run_with_flags(orchestrator::RunFlags::prep(), repo_root, config, events, retry_store, explicit_spec.as_deref(), &run_dir, yes, false).await
        }

        Command::All { yes } => {
            run_with_flags(orchestrator::RunFlags::all(), repo_root, config, events, retry_store, explicit_spec.as_deref(), &run_dir, yes, false).await
        }

        Command::Worktree { action } => worktree_command(action, repo_root, config).await,

        Command::Dag { action } => dag_command(action, repo_root, config).await,

        Command::Status => {
            let ctx = build_context(repo_root, config, explicit_spec.as_deref())
                .map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            print_status(&ctx);
            Ok(())
        }

        Command::History => {
            print_history(&retry::default_retry_store_path(&state_dir(repo_root)));
            Ok(())
        }

        Command::Doctor => run_doctor(repo_root, config),

        Command::Prereqs => {
            let ctx = build_context(repo_root, config, explicit_spec.as_deref())
                .map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            for stage in Stage::canonical_run_order() {
                let result = stage::check_prerequisites(&ctx, *stage);
                println!("{:<12} {}", stage.as_str(), if result.is_ok() { "ok" } else { "missing" });
            }
            Ok(())
        }

        Command::RenderCommand { stage } => {
            let ctx = build_context(repo_root, config, explicit_spec.as_deref())
                .map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            let rendered = renderer::render(&stage, &ctx).map_err(|e| AutospecError::ArtifactInvalid(e.to_string()))?;
            println!("{rendered}");
            Ok(())
        }

        Command::Update => {
            println!("autospec {} is up to date (no registry configured)", env!("CARGO_PKG_VERSION"));
            Ok(())
        }

        Command::View { artifact } => {
            let ctx = build_context(repo_root, config, explicit_spec.as_deref())
                .map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            let path = ctx.feature_dir.join(format!("{artifact}.yaml"));
            let content = std::fs::read_to_string(&path)?;
            println!("{content}");
            Ok(())
        }

        Command::Clean { yes } => {
            let state = state_dir(repo_root);
            if yes {
                if state.exists() {
                    std::fs::remove_dir_all(&state)?;
                }
                println!("removed {}", state.display());
            } else {
                println!("would remove {} (pass --yes to confirm)", state.display());
            }
            Ok(())
        }
    }
}

async fn run_single_stage(
    stage: Stage,
    repo_root: &Path,
    config: &Configuration,
    events: &EventBus,
    retry_store: &RetryStore,
    explicit_spec: Option<&str>,
    run_dir: &Path,
) -> Result<(), AutospecError> {
    let ctx = build_context(repo_root, config, explicit_spec).map_err(|e| AutospecError::IoFailure(e.to_string()))?;
    let preset = stage::default_agent_preset(config)?;
    stage::run_stage(stage, &ctx, config, &preset, retry_store, events, run_dir, None).await?;
    Ok(())
}

async fn run_with_flags(
    flags: orchestrator::RunFlags,
    repo_root: &Path,
    config: &Configuration,
    events: &EventBus,
    retry_store: &RetryStore,
    explicit_spec: Option<&str>,
    run_dir: &Path,
    yes: bool,
    no_overwrite: bool,
) -> Result<(), AutospecError> {
    let ctx = build_context(repo_root, config, explicit_spec).map_err(|e| AutospecError::IoFailure(e.to_string()))?;
    let preset = stage::default_agent_preset(config)?;
    orchestrator::run(
        flags,
        &ctx,
        config,
        &preset,
        retry_store,
        events,
        run_dir,
        ExecutionMode::PerTask,
        yes,
        no_overwrite,
    )
    .await?;
    Ok(())
}

fn print_status(ctx: &Context) {
    println!("feature: {}", ctx.feature_id);
    if !ctx.tasks_file.exists() {
        println!("tasks.yaml not yet produced");
        return;
    }
    match autospec_core::artifacts::TasksDocument::load(&ctx.tasks_file) {
        Ok(doc) => {
            for phase in &doc.phases {
                if let Some(info) = doc.phase_info(phase.number) {
                    println!(
                        "phase {:>3} {:<24} {}/{} complete, {} blocked, {} actionable",
                        phase.number, phase.title, info.completed, info.total, info.blocked, info.actionable
                    );
                }
            }
            match doc.first_incomplete_phase() {
                Some(n) => println!("first incomplete phase: {n}"),
                None => println!("all phases complete"),
            }
        }
        Err(e) => println!("failed to read tasks.yaml: {e}"),
    }
}

fn print_history(retry_store_path: &Path) {
    if !retry_store_path.exists() {
        println!("no retry history recorded");
        return;
    }
    match std::fs::read_to_string(retry_store_path) {
        Ok(content) => println!("{content}"),
        Err(e) => println!("failed to read retry store: {e}"),
    }
}

fn run_doctor(repo_root: &Path, config: &Configuration) -> Result<(), AutospecError> {
    let preset = stage::default_agent_preset(config)?;
    let agent_ok = which_binary(&preset.command).is_some();
    let git_ok = which_binary("git").is_some();
    let constitution_ok = repo_root.join(".autospec/constitution.yaml").exists();

    println!("agent ({}): {}", preset.command, if agent_ok { "ok" } else { "MISSING" });
    println!("git: {}", if git_ok { "ok" } else { "MISSING" });
    println!("constitution: {}", if constitution_ok { "ok" } else { "MISSING" });

    if agent_ok && git_ok && constitution_ok {
        Ok(())
    } else {
        Err(AutospecError::DependencyMissing("one or more doctor checks failed".to_string()))
    }
}

fn which_binary(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(name)).find(|c| c.is_file())
}

async fn worktree_command(action: WorktreeAction, repo_root: &Path, config: &Configuration) -> Result<(), AutospecError> {
    let state_path = state_dir(repo_root).join("worktrees.yaml");
    let manager = worktree::WorktreeManager::new(repo_root, state_path);

    match action {
        WorktreeAction::Create { name, branch } => {
            let branch = branch.unwrap_or_else(|| name.clone());
            let base = config.base_branch.clone().unwrap_or_else(|| "main".to_string());
            let expanded = git::expand_worktree_template(&config.worktree_path_template, repo_root, &name);
            let path = git::resolve_worktree_path(&expanded, repo_root);
            let record = manager.create(&name, &branch, &base, &path).map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            println!("created worktree {} at {}", record.name, record.absolute_path);
            Ok(())
        }
        WorktreeAction::List => {
            let list = manager.list().map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            for wt in list {
                println!("{:<20} {:<10} {}", wt.name, wt.status.as_str(), wt.absolute_path);
            }
            Ok(())
        }
        WorktreeAction::Remove { name, force } => {
            manager.remove(&name, force).map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            println!("removed worktree {name}");
            Ok(())
        }
        WorktreeAction::Prune => {
            let pruned = manager.prune().map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            println!("marked {} worktree(s) stale", pruned.len());
            Ok(())
        }
        WorktreeAction::Setup { name } => {
            manager.setup(&name).map_err(|e| AutospecError::IoFailure(e.to_string()))?;
            println!("ran setup for {name}");
            Ok(())
        }
    }
}

async fn dag_command(action: DagAction, repo_root: &Path, _config: &Configuration) -> Result<(), AutospecError> {
    match action {
        DagAction::Validate { file } => {
            let doc = dag::DagDocument::load(&file)?;
            doc.topological_order()?;
            println!("{} is valid: no cycles detected", file.display());
            Ok(())
        }
        DagAction::Visualize { file } => {
            let doc = dag::DagDocument::load(&file)?;
            let order = doc.topological_order()?;
            println!("execution order: {}", order.join(" -> "));
            Ok(())
        }
        DagAction::Run { file } => {
            let doc = dag::DagDocument::load(&file)?;
            let worktree_base = doc.git.worktree_base_dir.clone().unwrap_or_else(|| repo_root.join("..").join("worktrees"));
            let autospec_bin = std::env::current_exe().map_err(AutospecError::from)?;
            let state = dag::run_dag(
                &doc,
                repo_root,
                &worktree_base,
                &autospec_bin,
                &state_dir(repo_root).join("dag-runs"),
                &log_dir(repo_root).join("dag-runs"),
            )
            .await?;
            println!("run {} finished: {}", state.run_id, state.status.as_str());
            Ok(())
        }
        DagAction::Status { run_id } => {
            let state = dag::load_run_state(&state_dir(repo_root).join("dag-runs"), &autospec_core::types::RunId(run_id))
                .map_err(|_| AutospecError::ArgumentsInvalid("no persisted run state found for that run id".to_string()))?;
            println!("run {} ({}): {}", state.run_id, state.dag_file, state.status.as_str());
            for (feature_id, feature) in &state.features {
                println!("  {:<20} {}", feature_id, feature.status.as_str());
            }
            if !state.errors.is_empty() {
                println!("errors:");
                for e in &state.errors {
                    println!("  {e}");
                }
            }
            Ok(())
        }
        DagAction::Resume { file, run_id } => {
            let doc = dag::DagDocument::load(&file)?;
            let worktree_base = doc.git.worktree_base_dir.clone().unwrap_or_else(|| repo_root.join("..").join("worktrees"));
            let autospec_bin = std::env::current_exe().map_err(AutospecError::from)?;
            let state = dag::resume_dag(
                &doc,
                repo_root,
                &worktree_base,
                &autospec_bin,
                &state_dir(repo_root).join("dag-runs"),
                &log_dir(repo_root).join("dag-runs"),
                &autospec_core::types::RunId(run_id),
            )
            .await?;
            println!("run {} finished: {}", state.run_id, state.status.as_str());
            Ok(())
        }
    }
}
