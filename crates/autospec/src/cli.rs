//! Command-line surface (§6). Parsing only — dispatch lives in `main`.

use std::path::PathBuf;

use autospec_core::config::OutputStyle;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "autospec")]
#[command(about = "Spec-driven AI coding orchestrator")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub specs_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    pub agent: Option<String>,
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,
    #[arg(long, global = true)]
    pub skip_preflight: bool,
    #[arg(long, global = true)]
    pub debug: bool,
    #[arg(long, global = true)]
    pub verbose: bool,
    #[arg(long, global = true, value_enum)]
    pub output_style: Option<OutputStyleArg>,
    #[arg(long, global = true, conflicts_with = "no_auto_commit")]
    pub auto_commit: bool,
    #[arg(long, global = true)]
    pub no_auto_commit: bool,
    #[arg(long, global = true)]
    pub spec: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputStyleArg {
    Default,
    Compact,
    Minimal,
    Plain,
    Raw,
}

impl From<OutputStyleArg> for OutputStyle {
    fn from(v: OutputStyleArg) -> Self {
        match v {
            OutputStyleArg::Default => OutputStyle::Default,
            OutputStyleArg::Compact => OutputStyle::Compact,
            OutputStyleArg::Minimal => OutputStyle::Minimal,
            OutputStyleArg::Plain => OutputStyle::Plain,
            OutputStyleArg::Raw => OutputStyle::Raw,
        }
    }
}

impl Command {
    /// Stable event/log name for this invocation, independent of its
    /// arguments (§4.9 `command.start`/`command.complete`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Constitution => "constitution",
            Self::Specify { .. } => "specify",
            Self::Clarify => "clarify",
            Self::Checklist => "checklist",
            Self::Analyze => "analyze",
            Self::Plan { .. } => "plan",
            Self::Tasks { .. } => "tasks",
            Self::Implement { .. } => "implement",
            Self::Run { .. } => "run",
            Self::Prep { .. } => "prep",
            Self::All { .. } => "all",
            Self::Worktree { .. } => "worktree",
            Self::Dag { .. } => "dag",
            Self::Status => "status",
            Self::History => "history",
            Self::Doctor => "doctor",
            Self::Prereqs => "prereqs",
            Self::RenderCommand { .. } => "render-command",
            Self::Update => "update",
            Self::Ck => "checklist",
            Self::View { .. } => "view",
            Self::Clean { .. } => "clean",
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Scaffold `.autospec/` and `.claude/` in the current repository.
    Init {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        sandbox: bool,
        #[arg(long)]
        no_sandbox: bool,
        #[arg(long)]
        skip_permissions: bool,
        #[arg(long)]
        no_skip_permissions: bool,
        #[arg(long)]
        gitignore: bool,
        #[arg(long)]
        no_gitignore: bool,
        #[arg(long)]
        constitution: bool,
        #[arg(long)]
        no_constitution: bool,
        #[arg(long)]
        yes: bool,
    },
    Constitution,
    Specify {
        description: String,
    },
    Clarify,
    Checklist,
    Analyze,
    Plan {
        prompt: Option<String>,
    },
    Tasks {
        prompt: Option<String>,
    },
    Implement {
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        phases: bool,
        #[arg(long)]
        tasks: bool,
        #[arg(long)]
        single_session: bool,
        #[arg(long)]
        phase: Option<u32>,
        #[arg(long)]
        from_phase: Option<u32>,
        #[arg(long)]
        from_task: Option<String>,
    },
    Run {
        #[arg(short = 's', long)]
        specify: bool,
        #[arg(short = 'p', long)]
        plan: bool,
        #[arg(short = 't', long)]
        tasks: bool,
        #[arg(short = 'i', long)]
        implement: bool,
        #[arg(short = 'r', long)]
        clarify: bool,
        #[arg(short = 'l', long)]
        checklist: bool,
        #[arg(short = 'z', long)]
        analyze: bool,
        #[arg(short = 'n', long)]
        constitution: bool,
        /// Equivalent to -spti
        #[arg(short = 'a', long)]
        all: bool,
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        no_overwrite: bool,
    },
    /// `run -spt`
    Prep {
        #[arg(long)]
        yes: bool,
    },
    /// `run -spti`
    All {
        #[arg(long)]
        yes: bool,
    },
    Worktree {
        #[command(subcommand)]
        action: WorktreeAction,
    },
    Dag {
        #[command(subcommand)]
        action: DagAction,
    },
    Status,
    History,
    Doctor,
    Prereqs,
    RenderCommand {
        stage: String,
    },
    Update,
    /// Alias for `checklist`.
    Ck,
    View {
        artifact: String,
    },
    Clean {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum WorktreeAction {
    Create {
        name: String,
        #[arg(long)]
        branch: Option<String>,
    },
    List,
    Remove {
        name: String,
        #[arg(long)]
        force: bool,
    },
    Prune,
    Setup {
        name: String,
    },
}

#[derive(Subcommand)]
pub enum DagAction {
    Run { file: PathBuf },
    /// Report on a previously started run, identified by its run id
    /// (the `run_id` printed by `dag run` / persisted under
    /// `<state-dir>/dag-runs/<run_id>.yaml`).
    Status { run_id: String },
    /// Resume a paused or interrupted run: reconciles any feature left
    /// `Running` whose process died, then continues scheduling.
    Resume { file: PathBuf, run_id: String },
    Validate { file: PathBuf },
    Visualize { file: PathBuf },
}
