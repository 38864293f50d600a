//! DAG Scheduler (C12): parses a DAG document, detects cycles with
//! Kahn's algorithm, and drives bounded-parallel feature execution
//! across git worktrees with resumable persisted state (§4.12).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use autospec_core::error::{AutospecError, Result};
use autospec_core::types::{DagRunState, DagRunStatus, FeatureRunState, MergeStrategy, OnConflict, OnFeatureFailure, RunId};
use fs2::FileExt as _;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::git;

#[derive(Debug, Clone, Deserialize)]
pub struct DagFeature {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DagLayer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub features: Vec<DagFeature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DagGit {
    pub base_branch: String,
    #[serde(default)]
    pub worktree_prefix: Option<String>,
    #[serde(default)]
    pub worktree_base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DagExecution {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub timeout_per_feature: Option<u64>,
    #[serde(default)]
    pub retry_failed: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub on_feature_failure: OnFeatureFailure,
}

fn default_max_parallel() -> usize {
    3
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct DagMerge {
    #[serde(default)]
    pub strategy: MergeStrategy,
    #[serde(default)]
    pub run_tests_before_merge: bool,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub on_conflict: OnConflict,
    #[serde(default)]
    pub cleanup_after_merge: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DagDocument {
    pub schema_version: String,
    pub dag: DagMeta,
    pub git: DagGit,
    pub execution: DagExecution,
    pub merge: DagMerge,
    pub layers: Vec<DagLayer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DagMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl DagDocument {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    fn all_feature_ids(&self) -> HashSet<&str> {
        self.layers.iter().flat_map(|l| l.features.iter().map(|f| f.id.as_str())).collect()
    }

    /// Build the adjacency list (predecessor -> successors) from both
    /// layer-level and feature-level `depends_on` edges (§4.12).
    fn build_edges(&self) -> Result<HashMap<String, Vec<String>>> {
        let ids = self.all_feature_ids();
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        for id in &ids {
            edges.entry((*id).to_string()).or_default();
        }

        let layer_features: HashMap<&str, Vec<&str>> = self
            .layers
            .iter()
            .map(|l| (l.id.as_str(), l.features.iter().map(|f| f.id.as_str()).collect()))
            .collect();

        for layer in &self.layers {
            for dep_layer_id in &layer.depends_on {
                let predecessors = layer_features
                    .get(dep_layer_id.as_str())
                    .ok_or_else(|| AutospecError::ArgumentsInvalid(format!("unknown layer '{dep_layer_id}' in depends_on")))?;
                for pred in predecessors {
                    for succ in &layer.features {
                        edges.entry((*pred).to_string()).or_default().push(succ.id.clone());
                    }
                }
            }
            for feature in &layer.features {
                for dep in &feature.depends_on {
                    if !ids.contains(dep.as_str()) {
                        return Err(AutospecError::ArgumentsInvalid(format!(
                            "feature '{}' depends on unknown feature '{dep}'",
                            feature.id
                        )));
                    }
                    edges.entry(dep.clone()).or_default().push(feature.id.clone());
                }
            }
        }
        Ok(edges)
    }

    /// Validate the graph is acyclic via Kahn's algorithm, returning a
    /// topological ordering. On a cycle, returns `DagCycle` naming the
    /// nodes that never reached zero in-degree.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let edges = self.build_edges()?;
        let mut in_degree: HashMap<String, usize> = edges.keys().map(|k| (k.clone(), 0)).collect();
        for successors in edges.values() {
            for s in successors {
                *in_degree.entry(s.clone()).or_insert(0) += 1;
            }
        }

        // Deterministic ordering among equally-ready nodes.
        let mut initial: Vec<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| id.clone())
            .collect();
        initial.sort();
        let mut queue: VecDeque<String> = initial.into();

        let mut order = Vec::new();
        while let Some(node) = queue.pop_front() {
            order.push(node.clone());
            if let Some(successors) = edges.get(&node) {
                let mut newly_ready = Vec::new();
                for s in successors {
                    let deg = in_degree.get_mut(s).expect("successor tracked in in_degree");
                    *deg -= 1;
                    if *deg == 0 {
                        newly_ready.push(s.clone());
                    }
                }
                newly_ready.sort();
                for n in newly_ready {
                    queue.push_back(n);
                }
            }
        }

        if order.len() < in_degree.len() {
            let remaining: Vec<String> = in_degree
                .into_iter()
                .filter(|(id, _)| !order.contains(id))
                .map(|(id, _)| id)
                .collect();
            return Err(AutospecError::DagCycle(remaining));
        }
        Ok(order)
    }
}

/// A single feature's execution, run as a fresh `autospec` subprocess
/// pointed at its worktree (§4.12 "Execution"). Output is tee'd to a
/// per-feature log file under the run's log directory.
async fn run_feature_subprocess(
    feature_id: &str,
    worktree_path: &Path,
    log_path: &Path,
    autospec_bin: &Path,
    stage_args: &[String],
) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut cmd = Command::new(autospec_bin);
    cmd.args(stage_args)
        .current_dir(worktree_path)
        .env("SPECIFY_FEATURE", feature_id)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let output = cmd.output().await?;
    let mut combined = String::new();
    combined.push_str(&String::from_utf8_lossy(&output.stdout));
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let prefixed: String = combined
        .lines()
        .map(|l| format!("[{feature_id}] {l}\n"))
        .collect();
    std::fs::write(log_path, prefixed)?;

    if !output.status.success() {
        return Err(AutospecError::AgentFailed(format!(
            "feature {feature_id} exited with {:?}",
            output.status.code()
        )));
    }
    Ok(())
}

/// Persist `state` atomically: write to a sibling temp file, then
/// rename over the target, so a crash never leaves a half-written
/// state file (§4.12 "Resume").
pub fn save_run_state(state_dir: &Path, state: &DagRunState) -> Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let final_path = state_dir.join(format!("{}.yaml", state.run_id));
    let tmp_path = state_dir.join(format!("{}.yaml.tmp", state.run_id));
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.lock_exclusive().map_err(|_| AutospecError::IoFailure("could not lock dag run state".to_string()))?;
    let serialized = serde_yaml::to_string(state)?;
    std::fs::write(&tmp_path, serialized)?;
    fs2::FileExt::unlock(&file)?;
    std::fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

pub fn load_run_state(state_dir: &Path, run_id: &RunId) -> Result<DagRunState> {
    let path = state_dir.join(format!("{run_id}.yaml"));
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Apply the configured merge strategy for one successfully completed
/// feature (§4.12 "Merge strategies", `sequential` case).
fn merge_feature_sequential(repo_root: &Path, feature_branch: &str, target_branch: &str, base_branch: &str, merge: &DagMerge) -> Result<()> {
    match git::merge_to_target(repo_root, feature_branch, target_branch, base_branch, MergeStrategy::Sequential, false) {
        Ok(()) => Ok(()),
        Err(git::GitError::MergeConflict(branch, target)) => match merge.on_conflict {
            OnConflict::Pause => Err(AutospecError::MergeConflict { branch, target }),
            OnConflict::Skip => {
                warn!(branch = %branch, target = %target, "merge conflict, skipping per on_conflict=skip");
                Ok(())
            }
            OnConflict::Abort => Err(AutospecError::MergeConflict { branch, target }),
        },
        Err(e) => Err(e.into()),
    }
}

impl From<git::GitError> for AutospecError {
    fn from(e: git::GitError) -> Self {
        AutospecError::IoFailure(e.to_string())
    }
}

/// Execute `doc` to completion starting from a fresh `Pending` state,
/// bounding concurrency with a semaphore of size
/// `doc.execution.max_parallel` (§4.12 "Execution").
pub async fn run_dag(
    doc: &DagDocument,
    repo_root: &Path,
    worktree_base_dir: &Path,
    autospec_bin: &Path,
    state_dir: &Path,
    log_dir: &Path,
) -> Result<DagRunState> {
    let order = doc.topological_order()?;

    let run_id = RunId::new();
    let state = DagRunState {
        run_id: run_id.clone(),
        dag_file: doc.dag.name.clone(),
        started_at: chrono::Utc::now(),
        status: DagRunStatus::Running,
        current_layer: 0,
        features: order
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    FeatureRunState {
                        feature_id: id.clone(),
                        status: DagRunStatus::Pending,
                        worktree_path: None,
                        pid: None,
                        retries: 0,
                        blocked_by: Vec::new(),
                    },
                )
            })
            .collect(),
        layers_completed: Vec::new(),
        errors: Vec::new(),
    };

    execute_schedule(doc, state, repo_root, worktree_base_dir, autospec_bin, state_dir, log_dir).await
}

/// Resume a previously persisted run: reconcile any feature left
/// `Running` whose process no longer exists, then continue scheduling
/// from wherever it left off. Features already `Completed` are never
/// re-run (§4.12 "Resume idempotence").
pub async fn resume_dag(
    doc: &DagDocument,
    repo_root: &Path,
    worktree_base_dir: &Path,
    autospec_bin: &Path,
    state_dir: &Path,
    log_dir: &Path,
    run_id: &RunId,
) -> Result<DagRunState> {
    let mut state = load_run_state(state_dir, run_id)?;
    reconcile_running(&mut state);
    state.status = DagRunStatus::Running;
    execute_schedule(doc, state, repo_root, worktree_base_dir, autospec_bin, state_dir, log_dir).await
}

/// Shared scheduling core for both a fresh run and a resumed one:
/// builds the dependency graph from `doc`, seeds in-degrees and the
/// ready queue from `state`'s *current* feature statuses (so a resumed
/// run does not re-execute anything already `Completed`), then bounds
/// fan-out with a semaphore of size `doc.execution.max_parallel`.
async fn execute_schedule(
    doc: &DagDocument,
    mut state: DagRunState,
    repo_root: &Path,
    worktree_base_dir: &Path,
    autospec_bin: &Path,
    state_dir: &Path,
    log_dir: &Path,
) -> Result<DagRunState> {
    let edges = doc.build_edges()?;

    let mut in_degree: HashMap<String, usize> = state.features.keys().map(|id| (id.clone(), 0)).collect();
    for successors in edges.values() {
        for s in successors {
            *in_degree.entry(s.clone()).or_insert(0) += 1;
        }
    }
    // A predecessor already `Completed` (from a prior run) no longer
    // blocks its successors.
    for (id, fstate) in &state.features {
        if fstate.status == DagRunStatus::Completed {
            if let Some(successors) = edges.get(id) {
                for s in successors {
                    if let Some(deg) = in_degree.get_mut(s) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }
        }
    }

    let semaphore = Arc::new(Semaphore::new(doc.execution.max_parallel.max(1)));

    let mut ready: Vec<String> = in_degree
        .iter()
        .filter(|(id, &deg)| {
            deg == 0
                && state
                    .features
                    .get(*id)
                    .is_some_and(|f| f.status != DagRunStatus::Completed)
        })
        .map(|(id, _)| id.clone())
        .collect();
    ready.sort();
    let mut ready: VecDeque<String> = ready.into();

    // Each ready feature is spawned onto its own task as soon as the
    // semaphore yields a permit, so up to `max_parallel` features run
    // concurrently; this loop only does the sequential bookkeeping
    // (in-degree, merge, retry/failure policy) as results come back,
    // never the subprocess work itself (§4.12 "bounded parallelism").
    let mut in_flight: JoinSet<(String, PathBuf, Result<()>)> = JoinSet::new();

    loop {
        while let Some(feature_id) = ready.pop_front() {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| AutospecError::IoFailure("dag semaphore closed".to_string()))?;

            let worktree_path = worktree_base_dir.join(&feature_id);
            let base_branch = doc.git.base_branch.clone();
            let repo_root = repo_root.to_path_buf();
            let autospec_bin = autospec_bin.to_path_buf();
            let log_path = log_dir.join(format!("{feature_id}.log"));
            let fid = feature_id.clone();

            in_flight.spawn(async move {
                let _permit = permit;
                let result = async {
                    if !worktree_path.exists() {
                        git::create_worktree(&repo_root, &worktree_path, &fid, &base_branch)?;
                    }
                    run_feature_subprocess(&fid, &worktree_path, &log_path, &autospec_bin, &["all".to_string()]).await
                }
                .await;
                (fid, worktree_path, result)
            });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let (feature_id, worktree_path, result) =
            joined.map_err(|e| AutospecError::IoFailure(format!("feature task panicked: {e}")))?;

        let entry = state.features.get_mut(&feature_id).expect("feature tracked in state");
        entry.worktree_path = Some(worktree_path.display().to_string());

        match result {
            Ok(()) => {
                entry.status = DagRunStatus::Completed;
                if doc.merge.strategy == MergeStrategy::Sequential {
                    merge_feature_sequential(
                        repo_root,
                        &feature_id,
                        doc.git.worktree_prefix.as_deref().unwrap_or(&doc.git.base_branch),
                        &doc.git.base_branch,
                        &doc.merge,
                    )?;
                }

                if let Some(successors) = edges.get(&feature_id) {
                    let mut newly_ready: Vec<String> = Vec::new();
                    for s in successors {
                        let deg = in_degree.get_mut(s).expect("successor tracked");
                        *deg -= 1;
                        if *deg == 0 {
                            newly_ready.push(s.clone());
                        }
                    }
                    newly_ready.sort();
                    ready.extend(newly_ready);
                }
            }
            Err(e) => {
                entry.retries += 1;
                state.errors.push(format!("{feature_id}: {e}"));
                let exhausted = entry.retries >= doc.execution.max_retries || !doc.execution.retry_failed;
                if exhausted {
                    entry.status = DagRunStatus::Failed;
                    match doc.execution.on_feature_failure {
                        OnFeatureFailure::Continue => {}
                        OnFeatureFailure::Pause => {
                            state.status = DagRunStatus::Paused;
                            save_run_state(state_dir, &state)?;
                            return Ok(state);
                        }
                        OnFeatureFailure::Abort => {
                            state.status = DagRunStatus::Failed;
                            save_run_state(state_dir, &state)?;
                            return Ok(state);
                        }
                    }
                } else {
                    ready.push_back(feature_id.clone());
                }
            }
        }
        save_run_state(state_dir, &state)?;
    }

    state.status = if state.features.values().any(|f| f.status == DagRunStatus::Failed) {
        DagRunStatus::Failed
    } else {
        DagRunStatus::Completed
    };
    save_run_state(state_dir, &state)?;
    Ok(state)
}

/// Resume a paused or crashed run: reconcile any feature left
/// `Running` whose PID no longer exists, marking it `Pending` again
/// for retry (§4.12 "Resume").
pub fn reconcile_running(state: &mut DagRunState) {
    for feature in state.features.values_mut() {
        if feature.status == DagRunStatus::Running {
            let alive = feature.pid.is_some_and(pid_is_alive);
            if !alive {
                feature.status = DagRunStatus::Pending;
                feature.pid = None;
            }
        }
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc(extra_layer_dep: bool) -> DagDocument {
        let depends_on = if extra_layer_dep { vec!["layer-1".to_string()] } else { vec![] };
        DagDocument {
            schema_version: "1.0".to_string(),
            dag: DagMeta { name: "t".to_string(), description: String::new() },
            git: DagGit { base_branch: "main".to_string(), worktree_prefix: None, worktree_base_dir: None },
            execution: DagExecution {
                max_parallel: 2,
                timeout_per_feature: None,
                retry_failed: false,
                max_retries: 3,
                on_feature_failure: OnFeatureFailure::Pause,
            },
            merge: DagMerge {
                strategy: MergeStrategy::Manual,
                run_tests_before_merge: false,
                test_command: None,
                on_conflict: OnConflict::Pause,
                cleanup_after_merge: false,
            },
            layers: vec![
                DagLayer {
                    id: "layer-1".to_string(),
                    name: "l1".to_string(),
                    depends_on: vec![],
                    features: vec![DagFeature {
                        id: "007-a".to_string(),
                        name: "a".to_string(),
                        description: String::new(),
                        depends_on: vec![],
                        timeout: None,
                    }],
                },
                DagLayer {
                    id: "layer-2".to_string(),
                    name: "l2".to_string(),
                    depends_on,
                    features: vec![DagFeature {
                        id: "008-b".to_string(),
                        name: "b".to_string(),
                        description: String::new(),
                        depends_on: vec![],
                        timeout: None,
                    }],
                },
            ],
        }
    }

    #[test]
    fn topological_order_respects_layer_dependency() {
        let doc = sample_doc(true);
        let order = doc.topological_order().unwrap();
        let pos_a = order.iter().position(|x| x == "007-a").unwrap();
        let pos_b = order.iter().position(|x| x == "008-b").unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn independent_layers_have_no_forced_order() {
        let doc = sample_doc(false);
        let order = doc.topological_order().unwrap();
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn cycle_is_detected() {
        let mut doc = sample_doc(false);
        doc.layers[0].features[0].depends_on.push("008-b".to_string());
        doc.layers[1].features[0].depends_on.push("007-a".to_string());
        let err = doc.topological_order().unwrap_err();
        assert!(matches!(err, AutospecError::DagCycle(_)));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut doc = sample_doc(false);
        doc.layers[0].features[0].depends_on.push("999-ghost".to_string());
        let err = doc.build_edges().unwrap_err();
        assert!(matches!(err, AutospecError::ArgumentsInvalid(_)));
    }

    #[test]
    fn reconcile_marks_dead_pid_as_pending() {
        let mut state = DagRunState {
            run_id: RunId::new(),
            dag_file: "t".to_string(),
            started_at: chrono::Utc::now(),
            status: DagRunStatus::Running,
            current_layer: 0,
            features: BTreeMap::from([(
                "007-a".to_string(),
                FeatureRunState {
                    feature_id: "007-a".to_string(),
                    status: DagRunStatus::Running,
                    worktree_path: None,
                    pid: Some(999_999_999),
                    retries: 0,
                    blocked_by: vec![],
                },
            )]),
            layers_completed: vec![],
            errors: vec![],
        };
        reconcile_running(&mut state);
        assert_eq!(state.features["007-a"].status, DagRunStatus::Pending);
    }
}
