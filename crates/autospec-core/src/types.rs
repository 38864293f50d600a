//! Core domain types shared by every component.
//!
//! These types mirror the data model: features, artifacts, the tasks
//! document, retry state, worktree records, and DAG run state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, time-ordered identifier used for DAG run ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A pipeline stage. Ordering matches the canonical dependency chain
/// `constitution ≺ spec ≺ plan ≺ tasks ≺ implement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Constitution,
    Specify,
    Clarify,
    Plan,
    Tasks,
    Checklist,
    Analyze,
    Implement,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Constitution => "constitution",
            Self::Specify => "specify",
            Self::Clarify => "clarify",
            Self::Plan => "plan",
            Self::Tasks => "tasks",
            Self::Checklist => "checklist",
            Self::Analyze => "analyze",
            Self::Implement => "implement",
        }
    }

    /// Canonical order for the four required stages, independent of how
    /// the user spelled out `run` flags.
    pub fn canonical_run_order() -> &'static [Stage] {
        &[Stage::Specify, Stage::Plan, Stage::Tasks, Stage::Implement]
    }

    /// Whether this stage produces a YAML artifact that C1 validates.
    pub fn produces_artifact(&self) -> bool {
        !matches!(self, Self::Implement)
    }
}

/// Task status within a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        }
    }
}

/// A single task inside a phase of the tasks document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
}

/// A numbered phase grouping tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub number: u32,
    pub title: String,
    pub tasks: Vec<Task>,
}

/// Aggregate counts for a single phase, used by `autospec status` and C7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseInfo {
    pub total: usize,
    pub completed: usize,
    pub blocked: usize,
    pub actionable: usize,
}

/// Merge strategy applied when a DAG feature branch completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Sequential,
    Octopus,
    Manual,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Octopus => "octopus",
            Self::Manual => "manual",
        }
    }
}

/// Conflict-handling policy for the `sequential` merge strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnConflict {
    #[default]
    Pause,
    Skip,
    Abort,
}

impl OnConflict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Skip => "skip",
            Self::Abort => "abort",
        }
    }
}

/// Behavior once a DAG feature exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFeatureFailure {
    Continue,
    #[default]
    Pause,
    Abort,
}

impl OnFeatureFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Pause => "pause",
            Self::Abort => "abort",
        }
    }
}

/// Worktree lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    #[default]
    Active,
    Merged,
    Abandoned,
    Stale,
}

impl WorktreeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Merged => "merged",
            Self::Abandoned => "abandoned",
            Self::Stale => "stale",
        }
    }
}

/// A tracked git worktree (§3 "Worktree record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub name: String,
    pub absolute_path: String,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: WorktreeStatus,
    #[serde(default)]
    pub setup_completed: bool,
    pub last_accessed: DateTime<Utc>,
}

/// DAG run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagRunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl DagRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }
}

/// Per-feature execution state inside a DAG run (§3 "DAG Run state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRunState {
    pub feature_id: String,
    pub status: DagRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
}

/// Persisted state for one DAG scheduler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagRunState {
    pub run_id: RunId,
    pub dag_file: String,
    pub started_at: DateTime<Utc>,
    pub status: DagRunStatus,
    pub current_layer: usize,
    pub features: BTreeMap<String, FeatureRunState>,
    #[serde(default)]
    pub layers_completed: Vec<usize>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_generates_unique_values() {
        let a = RunId::new();
        let b = RunId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Stage::Specify).unwrap(),
            "\"specify\""
        );
    }

    #[test]
    fn canonical_run_order_is_fixed() {
        assert_eq!(
            Stage::canonical_run_order(),
            &[Stage::Specify, Stage::Plan, Stage::Tasks, Stage::Implement]
        );
    }

    #[test]
    fn task_status_default_is_pending() {
        assert_eq!(TaskStatus::default(), TaskStatus::Pending);
    }

    #[test]
    fn merge_strategy_default_is_sequential() {
        assert_eq!(MergeStrategy::default(), MergeStrategy::Sequential);
    }

    #[test]
    fn on_feature_failure_default_is_pause() {
        assert_eq!(OnFeatureFailure::default(), OnFeatureFailure::Pause);
    }

    #[test]
    fn worktree_status_as_str() {
        assert_eq!(WorktreeStatus::Active.as_str(), "active");
        assert_eq!(WorktreeStatus::Stale.as_str(), "stale");
    }
}
