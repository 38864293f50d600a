//! Artifact and schema model (C1).
//!
//! Typed representation and validation of the spec/plan/tasks/checklist/
//! clarification/analysis/constitution YAML documents, plus the
//! tasks-document queries used by the phase/task sub-executor and by
//! `autospec status`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Phase, PhaseInfo, Task, TaskStatus};

/// One artifact kind produced by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Constitution,
    Spec,
    Plan,
    Tasks,
    Checklist,
    Clarification,
    Analysis,
}

impl ArtifactType {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Constitution => "constitution.yaml",
            Self::Spec => "spec.yaml",
            Self::Plan => "plan.yaml",
            Self::Tasks => "tasks.yaml",
            Self::Checklist => "checklist.yaml",
            Self::Clarification => "clarification.yaml",
            Self::Analysis => "analysis.yaml",
        }
    }
}

/// Common front-matter every artifact carries (§3 "`_meta` block").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub version: u32,
    pub created: DateTime<Utc>,
    pub artifact_type: ArtifactType,
}

/// A single schema-validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub path: String,
    pub kind: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// The `spec.yaml` document produced by the `specify` stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecDocument {
    #[serde(rename = "_meta")]
    pub meta: ArtifactMeta,
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub clarifications_needed: Vec<String>,
}

/// The `plan.yaml` document produced by the `plan` stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDocument {
    #[serde(rename = "_meta")]
    pub meta: ArtifactMeta,
    pub approach: String,
    #[serde(default)]
    pub architecture_notes: Vec<String>,
}

/// The `tasks.yaml` document produced by the `tasks` stage and mutated
/// in place by `implement`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksDocument {
    #[serde(rename = "_meta")]
    pub meta: ArtifactMeta,
    pub phases: Vec<Phase>,
}

impl TasksDocument {
    /// Parse and validate a tasks document from bytes.
    pub fn parse(content: &str) -> Result<Self, ArtifactError> {
        Ok(serde_yaml::from_str(content).map_err(|source| ArtifactError::Parse {
            path: std::path::PathBuf::from("tasks.yaml"),
            source,
        })?)
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let content = std::fs::read_to_string(path).map_err(|source| ArtifactError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let content = serde_yaml::to_string(self).map_err(|source| ArtifactError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, content).map_err(|source| ArtifactError::Read {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate structural invariants (§3 "Tasks document"): unique
    /// task ids, acyclic dependencies, and a terminal quality-gate
    /// phase containing at least `test`.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen_ids = HashSet::new();
        let mut all_ids = HashSet::new();

        for phase in &self.phases {
            for task in &phase.tasks {
                all_ids.insert(task.id.clone());
            }
        }

        for (phase_idx, phase) in self.phases.iter().enumerate() {
            for (task_idx, task) in phase.tasks.iter().enumerate() {
                let path = format!("phases[{phase_idx}].tasks[{task_idx}]");
                if !seen_ids.insert(task.id.clone()) {
                    errors.push(ValidationError::new(
                        format!("{path}.id"),
                        "duplicate_task_id",
                        format!("task id {} is used more than once", task.id),
                    ));
                }
                for dep in &task.dependencies {
                    if !all_ids.contains(dep) {
                        errors.push(ValidationError::new(
                            format!("{path}.dependencies"),
                            "unknown_dependency",
                            format!("task {} depends on unknown task {dep}", task.id),
                        ));
                    }
                }
            }
        }

        if let Some(cycle) = self.find_dependency_cycle() {
            errors.push(ValidationError::new(
                "phases[].tasks[].dependencies",
                "dependency_cycle",
                format!("task dependency cycle: {}", cycle.join(" -> ")),
            ));
        }

        match self.phases.last() {
            None => errors.push(ValidationError::new(
                "phases",
                "missing_quality_gate",
                "tasks document has no phases".to_string(),
            )),
            Some(last) => {
                let titles: Vec<String> = last.tasks.iter().map(|t| t.title.to_lowercase()).collect();
                if !titles.iter().any(|t| t.contains("test")) {
                    errors.push(ValidationError::new(
                        format!("phases[{}]", self.phases.len() - 1),
                        "missing_quality_gate",
                        "terminal phase must contain a 'test' task".to_string(),
                    ));
                }
            }
        }

        errors
    }

    fn find_dependency_cycle(&self) -> Option<Vec<String>> {
        let mut deps: HashMap<&str, &[String]> = HashMap::new();
        for phase in &self.phases {
            for task in &phase.tasks {
                deps.insert(&task.id, &task.dependencies);
            }
        }

        #[derive(PartialEq, Clone, Copy)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<String> = Vec::new();

        fn visit<'a>(
            id: &'a str,
            deps: &HashMap<&'a str, &'a [String]>,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            if marks.get(id) == Some(&Mark::Done) {
                return None;
            }
            if marks.get(id) == Some(&Mark::Visiting) {
                let start = stack.iter().position(|s| s == id).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].to_vec();
                cycle.push(id.to_string());
                return Some(cycle);
            }
            marks.insert(id, Mark::Visiting);
            stack.push(id.to_string());
            if let Some(children) = deps.get(id) {
                for child in children.iter() {
                    if let Some(cycle) = visit(child.as_str(), deps, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            marks.insert(id, Mark::Done);
            None
        }

        let ids: Vec<&str> = deps.keys().copied().collect();
        for id in ids {
            if let Some(cycle) = visit(id, &deps, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    pub fn phase_info(&self, number: u32) -> Option<PhaseInfo> {
        let phase = self.phases.iter().find(|p| p.number == number)?;
        Some(Self::phase_info_for(phase))
    }

    fn phase_info_for(phase: &Phase) -> PhaseInfo {
        let total = phase.tasks.len();
        let completed = phase
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let blocked = phase
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Blocked)
            .count();
        let actionable = phase
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending || t.status == TaskStatus::InProgress)
            .count();
        PhaseInfo {
            total,
            completed,
            blocked,
            actionable,
        }
    }

    pub fn is_phase_complete(&self, number: u32) -> bool {
        self.phase_info(number)
            .is_some_and(|info| info.total > 0 && info.completed == info.total)
    }

    pub fn first_incomplete_phase(&self) -> Option<u32> {
        self.phases
            .iter()
            .find(|p| !p.tasks.iter().all(|t| t.status == TaskStatus::Completed))
            .map(|p| p.number)
    }

    pub fn tasks_of_phase(&self, number: u32) -> Vec<&Task> {
        self.phases
            .iter()
            .find(|p| p.number == number)
            .map(|p| p.tasks.iter().collect())
            .unwrap_or_default()
    }

    pub fn all_tasks_complete(&self) -> bool {
        self.phases
            .iter()
            .all(|p| p.tasks.iter().all(|t| t.status == TaskStatus::Completed))
    }

    /// Tasks that are actionable right now: `Pending`/`InProgress` with
    /// every dependency `Completed`, ordered `(phase asc, task id asc)`
    /// per §4.7's tie-break rule.
    pub fn actionable_tasks(&self) -> Vec<(u32, &Task)> {
        let completed: HashSet<&str> = self
            .phases
            .iter()
            .flat_map(|p| p.tasks.iter())
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();

        let mut out: Vec<(u32, &Task)> = self
            .phases
            .iter()
            .flat_map(|p| p.tasks.iter().map(move |t| (p.number, t)))
            .filter(|(_, t)| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
            .filter(|(_, t)| t.dependencies.iter().all(|d| completed.contains(d.as_str())))
            .collect();

        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        out
    }

    pub fn mark_task_status(&mut self, task_id: &str, status: TaskStatus) -> bool {
        for phase in &mut self.phases {
            for task in &mut phase.tasks {
                if task.id == task_id {
                    task.status = status;
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;

    fn doc_with_phases(phases: Vec<Phase>) -> TasksDocument {
        TasksDocument {
            meta: ArtifactMeta {
                version: 1,
                created: Utc::now(),
                artifact_type: ArtifactType::Tasks,
            },
            phases,
        }
    }

    fn task(id: &str, status: TaskStatus, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            title: format!("task {id}"),
            status,
            blocked_reason: None,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            parallel: None,
        }
    }

    #[test]
    fn duplicate_task_ids_are_rejected() {
        let doc = doc_with_phases(vec![Phase {
            number: 1,
            title: "setup".into(),
            tasks: vec![
                task("T1", TaskStatus::Pending, &[]),
                task("T1", TaskStatus::Pending, &[]),
            ],
        }]);
        let errors = doc.validate();
        assert!(errors.iter().any(|e| e.kind == "duplicate_task_id"));
    }

    #[test]
    fn cyclic_dependencies_are_rejected() {
        let doc = doc_with_phases(vec![Phase {
            number: 1,
            title: "setup".into(),
            tasks: vec![
                task("T1", TaskStatus::Pending, &["T2"]),
                task("T2", TaskStatus::Pending, &["T1"]),
            ],
        }]);
        let errors = doc.validate();
        assert!(errors.iter().any(|e| e.kind == "dependency_cycle"));
    }

    #[test]
    fn terminal_phase_without_test_task_is_rejected() {
        let doc = doc_with_phases(vec![Phase {
            number: 1,
            title: "quality gate".into(),
            tasks: vec![task("T1", TaskStatus::Pending, &[])],
        }]);
        let errors = doc.validate();
        assert!(errors.iter().any(|e| e.kind == "missing_quality_gate"));
    }

    #[test]
    fn phase_completion_requires_all_tasks_completed() {
        let doc = doc_with_phases(vec![Phase {
            number: 1,
            title: "p1".into(),
            tasks: vec![
                task("T1", TaskStatus::Completed, &[]),
                task("T2", TaskStatus::Pending, &[]),
            ],
        }]);
        assert!(!doc.is_phase_complete(1));
    }

    #[test]
    fn actionable_tasks_skip_unmet_dependencies() {
        let doc = doc_with_phases(vec![Phase {
            number: 1,
            title: "p1".into(),
            tasks: vec![
                task("T1", TaskStatus::Pending, &[]),
                task("T2", TaskStatus::Pending, &["T1"]),
            ],
        }]);
        let actionable = doc.actionable_tasks();
        assert_eq!(actionable.len(), 1);
        assert_eq!(actionable[0].1.id, "T1");
    }

    #[test]
    fn actionable_tasks_are_ordered_by_phase_then_id() {
        let doc = doc_with_phases(vec![
            Phase {
                number: 2,
                title: "p2".into(),
                tasks: vec![task("T9", TaskStatus::Pending, &[])],
            },
            Phase {
                number: 1,
                title: "p1".into(),
                tasks: vec![
                    task("T2", TaskStatus::Pending, &[]),
                    task("T1", TaskStatus::Pending, &[]),
                ],
            },
        ]);
        let order: Vec<&str> = doc.actionable_tasks().iter().map(|(_, t)| t.id.as_str()).collect();
        assert_eq!(order, vec!["T1", "T2", "T9"]);
    }
}
