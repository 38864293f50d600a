//! Worktree Manager (C11): create/list/remove/prune isolated git
//! worktrees and persist their tracking state (§4.11).

use std::path::{Path, PathBuf};

use autospec_core::types::{WorktreeRecord, WorktreeStatus};
use chrono::Utc;
use fs2::FileExt as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::git::{self, GitError};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worktree '{0}' already exists")]
    AlreadyExists(String),
    #[error("worktree '{0}' not found")]
    NotFound(String),
    #[error("worktree '{0}' has uncommitted or unpushed changes, use --force")]
    NotClean(String),
    #[error("failed to lock worktree state file")]
    Lock,
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct WorktreeState {
    #[serde(default)]
    worktrees: Vec<WorktreeRecord>,
}

/// Persists the worktree tracking file and wraps git worktree
/// operations (§3 "Worktree record", §4.11).
pub struct WorktreeManager {
    state_path: PathBuf,
    repo_root: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            state_path: state_path.into(),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut WorktreeState) -> T) -> Result<T> {
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.state_path)?;
        file.lock_exclusive().map_err(|_| WorktreeError::Lock)?;

        let content = std::fs::read_to_string(&self.state_path)?;
        let mut state: WorktreeState = if content.trim().is_empty() {
            WorktreeState::default()
        } else {
            serde_yaml::from_str(&content).unwrap_or_default()
        };

        let result = f(&mut state);

        let serialized = serde_yaml::to_string(&state).unwrap_or_default();
        std::fs::write(&self.state_path, serialized)?;
        fs2::FileExt::unlock(&file)?;
        Ok(result)
    }

    pub fn create(&self, name: &str, branch: &str, base_branch: &str, path: &Path) -> Result<WorktreeRecord> {
        self.with_state(|state| -> Result<WorktreeRecord> {
            if state.worktrees.iter().any(|w| w.name == name) {
                return Err(WorktreeError::AlreadyExists(name.to_string()));
            }
            if path.exists() {
                return Err(WorktreeError::AlreadyExists(name.to_string()));
            }
            if state.worktrees.iter().any(|w| w.branch == branch) {
                return Err(WorktreeError::AlreadyExists(format!("branch {branch} already checked out elsewhere")));
            }

            git::create_worktree(&self.repo_root, path, branch, base_branch)?;

            let now = Utc::now();
            let record = WorktreeRecord {
                name: name.to_string(),
                absolute_path: path.display().to_string(),
                branch: branch.to_string(),
                created_at: now,
                status: WorktreeStatus::Active,
                setup_completed: false,
                last_accessed: now,
            };
            state.worktrees.push(record.clone());
            Ok(record)
        })?
    }

    pub fn list(&self) -> Result<Vec<WorktreeRecord>> {
        self.with_state(|state| state.worktrees.clone())
    }

    pub fn get(&self, name: &str) -> Result<WorktreeRecord> {
        self.with_state(|state| state.worktrees.iter().find(|w| w.name == name).cloned())?
            .ok_or_else(|| WorktreeError::NotFound(name.to_string()))
    }

    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        let record = self.get(name)?;
        let path = Path::new(&record.absolute_path);

        if !force {
            let clean = git::is_working_tree_clean(path).unwrap_or(false);
            if !clean {
                return Err(WorktreeError::NotClean(name.to_string()));
            }
        }

        if force {
            git::remove_worktree_force(&self.repo_root, path)?;
        } else {
            git::remove_worktree(&self.repo_root, path)?;
        }

        self.with_state(|state| {
            state.worktrees.retain(|w| w.name != name);
        })
    }

    /// Run the user-configurable setup script
    /// `.autospec/scripts/worktree-setup.sh` in the new worktree.
    /// Failure is logged but does not roll back worktree creation.
    pub fn setup(&self, name: &str) -> Result<()> {
        let record = self.get(name)?;
        let script = self.repo_root.join(".autospec/scripts/worktree-setup.sh");
        if !script.exists() {
            return self.with_state(|state| {
                if let Some(w) = state.worktrees.iter_mut().find(|w| w.name == name) {
                    w.setup_completed = true;
                }
            });
        }

        let status = std::process::Command::new(&script)
            .arg(&record.absolute_path)
            .arg(&record.name)
            .arg(&record.branch)
            .current_dir(&record.absolute_path)
            .status();

        let completed = matches!(status, Ok(s) if s.success());
        if !completed {
            tracing::warn!(name, "worktree setup script failed or was not found");
        }
        self.with_state(|state| {
            if let Some(w) = state.worktrees.iter_mut().find(|w| w.name == name) {
                w.setup_completed = completed;
            }
        })
    }

    /// Re-sync tracked state with the filesystem and `git worktree
    /// list`, marking entries whose path no longer exists `stale`.
    pub fn prune(&self) -> Result<Vec<String>> {
        let live_paths: Vec<PathBuf> = git::list_worktrees(&self.repo_root)
            .map(|v| v.into_iter().map(|w| w.path).collect())
            .unwrap_or_default();

        self.with_state(|state| {
            let mut pruned = Vec::new();
            for w in &mut state.worktrees {
                let path = Path::new(&w.absolute_path);
                let still_live = path.exists() && live_paths.iter().any(|p| p == path);
                if !still_live && w.status != WorktreeStatus::Stale {
                    w.status = WorktreeStatus::Stale;
                    pruned.push(w.name.clone());
                }
            }
            pruned
        })
    }

    pub fn update_status(&self, name: &str, status: WorktreeStatus) -> Result<()> {
        self.with_state(|state| {
            if let Some(w) = state.worktrees.iter_mut().find(|w| w.name == name) {
                w.status = status;
                w.last_accessed = Utc::now();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init", "--initial-branch=main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git").args(&args).current_dir(dir.path()).output().unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# t").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "init"]).current_dir(dir.path()).output().unwrap();
        dir
    }

    #[test]
    fn create_then_list_round_trips() {
        let repo = setup_test_repo();
        let state_path = repo.path().join(".autospec/state/worktrees.yaml");
        let manager = WorktreeManager::new(repo.path(), state_path);

        let wt_path = repo.path().parent().unwrap().join("wt-007");
        manager.create("007-user-auth", "007-user-auth", "main", &wt_path).unwrap();

        let list = manager.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "007-user-auth");

        std::fs::remove_dir_all(&wt_path).ok();
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let repo = setup_test_repo();
        let state_path = repo.path().join(".autospec/state/worktrees.yaml");
        let manager = WorktreeManager::new(repo.path(), state_path);

        let wt_path = repo.path().parent().unwrap().join("wt-dup");
        manager.create("dup", "dup-branch", "main", &wt_path).unwrap();
        let err = manager.create("dup", "dup-branch-2", "main", &wt_path.with_extension("2"));
        assert!(matches!(err, Err(WorktreeError::AlreadyExists(_))));

        std::fs::remove_dir_all(&wt_path).ok();
    }
}
