//! Git subprocess operations backing the Worktree Manager (C11) and the
//! DAG Scheduler's merge orchestration (C12).

use std::path::{Path, PathBuf};
use std::process::Command;

use autospec_core::types::MergeStrategy;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("merge conflict merging {0} into {1}")]
    MergeConflict(String, String),
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Filesystem-safe slug of a branch name (slashes replaced with `-`).
pub fn sanitize_branch_name(branch: &str) -> String {
    branch.replace('/', "-")
}

pub fn detect_default_branch(repo_root: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["symbolic-ref", "refs/remotes/origin/HEAD"])
        .current_dir(repo_root)
        .output()?;

    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout)
            .map_err(|_| GitError::InvalidUtf8)?
            .trim()
            .to_string();
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        let check = Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{candidate}")])
            .current_dir(repo_root)
            .output()?;
        if check.status.success() {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

pub fn repo_name(repo_root: &Path) -> String {
    repo_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Expand the worktree path template. Template variables: `{{ repo }}`,
/// `{{ feature_id }}`, `{{ feature_id | sanitize }}` (slashes replaced
/// with `-`), with or without surrounding spaces.
pub fn expand_worktree_template(template: &str, repo_root: &Path, feature_id: &str) -> String {
    let repo = repo_name(repo_root);
    let sanitized = sanitize_branch_name(feature_id);

    template
        .replace("{{ repo }}", &repo)
        .replace("{{repo}}", &repo)
        .replace("{{ feature_id | sanitize }}", &sanitized)
        .replace("{{feature_id | sanitize}}", &sanitized)
        .replace("{{ feature_id }}", feature_id)
        .replace("{{feature_id}}", feature_id)
}

pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                components.pop();
            }
            std::path::Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}

pub fn resolve_worktree_path(expanded: &str, repo_root: &Path) -> PathBuf {
    let path = Path::new(expanded);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo_root
            .join(expanded)
            .canonicalize()
            .unwrap_or_else(|_| normalize_path(&repo_root.join(expanded)))
    }
}

pub fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(repo_root)
        .output()?;
    Ok(output.status.success())
}

pub fn create_branch(repo_root: &Path, branch: &str, base: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["branch", branch, base])
        .current_dir(repo_root)
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(String::from_utf8_lossy(&output.stderr).to_string()));
    }
    Ok(())
}

pub fn create_worktree(repo_root: &Path, path: &Path, branch: &str, base: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !branch_exists(repo_root, branch)? {
        create_branch(repo_root, branch, base)?;
    }
    let output = Command::new("git")
        .args(["worktree", "add"])
        .arg(path)
        .arg(branch)
        .current_dir(repo_root)
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(String::from_utf8_lossy(&output.stderr).to_string()));
    }
    Ok(())
}

pub fn remove_worktree(repo_root: &Path, path: &Path) -> Result<()> {
    remove_worktree_inner(repo_root, path, false)
}

pub fn remove_worktree_force(repo_root: &Path, path: &Path) -> Result<()> {
    remove_worktree_inner(repo_root, path, true)
}

fn remove_worktree_inner(repo_root: &Path, path: &Path, force: bool) -> Result<()> {
    let mut args = vec!["worktree".to_string(), "remove".to_string()];
    if force {
        args.push("--force".to_string());
    }
    let output = Command::new("git")
        .args(&args)
        .arg(path)
        .current_dir(repo_root)
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(String::from_utf8_lossy(&output.stderr).to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub commit: String,
}

/// Parse `git worktree list --porcelain` output.
pub fn list_worktrees(repo_root: &Path) -> Result<Vec<WorktreeInfo>> {
    let output = Command::new("git")
        .args(["worktree", "list", "--porcelain"])
        .current_dir(repo_root)
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(String::from_utf8_lossy(&output.stderr).to_string()));
    }
    let text = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;

    let mut result = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut commit = String::new();
    let mut branch: Option<String> = None;

    for line in text.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            if let Some(prev) = path.take() {
                result.push(WorktreeInfo { path: prev, branch: branch.take(), commit: std::mem::take(&mut commit) });
            }
            path = Some(PathBuf::from(p));
        } else if let Some(c) = line.strip_prefix("HEAD ") {
            commit = c.to_string();
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = Some(b.trim_start_matches("refs/heads/").to_string());
        }
    }
    if let Some(prev) = path.take() {
        result.push(WorktreeInfo { path: prev, branch, commit });
    }
    Ok(result)
}

pub fn is_working_tree_clean(repo_root: &Path) -> Result<bool> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(repo_root)
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(String::from_utf8_lossy(&output.stderr).to_string()));
    }
    Ok(output.stdout.is_empty())
}

pub fn checkout_branch(repo_root: &Path, branch: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["checkout", branch])
        .current_dir(repo_root)
        .output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(String::from_utf8_lossy(&output.stderr).to_string()));
    }
    Ok(())
}

pub fn merge_branch(repo_root: &Path, branch: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["merge", "--no-edit", branch])
        .current_dir(repo_root)
        .output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
        let _ = Command::new("git").args(["merge", "--abort"]).current_dir(repo_root).output();
        return Err(GitError::MergeConflict(branch.to_string(), "current branch".to_string()));
    }
    Err(GitError::CommandFailed(stderr.to_string()))
}

pub fn octopus_merge(repo_root: &Path, branches: &[String]) -> Result<()> {
    if branches.is_empty() {
        return Ok(());
    }
    let mut args = vec!["merge".to_string(), "--no-edit".to_string()];
    args.extend(branches.iter().cloned());
    let output = Command::new("git").args(&args).current_dir(repo_root).output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
        let _ = Command::new("git").args(["merge", "--abort"]).current_dir(repo_root).output();
        return Err(GitError::MergeConflict(branches.join(","), "current branch".to_string()));
    }
    Err(GitError::CommandFailed(stderr.to_string()))
}

pub fn squash_merge_branch(repo_root: &Path, branch: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["merge", "--squash", branch])
        .current_dir(repo_root)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("CONFLICT") || stderr.contains("Automatic merge failed") {
            let _ = Command::new("git").args(["merge", "--abort"]).current_dir(repo_root).output();
            return Err(GitError::MergeConflict(branch.to_string(), "current branch".to_string()));
        }
        return Err(GitError::CommandFailed(stderr.to_string()));
    }

    let diff_check = Command::new("git")
        .args(["diff", "--cached", "--quiet"])
        .current_dir(repo_root)
        .status()?;
    if diff_check.success() {
        // Nothing staged; squash produced no changes.
        return Ok(());
    }

    let commit = Command::new("git")
        .args(["commit", "-m", &format!("Squash merge from {branch}")])
        .current_dir(repo_root)
        .output()?;
    if !commit.status.success() {
        return Err(GitError::CommandFailed(String::from_utf8_lossy(&commit.stderr).to_string()));
    }
    Ok(())
}

/// Merge `feature_branch` into `merge_target_branch` per the
/// configured [`MergeStrategy`] (§4.12 "sequential" single-feature
/// step). `Manual` is a no-op; callers never invoke merges at all for
/// `Manual`-strategy DAG runs.
pub fn merge_to_target(
    repo_root: &Path,
    feature_branch: &str,
    merge_target_branch: &str,
    base_branch: &str,
    strategy: MergeStrategy,
    squash: bool,
) -> Result<()> {
    if strategy == MergeStrategy::Manual {
        return Ok(());
    }
    if !is_working_tree_clean(repo_root)? {
        return Err(GitError::DirtyWorkingTree(
            "cannot merge with uncommitted changes".to_string(),
        ));
    }
    if !branch_exists(repo_root, merge_target_branch)? {
        create_branch(repo_root, merge_target_branch, base_branch)?;
    }
    checkout_branch(repo_root, merge_target_branch)?;

    let result = if squash {
        squash_merge_branch(repo_root, feature_branch)
    } else {
        merge_branch(repo_root, feature_branch)
    };

    if let Err(e) = &result {
        tracing::warn!(
            "merge failed, feature branch {} preserved for manual recovery: {}",
            feature_branch,
            e
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git").args(&args).current_dir(dir.path()).output().unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    #[test]
    fn repo_name_uses_directory_basename() {
        assert_eq!(repo_name(Path::new("/home/user/my-project")), "my-project");
    }

    #[test]
    fn expand_worktree_template_sanitizes_feature_id() {
        let expanded = expand_worktree_template(
            "../{{ repo }}.{{ feature_id | sanitize }}",
            Path::new("/home/user/my-project"),
            "007/user-auth",
        );
        assert_eq!(expanded, "../my-project.007-user-auth");
    }

    #[test]
    fn is_working_tree_clean_detects_untracked_files() {
        let dir = setup_test_repo();
        assert!(is_working_tree_clean(dir.path()).unwrap());
        std::fs::write(dir.path().join("untracked.txt"), "data").unwrap();
        assert!(!is_working_tree_clean(dir.path()).unwrap());
    }

    #[test]
    fn merge_to_target_creates_missing_branch() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "007-feature", "HEAD").unwrap();
        checkout_branch(dir.path(), "007-feature").unwrap();
        std::fs::write(dir.path().join("feature.txt"), "content").unwrap();
        Command::new("git").args(["add", "feature.txt"]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "add feature"])
            .current_dir(dir.path())
            .output()
            .unwrap();

        let main_branch = detect_default_branch(dir.path()).unwrap();
        checkout_branch(dir.path(), &main_branch).unwrap();

        merge_to_target(
            dir.path(),
            "007-feature",
            "integration",
            &main_branch,
            MergeStrategy::Sequential,
            true,
        )
        .unwrap();

        assert!(branch_exists(dir.path(), "integration").unwrap());
        assert!(dir.path().join("feature.txt").exists());
    }

    #[test]
    fn merge_to_target_manual_strategy_is_no_op() {
        let dir = setup_test_repo();
        let main_branch = detect_default_branch(dir.path()).unwrap();
        merge_to_target(
            dir.path(),
            "nonexistent",
            "target",
            &main_branch,
            MergeStrategy::Manual,
            true,
        )
        .unwrap();
        assert!(!branch_exists(dir.path(), "target").unwrap());
    }

    #[test]
    fn merge_to_target_fails_on_dirty_tree() {
        let dir = setup_test_repo();
        std::fs::write(dir.path().join("dirty.txt"), "uncommitted").unwrap();
        let main_branch = detect_default_branch(dir.path()).unwrap();
        let result = merge_to_target(
            dir.path(),
            "nonexistent",
            "target",
            &main_branch,
            MergeStrategy::Sequential,
            true,
        );
        assert!(matches!(result, Err(GitError::DirtyWorkingTree(_))));
    }
}
