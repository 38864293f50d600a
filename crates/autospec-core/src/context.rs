//! Prereqs & Context (C2): feature resolution and template variables.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::artifacts::ArtifactType;
use crate::error::{AutospecError, Result};
use crate::types::Stage;

/// Template substitution context computed fresh for every stage
/// invocation (§4.2).
#[derive(Debug, Clone, Serialize)]
pub struct Context {
    pub is_git_repo: bool,
    pub repo_root: PathBuf,
    pub feature_id: String,
    pub feature_dir: PathBuf,
    pub feature_spec: PathBuf,
    pub impl_plan: PathBuf,
    pub tasks_file: PathBuf,
    pub checklist_file: PathBuf,
    pub analysis_file: PathBuf,
    pub autospec_version: String,
    pub created_date: String,
}

/// A pattern matching `NNN-slug`: three digits, a dash, then
/// lowercase alphanumerics and dashes.
pub fn is_feature_branch(name: &str) -> bool {
    let mut parts = name.splitn(2, '-');
    let Some(digits) = parts.next() else { return false };
    let Some(slug) = parts.next() else { return false };
    digits.len() == 3
        && digits.chars().all(|c| c.is_ascii_digit())
        && !slug.is_empty()
        && slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Resolve the feature id from, in priority order: an explicit
/// `--spec` override, `SPECIFY_FEATURE`, then the current git branch.
pub fn resolve_feature_id(explicit: Option<&str>, current_branch: Option<&str>) -> Option<String> {
    if let Some(id) = explicit {
        return Some(id.to_string());
    }
    if let Ok(env_feature) = std::env::var("SPECIFY_FEATURE") {
        if !env_feature.is_empty() {
            return Some(env_feature);
        }
    }
    current_branch
        .filter(|b| is_feature_branch(b))
        .map(ToString::to_string)
}

impl Context {
    pub fn compute(
        specs_dir: &Path,
        repo_root: &Path,
        is_git_repo: bool,
        explicit_feature: Option<&str>,
        current_branch: Option<&str>,
        version: &str,
    ) -> Result<Self> {
        let feature_id = resolve_feature_id(explicit_feature, current_branch)
            .ok_or_else(|| AutospecError::FeatureNotResolved(
                "no --spec flag, SPECIFY_FEATURE, or matching feature branch".to_string(),
            ))?;
        let feature_dir = specs_dir.join(&feature_id);
        Ok(Self {
            is_git_repo,
            repo_root: repo_root.to_path_buf(),
            feature_spec: feature_dir.join(ArtifactType::Spec.file_name()),
            impl_plan: feature_dir.join(ArtifactType::Plan.file_name()),
            tasks_file: feature_dir.join(ArtifactType::Tasks.file_name()),
            checklist_file: feature_dir.join(ArtifactType::Checklist.file_name()),
            analysis_file: feature_dir.join(ArtifactType::Analysis.file_name()),
            feature_dir,
            feature_id,
            autospec_version: version.to_string(),
            created_date: Utc::now().to_rfc3339(),
        })
    }
}

/// Static table of artifacts a stage requires to already exist.
/// (§4.2 `GetRequiredArtifacts`.)
pub fn required_artifacts(stage: Stage) -> &'static [ArtifactType] {
    match stage {
        Stage::Constitution => &[],
        Stage::Specify => &[ArtifactType::Constitution],
        Stage::Clarify => &[ArtifactType::Constitution, ArtifactType::Spec],
        Stage::Plan => &[ArtifactType::Constitution, ArtifactType::Spec],
        Stage::Tasks => &[ArtifactType::Constitution, ArtifactType::Spec, ArtifactType::Plan],
        Stage::Checklist => &[ArtifactType::Constitution, ArtifactType::Spec],
        Stage::Analyze => &[
            ArtifactType::Constitution,
            ArtifactType::Spec,
            ArtifactType::Plan,
            ArtifactType::Tasks,
        ],
        Stage::Implement => &[
            ArtifactType::Constitution,
            ArtifactType::Spec,
            ArtifactType::Plan,
            ArtifactType::Tasks,
        ],
    }
}

impl Context {
    /// Resolve the absolute path for a given required artifact.
    pub fn artifact_path(&self, kind: ArtifactType, repo_root: &Path) -> PathBuf {
        match kind {
            ArtifactType::Constitution => repo_root.join(".autospec").join(kind.file_name()),
            ArtifactType::Spec => self.feature_spec.clone(),
            ArtifactType::Plan => self.impl_plan.clone(),
            ArtifactType::Tasks => self.tasks_file.clone(),
            ArtifactType::Checklist => self.checklist_file.clone(),
            ArtifactType::Clarification => self.feature_dir.join(kind.file_name()),
            ArtifactType::Analysis => self.analysis_file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_branch_pattern_matches_spec_format() {
        assert!(is_feature_branch("007-user-auth"));
        assert!(!is_feature_branch("main"));
        assert!(!is_feature_branch("7-user-auth"));
        assert!(!is_feature_branch("007-"));
        assert!(!is_feature_branch("007-User-Auth"));
    }

    #[test]
    fn explicit_flag_wins_over_branch() {
        let id = resolve_feature_id(Some("002-foo"), Some("001-bar"));
        assert_eq!(id.as_deref(), Some("002-foo"));
    }

    #[test]
    fn falls_back_to_branch_when_nothing_else_matches() {
        std::env::remove_var("SPECIFY_FEATURE");
        let id = resolve_feature_id(None, Some("003-baz"));
        assert_eq!(id.as_deref(), Some("003-baz"));
    }

    #[test]
    fn non_matching_branch_resolves_to_none() {
        std::env::remove_var("SPECIFY_FEATURE");
        let id = resolve_feature_id(None, Some("main"));
        assert_eq!(id, None);
    }

    #[test]
    fn compute_fails_when_no_feature_resolvable() {
        std::env::remove_var("SPECIFY_FEATURE");
        let err = Context::compute(
            Path::new("specs"),
            Path::new("/repo"),
            true,
            None,
            Some("main"),
            "0.2.0",
        )
        .unwrap_err();
        assert!(matches!(err, AutospecError::FeatureNotResolved(_)));
    }

    #[test]
    fn plan_requires_spec_and_constitution() {
        assert_eq!(
            required_artifacts(Stage::Plan),
            &[ArtifactType::Constitution, ArtifactType::Spec]
        );
    }
}
