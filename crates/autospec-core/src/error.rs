//! Error taxonomy and exit-code mapping shared by every component.

use thiserror::Error;

/// Top-level error kind. Every component error converts into one of
/// these via `From` so the CLI can pick an exit code without knowing
/// which component failed.
#[derive(Debug, Error)]
pub enum AutospecError {
    #[error("invalid arguments: {0}")]
    ArgumentsInvalid(String),

    #[error("prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    #[error("missing dependency: {0}")]
    DependencyMissing(String),

    #[error("constitution missing: {0}")]
    ConstitutionMissing(String),

    #[error("artifact invalid: {0}")]
    ArtifactInvalid(String),

    #[error("agent failed: {0}")]
    AgentFailed(String),

    #[error("agent timed out after {0}s")]
    AgentTimeout(u64),

    #[error("retry limit exhausted for {feature}/{stage} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        feature: String,
        stage: String,
        attempts: u32,
        last_error: String,
    },

    #[error("dependency cycle detected involving: [{}]", .0.join(" "))]
    DagCycle(Vec<String>),

    #[error("merge conflict merging {branch} into {target}")]
    MergeConflict { branch: String, target: String },

    #[error("io failure: {0}")]
    IoFailure(String),

    #[error("feature could not be resolved: {0}")]
    FeatureNotResolved(String),
}

impl AutospecError {
    /// Process exit code for this error kind (§7 error-handling table).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ArgumentsInvalid(_)
            | Self::PrerequisiteMissing(_)
            | Self::ConstitutionMissing(_)
            | Self::FeatureNotResolved(_) => 3,
            Self::DependencyMissing(_) => 4,
            Self::ArtifactInvalid(_) | Self::DagCycle(_) | Self::MergeConflict { .. } | Self::IoFailure(_) => 1,
            Self::AgentFailed(_) => 2,
            Self::AgentTimeout(_) => 5,
            Self::RetryExhausted { .. } => 2,
        }
    }

    /// A short, user-facing remediation line, if one applies.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::PrerequisiteMissing(what) => {
                Some(format!("produce it first, then re-run this command ({what})"))
            }
            Self::ConstitutionMissing(_) => {
                Some("run 'autospec constitution' to create .autospec/constitution.yaml".to_string())
            }
            Self::DependencyMissing(what) => Some(format!("install or configure {what} and retry")),
            Self::DagCycle(nodes) => Some(format!(
                "remove one of the dependency edges among: {}",
                nodes.join(", ")
            )),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AutospecError {
    fn from(e: std::io::Error) -> Self {
        Self::IoFailure(e.to_string())
    }
}

impl From<serde_yaml::Error> for AutospecError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::ArtifactInvalid(e.to_string())
    }
}

impl From<crate::artifacts::ArtifactError> for AutospecError {
    fn from(e: crate::artifacts::ArtifactError) -> Self {
        Self::ArtifactInvalid(e.to_string())
    }
}

impl From<crate::retry::RetryStoreError> for AutospecError {
    fn from(e: crate::retry::RetryStoreError) -> Self {
        Self::IoFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AutospecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_taxonomy() {
        assert_eq!(AutospecError::ArgumentsInvalid("x".into()).exit_code(), 3);
        assert_eq!(AutospecError::DependencyMissing("git".into()).exit_code(), 4);
        assert_eq!(AutospecError::AgentTimeout(30).exit_code(), 5);
        assert_eq!(
            AutospecError::RetryExhausted {
                feature: "007-x".into(),
                stage: "plan".into(),
                attempts: 3,
                last_error: "boom".into(),
            }
            .exit_code(),
            2
        );
    }

    #[test]
    fn dag_cycle_message_lists_nodes() {
        let err = AutospecError::DagCycle(vec!["A".into(), "B".into(), "C".into()]);
        assert_eq!(err.to_string(), "dependency cycle detected involving: [A B C]");
    }
}
