//! Layered configuration.
//!
//! Precedence (lowest to highest): built-in defaults, the user file
//! (`~/.config/autospec/config.yml`), the project file
//! (`<repo>/.autospec/config.yml`), environment variables (`AUTOSPEC_*`),
//! then CLI flags. Each layer is parsed as a partial (`Option`-wrapped)
//! document and merged field-by-field onto the previous layer; unknown
//! keys are reported but do not abort the merge, so newer project files
//! stay loadable by older binaries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MergeStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Resolved, immutable configuration. Produced once by
/// [`Configuration::load`] and passed by value to every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub specs_dir: PathBuf,
    pub agent: String,
    pub max_retries: u32,
    pub agent_timeout_sec: u64,
    pub hook_timeout_sec: u64,
    pub auto_commit: bool,
    pub output_style: OutputStyle,
    pub base_branch: Option<String>,
    pub run_branch_prefix: String,
    pub merge_target_branch: Option<String>,
    pub merge_strategy: MergeStrategy,
    pub worktree_path_template: String,
    pub worktree_base_dir: Option<PathBuf>,
    pub max_parallel: usize,
    pub skip_preflight: bool,
    pub hooks: HashMap<String, HookConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStyle {
    #[default]
    Default,
    Compact,
    Minimal,
    Plain,
    Raw,
}

/// One `hooks.<event-key>` entry (§4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    pub command: String,
    pub mode: HookMode,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub only_on_success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookMode {
    Gate,
    Checkpoint,
    BestEffort,
    FireAndForget,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            specs_dir: PathBuf::from("specs"),
            agent: "claude".to_string(),
            max_retries: 3,
            agent_timeout_sec: 1800,
            hook_timeout_sec: 300,
            auto_commit: false,
            output_style: OutputStyle::Default,
            base_branch: None,
            run_branch_prefix: "".to_string(),
            merge_target_branch: None,
            merge_strategy: MergeStrategy::Sequential,
            worktree_path_template: "../{{ repo }}.{{ feature_id | sanitize }}".to_string(),
            worktree_base_dir: None,
            max_parallel: 3,
            skip_preflight: false,
            hooks: HashMap::new(),
        }
    }
}

/// A partial configuration document as parsed from a single YAML layer;
/// every field is optional so a layer may override only what it sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialConfiguration {
    pub specs_dir: Option<PathBuf>,
    pub agent: Option<String>,
    pub max_retries: Option<u32>,
    pub agent_timeout_sec: Option<u64>,
    pub hook_timeout_sec: Option<u64>,
    pub auto_commit: Option<bool>,
    pub output_style: Option<OutputStyle>,
    pub base_branch: Option<String>,
    pub run_branch_prefix: Option<String>,
    pub merge_target_branch: Option<String>,
    pub merge_strategy: Option<MergeStrategy>,
    pub worktree_path_template: Option<String>,
    pub worktree_base_dir: Option<PathBuf>,
    pub max_parallel: Option<usize>,
    pub skip_preflight: Option<bool>,
    #[serde(default)]
    pub hooks: HashMap<String, HookConfig>,
}

impl Configuration {
    /// Merge one partial layer on top of `self`, returning the result.
    /// Unset fields in `layer` leave the existing value untouched.
    pub fn merge_from(mut self, layer: PartialConfiguration) -> Self {
        if let Some(v) = layer.specs_dir {
            self.specs_dir = v;
        }
        if let Some(v) = layer.agent {
            self.agent = v;
        }
        if let Some(v) = layer.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = layer.agent_timeout_sec {
            self.agent_timeout_sec = v;
        }
        if let Some(v) = layer.hook_timeout_sec {
            self.hook_timeout_sec = v;
        }
        if let Some(v) = layer.auto_commit {
            self.auto_commit = v;
        }
        if let Some(v) = layer.output_style {
            self.output_style = v;
        }
        if layer.base_branch.is_some() {
            self.base_branch = layer.base_branch;
        }
        if let Some(v) = layer.run_branch_prefix {
            self.run_branch_prefix = v;
        }
        if layer.merge_target_branch.is_some() {
            self.merge_target_branch = layer.merge_target_branch;
        }
        if let Some(v) = layer.merge_strategy {
            self.merge_strategy = v;
        }
        if let Some(v) = layer.worktree_path_template {
            self.worktree_path_template = v;
        }
        if layer.worktree_base_dir.is_some() {
            self.worktree_base_dir = layer.worktree_base_dir;
        }
        if let Some(v) = layer.max_parallel {
            self.max_parallel = v;
        }
        if let Some(v) = layer.skip_preflight {
            self.skip_preflight = v;
        }
        for (k, v) in layer.hooks {
            self.hooks.insert(k, v);
        }
        self
    }

    /// Parse one YAML layer from disk. A missing file is not an error —
    /// callers skip layers that don't exist.
    pub fn load_file(path: &Path) -> Result<PartialConfiguration, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `AUTOSPEC_*` environment overrides, the narrow set this
    /// spec names explicitly (§6 "Environment variables").
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("AUTOSPEC_AGENT") {
            self.agent = v;
        }
        if let Ok(v) = std::env::var("AUTOSPEC_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("AUTOSPEC_SPECS_DIR") {
            self.specs_dir = PathBuf::from(v);
        }
        self
    }

    /// Full layered load: defaults → user file → project file → env.
    /// CLI flags are applied afterward by the caller via `merge_from`.
    pub fn load(
        user_config_path: Option<&Path>,
        project_config_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(path) = user_config_path {
            if path.exists() {
                cfg = cfg.merge_from(Self::load_file(path)?);
            }
        }
        if let Some(path) = project_config_path {
            if path.exists() {
                cfg = cfg.merge_from(Self::load_file(path)?);
            }
        }
        Ok(cfg.apply_env())
    }

    /// Absolutize path-valued fields against the repository root, the
    /// way the teacher's `resolve_paths` step does for its own config.
    pub fn resolve_paths(&mut self, repo_root: &Path) {
        if self.specs_dir.is_relative() {
            self.specs_dir = repo_root.join(&self.specs_dir);
        }
        if let Some(dir) = &self.worktree_base_dir {
            if dir.is_relative() {
                self.worktree_base_dir = Some(repo_root.join(dir));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_three_retries() {
        assert_eq!(Configuration::default().max_retries, 3);
    }

    #[test]
    fn merge_overrides_only_set_fields() {
        let base = Configuration::default();
        let layer = PartialConfiguration {
            agent: Some("opencode".to_string()),
            ..Default::default()
        };
        let merged = base.merge_from(layer);
        assert_eq!(merged.agent, "opencode");
        assert_eq!(merged.max_retries, 3);
    }

    #[test]
    fn missing_layer_file_is_not_loaded() {
        let cfg = Configuration::load(Some(Path::new("/nonexistent/config.yml")), None).unwrap();
        assert_eq!(cfg.agent, "claude");
    }

    #[test]
    fn resolve_paths_absolutizes_relative_specs_dir() {
        let mut cfg = Configuration::default();
        cfg.resolve_paths(Path::new("/repo"));
        assert_eq!(cfg.specs_dir, PathBuf::from("/repo/specs"));
    }
}
