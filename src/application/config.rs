//! `hookweave.toml`: per-program pipeline settings.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::domain::injector::ConflictPolicy;

pub const CONFIG_FILE: &str = "hookweave.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Rule files (`.toml` / `.json`), applied in this order.
    pub rules: Vec<PathBuf>,
    /// Rule ids removed at build time; `"all"` removes every rule.
    pub disabled_rules: Vec<String>,
    /// Rule ids that keep a runtime switch (`HOOKWEAVE_DISABLED_RULES`).
    pub runtime_toggle: Vec<String>,
    pub conflict_policy: ConflictPolicy,
    pub prune_unreachable: bool,
    pub offline: bool,
    pub locked: bool,
    pub target_dir: Option<PathBuf>,
    pub keep_work_dir: bool,
    pub workers: Option<usize>,
    pub cargo_args: Vec<String>,
    /// Location of the `hookweave-rt` package.
    pub runtime_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            disabled_rules: Vec::new(),
            runtime_toggle: Vec::new(),
            conflict_policy: ConflictPolicy::Abort,
            prune_unreachable: true,
            offline: false,
            locked: false,
            target_dir: None,
            keep_work_dir: false,
            workers: None,
            cargo_args: Vec::new(),
            runtime_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self> {
        let mut config: Self = toml::from_str(text).context("invalid hookweave configuration")?;
        config.rules = config.rules.iter().map(|p| base_dir.join(p)).collect();
        config.target_dir = config.target_dir.map(|p| base_dir.join(p));
        config.runtime_path = config.runtime_path.map(|p| base_dir.join(p));
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let base = path.parent().unwrap_or(Path::new("."));
        Self::parse(&text, base).with_context(|| format!("in {}", path.display()))
    }

    /// `hookweave.toml` in the program root, or defaults when absent.
    pub fn discover(program_root: &Path) -> Result<Self> {
        let path = program_root.join(CONFIG_FILE);
        if path.is_file() {
            tracing::debug!(config = %path.display(), "configuration loaded");
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// The runtime crate: configured, `$HOOKWEAVE_RT_PATH`, or the copy
    /// next to this tool's sources.
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_path
            .clone()
            .or_else(|| std::env::var_os("HOOKWEAVE_RT_PATH").map(PathBuf::from))
            .unwrap_or_else(|| Path::new(env!("CARGO_MANIFEST_DIR")).join("hookweave-rt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolves_relative_paths() {
        let config = PipelineConfig::parse(
            r#"
            rules = ["rules/http.toml"]
            disabled_rules = ["noisy"]
            conflict_policy = "skip"
            target_dir = "target/hw"
            "#,
            Path::new("/prog"),
        )
        .unwrap();
        assert_eq!(config.rules, vec![PathBuf::from("/prog/rules/http.toml")]);
        assert_eq!(config.conflict_policy, ConflictPolicy::Skip);
        assert_eq!(config.target_dir, Some(PathBuf::from("/prog/target/hw")));
        assert!(config.prune_unreachable);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(PipelineConfig::parse("rulez = []", Path::new("/")).is_err());
    }

    #[test]
    fn test_discover_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::discover(dir.path()).unwrap();
        assert!(config.rules.is_empty());
        assert_eq!(config.conflict_policy, ConflictPolicy::Abort);
    }
}
