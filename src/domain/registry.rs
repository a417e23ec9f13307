//! Rule Registry: loads rule sources, validates them, resolves hook
//! references against their hook crates, and indexes rules by import path.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::ast::{walk_crate, ParseCache};
use crate::domain::error::{PipelineError, Result, Stage};
use crate::domain::rule::{HookCrate, HookRef, HookRule, RuleFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFormat {
    Toml,
    Json,
}

/// One rule set: the text of a rule file plus where relative paths in it
/// are resolved from.
#[derive(Debug, Clone)]
pub struct RuleSource {
    pub name: String,
    pub format: RuleFormat,
    pub text: String,
    pub base_dir: PathBuf,
}

impl RuleSource {
    pub fn from_file(path: &Path) -> Result<Self> {
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => RuleFormat::Toml,
            Some("json") => RuleFormat::Json,
            _ => {
                return Err(PipelineError::rule_definition(
                    path.display().to_string(),
                    None,
                    "rule files must end in .toml or .json",
                ))
            }
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::io(Stage::Registry, path, e))?;
        Ok(Self {
            name: path.display().to_string(),
            format,
            text,
            base_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct Registry {
    rules: Vec<Arc<HookRule>>,
    by_path: HashMap<String, Vec<usize>>,
    by_crate: HashMap<String, Vec<usize>>,
    hook_crates: Vec<HookCrate>,
}

impl Registry {
    /// Load every source in order. Registration order is source order, then
    /// order within the source.
    pub fn load(sources: &[RuleSource]) -> Result<Self> {
        let mut rules: Vec<HookRule> = Vec::new();
        let mut hook_crates: Vec<HookCrate> = Vec::new();
        let mut ids: HashMap<String, String> = HashMap::new();

        for source in sources {
            let file: RuleFile = match source.format {
                RuleFormat::Toml => toml::from_str(&source.text)
                    .map_err(|e| PipelineError::rule_definition(&source.name, None, e.to_string()))?,
                RuleFormat::Json => serde_json::from_str(&source.text)
                    .map_err(|e| PipelineError::rule_definition(&source.name, None, e.to_string()))?,
            };
            let hook_crate = HookCrate {
                name: file.hooks.crate_name.replace('-', "_"),
                dir: absolutize(&source.base_dir.join(&file.hooks.path)),
            };
            match hook_crates.iter().find(|h| h.name == hook_crate.name) {
                Some(existing) if existing.dir != hook_crate.dir => {
                    return Err(PipelineError::rule_definition(
                        &source.name,
                        None,
                        format!(
                            "hook crate '{}' is declared at both {} and {}",
                            hook_crate.name,
                            existing.dir.display(),
                            hook_crate.dir.display()
                        ),
                    ));
                }
                Some(_) => {}
                None => hook_crates.push(hook_crate.clone()),
            }

            for def in file.rules {
                let order = rules.len();
                let rule = def
                    .into_rule(order, &source.name, &hook_crate)
                    .map_err(|(id, msg)| PipelineError::rule_definition(&source.name, id.as_deref(), msg))?;
                if let Some(first) = ids.insert(rule.id.clone(), source.name.clone()) {
                    return Err(PipelineError::rule_definition(
                        &source.name,
                        Some(&rule.id),
                        format!("duplicate rule id '{}' (first defined in {})", rule.id, first),
                    ));
                }
                rules.push(rule);
            }
        }

        resolve_hooks(&rules, &hook_crates)?;
        tracing::debug!(rules = rules.len(), hook_crates = hook_crates.len(), "rule registry loaded");
        Ok(Self::from_rules(rules, hook_crates))
    }

    pub fn load_files(paths: &[PathBuf]) -> Result<Self> {
        let sources = paths
            .iter()
            .map(|p| RuleSource::from_file(p))
            .collect::<Result<Vec<_>>>()?;
        Self::load(&sources)
    }

    fn from_rules(rules: Vec<HookRule>, hook_crates: Vec<HookCrate>) -> Self {
        let mut by_path: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_crate: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, rule) in rules.iter().enumerate() {
            by_path.entry(rule.import_path.clone()).or_default().push(i);
            by_crate.entry(rule.target_crate().to_string()).or_default().push(i);
        }
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            by_path,
            by_crate,
            hook_crates,
        }
    }

    /// Rules whose import path is exactly `import_path`, in registration order.
    pub fn lookup(&self, import_path: &str) -> Vec<Arc<HookRule>> {
        self.indexed(self.by_path.get(import_path))
    }

    /// Rules targeting any module of crate `crate_name`.
    pub fn for_crate(&self, crate_name: &str) -> Vec<Arc<HookRule>> {
        self.indexed(self.by_crate.get(crate_name))
    }

    fn indexed(&self, idx: Option<&Vec<usize>>) -> Vec<Arc<HookRule>> {
        idx.map(|v| v.iter().map(|&i| Arc::clone(&self.rules[i])).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<HookRule>> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn rules(&self) -> &[Arc<HookRule>] {
        &self.rules
    }

    pub fn hook_crates(&self) -> &[HookCrate] {
        &self.hook_crates
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// A registry holding the rules for which `keep` holds, registration
    /// order and numbering unchanged.
    pub fn retain<F: Fn(&HookRule) -> bool>(&self, keep: F) -> Self {
        let rules: Vec<HookRule> = self
            .rules
            .iter()
            .filter(|r| keep(r))
            .map(|r| HookRule::clone(r))
            .collect();
        Self::from_rules(rules, self.hook_crates.clone())
    }
}

fn absolutize(path: &Path) -> PathBuf {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    std::fs::canonicalize(&path).unwrap_or(path)
}

/// Library root of a hook crate: `[lib] path` from its manifest, else
/// `src/lib.rs`.
pub fn hook_crate_root(dir: &Path) -> PathBuf {
    let manifest = dir.join("Cargo.toml");
    std::fs::read_to_string(&manifest)
        .ok()
        .and_then(|text| text.parse::<toml::Table>().ok())
        .and_then(|t| {
            t.get("lib")
                .and_then(|l| l.get("path"))
                .and_then(|p| p.as_str())
                .map(|p| dir.join(p))
        })
        .unwrap_or_else(|| dir.join("src").join("lib.rs"))
}

/// Exported `pub fn` paths of a hook crate, relative to its root
/// (`client::on_enter`).
fn exported_functions(hook: &HookCrate, cache: &ParseCache) -> Result<HashSet<String>> {
    let root = hook_crate_root(&hook.dir);
    if !root.is_file() {
        return Err(PipelineError::rule_definition(
            hook.dir.display().to_string(),
            None,
            format!("hook crate '{}' has no library root at {}", hook.name, root.display()),
        ));
    }
    let files = walk_crate(&hook.name, &root, cache).map_err(|e| {
        PipelineError::rule_definition(
            hook.dir.display().to_string(),
            None,
            format!("hook crate '{}' does not parse: {}", hook.name, e),
        )
    })?;

    let prefix = format!("{}::", hook.name);
    let mut out = HashSet::new();
    for file in files.iter().filter(|f| f.exported) {
        for f in &file.scan.functions {
            if !f.is_pub || f.receiver.is_some() || !f.inline_module.is_empty() {
                continue;
            }
            let module = file.module_path.strip_prefix(&prefix).unwrap_or("");
            out.insert(if module.is_empty() || file.module_path == hook.name {
                f.name.clone()
            } else {
                format!("{}::{}", module, f.name)
            });
        }
    }
    Ok(out)
}

fn resolve_hooks(rules: &[HookRule], hook_crates: &[HookCrate]) -> Result<()> {
    let cache = ParseCache::new();
    let mut exported: HashMap<&str, HashSet<String>> = HashMap::new();
    for hook in hook_crates {
        if rules.iter().any(|r| r.hook_crate.name == hook.name) {
            exported.insert(hook.name.as_str(), exported_functions(hook, &cache)?);
        }
    }
    for rule in rules {
        let refs: [(&str, &Option<HookRef>); 2] = [("on_enter", &rule.on_enter), ("on_exit", &rule.on_exit)];
        for (what, hook) in refs {
            let Some(hook) = hook else { continue };
            let found = exported
                .get(hook.hook_crate.as_str())
                .map(|set| set.contains(&hook.path))
                .unwrap_or(false);
            if !found {
                return Err(PipelineError::rule_definition(
                    &rule.source,
                    Some(&rule.id),
                    format!(
                        "{} '{}' is not a public function of hook crate '{}'",
                        what, hook.path, hook.hook_crate
                    ),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook_crate(dir: &Path) {
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(
            dir.join("Cargo.toml"),
            "[package]\nname = \"demo-hooks\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        std::fs::write(dir.join("src/lib.rs"), "pub mod client;\nmod private;\npub fn top() {}\n").unwrap();
        std::fs::write(
            dir.join("src/client.rs"),
            "pub fn on_enter() {}\npub fn on_exit() {}\nfn hidden() {}\n",
        )
        .unwrap();
        std::fs::write(dir.join("src/private.rs"), "pub fn secret() {}\n").unwrap();
    }

    fn source(dir: &Path, name: &str, rules: &str) -> RuleSource {
        RuleSource {
            name: name.to_string(),
            format: RuleFormat::Toml,
            text: format!("[hooks]\ncrate = \"demo-hooks\"\npath = \"hooks\"\n{}", rules),
            base_dir: dir.to_path_buf(),
        }
    }

    const RULE_A: &str = r#"
[[rule]]
id = "a"
import_path = "pkg::client"
receiver = "Client"
function = "do_request"
on_enter = "client::on_enter"
on_exit = "client::on_exit"
"#;

    #[test]
    fn test_load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        hook_crate(&dir.path().join("hooks"));
        let rule_b = RULE_A.replace("\"a\"", "\"b\"").replace("pkg::client", "pkg");
        let registry = Registry::load(&[
            source(dir.path(), "one.toml", RULE_A),
            source(dir.path(), "two.toml", &rule_b.replace("client::on_enter", "top")),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        let hits = registry.lookup("pkg::client");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[0].hook_crate.name, "demo_hooks");
        let ids: Vec<_> = registry.for_crate("pkg").iter().map(|r| r.order).collect();
        assert_eq!(ids, vec![0, 1]);
        assert!(registry.lookup("pkg::server").is_empty());
        assert_eq!(registry.hook_crates().len(), 1);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        hook_crate(&dir.path().join("hooks"));
        let err = Registry::load(&[
            source(dir.path(), "one.toml", RULE_A),
            source(dir.path(), "two.toml", RULE_A),
        ])
        .unwrap_err();
        match err {
            PipelineError::RuleDefinition { source_name, rule, message } => {
                assert_eq!(source_name, "two.toml");
                assert_eq!(rule.as_deref(), Some("a"));
                assert!(message.contains("one.toml"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_undefined_hooks_rejected() {
        let dir = tempfile::tempdir().unwrap();
        hook_crate(&dir.path().join("hooks"));
        for bad in ["client::missing", "client::hidden", "private::secret"] {
            let text = RULE_A.replace("client::on_exit", bad);
            let err = Registry::load(&[source(dir.path(), "one.toml", &text)]).unwrap_err();
            assert!(err.to_string().contains(bad), "{}", err);
        }
    }

    #[test]
    fn test_json_source_and_retain() {
        let dir = tempfile::tempdir().unwrap();
        hook_crate(&dir.path().join("hooks"));
        let json = RuleSource {
            name: "rules.json".into(),
            format: RuleFormat::Json,
            text: r#"{
                "hooks": { "crate": "demo_hooks", "path": "hooks" },
                "rule": [
                    { "id": "x", "import_path": "pkg", "function": "run", "on_exit": "client::on_exit" },
                    { "id": "y", "import_path": "pkg", "function": "stop", "on_exit": "client::on_exit" }
                ]
            }"#
            .into(),
            base_dir: dir.path().to_path_buf(),
        };
        let registry = Registry::load(&[json]).unwrap();
        let kept = registry.retain(|r| r.id == "y");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.rules()[0].order, 1);
        assert!(kept.get("x").is_none());
    }

    #[test]
    fn test_malformed_toml_names_source() {
        let err = Registry::load(&[RuleSource {
            name: "broken.toml".into(),
            format: RuleFormat::Toml,
            text: "[hooks\n".into(),
            base_dir: PathBuf::from("."),
        }])
        .unwrap_err();
        assert!(matches!(err, PipelineError::RuleDefinition { ref source_name, .. } if source_name == "broken.toml"));
    }
}
