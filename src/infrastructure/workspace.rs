//! Isolated working copy of the program and of every dependency the
//! pipeline rewrites. The original tree is only ever read.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use toml::{Table, Value};

use crate::domain::error::{PipelineError, Result, Stage};
use crate::domain::graph::{DependencyGraph, PackageSource};
use crate::domain::instrumented::InstrumentedFile;
use crate::domain::rule::HookCrate;
use crate::domain::trampoline::RUNTIME_CRATE;

const SKIP_DIRS: &[&str] = &["target", ".git", "hookweave-debug"];
const DEP_TABLES: &[&str] = &["dependencies", "dev-dependencies", "build-dependencies"];
const RUNTIME_PACKAGE: &str = "hookweave-rt";

/// What the working copy must contain besides the program itself.
#[derive(Debug, Clone, Copy)]
pub struct MaterializePlan<'a> {
    /// Packages that receive instrumentation.
    pub instrumented: &'a [usize],
    pub hook_crates: &'a [HookCrate],
    /// Directory of the `hookweave-rt` package, used when the dependency
    /// graph has none of its own.
    pub runtime_dir: &'a Path,
}

#[derive(Debug, Clone)]
struct Relocation {
    original: PathBuf,
    copy: PathBuf,
}

#[derive(Debug)]
pub struct WorkingCopy {
    dir: Option<TempDir>,
    /// Directory holding the copy, the `deps/` tree, and reports.
    pub base: PathBuf,
    /// Copy of the program root.
    pub root: PathBuf,
    relocations: Vec<Relocation>,
    /// Registry or git packages replaced through `[patch]`.
    pub patched: Vec<String>,
}

fn io(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |e| PipelineError::io(Stage::Resolver, path, e)
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Copy `from` into `to`, skipping build output and VCS metadata. Returns
/// the manifests found on the way.
fn copy_tree(from: &Path, to: &Path, manifests: &mut Vec<PathBuf>) -> Result<()> {
    fs::create_dir_all(to).map_err(io(to))?;
    for entry in fs::read_dir(from).map_err(io(from))? {
        let entry = entry.map_err(io(from))?;
        let path = entry.path();
        let name = entry.file_name();
        let target = to.join(&name);
        // Follows symlinks.
        let meta = fs::metadata(&path).map_err(io(&path))?;
        if meta.is_dir() {
            if SKIP_DIRS.iter().any(|s| name == *s) {
                continue;
            }
            copy_tree(&path, &target, manifests)?;
        } else if meta.is_file() {
            fs::copy(&path, &target).map_err(io(&path))?;
            if name == "Cargo.toml" {
                manifests.push(target);
            }
        }
    }
    Ok(())
}

fn read_manifest(path: &Path) -> Result<Table> {
    let text = fs::read_to_string(path).map_err(io(path))?;
    text.parse::<Table>()
        .map_err(|e| PipelineError::unresolved(path.display().to_string(), format!("invalid manifest: {}", e)))
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

impl WorkingCopy {
    /// Copy the program root and the packages that must be rewritten into a
    /// fresh temporary directory and wire them together.
    ///
    /// Relocated: every path package outside the program root (so relative
    /// paths keep working) and every instrumented registry or git package,
    /// which is then substituted through `[patch]`.
    pub fn materialize(graph: &DependencyGraph, plan: MaterializePlan<'_>) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("hookweave-")
            .tempdir()
            .map_err(io(Path::new("<tempdir>")))?;
        let base = dir.path().to_path_buf();
        let root = base.join("ws");

        let mut manifests: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut found = Vec::new();
        copy_tree(&graph.workspace_root, &root, &mut found)?;
        for copy in found {
            let rel = copy.strip_prefix(&root).unwrap_or(&copy).to_path_buf();
            manifests.push((copy, graph.workspace_root.join(rel)));
        }

        let mut relocations = vec![Relocation {
            original: graph.workspace_root.clone(),
            copy: root.clone(),
        }];
        let mut patches: BTreeMap<String, Table> = BTreeMap::new();
        let mut patched = Vec::new();

        for (idx, package) in graph.packages.iter().enumerate() {
            let pkg_root = package.root_dir();
            if pkg_root.starts_with(&graph.workspace_root) {
                continue;
            }
            let instrumented = plan.instrumented.contains(&idx);
            let patch_key = package.source.patch_key();
            if package.source != PackageSource::Path && !instrumented {
                continue;
            }
            let mut copy = base.join("deps").join(format!("{}-{}", package.name, package.version));
            let mut n = 1;
            while copy.exists() {
                copy = base.join("deps").join(format!("{}-{}-{}", package.name, package.version, n));
                n += 1;
            }
            let mut found = Vec::new();
            copy_tree(&pkg_root, &copy, &mut found)?;
            manifests.push((copy.join("Cargo.toml"), package.manifest_path.clone()));
            relocations.push(Relocation {
                original: pkg_root,
                copy: copy.clone(),
            });

            if let Some(key) = patch_key {
                let table = patches.entry(key).or_default();
                let mut entry = Table::new();
                entry.insert("path".into(), path_value(&copy));
                let mut name = package.name.clone();
                if table.contains_key(&name) {
                    entry.insert("package".into(), Value::String(package.name.clone()));
                    name = format!("{}-hw{}", package.name, table.len());
                }
                table.insert(name, Value::Table(entry));
                patched.push(package.label());
            }
        }

        let wc = Self {
            dir: Some(dir),
            base,
            root,
            relocations,
            patched,
        };
        wc.rewrite_manifests(graph, &manifests, plan, patches)?;
        tracing::info!(
            root = %wc.root.display(),
            relocated = wc.relocations.len() - 1,
            patched = wc.patched.len(),
            "working copy materialized"
        );
        Ok(wc)
    }

    fn rewrite_manifests(
        &self,
        graph: &DependencyGraph,
        manifests: &[(PathBuf, PathBuf)],
        plan: MaterializePlan<'_>,
        patches: BTreeMap<String, Table>,
    ) -> Result<()> {
        let instrumented_manifests: Vec<PathBuf> = plan
            .instrumented
            .iter()
            .filter_map(|&i| self.copy_path(&graph.packages[i].manifest_path))
            .collect();
        let root_manifest = self.root.join("Cargo.toml");
        let mut extra = Table::new();
        if !plan.instrumented.is_empty() {
            // The runtime and hook crates may themselves be program packages;
            // then the copy is used, so one package never has two sources.
            // A runtime the program already resolves wins over the configured one.
            let runtime = match graph.by_name(RUNTIME_PACKAGE).next() {
                Some(idx) => graph.packages[idx].root_dir(),
                None => fs::canonicalize(plan.runtime_dir).map_err(io(plan.runtime_dir))?,
            };
            let runtime = self.copy_path(&runtime).unwrap_or(runtime);
            extra.insert(
                RUNTIME_CRATE.to_string(),
                dependency_entry(&runtime, RUNTIME_CRATE, RUNTIME_PACKAGE)?,
            );
            for hook in plan.hook_crates {
                let name = package_name(&hook.dir)?;
                let dir = self.copy_path(&hook.dir).unwrap_or_else(|| hook.dir.clone());
                extra.insert(hook.name.clone(), dependency_entry(&dir, &hook.name, &name)?);
            }
        }

        for (copy, original) in manifests {
            let mut table = read_manifest(copy)?;
            let original_dir = original.parent().unwrap_or(Path::new(""));
            self.rewrite_path_deps(&mut table, original_dir);

            if instrumented_manifests.contains(copy) {
                let deps = table
                    .entry("dependencies")
                    .or_insert_with(|| Value::Table(Table::new()));
                if let Value::Table(deps) = deps {
                    for (key, value) in &extra {
                        let dashed = key.replace('_', "-");
                        if !deps.contains_key(key) && !deps.contains_key(&dashed) {
                            deps.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            if *copy == root_manifest && !patches.is_empty() {
                let patch = table
                    .entry("patch")
                    .or_insert_with(|| Value::Table(Table::new()));
                if let Value::Table(patch) = patch {
                    for (source, entries) in &patches {
                        let slot = patch
                            .entry(source.clone())
                            .or_insert_with(|| Value::Table(Table::new()));
                        if let Value::Table(slot) = slot {
                            slot.extend(entries.clone());
                        }
                    }
                }
            }

            let text = toml::to_string(&table)
                .map_err(|e| PipelineError::Config(format!("cannot write {}: {}", copy.display(), e)))?;
            fs::write(copy, text).map_err(io(copy))?;
        }
        Ok(())
    }

    /// Point every `path` dependency at an absolute location: the copy when
    /// the target was relocated, the original otherwise.
    fn rewrite_path_deps(&self, table: &mut Table, original_dir: &Path) {
        let rewrite = |deps: &mut Value| {
            let Value::Table(deps) = deps else { return };
            for (_, dep) in deps.iter_mut() {
                let Value::Table(dep) = dep else { continue };
                let Some(Value::String(rel)) = dep.get("path") else { continue };
                let original = normalize_path(&original_dir.join(rel));
                let target = self.copy_path(&original).unwrap_or(original);
                dep.insert("path".into(), path_value(&target));
            }
        };
        for key in DEP_TABLES {
            if let Some(deps) = table.get_mut(*key) {
                rewrite(deps);
            }
        }
        if let Some(Value::Table(targets)) = table.get_mut("target") {
            for (_, cfg) in targets.iter_mut() {
                if let Value::Table(cfg) = cfg {
                    for key in DEP_TABLES {
                        if let Some(deps) = cfg.get_mut(*key) {
                            rewrite(deps);
                        }
                    }
                }
            }
        }
        if let Some(Value::Table(ws)) = table.get_mut("workspace") {
            if let Some(deps) = ws.get_mut("dependencies") {
                rewrite(deps);
            }
        }
        if let Some(Value::Table(patch)) = table.get_mut("patch") {
            for (_, source) in patch.iter_mut() {
                rewrite(source);
            }
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("Cargo.toml")
    }

    /// Where an original path lives in the copy, if it was copied.
    pub fn copy_path(&self, original: &Path) -> Option<PathBuf> {
        self.relocations
            .iter()
            .filter(|r| original.starts_with(&r.original))
            .max_by_key(|r| r.original.components().count())
            .and_then(|r| original.strip_prefix(&r.original).ok().map(|rest| r.copy.join(rest)))
    }

    /// Inverse of [`Self::copy_path`].
    pub fn original_path(&self, copy: &Path) -> Option<PathBuf> {
        self.relocations
            .iter()
            .filter(|r| copy.starts_with(&r.copy))
            .max_by_key(|r| r.copy.components().count())
            .and_then(|r| copy.strip_prefix(&r.copy).ok().map(|rest| r.original.join(rest)))
    }

    /// Write every modified file to its place in the copy.
    pub fn write_files(&self, files: &[InstrumentedFile]) -> Result<usize> {
        let mut written = 0;
        for file in files.iter().filter(|f| f.is_modified()) {
            let Some(target) = self.copy_path(file.original_path()) else {
                return Err(PipelineError::unresolved(
                    file.original_path().display().to_string(),
                    "instrumented file is outside the working copy",
                ));
            };
            fs::write(&target, file.text()).map_err(io(&target))?;
            written += 1;
        }
        tracing::debug!(written, "instrumented files written");
        Ok(written)
    }

    pub fn write_report(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.base.join(name);
        fs::write(&path, contents).map_err(io(&path))?;
        Ok(path)
    }

    /// Pretty-printed copies of the instrumented files under
    /// `hookweave-debug/`, mirroring their place in the copy.
    pub fn write_debug_copies(&self, files: &[InstrumentedFile]) -> Result<usize> {
        let debug_root = self.base.join("hookweave-debug");
        let mut written = 0;
        for file in files.iter().filter(|f| f.is_modified()) {
            let Some(copy) = self.copy_path(file.original_path()) else {
                continue;
            };
            let rel = copy.strip_prefix(&self.base).unwrap_or(&copy);
            let target = debug_root.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io(parent))?;
            }
            match file.prettified() {
                Ok(text) => {
                    fs::write(&target, text).map_err(io(&target))?;
                    written += 1;
                }
                Err(e) => tracing::warn!(file = %copy.display(), error = %e, "could not pretty-print"),
            }
        }
        Ok(written)
    }

    /// Keep the directory on disk after this value is dropped.
    pub fn persist(&mut self) -> PathBuf {
        if let Some(dir) = self.dir.take() {
            let _ = dir.keep();
        }
        self.base.clone()
    }
}

fn package_name(dir: &Path) -> Result<String> {
    let manifest = dir.join("Cargo.toml");
    let table = read_manifest(&manifest)?;
    table
        .get("package")
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| PipelineError::unresolved(manifest.display().to_string(), "manifest has no package name"))
}

fn dependency_entry(dir: &Path, key: &str, package: &str) -> Result<Value> {
    let dir = fs::canonicalize(dir).map_err(io(dir))?;
    let mut entry = Table::new();
    entry.insert("path".into(), path_value(&dir));
    if key != package {
        entry.insert("package".into(), Value::String(package.to_string()));
    }
    Ok(Value::Table(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::PackageNode;
    use cargo_metadata::semver::Version;

    fn write(path: &Path, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    fn node(name: &str, dir: &Path, member: bool) -> PackageNode {
        PackageNode {
            id: name.to_string(),
            name: name.to_string(),
            crate_name: name.to_string(),
            version: Version::new(0, 1, 0),
            manifest_path: dir.join("Cargo.toml"),
            lib_root: Some(dir.join("src/lib.rs")),
            bin_roots: Vec::new(),
            edition: "2021".to_string(),
            source: PackageSource::Path,
            is_member: member,
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
    }

    #[test]
    fn test_materialize_relocates_and_wires() {
        let orig = tempfile::tempdir().unwrap();
        let ws = orig.path().join("ws");
        let util = orig.path().join("util");
        let rt = orig.path().join("rt");
        write(
            &ws.join("Cargo.toml"),
            "[package]\nname = \"app\"\nversion = \"0.1.0\"\n\n[dependencies]\nutil = { path = \"../util\" }\n",
        );
        write(&ws.join("src/lib.rs"), "pub fn app() {}\n");
        write(&ws.join("target/debug/junk"), "x");
        write(&util.join("Cargo.toml"), "[package]\nname = \"util\"\nversion = \"0.1.0\"\n");
        write(&util.join("src/lib.rs"), "pub fn util() {}\n");
        write(&rt.join("Cargo.toml"), "[package]\nname = \"hookweave-rt\"\nversion = \"0.1.0\"\n");

        let graph = DependencyGraph::new(
            ws.clone(),
            vec![node("app", &ws, true), node("util", &util, false)],
            &[("app".to_string(), "util".to_string())],
            None,
        )
        .unwrap();
        let wc = WorkingCopy::materialize(
            &graph,
            MaterializePlan {
                instrumented: &[1],
                hook_crates: &[],
                runtime_dir: &rt,
            },
        )
        .unwrap();

        assert!(wc.root.join("src/lib.rs").exists());
        assert!(!wc.root.join("target").exists());
        let util_copy = wc.copy_path(&util).unwrap();
        assert!(util_copy.starts_with(wc.base.join("deps")));
        assert_eq!(wc.original_path(&util_copy.join("src/lib.rs")), Some(util.join("src/lib.rs")));

        let app: Table = fs::read_to_string(wc.manifest_path()).unwrap().parse().unwrap();
        let dep_path = app["dependencies"]["util"]["path"].as_str().unwrap();
        assert_eq!(Path::new(dep_path), util_copy);
        assert!(app["dependencies"].get(RUNTIME_CRATE).is_none());

        let util_manifest: Table = fs::read_to_string(util_copy.join("Cargo.toml")).unwrap().parse().unwrap();
        let rt_dep = &util_manifest["dependencies"][RUNTIME_CRATE];
        assert_eq!(rt_dep["package"].as_str(), Some("hookweave-rt"));

        // The original is untouched.
        let original = fs::read_to_string(ws.join("Cargo.toml")).unwrap();
        assert!(original.contains("path = \"../util\""));
    }

    #[test]
    fn test_runtime_from_graph_beats_configured_dir() {
        let orig = tempfile::tempdir().unwrap();
        let ws = orig.path().join("ws");
        let rt = orig.path().join("hookweave-rt");
        let elsewhere = orig.path().join("other-rt");
        write(&ws.join("Cargo.toml"), "[workspace]\nmembers = [\"app\", \"hooks\"]\n");
        write(&ws.join("app/Cargo.toml"), "[package]\nname = \"app\"\nversion = \"0.1.0\"\n");
        write(&ws.join("app/src/lib.rs"), "pub fn app() {}\n");
        write(
            &ws.join("hooks/Cargo.toml"),
            "[package]\nname = \"hooks\"\nversion = \"0.1.0\"\n\n[dependencies]\nhookweave-rt = { path = \"../../hookweave-rt\" }\n",
        );
        write(&ws.join("hooks/src/lib.rs"), "");
        write(&rt.join("Cargo.toml"), "[package]\nname = \"hookweave-rt\"\nversion = \"0.1.0\"\n");
        write(&elsewhere.join("Cargo.toml"), "[package]\nname = \"hookweave-rt\"\nversion = \"0.1.0\"\n");

        let graph = DependencyGraph::new(
            ws.clone(),
            vec![
                node("app", &ws.join("app"), true),
                node("hooks", &ws.join("hooks"), true),
                node("hookweave-rt", &rt, false),
            ],
            &[("hooks".to_string(), "hookweave-rt".to_string())],
            None,
        )
        .unwrap();
        let hooks = [HookCrate {
            name: "hooks".to_string(),
            dir: ws.join("hooks"),
        }];
        let wc = WorkingCopy::materialize(
            &graph,
            MaterializePlan {
                instrumented: &[0],
                hook_crates: &hooks,
                runtime_dir: &elsewhere,
            },
        )
        .unwrap();

        let rt_copy = fs::canonicalize(wc.copy_path(&rt).unwrap()).unwrap();
        let app: Table = fs::read_to_string(wc.root.join("app/Cargo.toml")).unwrap().parse().unwrap();
        let app_rt = app["dependencies"][RUNTIME_CRATE]["path"].as_str().unwrap();
        assert_eq!(Path::new(app_rt), rt_copy);

        // The hook crate's own dependency names the same copy.
        let hooks: Table = fs::read_to_string(wc.root.join("hooks/Cargo.toml")).unwrap().parse().unwrap();
        let hooks_rt = hooks["dependencies"]["hookweave-rt"]["path"].as_str().unwrap();
        assert_eq!(fs::canonicalize(hooks_rt).unwrap(), rt_copy);
    }
}
