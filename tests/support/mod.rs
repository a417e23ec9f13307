//! Shared fixtures for the integration tests: a temporary copy of
//! `test_instrument_ws` and a hand-built dependency graph for it.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use cargo_metadata::semver::Version;
use hookweave::domain::error::Result;
use hookweave::domain::graph::{DependencyGraph, PackageNode, PackageSource};
use hookweave::ports::{CompileOutput, CompileRequest, Compiler, MetadataSource, ResolveOptions};
use std::sync::Mutex;

pub fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("test_instrument_ws")
}

pub fn runtime_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("hookweave-rt")
}

fn copy_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name();
        if name == "target" {
            continue;
        }
        let dest = to.join(&name);
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &dest);
        } else {
            fs::copy(entry.path(), &dest).unwrap();
        }
    }
}

/// A private copy of the fixture workspace; returns (guard, canonical root).
/// The runtime is copied next to it so the hook crate's relative path
/// dependency still resolves.
pub fn fixture_copy() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("program");
    copy_dir(&fixture_dir(), &root);
    copy_dir(&runtime_dir(), &dir.path().join("hookweave-rt"));
    let root = root.canonicalize().unwrap();
    (dir, root)
}

fn node(root: &Path, name: &str, lib: bool, bin: bool) -> PackageNode {
    let dir = root.join(name);
    PackageNode {
        id: format!("{} 0.1.0 (path+file://{})", name, dir.display()),
        name: name.to_string(),
        crate_name: name.replace('-', "_"),
        version: Version::new(0, 1, 0),
        manifest_path: dir.join("Cargo.toml"),
        lib_root: lib.then(|| dir.join("src/lib.rs")),
        bin_roots: if bin { vec![dir.join("src/main.rs")] } else { Vec::new() },
        edition: "2021".to_string(),
        source: PackageSource::Path,
        is_member: true,
    }
}

/// The graph `cargo metadata` reports for the fixture, without running it.
pub fn fixture_graph(root: &Path) -> DependencyGraph {
    let packages = vec![
        node(root, "app", false, true),
        node(root, "pkg", true, false),
        node(root, "demo_hooks", true, false),
    ];
    let edges = vec![(packages[0].id.clone(), packages[1].id.clone())];
    DependencyGraph::new(root.to_path_buf(), packages, &edges, None).unwrap()
}

pub struct FixtureMetadata;

impl MetadataSource for FixtureMetadata {
    fn resolve(&self, program_root: &Path, _options: &ResolveOptions) -> Result<DependencyGraph> {
        Ok(fixture_graph(program_root))
    }
}

/// Records requests and answers with a canned output.
pub struct FakeCompiler {
    pub output: CompileOutput,
    pub requests: Mutex<Vec<CompileRequest>>,
    /// Sources of the working copy captured at compile time.
    pub seen: Mutex<Vec<(PathBuf, String)>>,
}

impl FakeCompiler {
    pub fn new(output: CompileOutput) -> Self {
        Self {
            output,
            requests: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(CompileOutput {
            success: true,
            ..CompileOutput::default()
        })
    }

    /// Latest captured copy of a file.
    pub fn seen_file(&self, suffix: &str) -> Option<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| p.ends_with(suffix))
            .map(|(_, t)| t.clone())
    }
}

impl Compiler for FakeCompiler {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput> {
        let root = request.manifest_path.parent().unwrap().to_path_buf();
        for rel in ["pkg/src/lib.rs", "pkg/src/client.rs", "pkg/Cargo.toml", "app/src/main.rs"] {
            if let Ok(text) = fs::read_to_string(root.join(rel)) {
                self.seen.lock().unwrap().push((root.join(rel), text));
            }
        }
        if let Ok(report) = fs::read_to_string(root.parent().unwrap().join("matched_rules.json")) {
            self.seen.lock().unwrap().push((root.join("matched_rules.json"), report));
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.output.clone())
    }
}
