//! Whole-program call graph used to prune instrumentation of dead code.
//!
//! Edges are name based: a function reaches every scanned function whose
//! name appears in its body. That over-approximates calls (method names are
//! not resolved against receivers), which only ever keeps more code live.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::domain::ast::{walk_crate, FileScan, ParseCache};
use crate::domain::entry_point::{EntryPointDetector, FileRole};
use crate::domain::error::Result;
use crate::domain::graph::DependencyGraph;

/// A node in the call graph: one function body.
#[derive(Debug)]
pub struct CallGraphNode {
    pub package: usize,
    pub file: Arc<FileScan>,
    /// Index into `FileScan::functions`.
    pub function: usize,
    /// Nodes whose name this body mentions.
    pub callees: Vec<usize>,
}

impl CallGraphNode {
    fn key(&self) -> (PathBuf, usize) {
        (self.file.path.clone(), self.file.functions[self.function].body_open)
    }
}

/// The call graph itself.
#[derive(Debug, Default)]
pub struct CallGraph {
    pub nodes: Vec<CallGraphNode>,
    pub entries: Vec<usize>,
    /// Names mentioned by macros and statics; their functions count as
    /// entry points since the use site is not visible to the scan.
    pub root_names: BTreeSet<String>,
}

impl CallGraph {
    /// Add every function of `file` as a node and record its entry points.
    pub fn add_file(&mut self, package: usize, file: Arc<FileScan>, role: FileRole) {
        let base = self.nodes.len();
        for ep in EntryPointDetector::new(role).detect(&file) {
            self.entries.push(base + ep.function);
        }
        self.root_names.extend(file.item_mentions.iter().cloned());
        for function in 0..file.functions.len() {
            self.nodes.push(CallGraphNode {
                package,
                file: Arc::clone(&file),
                function,
                callees: Vec::new(),
            });
        }
    }

    /// Resolve mentions into edges.
    pub fn link(&mut self) {
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let name = node.file.functions[node.function].name.clone();
            by_name.entry(name).or_default().push(i);
        }
        for name in &self.root_names {
            if let Some(nodes) = by_name.get(name) {
                self.entries.extend(nodes.iter().copied());
            }
        }
        for node in &mut self.nodes {
            let summary = &node.file.functions[node.function];
            node.callees = summary
                .mentions
                .iter()
                .filter_map(|m| by_name.get(m))
                .flatten()
                .copied()
                .collect();
        }
    }

    /// Nodes reachable from the entry points.
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = self.entries.clone();
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut seen[i], true) {
                continue;
            }
            stack.extend(self.nodes[i].callees.iter().copied().filter(|&c| !seen[c]));
        }
        seen
    }
}

/// Outcome of reachability analysis over the scanned packages.
#[derive(Debug, Default)]
pub struct Reachability {
    live: HashSet<(PathBuf, usize)>,
    /// Packages whose every direct dependent was scanned.
    prunable: Vec<bool>,
}

impl Reachability {
    /// Build the graph over the workspace members and `instrumented`
    /// packages. Members contribute entry points, and so does the public API
    /// of every scanned package that an unscanned package depends on. A
    /// package can only lose instrumentation if every package depending on
    /// it was scanned too.
    pub fn analyze(graph: &DependencyGraph, instrumented: &[usize], cache: &ParseCache) -> Result<Self> {
        let mut scanned: Vec<usize> = graph.members().collect();
        for &p in instrumented {
            if !scanned.contains(&p) {
                scanned.push(p);
            }
        }
        scanned.sort_unstable();
        let is_scanned = |p: &usize| scanned.binary_search(p).is_ok();

        let mut cg = CallGraph::default();
        for &idx in &scanned {
            let package = &graph.packages[idx];
            let exposed = !graph.dependents(idx).iter().all(is_scanned);
            if let Some(root) = &package.lib_root {
                for file in walk_crate(&package.crate_name, root, cache)? {
                    let role = if package.is_member || exposed {
                        FileRole::ExposedLibrary
                    } else {
                        FileRole::Internal
                    };
                    cg.add_file(idx, file.scan, role);
                }
            }
            if package.is_member {
                for bin in &package.bin_roots {
                    for file in walk_crate(&package.crate_name, bin, cache)? {
                        let role = if file.scan.path == *bin {
                            FileRole::BinaryRoot
                        } else {
                            FileRole::Internal
                        };
                        cg.add_file(idx, file.scan, role);
                    }
                }
            }
        }
        cg.link();

        let reachable = cg.reachable();
        let live: HashSet<(PathBuf, usize)> = cg
            .nodes
            .iter()
            .zip(&reachable)
            .filter(|(_, r)| **r)
            .map(|(n, _)| n.key())
            .collect();
        let prunable = (0..graph.packages.len())
            .map(|p| is_scanned(&p) && graph.dependents(p).iter().all(is_scanned))
            .collect();

        tracing::debug!(
            functions = cg.nodes.len(),
            entries = cg.entries.len(),
            live = live.len(),
            "call graph built"
        );
        Ok(Self { live, prunable })
    }

    /// Whether the function with body at `body_open` in `file` may run.
    pub fn is_live(&self, package: usize, file: &Path, body_open: usize) -> bool {
        if !self.prunable.get(package).copied().unwrap_or(false) {
            return true;
        }
        self.live.contains(&(file.to_path_buf(), body_open))
    }
}
