//! Resolved dependency graph of the program being instrumented.

use std::collections::HashMap;
use std::path::PathBuf;

use cargo_metadata::semver::Version;
use serde::Serialize;

use crate::domain::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PackageSource {
    /// Local path dependency or workspace member.
    Path,
    /// Registry dependency; carries the source id (`registry+https://...`).
    Registry(String),
    Git(String),
}

impl PackageSource {
    /// Key used in a `[patch.<key>]` table, `None` for path sources.
    pub fn patch_key(&self) -> Option<String> {
        match self {
            PackageSource::Path => None,
            PackageSource::Registry(id) if id.contains("crates.io-index") || id.contains("index.crates.io") => {
                Some("crates-io".to_string())
            }
            PackageSource::Registry(id) => Some(
                id.trim_start_matches("registry+")
                    .trim_start_matches("sparse+")
                    .to_string(),
            ),
            PackageSource::Git(id) => {
                let url = id.trim_start_matches("git+");
                let url = url.split(['?', '#']).next().unwrap_or(url);
                Some(url.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageNode {
    /// Cargo package id.
    pub id: String,
    pub name: String,
    /// Name of the library target, `-` replaced by `_`.
    pub crate_name: String,
    pub version: Version,
    pub manifest_path: PathBuf,
    pub lib_root: Option<PathBuf>,
    pub bin_roots: Vec<PathBuf>,
    pub edition: String,
    pub source: PackageSource,
    pub is_member: bool,
}

impl PackageNode {
    pub fn root_dir(&self) -> PathBuf {
        self.manifest_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default()
    }

    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Package-name comparison that treats `-` and `_` alike.
pub fn same_package_name(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .all(|(x, y)| x == y || matches!((x, y), (b'-', b'_') | (b'_', b'-')))
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyGraph {
    pub workspace_root: PathBuf,
    pub packages: Vec<PackageNode>,
    /// `deps[i]` = indices of packages that package `i` depends on.
    pub deps: Vec<Vec<usize>>,
    /// Version of the compiler that will build the program.
    pub rustc: Option<Version>,
    #[serde(skip)]
    by_crate: HashMap<String, Vec<usize>>,
}

impl DependencyGraph {
    /// Build a graph from nodes and `(from, to)` edges given as package ids.
    /// Fails when an edge names a package that is not a node.
    pub fn new(
        workspace_root: PathBuf,
        packages: Vec<PackageNode>,
        edges: &[(String, String)],
        rustc: Option<Version>,
    ) -> Result<Self> {
        let index: HashMap<&str, usize> = packages
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.as_str(), i))
            .collect();
        let mut deps = vec![Vec::new(); packages.len()];
        for (from, to) in edges {
            let Some(&f) = index.get(from.as_str()) else {
                return Err(PipelineError::unresolved(from, "dependency edge from a package missing in the graph"));
            };
            let Some(&t) = index.get(to.as_str()) else {
                return Err(PipelineError::unresolved(
                    to,
                    format!("required by {} but missing in the graph", packages[f].label()),
                ));
            };
            if !deps[f].contains(&t) {
                deps[f].push(t);
            }
        }
        let mut by_crate: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, p) in packages.iter().enumerate() {
            by_crate.entry(p.crate_name.clone()).or_default().push(i);
        }
        Ok(Self {
            workspace_root,
            packages,
            deps,
            rustc,
            by_crate,
        })
    }

    /// Packages whose library crate is called `crate_name`; several versions
    /// of one crate may coexist.
    pub fn by_crate(&self, crate_name: &str) -> &[usize] {
        self.by_crate
            .get(crate_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = usize> + 'a {
        self.packages
            .iter()
            .enumerate()
            .filter(move |(_, p)| same_package_name(&p.name, name))
            .map(|(i, _)| i)
    }

    pub fn members(&self) -> impl Iterator<Item = usize> + '_ {
        self.packages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_member)
            .map(|(i, _)| i)
    }

    /// Packages that depend directly on `idx`.
    pub fn dependents(&self, idx: usize) -> Vec<usize> {
        self.deps
            .iter()
            .enumerate()
            .filter(|(_, d)| d.contains(&idx))
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices reachable from the workspace members, members included.
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.packages.len()];
        let mut stack: Vec<usize> = self.members().collect();
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut seen[i], true) {
                continue;
            }
            stack.extend(self.deps[i].iter().copied().filter(|&d| !seen[d]));
        }
        seen
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn node(name: &str, version: &str, member: bool) -> PackageNode {
        PackageNode {
            id: format!("{} {}", name, version),
            name: name.to_string(),
            crate_name: name.replace('-', "_"),
            version: Version::parse(version).unwrap(),
            manifest_path: PathBuf::from(format!("/ws/{}/Cargo.toml", name)),
            lib_root: Some(PathBuf::from(format!("/ws/{}/src/lib.rs", name))),
            bin_roots: Vec::new(),
            edition: "2021".to_string(),
            source: if member {
                PackageSource::Path
            } else {
                PackageSource::Registry("registry+https://github.com/rust-lang/crates.io-index".to_string())
            },
            is_member: member,
        }
    }
}
