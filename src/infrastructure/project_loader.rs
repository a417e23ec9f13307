use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use cargo_metadata::semver::Version;
use cargo_metadata::{Metadata, MetadataCommand, Package};

use crate::domain::error::{PipelineError, Result};
use crate::domain::graph::{DependencyGraph, PackageNode, PackageSource};
use crate::ports::{MetadataSource, ResolveOptions};

/// Target kinds whose crate is a library other crates link against.
const LIB_KINDS: &[&str] = &["lib", "rlib", "dylib", "cdylib", "staticlib"];

/// Resolves programs with `cargo metadata`.
pub struct ProjectLoader;

impl MetadataSource for ProjectLoader {
    fn resolve(&self, program_root: &Path, options: &ResolveOptions) -> Result<DependencyGraph> {
        let manifest = program_root.join("Cargo.toml");
        let mut flags = Vec::new();
        if options.offline {
            flags.push("--offline".to_string());
        }
        if options.locked {
            flags.push("--locked".to_string());
        }
        let metadata = MetadataCommand::new()
            .manifest_path(&manifest)
            .other_options(flags)
            .exec()
            .map_err(|e| match e {
                cargo_metadata::Error::CargoMetadata { stderr } => {
                    PipelineError::unresolved(manifest.display().to_string(), stderr.trim().to_string())
                }
                other => PipelineError::unresolved(manifest.display().to_string(), other.to_string()),
            })?;

        let rustc = rustc_version();
        let graph = graph_from_metadata(metadata, rustc)?;
        tracing::info!(
            packages = graph.packages.len(),
            members = graph.members().count(),
            rustc = ?graph.rustc.as_ref().map(|v| v.to_string()),
            "cargo metadata loaded"
        );
        Ok(graph)
    }
}

pub fn graph_from_metadata(metadata: Metadata, rustc: Option<Version>) -> Result<DependencyGraph> {
    let Some(resolve) = metadata.resolve else {
        return Err(PipelineError::unresolved(
            metadata.workspace_root.to_string(),
            "cargo metadata returned no resolve graph",
        ));
    };
    let in_graph: HashSet<&str> = resolve.nodes.iter().map(|n| n.id.repr.as_str()).collect();
    let members: HashSet<&str> = metadata.workspace_members.iter().map(|id| id.repr.as_str()).collect();
    for member in &metadata.workspace_members {
        if !in_graph.contains(member.repr.as_str()) {
            return Err(PipelineError::unresolved(
                member.repr.clone(),
                "workspace member missing from the resolve graph",
            ));
        }
    }

    let packages: Vec<PackageNode> = metadata
        .packages
        .iter()
        .filter(|p| in_graph.contains(p.id.repr.as_str()))
        .map(|p| package_node(p, members.contains(p.id.repr.as_str())))
        .collect();
    let edges: Vec<(String, String)> = resolve
        .nodes
        .iter()
        .flat_map(|n| n.deps.iter().map(move |d| (n.id.repr.clone(), d.pkg.repr.clone())))
        .collect();

    DependencyGraph::new(
        metadata.workspace_root.into_std_path_buf(),
        packages,
        &edges,
        rustc,
    )
}

fn package_node(package: &Package, is_member: bool) -> PackageNode {
    let lib = package
        .targets
        .iter()
        .find(|t| t.kind.iter().any(|k| LIB_KINDS.contains(&k.as_str())));
    let bin_roots: Vec<PathBuf> = package
        .targets
        .iter()
        .filter(|t| t.kind.iter().any(|k| k == "bin"))
        .map(|t| t.src_path.clone().into_std_path_buf())
        .collect();
    let edition = serde_json::to_value(&package.edition)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "2015".to_string());

    PackageNode {
        id: package.id.repr.clone(),
        name: package.name.clone(),
        crate_name: lib
            .map(|t| t.name.replace('-', "_"))
            .unwrap_or_else(|| package.name.replace('-', "_")),
        version: package.version.clone(),
        manifest_path: package.manifest_path.clone().into_std_path_buf(),
        lib_root: lib.map(|t| t.src_path.clone().into_std_path_buf()),
        bin_roots,
        edition,
        source: package_source(package.source.as_ref().map(|s| s.repr.as_str())),
        is_member,
    }
}

pub fn package_source(repr: Option<&str>) -> PackageSource {
    match repr {
        None => PackageSource::Path,
        Some(r) if r.starts_with("git+") => PackageSource::Git(r.to_string()),
        Some(r) if r.starts_with("path+") => PackageSource::Path,
        Some(r) => PackageSource::Registry(r.to_string()),
    }
}

/// Version of the compiler Cargo will use (`$RUSTC`, else `rustc`).
pub fn rustc_version() -> Option<Version> {
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let output = match Command::new(&rustc).arg("-vV").output() {
        Ok(o) if o.status.success() => o,
        Ok(o) => {
            tracing::warn!(status = %o.status, "{} -vV failed", rustc);
            return None;
        }
        Err(e) => {
            tracing::warn!(error = %e, "could not run {}", rustc);
            return None;
        }
    };
    parse_rustc_version(&String::from_utf8_lossy(&output.stdout))
}

pub fn parse_rustc_version(text: &str) -> Option<Version> {
    text.lines()
        .find_map(|l| l.strip_prefix("release: "))
        .and_then(|v| Version::parse(v.trim()).ok())
}
