//! Rule applicability against a resolved dependency graph.

use std::collections::BTreeMap;

use cargo_metadata::semver::Version;

use crate::domain::error::{PipelineError, Result};
use crate::domain::graph::DependencyGraph;
use crate::domain::registry::Registry;
use crate::domain::rule::HookRule;
use crate::domain::version::VersionRange;

/// Why a rule was left out. Skips are not errors: the rule's target is
/// simply not part of this program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    TargetAbsent,
    TargetVersion { found: Vec<Version> },
    Toolchain { rustc: Version },
    RequirementAbsent { package: String },
}

/// A range one selected rule places on one package.
struct Constraint<'a> {
    rule: &'a HookRule,
    range: &'a VersionRange,
    from_target: bool,
}

fn applicability(rule: &HookRule, graph: &DependencyGraph, reachable: &[bool]) -> Result<Option<Skip>> {
    let targets: Vec<usize> = graph
        .by_crate(rule.target_crate())
        .iter()
        .copied()
        .filter(|&i| reachable[i])
        .collect();
    if targets.is_empty() {
        return Ok(Some(Skip::TargetAbsent));
    }
    if !targets.iter().any(|&i| rule.version.contains(&graph.packages[i].version)) {
        return Ok(Some(Skip::TargetVersion {
            found: targets.iter().map(|&i| graph.packages[i].version.clone()).collect(),
        }));
    }
    if let (Some(range), Some(rustc)) = (&rule.rustc, &graph.rustc) {
        if !range.contains(rustc) {
            return Ok(Some(Skip::Toolchain { rustc: rustc.clone() }));
        }
    }
    for req in &rule.requires {
        let present: Vec<usize> = graph.by_name(&req.package).filter(|&i| reachable[i]).collect();
        if present.is_empty() {
            return Ok(Some(Skip::RequirementAbsent {
                package: req.package.clone(),
            }));
        }
        if !present.iter().any(|&i| req.range.contains(&graph.packages[i].version)) {
            let found: Vec<String> = present.iter().map(|&i| graph.packages[i].version.to_string()).collect();
            return Err(PipelineError::VersionConflict {
                package: req.package.clone(),
                rules: vec![rule.id.clone()],
                message: format!(
                    "rule '{}' requires {} but the program resolves {}",
                    rule.id,
                    req.range,
                    found.join(", ")
                ),
            });
        }
    }
    Ok(None)
}

/// Keep the rules whose targets this program contains. Fails when a
/// selected rule cannot be satisfied or two selected rules demand disjoint
/// versions of one package.
pub fn select_rules(graph: &DependencyGraph, registry: &Registry) -> Result<Registry> {
    let reachable = graph.reachable();
    let mut selected: Vec<&HookRule> = Vec::new();

    for rule in registry.rules() {
        match applicability(rule, graph, &reachable)? {
            None => selected.push(rule),
            Some(skip) => tracing::debug!(rule = %rule.id, reason = ?skip, "rule skipped"),
        }
    }
    if graph.rustc.is_none() && selected.iter().any(|r| r.rustc.is_some()) {
        tracing::warn!("toolchain version unknown, rustc ranges not checked");
    }

    let mut constraints: BTreeMap<String, Vec<Constraint<'_>>> = BTreeMap::new();
    for rule in &selected {
        constraints
            .entry(rule.target_crate().replace('-', "_"))
            .or_default()
            .push(Constraint {
                rule,
                range: &rule.version,
                from_target: true,
            });
        for req in &rule.requires {
            constraints
                .entry(req.package.replace('-', "_"))
                .or_default()
                .push(Constraint {
                    rule,
                    range: &req.range,
                    from_target: false,
                });
        }
    }
    for (package, list) in &constraints {
        for (i, a) in list.iter().enumerate() {
            for b in &list[i + 1..] {
                // Two targets may be satisfied by two versions in the graph.
                if a.from_target && b.from_target || a.rule.id == b.rule.id {
                    continue;
                }
                if a.range.is_disjoint(b.range) {
                    return Err(PipelineError::VersionConflict {
                        package: package.clone(),
                        rules: vec![a.rule.id.clone(), b.rule.id.clone()],
                        message: format!(
                            "rule '{}' needs {} but rule '{}' needs {}",
                            a.rule.id, a.range, b.rule.id, b.range
                        ),
                    });
                }
            }
        }
    }

    let keep: Vec<String> = selected.iter().map(|r| r.id.clone()).collect();
    let out = registry.retain(|r| keep.contains(&r.id));
    tracing::info!(
        selected = out.len(),
        skipped = registry.len() - out.len(),
        "rules resolved against the dependency graph"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::fixtures::node;
    use crate::domain::registry::{RuleFormat, RuleSource};
    use std::path::PathBuf;

    fn graph(extra: &[(&str, &str)]) -> DependencyGraph {
        let mut packages = vec![node("app", "0.1.0", true), node("pkg", "0.1.5", false)];
        let mut edges = vec![("app 0.1.0".to_string(), "pkg 0.1.5".to_string())];
        for (name, version) in extra {
            packages.push(node(name, version, false));
            edges.push(("app 0.1.0".to_string(), format!("{} {}", name, version)));
        }
        DependencyGraph::new(PathBuf::from("/ws"), packages, &edges, Version::parse("1.75.0").ok()).unwrap()
    }

    fn registry(rules: &str) -> Registry {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("hooks/src")).unwrap();
        std::fs::write(
            dir.path().join("hooks/Cargo.toml"),
            "[package]\nname = \"hooks\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("hooks/src/lib.rs"), "pub fn enter() {}\n").unwrap();
        let text = format!("[hooks]\ncrate = \"hooks\"\npath = \"hooks\"\n{}", rules);
        Registry::load(&[RuleSource {
            name: "rules.toml".into(),
            format: RuleFormat::Toml,
            text,
            base_dir: dir.path().to_path_buf(),
        }])
        .unwrap()
    }

    fn rule(id: &str, import_path: &str, extra: &str) -> String {
        format!(
            "[[rule]]\nid = \"{}\"\nimport_path = \"{}\"\nfunction = \"f\"\non_enter = \"enter\"\n{}\n",
            id, import_path, extra
        )
    }

    fn ids(r: &Registry) -> Vec<&str> {
        r.rules().iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_absent_target_or_requirement_is_skipped() {
        let reg = registry(&format!(
            "{}{}{}{}",
            rule("kept", "pkg::client", ""),
            rule("absent", "reqwest", ""),
            rule("old", "pkg", "version = \"[0.2.0,)\""),
            rule("needs-tokio", "pkg", "requires = [{ package = \"tokio\", version = \"1\" }]"),
        ));
        let out = select_rules(&graph(&[]), &reg).unwrap();
        assert_eq!(ids(&out), vec!["kept"]);
    }

    #[test]
    fn test_requirement_out_of_range_conflicts() {
        let reg = registry(&rule("r", "pkg", "requires = [{ package = \"tokio\", version = \">=1.20\" }]"));
        let err = select_rules(&graph(&[("tokio", "1.10.0")]), &reg).unwrap_err();
        match err {
            PipelineError::VersionConflict { package, rules, .. } => {
                assert_eq!(package, "tokio");
                assert_eq!(rules, vec!["r"]);
            }
            other => panic!("unexpected: {}", other),
        }
    }

    #[test]
    fn test_disjoint_requirements_conflict() {
        let reg = registry(&format!(
            "{}{}",
            rule("a", "pkg", "requires = [{ package = \"tokio\", version = \"[1.0.0,1.30.0)\" }]"),
            rule("b", "pkg", "requires = [{ package = \"tokio\", version = \">=1.30\" }]"),
        ));
        let g = graph(&[("tokio", "1.20.0"), ("tokio", "1.35.0")]);
        match select_rules(&g, &reg).unwrap_err() {
            PipelineError::VersionConflict { rules, .. } => assert_eq!(rules, vec!["a", "b"]),
            other => panic!("unexpected: {}", other),
        }
    }

    #[test]
    fn test_rustc_range_filters() {
        let reg = registry(&format!(
            "{}{}",
            rule("new-toolchain", "pkg", "rustc = \"[1.80.0,)\""),
            rule("any-toolchain", "pkg", "rustc = \"[1.60.0,)\""),
        ));
        let out = select_rules(&graph(&[]), &reg).unwrap();
        assert_eq!(ids(&out), vec!["any-toolchain"]);
    }
}
