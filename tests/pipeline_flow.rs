mod support;

use std::fs;
use std::path::PathBuf;

use hookweave::application::{Pipeline, PipelineConfig};
use hookweave::domain::error::{PipelineError, Stage};
use hookweave::domain::injector::ConflictPolicy;
use hookweave::ports::{CompileOutput, RawDiagnostic, RawSpan};
use support::{fixture_copy, runtime_dir, FakeCompiler, FixtureMetadata};

fn config(root: &std::path::Path, target: PathBuf) -> PipelineConfig {
    PipelineConfig {
        rules: vec![root.join("rules/demo.toml")],
        runtime_path: Some(runtime_dir()),
        target_dir: Some(target),
        ..PipelineConfig::default()
    }
}

#[test]
fn build_instruments_working_copy_and_leaves_original() {
    let (tmp, root) = fixture_copy();
    let original_client = fs::read_to_string(root.join("pkg/src/client.rs")).unwrap();
    let compiler = FakeCompiler::succeeding();
    let cfg = config(&root, tmp.path().join("target"));

    let result = Pipeline::new(&FixtureMetadata, &compiler, &cfg).build(&root).unwrap();
    assert!(result.work_dir.is_none());

    let client = compiler.seen_file("pkg/src/client.rs").unwrap();
    assert!(client.contains("::hookweave_rt::Trampoline::new(&__HW_SITE_0"), "{}", client);
    assert!(client.contains("\"pkg-client-do\""));
    assert!(client.contains("::demo_hooks::count_exit"));
    assert_eq!(client.lines().count(), original_client.lines().count());
    // Never called, so pruned.
    assert!(!client.contains("pkg-legacy"));

    let lib = compiler.seen_file("pkg/src/lib.rs").unwrap();
    assert!(lib.contains("\"pkg-checksum\""));

    let manifest = compiler.seen_file("pkg/Cargo.toml").unwrap();
    assert!(manifest.contains("hookweave_rt"), "{}", manifest);
    assert!(manifest.contains("demo_hooks"), "{}", manifest);

    let report = compiler.seen_file("matched_rules.json").unwrap();
    assert!(report.contains("pkg-client-do"));
    assert!(report.contains("pkg-legacy"));
    assert!(!report.contains("absent-dep"));

    let requests = compiler.requests.lock().unwrap();
    assert_eq!(requests[0].target_dir, Some(tmp.path().join("target")));

    // The original tree is read only.
    assert_eq!(fs::read_to_string(root.join("pkg/src/client.rs")).unwrap(), original_client);
    assert!(!fs::read_to_string(root.join("pkg/Cargo.toml")).unwrap().contains("hookweave_rt"));
}

#[test]
fn disabling_all_rules_builds_unchanged_program() {
    let (tmp, root) = fixture_copy();
    let original_client = fs::read_to_string(root.join("pkg/src/client.rs")).unwrap();
    let compiler = FakeCompiler::succeeding();
    let mut cfg = config(&root, tmp.path().join("target"));
    cfg.disabled_rules = vec!["all".to_string()];

    Pipeline::new(&FixtureMetadata, &compiler, &cfg).build(&root).unwrap();
    assert_eq!(compiler.seen_file("pkg/src/client.rs").unwrap(), original_client);
    assert!(!compiler.seen_file("pkg/Cargo.toml").unwrap().contains("hookweave_rt"));
}

#[test]
fn pruning_can_be_turned_off() {
    let (tmp, root) = fixture_copy();
    let compiler = FakeCompiler::succeeding();
    let mut cfg = config(&root, tmp.path().join("target"));
    cfg.prune_unreachable = false;

    Pipeline::new(&FixtureMetadata, &compiler, &cfg).build(&root).unwrap();
    assert!(compiler.seen_file("pkg/src/client.rs").unwrap().contains("pkg-legacy"));
}

#[test]
fn compile_errors_point_at_original_sources() {
    let (tmp, root) = fixture_copy();
    let original = fs::read_to_string(root.join("pkg/src/client.rs")).unwrap();
    let (line_idx, line) = original
        .lines()
        .enumerate()
        .find(|(_, l)| l.contains("return Err(Error { attempt })"))
        .unwrap();
    let column = line.find("Err").unwrap() + 1;

    // Same body line in the rewritten file: text before it is unchanged
    // because injected code never spans lines and the line is inside the body.
    let compiler = FakeCompiler::new(CompileOutput {
        success: false,
        artifacts: Vec::new(),
        diagnostics: vec![RawDiagnostic {
            level: "error".into(),
            code: Some("E0308".into()),
            message: "mismatched types".into(),
            spans: vec![RawSpan {
                file: PathBuf::from("pkg/src/client.rs"),
                line: line_idx + 1,
                column,
                primary: true,
            }],
        }],
    });
    let cfg = config(&root, tmp.path().join("target"));
    let err = Pipeline::new(&FixtureMetadata, &compiler, &cfg).build(&root).unwrap_err();
    assert_eq!(err.stage(), Stage::Orchestrator);
    let PipelineError::Compilation { diagnostics } = err else {
        panic!("expected a compilation error");
    };
    let pos = diagnostics[0].primary.as_ref().unwrap();
    assert_eq!(pos.file, root.join("pkg/src/client.rs"));
    assert_eq!((pos.line, pos.column, pos.generated), (line_idx + 1, column, false));
}

#[test]
fn conflicting_captures_abort_or_skip() {
    let (tmp, root) = fixture_copy();
    fs::write(
        root.join("rules/conflict.toml"),
        r#"
[hooks]
crate = "demo_hooks"
path = "../demo_hooks"

[[rule]]
id = "typed-url"
import_path = "pkg::client"
receiver = "Client"
function = "do_request"
on_exit = "on_exit"
captures = [{ param = "url", ty = "String" }]
"#,
    )
    .unwrap();
    let compiler = FakeCompiler::succeeding();
    let mut cfg = config(&root, tmp.path().join("target"));
    cfg.rules.push(root.join("rules/conflict.toml"));

    let err = Pipeline::new(&FixtureMetadata, &compiler, &cfg).build(&root).unwrap_err();
    assert_eq!(err.stage(), Stage::Injector);
    assert!(err.to_string().contains("typed-url"), "{}", err);
    assert!(compiler.requests.lock().unwrap().is_empty());

    cfg.conflict_policy = ConflictPolicy::Skip;
    Pipeline::new(&FixtureMetadata, &compiler, &cfg).build(&root).unwrap();
    let client = compiler.seen_file("pkg/src/client.rs").unwrap();
    assert!(client.contains("pkg-client-do"));
    assert!(!client.contains("typed-url"));
}

#[test]
fn match_report_is_deterministic() {
    let (_tmp, root) = fixture_copy();
    let compiler = FakeCompiler::succeeding();
    let cfg = config(&root, root.join("target"));
    let pipeline = Pipeline::new(&FixtureMetadata, &compiler, &cfg);

    let first = pipeline.analyze(&root).unwrap().report().unwrap();
    let second = pipeline.analyze(&root).unwrap().report().unwrap();
    assert_eq!(first, second);

    let outer = first.find("\"pkg-client-do\"").unwrap();
    let inner = first.find("\"pkg-client-do-count\"").unwrap();
    assert!(outer < inner, "registration order drives nesting order");
}

#[test]
fn keep_work_dir_persists_copy_and_debug_sources() {
    let (tmp, root) = fixture_copy();
    let compiler = FakeCompiler::succeeding();
    let mut cfg = config(&root, tmp.path().join("target"));
    cfg.keep_work_dir = true;

    let result = Pipeline::new(&FixtureMetadata, &compiler, &cfg).build(&root).unwrap();
    let dir = result.work_dir.unwrap();
    assert!(dir.join("ws/pkg/src/client.rs").exists());
    assert!(dir.join("matched_rules.json").exists());
    let pretty = fs::read_to_string(dir.join("hookweave-debug/ws/pkg/src/client.rs")).unwrap();
    assert!(pretty.contains("Trampoline"));
    fs::remove_dir_all(dir).unwrap();
}
