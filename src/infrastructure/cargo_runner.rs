//! Cargo build runner.
//!
//! Runs `cargo build --message-format=json` over the working copy and turns
//! the message stream into artifacts and raw diagnostics. Positions stay in
//! working-copy coordinates; the orchestrator remaps them.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use cargo_metadata::diagnostic::{Diagnostic, DiagnosticLevel};
use cargo_metadata::Message;

use crate::domain::error::{PipelineError, Result, Stage};
use crate::ports::{Artifact, CompileOutput, CompileRequest, Compiler, RawDiagnostic, RawSpan};

// ═══════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════

/// Compiler port backed by the `cargo` found in `$CARGO` or on `PATH`.
pub struct CargoCompiler;

impl Compiler for CargoCompiler {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput> {
        let spec = build_command_spec(request);
        tracing::info!(manifest = %request.manifest_path.display(), "running {} {}", spec.program, spec.args.join(" "));

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PipelineError::io(Stage::Orchestrator, &spec.program, e))?;

        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });
        let mut output = match child.stdout.take() {
            Some(stdout) => parse_messages(BufReader::new(stdout)),
            None => CompileOutput::default(),
        };
        let status = child
            .wait()
            .map_err(|e| PipelineError::io(Stage::Orchestrator, &spec.program, e))?;
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

        output.success = status.success();
        if !output.success && !output.diagnostics.iter().any(|d| d.level == "error") {
            // Cargo failed before rustc could say anything (manifest,
            // resolution, network). Surface cargo's own words.
            output.diagnostics.push(RawDiagnostic {
                level: "error".to_string(),
                code: None,
                message: format!("cargo exited with {}: {}", status, last_lines(&stderr, 20)),
                spans: Vec::new(),
            });
        }
        tracing::debug!(
            success = output.success,
            artifacts = output.artifacts.len(),
            diagnostics = output.diagnostics.len(),
            "cargo finished"
        );
        Ok(output)
    }
}

/// Collect artifacts and diagnostics from a `--message-format=json` stream.
pub fn parse_messages<R: BufRead>(reader: R) -> CompileOutput {
    let mut output = CompileOutput::default();
    for message in Message::parse_stream(reader) {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable cargo message");
                continue;
            }
        };
        match message {
            Message::CompilerArtifact(artifact) => output.artifacts.push(Artifact {
                package: artifact.package_id.repr,
                target: artifact.target.name,
                filenames: artifact.filenames.into_iter().map(|f| f.into_std_path_buf()).collect(),
                executable: artifact.executable.map(|e| e.into_std_path_buf()),
            }),
            Message::CompilerMessage(msg) => {
                if let Some(diagnostic) = raw_diagnostic(&msg.message) {
                    output.diagnostics.push(diagnostic);
                }
            }
            Message::BuildFinished(finished) => output.success = finished.success,
            _ => {}
        }
    }
    output
}

// ═══════════════════════════════════════════════════════════════════════════
// Internal Implementation
// ═══════════════════════════════════════════════════════════════════════════

fn level_name(level: &DiagnosticLevel) -> Option<&'static str> {
    match level {
        DiagnosticLevel::Ice | DiagnosticLevel::Error => Some("error"),
        DiagnosticLevel::Warning => Some("warning"),
        // Summary lines ("aborting due to ..."), notes without a parent.
        _ => None,
    }
}

fn raw_diagnostic(d: &Diagnostic) -> Option<RawDiagnostic> {
    let level = level_name(&d.level)?;
    let spans = d
        .spans
        .iter()
        .map(|s| RawSpan {
            file: PathBuf::from(&s.file_name),
            line: s.line_start,
            column: s.column_start,
            primary: s.is_primary,
        })
        .collect();
    Some(RawDiagnostic {
        level: level.to_string(),
        code: d.code.as_ref().map(|c| c.code.clone()),
        message: d.message.clone(),
        spans,
    })
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

// ═══════════════════════════════════════════════════════════════════════════
// Testable Command Builder (for unit tests)
// ═══════════════════════════════════════════════════════════════════════════

/// Describes the command that would be run for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CargoCommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

pub fn build_command_spec(request: &CompileRequest) -> CargoCommandSpec {
    let program = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let mut args = vec![
        "build".to_string(),
        "--message-format=json".to_string(),
        "--manifest-path".to_string(),
        request.manifest_path.display().to_string(),
    ];
    if let Some(dir) = &request.target_dir {
        args.push("--target-dir".to_string());
        args.push(dir.display().to_string());
    }
    if request.offline {
        args.push("--offline".to_string());
    }
    if request.locked {
        args.push("--locked".to_string());
    }
    args.extend(request.extra_args.iter().cloned());
    CargoCommandSpec { program, args }
}
