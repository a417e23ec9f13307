//! Entry Point Detection Module
//!
//! Finds the functions that reachability analysis starts from: binary
//! `main`s, tests, the public API of exposed libraries, and functions that
//! can be called without being named (trait impls, `Drop`, exported symbols).

use crate::domain::ast::{FileScan, FnSummary};

/// Represents a detected entry point in the codebase.
#[derive(Debug, Clone)]
pub struct EntryPoint {
    /// Index into `FileScan::functions`.
    pub function: usize,
    /// Human-readable name (e.g., "main", "Client::send")
    pub name: String,
    /// Type of entry point
    pub kind: EntryPointKind,
    /// Line number in the file
    pub line: usize,
}

/// Classification of entry point types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPointKind {
    Main,             // fn main() of a binary target
    AsyncMain,        // #[tokio::main] async fn main()
    Test,             // #[test] / #[tokio::test]
    ExportedFunction, // pub fn of an exposed library
    AlwaysLive,       // trait impls, Drop, #[no_mangle], #[export_name]
}

/// How a scanned file is used by its package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    /// The root file of a binary target.
    BinaryRoot,
    /// A library file whose `pub` functions can be called from code outside
    /// the scanned set: workspace members, and packages an unscanned
    /// package depends on.
    ExposedLibrary,
    /// Everything else: binary modules, dependency sources.
    Internal,
}

/// Entry point detector
pub struct EntryPointDetector {
    role: FileRole,
}

impl EntryPointDetector {
    pub fn new(role: FileRole) -> Self {
        Self { role }
    }

    fn classify(&self, f: &FnSummary) -> Option<EntryPointKind> {
        if f.is_test {
            return Some(EntryPointKind::Test);
        }
        if f.always_live {
            return Some(EntryPointKind::AlwaysLive);
        }
        match self.role {
            FileRole::BinaryRoot if f.name == "main" && f.inline_module.is_empty() && f.receiver.is_none() => {
                Some(if f.is_async {
                    EntryPointKind::AsyncMain
                } else {
                    EntryPointKind::Main
                })
            }
            FileRole::ExposedLibrary if f.is_pub => Some(EntryPointKind::ExportedFunction),
            _ => None,
        }
    }

    /// Detect entry points among the functions of one scanned file.
    pub fn detect(&self, file: &FileScan) -> Vec<EntryPoint> {
        file.functions
            .iter()
            .enumerate()
            .filter_map(|(i, f)| {
                self.classify(f).map(|kind| EntryPoint {
                    function: i,
                    name: match &f.receiver {
                        Some(r) => format!("{}::{}", r, f.name),
                        None => f.name.clone(),
                    },
                    kind,
                    line: f.line,
                })
            })
            .collect()
    }
}
