// Core pipeline types and algorithms. Nothing here runs external commands.

pub mod ast;
pub mod callgraph;
pub mod entry_point;
pub mod error;
pub mod graph;
pub mod injector;
pub mod instrumented;
pub mod matcher;
pub mod optimizer;
pub mod position;
pub mod registry;
pub mod resolver;
pub mod rule;
pub mod trampoline;
pub mod version;
