// Infrastructure implementations for Hookweave.

pub mod cargo_runner;
pub mod concurrency;
pub mod logging;
pub mod project_loader;
pub mod workspace;

pub use cargo_runner::CargoCompiler;
pub use project_loader::ProjectLoader;
pub use workspace::{MaterializePlan, WorkingCopy};
