// Application layer: wires the domain stages to the ports.

pub mod config;
pub mod orchestrator;
pub mod pipeline;

pub use config::PipelineConfig;
pub use orchestrator::{BuildResult, Orchestrator};
pub use pipeline::{Analysis, Instrumentation, Pipeline};
