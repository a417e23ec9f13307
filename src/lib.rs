// Main library entry point for Hookweave.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod ports;
