/// reid-deploy library crate.
///
/// Exposes the export and packaging modules as a public API so that
/// integration tests in tests/ can import them via `reid_deploy::`.
///
/// The binary entry point (src/main.rs) uses these same modules.
pub mod config;
pub mod exporter;
pub mod harness;
pub mod packager;
pub mod render;
pub mod utils;
