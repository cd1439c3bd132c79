//! Shared plumbing for the gitshift workspace: the layered application
//! configuration and the tracing bootstrap. Everything else lives in
//! `gitshift-core`.

pub mod config;
pub mod tracing;

pub use config::AppConfig;
