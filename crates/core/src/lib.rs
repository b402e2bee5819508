//! Core library for the rigger deployment agent
//!
//! This crate contains the job pipeline (stage orchestration, platform
//! dispatch, emergency cleanup), the container drivers for local and
//! Windows Docker hosts, the remote session layer, image validation,
//! configuration, logging, and error handling.

pub mod app_config;
pub mod archive;
pub mod artifacts;
pub mod cleanup;
pub mod command;
pub mod credentials;
pub mod docker;
pub mod errors;
pub mod events;
pub mod image;
pub mod io;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod platform;
pub mod process;
pub mod redaction;
pub mod runner;
pub mod secrets;
pub mod session;
pub mod settings;
pub mod source;
pub mod store;
pub mod workspace;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
