//! Shared setup used by the `taskq-reaper` and `taskq-cli` binaries: environment-driven
//! configuration and the process-wide tracing subscriber. The queue itself lives in the
//! `taskq-queue` crate; this crate just wires it up for a standalone process.

pub mod config;
pub mod tracing_config;

pub use config::Config;
