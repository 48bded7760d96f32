//! # crucible-core
//!
//! Shared building blocks for the crucible remote execution service:
//! - msgpack wire protocol (requests, streamed output, terminal report)
//! - invocation validation against the known-runner set
//! - normalization of the backend's raw status record
//! - client fingerprinting and invocation-id derivation
//! - backend collaborator configuration

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod invocation;
pub mod languages;
pub mod protocol;
pub mod report;

pub use config::BackendConfig;
pub use error::CrucibleError;
pub use invocation::Invocation;
pub use report::ExecutionReport;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, CrucibleError>;
