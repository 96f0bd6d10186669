//! kmc-inttest - end-to-end scenario for k0smotron nested control planes
//!
//! The host-path scenario bootstraps a k0s host cluster, installs the
//! k0smotron operator, submits a nested cluster whose state lives in a
//! directory on a host worker, joins a worker to the nested control plane,
//! and finally checks that the directory holds the expected artifacts.
//!
//! # Modules
//!
//! - [`config`] - Scenario settings from defaults, a file and `KMC_*` variables
//! - [`manifest`] - The nested `Cluster` object submitted to the host
//! - [`scenario`] - Step plan, readiness gates and the orchestrator
//! - [`error`] - Error types for a failed run
//!
//! Cluster access, polling, tunnelling and telemetry live in `kmc-common`.
//! SSH and k0s plumbing for footloose machines live in `kmc-footloose`.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod manifest;
pub mod scenario;

pub use config::ScenarioConfig;
pub use error::Error;
pub use scenario::{Collaborators, Orchestrator, ScenarioReport};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
