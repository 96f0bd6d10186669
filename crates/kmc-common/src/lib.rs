//! Readiness polling, cluster access and port-forward tunnels for k0smotron
//! integration tests

#![deny(missing_docs)]

pub mod access;
pub mod collaborators;
pub mod error;
pub mod kube_utils;
pub mod manifests;
pub mod poll;
pub mod readiness;
pub mod retry;
pub mod telemetry;
pub mod tunnel;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the k0smotron operator runs in
pub const K0SMOTRON_NAMESPACE: &str = "k0smotron";

/// Name of the k0smotron operator Deployment
pub const K0SMOTRON_CONTROLLER: &str = "k0smotron-controller-manager";

/// Port the nested control plane's API server listens on (NodePort service)
pub const NESTED_API_PORT: u16 = 30443;
