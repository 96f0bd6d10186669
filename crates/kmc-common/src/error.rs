//! Error types for the integration harness
//!
//! Errors carry the context needed to explain a failed scenario run: which
//! condition did not converge, what was last observed, which node a remote
//! command ran on.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for harness operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A polled condition did not become true in time
    #[error("timed out after {elapsed:?} waiting for {description} (last observed: {last_observed})")]
    Timeout {
        /// Human-readable description of the condition
        description: String,
        /// Last state reported by the condition, or the last evaluation error
        last_observed: String,
        /// Wall-clock time spent before giving up
        elapsed: Duration,
    },

    /// A poll policy that can never be satisfied as configured
    #[error("invalid poll policy: {message}")]
    InvalidPolicy {
        /// What is wrong with the policy
        message: String,
    },

    /// Port-forward tunnel failure
    #[error("tunnel error [{target}]: {message}")]
    Tunnel {
        /// The workload the tunnel points at (namespace/name:port)
        target: String,
        /// Description of what failed
        message: String,
    },

    /// Cluster access (kubeconfig) could not be built or used
    #[error("cluster access error: {message}")]
    Access {
        /// Description of what failed
        message: String,
    },

    /// Command execution on a provisioned host failed
    #[error("remote command failed on {node} ({command}): {message}")]
    Remote {
        /// Node the command ran on
        node: String,
        /// The command line
        command: String,
        /// Captured error output or transport error
        message: String,
    },

    /// Manifest parsing or application error
    #[error("manifest error: {message}")]
    Manifest {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_namespace", "poll")
        context: String,
    },
}

impl Error {
    /// Create a timeout error for a condition
    pub fn timeout(
        description: impl Into<String>,
        last_observed: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self::Timeout {
            description: description.into(),
            last_observed: last_observed.into(),
            elapsed,
        }
    }

    /// Create an invalid policy error
    pub fn invalid_policy(msg: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            message: msg.into(),
        }
    }

    /// Create a tunnel error for the given target
    pub fn tunnel(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Tunnel {
            target: target.into(),
            message: msg.into(),
        }
    }

    /// Create a cluster access error
    pub fn access(msg: impl Into<String>) -> Self {
        Self::Access {
            message: msg.into(),
        }
    }

    /// Create a remote execution error
    pub fn remote(
        node: impl Into<String>,
        command: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Remote {
            node: node.into(),
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a manifest error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest {
            message: msg.into(),
        }
    }

    /// Create an internal error with the default context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::internal_with_context(UNKNOWN_CONTEXT, msg)
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error is a condition timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this is a Kubernetes "not found" response
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(e) } if e.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_reports_description_and_last_state() {
        let err = Error::timeout(
            "node worker0 to be Ready",
            "Ready=False",
            Duration::from_secs(600),
        );
        let msg = err.to_string();
        assert!(err.is_timeout());
        assert!(msg.contains("node worker0 to be Ready"));
        assert!(msg.contains("Ready=False"));
        assert!(msg.contains("600s"));
    }

    #[test]
    fn remote_error_names_node_and_command() {
        let err = Error::remote("worker0", "ls /tmp/kmc-test", "exit status 2");
        assert!(err.to_string().contains("worker0"));
        assert!(err.to_string().contains("ls /tmp/kmc-test"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));

        let err = Error::internal_with_context("create_namespace", "rejected");
        assert!(err.to_string().contains("[create_namespace]"));
    }

    #[test]
    fn not_found_only_for_404() {
        let not_found = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "nodes \"worker0\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }));
        assert!(not_found.is_not_found());

        let conflict = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        }));
        assert!(!conflict.is_not_found());
        assert!(!Error::access("bad kubeconfig").is_not_found());
    }
}
