//! Interfaces of the external systems the scenario drives
//!
//! Cluster bootstrap, remote command execution, join-token issuance and
//! operator installation are consumed through these traits only. Adapters
//! for footloose machines live in the `kmc-footloose` crate; tests use the
//! generated mocks.

use std::fmt;

use async_trait::async_trait;
#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

use crate::access::ClusterAccess;
use crate::Error;

/// Short-lived credential that lets a node register with a control plane.
///
/// Consumed by value when a node joins. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinToken(String);

impl JoinToken {
    /// Wrap a raw token, trimming surrounding whitespace from command output
    pub fn new(token: impl AsRef<str>) -> Result<Self, Error> {
        let token = token.as_ref().trim();
        if token.is_empty() {
            return Err(Error::internal_with_context(
                "join_token",
                "issuer returned an empty token",
            ));
        }
        Ok(Self(token.to_string()))
    }

    /// Borrow the secret value
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Take the secret value
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JoinToken(<redacted, {} bytes>)", self.0.len())
    }
}

/// Provisions the host cluster and joins nodes
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait ClusterBootstrap: Send + Sync {
    /// Install and start the controller with extra arguments
    async fn init_controller(&self, args: &[String]) -> Result<(), Error>;

    /// Join the host cluster's workers to the controller
    async fn run_workers(&self) -> Result<(), Error>;

    /// Join `node` to whichever control plane issued `token`
    async fn run_with_token(&self, node: &str, token: JoinToken) -> Result<(), Error>;

    /// Admin access to the host cluster
    async fn admin_access(&self) -> Result<ClusterAccess, Error>;

    /// Import container image bundles into the runtime on `node`
    async fn import_images(&self, node: &str, bundles: &[String]) -> Result<(), Error>;
}

/// Runs shell commands on provisioned hosts.
///
/// Every call uses its own connection, released before returning whether the
/// command succeeded or not.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` on `node` and return its standard output
    async fn exec_with_output(&self, node: &str, command: &str) -> Result<String, Error>;
}

/// Issues join tokens from a control plane
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait JoinTokenIssuer: Send + Sync {
    /// Issue a worker token from the control plane running in `namespace/pod`
    async fn issue(
        &self,
        access: &ClusterAccess,
        pod: &str,
        namespace: &str,
    ) -> Result<JoinToken, Error>;
}

/// Installs the hosting operator into a cluster
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait OperatorInstaller: Send + Sync {
    /// Apply the operator's manifests
    async fn install(&self, access: &ClusterAccess) -> Result<(), Error>;
}
