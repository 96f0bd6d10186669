//! Cluster access credentials
//!
//! A [`ClusterAccess`] is an immutable kubeconfig for one cluster. It is cheap
//! to clone and safe to read from several tasks at once; deriving a variant
//! (e.g. pointing it at a tunnel endpoint) produces a new value.

use std::path::Path;
use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::kube_utils::{ClusterApi, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use crate::Error;

/// Secret data key holding the admin kubeconfig of a k0smotron cluster
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Immutable credential bundle (API endpoint + auth material) for one cluster
#[derive(Clone, Debug)]
pub struct ClusterAccess {
    kubeconfig: Arc<Kubeconfig>,
}

impl ClusterAccess {
    /// Parse a kubeconfig document
    pub fn from_kubeconfig_yaml(yaml: &str) -> Result<Self, Error> {
        let kubeconfig = Kubeconfig::from_yaml(yaml)
            .map_err(|e| Error::access(format!("failed to parse kubeconfig: {}", e)))?;
        Self::from_kubeconfig(kubeconfig)
    }

    /// Read a kubeconfig file
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            Error::access(format!(
                "failed to read kubeconfig {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_kubeconfig(kubeconfig)
    }

    /// Wrap an already parsed kubeconfig
    pub fn from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Self, Error> {
        if kubeconfig.clusters.is_empty() {
            return Err(Error::access("kubeconfig defines no clusters"));
        }
        Ok(Self {
            kubeconfig: Arc::new(kubeconfig),
        })
    }

    /// Materialize access from a secret holding an embedded kubeconfig
    pub async fn from_secret(
        api: &dyn ClusterApi,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Self, Error> {
        let raw = api.secret_value(namespace, name, key).await?;
        let yaml = String::from_utf8(raw).map_err(|e| {
            Error::access(format!(
                "secret {}/{} key {} is not valid UTF-8: {}",
                namespace, name, key, e
            ))
        })?;
        Self::from_kubeconfig_yaml(&yaml)
    }

    /// The parsed kubeconfig
    pub fn kubeconfig(&self) -> &Kubeconfig {
        &self.kubeconfig
    }

    /// API server URL of the active cluster
    pub fn server(&self) -> Option<&str> {
        let name = self.active_cluster_name();
        self.kubeconfig
            .clusters
            .iter()
            .find(|c| name.as_deref().map(|n| n == c.name).unwrap_or(true))
            .and_then(|c| c.cluster.as_ref())
            .and_then(|c| c.server.as_deref())
    }

    /// Derive access that talks to `server` instead of the recorded endpoint.
    ///
    /// Only the active cluster entry is rewritten; auth material is untouched.
    pub fn with_server(&self, server: &str) -> Self {
        let mut kubeconfig = (*self.kubeconfig).clone();
        let active = self.active_cluster_name();

        for named in kubeconfig.clusters.iter_mut() {
            if active.as_deref().map(|n| n == named.name).unwrap_or(true) {
                if let Some(cluster) = named.cluster.as_mut() {
                    cluster.server = Some(server.to_string());
                }
            }
        }

        Self {
            kubeconfig: Arc::new(kubeconfig),
        }
    }

    /// Build a kube client with default timeouts
    pub async fn client(&self) -> Result<Client, Error> {
        let mut config =
            Config::from_custom_kubeconfig((*self.kubeconfig).clone(), &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::access(format!("failed to load kubeconfig: {}", e)))?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

        Client::try_from(config)
            .map_err(|e| Error::access(format!("failed to create client: {}", e)))
    }

    /// Name of the cluster referenced by the current context
    fn active_cluster_name(&self) -> Option<String> {
        let current = self.kubeconfig.current_context.as_deref()?;
        self.kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == current)
            .and_then(|c| c.context.as_ref())
            .map(|c| c.cluster.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_utils::MockClusterApi;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: kmc-test
  cluster:
    server: https://172.17.0.3:30443
    insecure-skip-tls-verify: true
- name: other
  cluster:
    server: https://10.0.0.1:6443
contexts:
- name: kmc-test
  context:
    cluster: kmc-test
    user: admin
current-context: kmc-test
users:
- name: admin
  user:
    token: abc
"#;

    #[test]
    fn parses_server_of_active_cluster() {
        let access = ClusterAccess::from_kubeconfig_yaml(KUBECONFIG).unwrap();
        assert_eq!(access.server(), Some("https://172.17.0.3:30443"));
    }

    #[test]
    fn with_server_rewrites_only_active_cluster() {
        let access = ClusterAccess::from_kubeconfig_yaml(KUBECONFIG).unwrap();
        let tunneled = access.with_server("https://127.0.0.1:40000");

        assert_eq!(tunneled.server(), Some("https://127.0.0.1:40000"));
        // Source access is unchanged
        assert_eq!(access.server(), Some("https://172.17.0.3:30443"));
        let other = tunneled
            .kubeconfig()
            .clusters
            .iter()
            .find(|c| c.name == "other")
            .and_then(|c| c.cluster.as_ref())
            .and_then(|c| c.server.clone());
        assert_eq!(other.as_deref(), Some("https://10.0.0.1:6443"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(ClusterAccess::from_kubeconfig_yaml("not: [valid").is_err());
        assert!(ClusterAccess::from_kubeconfig_yaml("apiVersion: v1\nkind: Config\n").is_err());
    }

    #[tokio::test]
    async fn from_secret_reads_embedded_kubeconfig() {
        let mut api = MockClusterApi::new();
        api.expect_secret_value()
            .withf(|ns, name, key| {
                ns == "kmc-test" && name == "kmc-admin-kubeconfig-kmc-test" && key == "kubeconfig"
            })
            .returning(|_, _, _| Ok(KUBECONFIG.as_bytes().to_vec()));

        let access = ClusterAccess::from_secret(
            &api,
            "kmc-test",
            "kmc-admin-kubeconfig-kmc-test",
            KUBECONFIG_SECRET_KEY,
        )
        .await
        .unwrap();
        assert_eq!(access.server(), Some("https://172.17.0.3:30443"));
    }
}
