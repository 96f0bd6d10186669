//! The k0smotron `Cluster` object submitted to the host cluster

use serde::Serialize;

use crate::config::ScenarioConfig;

/// API group/version of k0smotron clusters
pub const API_VERSION: &str = "k0smotron.io/v1beta1";

/// Kind of k0smotron clusters
pub const KIND: &str = "Cluster";

/// Persistence type storing control-plane state in a host directory
pub const PERSISTENCE_HOST_PATH: &str = "hostPath";

/// Object metadata
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Metadata {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
}

/// Service exposing the nested API server
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Kubernetes service type (NodePort, LoadBalancer, ...)
    #[serde(rename = "type")]
    pub type_: String,
}

/// Where the nested control plane keeps its state
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    /// Persistence type
    #[serde(rename = "type")]
    pub type_: String,
    /// Directory on the host node
    pub host_path: String,
}

/// Desired state of the nested cluster
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NestedClusterSpec {
    /// Address workers use to reach the nested API
    pub external_address: String,
    /// API service
    pub service: ServiceSpec,
    /// State storage
    pub persistence: PersistenceSpec,
}

/// A k0smotron `Cluster` with host-path persistence
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NestedCluster {
    /// Always [`API_VERSION`]
    pub api_version: String,
    /// Always [`KIND`]
    pub kind: String,
    /// Name and namespace
    pub metadata: Metadata,
    /// Spec
    pub spec: NestedClusterSpec,
}

impl NestedCluster {
    /// Build the cluster object for `config`, reachable at `external_address`
    pub fn host_path(config: &ScenarioConfig, external_address: &str) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: Metadata {
                name: config.nested_name.clone(),
                namespace: config.nested_namespace.clone(),
            },
            spec: NestedClusterSpec {
                external_address: external_address.to_string(),
                service: ServiceSpec {
                    type_: config.service_type.clone(),
                },
                persistence: PersistenceSpec {
                    type_: PERSISTENCE_HOST_PATH.to_string(),
                    host_path: config.host_path.clone(),
                },
            },
        }
    }

    /// Collection path the object is POSTed to
    pub fn api_path(&self) -> String {
        format!(
            "/apis/{}/namespaces/{}/clusters",
            API_VERSION, self.metadata.namespace
        )
    }

    /// JSON request body
    pub fn to_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_k0smotron_cluster() {
        let cluster = NestedCluster::host_path(&ScenarioConfig::default(), "172.17.0.3");
        let value: serde_json::Value = serde_json::from_slice(&cluster.to_body().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "apiVersion": "k0smotron.io/v1beta1",
                "kind": "Cluster",
                "metadata": {"name": "kmc-test", "namespace": "kmc-test"},
                "spec": {
                    "externalAddress": "172.17.0.3",
                    "service": {"type": "NodePort"},
                    "persistence": {"type": "hostPath", "hostPath": "/tmp/kmc-test"}
                }
            })
        );
    }

    #[test]
    fn api_path_uses_cluster_namespace() {
        let config = ScenarioConfig {
            nested_namespace: "other".to_string(),
            ..Default::default()
        };
        let cluster = NestedCluster::host_path(&config, "10.0.0.1");
        assert_eq!(
            cluster.api_path(),
            "/apis/k0smotron.io/v1beta1/namespaces/other/clusters"
        );
    }
}
