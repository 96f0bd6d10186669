//! Cluster API access using kube-rs
//!
//! [`ClusterApi`] is the narrow set of API calls the scenario needs: node and
//! workload lookups for readiness checks, namespace creation, a raw POST for
//! custom resources, and secret reads for access credentials.
//! [`KubeClusterApi`] implements it on top of a kube [`Client`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Node, Secret};
use kube::api::{Api, PostParams};
use kube::Client;
#[cfg(any(test, feature = "mocks"))]
use mockall::automock;
use tracing::{debug, info};

use crate::access::ClusterAccess;
use crate::tunnel::{KubePortForward, Upstream};
use crate::Error;

// Kubernetes condition type constants
/// The "Ready" condition type for nodes
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";
/// Node address type used to reach a node from inside the cluster network
pub const ADDRESS_INTERNAL_IP: &str = "InternalIP";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Kind of a replicated workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment => write!(f, "deployment"),
            Self::StatefulSet => write!(f, "statefulset"),
        }
    }
}

/// Reference to a replicated workload in a namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadRef {
    /// Workload kind
    pub kind: WorkloadKind,
    /// Namespace of the workload
    pub namespace: String,
    /// Name of the workload
    pub name: String,
}

impl WorkloadRef {
    /// Reference a Deployment
    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: WorkloadKind::Deployment,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Reference a StatefulSet
    pub fn stateful_set(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: WorkloadKind::StatefulSet,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Desired vs. observed replica counts of a workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaCounts {
    /// `spec.replicas` (Kubernetes defaults an unset value to 1)
    pub desired: i32,
    /// `status.readyReplicas`
    pub ready: i32,
}

impl ReplicaCounts {
    /// Extract counts from a Deployment
    pub fn from_deployment(deployment: &Deployment) -> Self {
        Self {
            desired: deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1),
            ready: deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }
    }

    /// Extract counts from a StatefulSet
    pub fn from_stateful_set(sts: &StatefulSet) -> Self {
        Self {
            desired: sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            ready: sts
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }
    }
}

/// Check if a Kubernetes condition of the given type has status "True"
///
/// Works for any resource that uses the standard condition format.
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::core::v1::NodeCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Return the first address of type InternalIP reported by a node
pub fn internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| {
            addrs
                .iter()
                .find(|a| a.type_ == ADDRESS_INTERNAL_IP)
                .map(|a| a.address.clone())
        })
}

/// API calls the scenario makes against one cluster
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a node by name
    async fn get_node(&self, name: &str) -> Result<Node, Error>;

    /// Fetch desired/ready replica counts of a workload
    async fn workload_replicas(&self, workload: &WorkloadRef) -> Result<ReplicaCounts, Error>;

    /// Create a namespace; an existing namespace is not an error
    async fn create_namespace(&self, name: &str) -> Result<(), Error>;

    /// POST a raw JSON body to an absolute API path
    async fn post_raw(&self, path: &str, body: Vec<u8>) -> Result<(), Error>;

    /// Read one data key of a secret
    async fn secret_value(&self, namespace: &str, name: &str, key: &str)
        -> Result<Vec<u8>, Error>;
}

/// Resolve a node's InternalIP through the API
pub async fn node_internal_ip(api: &dyn ClusterApi, node: &str) -> Result<String, Error> {
    let n = api.get_node(node).await?;
    internal_ip(&n).ok_or_else(|| {
        Error::internal_with_context(
            "node_internal_ip",
            format!("node {} doesn't have an address of type InternalIP", node),
        )
    })
}

/// [`ClusterApi`] backed by a kube client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client for the given cluster access
    pub async fn connect(access: &ClusterAccess) -> Result<Self, Error> {
        Ok(Self::new(access.client().await?))
    }

    /// The underlying kube client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_node(&self, name: &str) -> Result<Node, Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get(name).await?)
    }

    async fn workload_replicas(&self, workload: &WorkloadRef) -> Result<ReplicaCounts, Error> {
        match workload.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                Ok(ReplicaCounts::from_deployment(&api.get(&workload.name).await?))
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                Ok(ReplicaCounts::from_stateful_set(
                    &api.get(&workload.name).await?,
                ))
            }
        }
    }

    async fn create_namespace(&self, name: &str) -> Result<(), Error> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: kube::core::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        match namespaces.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %name, "Created namespace");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(namespace = %name, "Namespace already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn post_raw(&self, path: &str, body: Vec<u8>) -> Result<(), Error> {
        let request = http::Request::post(path)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .map_err(|e| {
                Error::internal_with_context("post_raw", format!("invalid request: {}", e))
            })?;

        let response = self.client.request_text(request).await?;
        debug!(path = %path, bytes = response.len(), "POST accepted");
        Ok(())
    }

    async fn secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Vec<u8>, Error> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get(name).await?;

        secret
            .data
            .and_then(|mut data| data.remove(key))
            .map(|bytes| bytes.0)
            .ok_or_else(|| {
                Error::internal_with_context(
                    "secret_value",
                    format!("secret {}/{} has no key {}", namespace, name, key),
                )
            })
    }
}

/// Builds API handles and port-forward upstreams from cluster access
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// API handle for the cluster
    async fn api(&self, access: &ClusterAccess) -> Result<Arc<dyn ClusterApi>, Error>;

    /// Port-forward upstream to a pod port in the cluster
    async fn port_forward(
        &self,
        access: &ClusterAccess,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<Arc<dyn Upstream>, Error>;
}

/// [`ClusterConnector`] producing kube-rs backed handles
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn api(&self, access: &ClusterAccess) -> Result<Arc<dyn ClusterApi>, Error> {
        Ok(Arc::new(KubeClusterApi::connect(access).await?))
    }

    async fn port_forward(
        &self,
        access: &ClusterAccess,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<Arc<dyn Upstream>, Error> {
        let client = access.client().await?;
        Ok(Arc::new(KubePortForward::new(client, namespace, pod, port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus, StatefulSetSpec};
    use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeStatus};

    fn node_with_addresses(addresses: Vec<(&str, &str)>) -> Node {
        Node {
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .into_iter()
                        .map(|(t, a)| NodeAddress {
                            type_: t.to_string(),
                            address: a.to_string(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn internal_ip_skips_other_address_types() {
        let node = node_with_addresses(vec![
            ("Hostname", "worker0"),
            ("InternalIP", "172.17.0.3"),
            ("ExternalIP", "10.0.0.1"),
        ]);
        assert_eq!(internal_ip(&node).as_deref(), Some("172.17.0.3"));
    }

    #[test]
    fn internal_ip_missing() {
        let node = node_with_addresses(vec![("Hostname", "worker0")]);
        assert_eq!(internal_ip(&node), None);
        assert_eq!(internal_ip(&Node::default()), None);
    }

    #[tokio::test]
    async fn node_internal_ip_reports_missing_address() {
        let mut api = MockClusterApi::new();
        api.expect_get_node()
            .returning(|_| Ok(node_with_addresses(vec![("Hostname", "worker0")])));

        let err = node_internal_ip(&api, "worker0").await.unwrap_err();
        assert!(err.to_string().contains("InternalIP"));
    }

    #[test]
    fn has_condition_requires_true_status() {
        let conditions = vec![
            NodeCondition {
                type_: "MemoryPressure".to_string(),
                status: "False".to_string(),
                ..Default::default()
            },
            NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            },
        ];
        assert!(has_condition(Some(conditions.as_slice()), CONDITION_READY));
        assert!(!has_condition(Some(conditions.as_slice()), "DiskPressure"));
        assert!(!has_condition::<NodeCondition>(None, CONDITION_READY));
    }

    #[test]
    fn replica_counts_default_desired_to_one() {
        let deployment = Deployment::default();
        assert_eq!(
            ReplicaCounts::from_deployment(&deployment),
            ReplicaCounts {
                desired: 1,
                ready: 0
            }
        );

        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            ReplicaCounts::from_deployment(&deployment),
            ReplicaCounts {
                desired: 3,
                ready: 2
            }
        );

        let sts = StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            ReplicaCounts::from_stateful_set(&sts),
            ReplicaCounts {
                desired: 1,
                ready: 0
            }
        );
    }

    #[test]
    fn workload_ref_display() {
        let sts = WorkloadRef::stateful_set("kmc-test", "kmc-kmc-test");
        assert_eq!(sts.to_string(), "statefulset kmc-test/kmc-kmc-test");
        let deploy = WorkloadRef::deployment("k0smotron", "k0smotron-controller-manager");
        assert_eq!(
            deploy.to_string(),
            "deployment k0smotron/k0smotron-controller-manager"
        );
    }
}
