//! The scenario as an ordered list of steps with readiness gates

use std::fmt;

use kmc_common::kube_utils::WorkloadRef;

use crate::config::ScenarioConfig;

/// Steps of the host-path scenario, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepName {
    /// Start the host controller and workers
    BootstrapHost,
    /// Create the persistence directory on the host worker
    PrepareHostPath,
    /// Import operator images into the host worker's runtime
    ImportImages,
    /// Install the k0smotron operator
    InstallOperator,
    /// Create the namespace and POST the nested `Cluster`
    SubmitNestedCluster,
    /// Issue a join token from the nested control plane
    IssueJoinToken,
    /// Join the nested worker with that token
    JoinNestedWorker,
    /// Port-forward to the nested API server
    OpenTunnel,
    /// Build nested cluster access from its admin kubeconfig secret
    ConnectNested,
    /// List the persistence directory and check its entries
    VerifyHostPath,
}

impl StepName {
    /// Stable kebab-case name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BootstrapHost => "bootstrap-host",
            Self::PrepareHostPath => "prepare-host-path",
            Self::ImportImages => "import-images",
            Self::InstallOperator => "install-operator",
            Self::SubmitNestedCluster => "submit-nested-cluster",
            Self::IssueJoinToken => "issue-join-token",
            Self::JoinNestedWorker => "join-nested-worker",
            Self::OpenTunnel => "open-tunnel",
            Self::ConnectNested => "connect-nested",
            Self::VerifyHostPath => "verify-host-path",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which cluster a gate queries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterRole {
    /// The k0s cluster hosting the operator
    Host,
    /// The k0smotron control plane
    Nested,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Nested => write!(f, "nested"),
        }
    }
}

/// Readiness condition that must hold before the next step starts
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Gate {
    /// Node reports Ready
    NodeReady {
        /// Cluster the node belongs to
        cluster: ClusterRole,
        /// Node name
        node: String,
    },
    /// Workload has the expected number of ready replicas
    WorkloadReady {
        /// Cluster running the workload
        cluster: ClusterRole,
        /// The workload
        workload: WorkloadRef,
        /// Expected desired and ready replicas
        replicas: i32,
    },
}

impl Gate {
    /// Cluster the gate queries
    pub fn cluster(&self) -> ClusterRole {
        match self {
            Self::NodeReady { cluster, .. } | Self::WorkloadReady { cluster, .. } => *cluster,
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeReady { cluster, node } => write!(f, "nodeReady({}, {})", cluster, node),
            Self::WorkloadReady {
                cluster,
                workload,
                replicas,
            } => write!(f, "workloadReady({}, {}, {})", cluster, workload, replicas),
        }
    }
}

/// One action and the gate that follows it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    /// What to do
    pub name: StepName,
    /// What must hold afterwards
    pub gate: Option<Gate>,
}

impl Step {
    fn new(name: StepName) -> Self {
        Self { name, gate: None }
    }

    fn gated(name: StepName, gate: Gate) -> Self {
        Self {
            name,
            gate: Some(gate),
        }
    }
}

/// Ordered steps consumed by the orchestrator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    /// The host-path scenario for `config`
    pub fn hostpath(config: &ScenarioConfig) -> Self {
        let mut steps = vec![
            Step::gated(
                StepName::BootstrapHost,
                Gate::NodeReady {
                    cluster: ClusterRole::Host,
                    node: config.host_worker.clone(),
                },
            ),
            Step::new(StepName::PrepareHostPath),
        ];
        if !config.image_bundles.is_empty() {
            steps.push(Step::new(StepName::ImportImages));
        }
        steps.extend([
            Step::gated(
                StepName::InstallOperator,
                Gate::WorkloadReady {
                    cluster: ClusterRole::Host,
                    workload: WorkloadRef::deployment(
                        &config.operator_namespace,
                        &config.operator_deployment,
                    ),
                    replicas: 1,
                },
            ),
            Step::gated(
                StepName::SubmitNestedCluster,
                Gate::WorkloadReady {
                    cluster: ClusterRole::Host,
                    workload: WorkloadRef::stateful_set(
                        &config.nested_namespace,
                        config.nested_stateful_set(),
                    ),
                    replicas: 1,
                },
            ),
            Step::new(StepName::IssueJoinToken),
            Step::new(StepName::JoinNestedWorker),
            Step::new(StepName::OpenTunnel),
            Step::gated(
                StepName::ConnectNested,
                Gate::NodeReady {
                    cluster: ClusterRole::Nested,
                    node: config.nested_worker.clone(),
                },
            ),
            Step::new(StepName::VerifyHostPath),
        ]);
        Self { steps }
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostpath_plan_order_and_gates() {
        let plan = Plan::hostpath(&ScenarioConfig::default());
        let names: Vec<_> = plan.steps().iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                StepName::BootstrapHost,
                StepName::PrepareHostPath,
                StepName::ImportImages,
                StepName::InstallOperator,
                StepName::SubmitNestedCluster,
                StepName::IssueJoinToken,
                StepName::JoinNestedWorker,
                StepName::OpenTunnel,
                StepName::ConnectNested,
                StepName::VerifyHostPath,
            ]
        );

        let gates: Vec<String> = plan
            .steps()
            .iter()
            .filter_map(|s| s.gate.as_ref().map(ToString::to_string))
            .collect();
        assert_eq!(
            gates,
            vec![
                "nodeReady(host, worker0)",
                "workloadReady(host, deployment k0smotron/k0smotron-controller-manager, 1)",
                "workloadReady(host, statefulset kmc-test/kmc-kmc-test, 1)",
                "nodeReady(nested, k0smotron0)",
            ]
        );
    }

    #[test]
    fn import_step_skipped_without_bundles() {
        let config = ScenarioConfig {
            image_bundles: vec![],
            ..Default::default()
        };
        let plan = Plan::hostpath(&config);
        assert!(plan
            .steps()
            .iter()
            .all(|s| s.name != StepName::ImportImages));
        assert_eq!(plan.steps().len(), 9);
    }
}
