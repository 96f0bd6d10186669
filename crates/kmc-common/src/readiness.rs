//! Named readiness conditions for nodes and workloads
//!
//! Each check composes a lookup through [`ClusterApi`] with a pure predicate
//! and hands it to [`wait_for`]. Lookup failures (e.g. a 404 before the
//! workload is created) are "not ready yet" to the poller. Timeouts are
//! returned unchanged.

use k8s_openapi::api::core::v1::Node;
use tracing::info;

use crate::kube_utils::{has_condition, ClusterApi, ReplicaCounts, WorkloadRef, CONDITION_READY};
use crate::poll::{wait_for, Condition, PollOutcome, PollPolicy, Probe};
use crate::Error;

/// Ready iff the node reports `Ready=True`
pub fn node_probe(node: &Node) -> Probe {
    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_deref());
    if has_condition(conditions, CONDITION_READY) {
        return Probe::Ready;
    }

    let observed = conditions
        .and_then(|conds| conds.iter().find(|c| c.type_ == CONDITION_READY))
        .map(|c| format!("Ready={}", c.status))
        .unwrap_or_else(|| "no Ready condition".to_string());
    Probe::Pending(observed)
}

/// Ready iff ready replicas equal the desired replicas
pub fn workload_probe(counts: &ReplicaCounts) -> Probe {
    if counts.ready == counts.desired {
        Probe::Ready
    } else {
        Probe::Pending(format!("{}/{} replicas ready", counts.ready, counts.desired))
    }
}

/// Wait until `node` reports Ready
pub async fn node_ready(
    api: &dyn ClusterApi,
    node: &str,
    policy: &PollPolicy,
) -> Result<PollOutcome, Error> {
    let condition = Condition::new(format!("node {} to be Ready", node), move || async move {
        let n = api.get_node(node).await?;
        Ok(node_probe(&n))
    });

    let outcome = wait_for(condition, policy).await?;
    info!(node = %node, attempts = outcome.attempts, "Node is Ready");
    Ok(outcome)
}

/// Wait until `workload` declares `expected_replicas` and all of them are ready
pub async fn workload_ready(
    api: &dyn ClusterApi,
    workload: &WorkloadRef,
    expected_replicas: i32,
    policy: &PollPolicy,
) -> Result<PollOutcome, Error> {
    let condition = Condition::new(
        format!("{} to have {} ready replicas", workload, expected_replicas),
        move || async move {
            let counts = api.workload_replicas(workload).await?;
            if counts.desired != expected_replicas {
                return Ok(Probe::pending(format!(
                    "desired replicas {} (expected {})",
                    counts.desired, expected_replicas
                )));
            }
            Ok(workload_probe(&counts))
        },
    );

    let outcome = wait_for(condition, policy).await?;
    info!(workload = %workload, attempts = outcome.attempts, "Workload is ready");
    Ok(outcome)
}
