//! Scenario orchestration
//!
//! [`Orchestrator::run`] walks the [`Plan`] front to back. Each step performs
//! its action through a collaborator, then blocks on its readiness gate. The
//! first failure ends the run: no later step's collaborators are called.
//! The tunnel session, if one was opened, is released on every exit path.

mod plan;
mod verify;

pub use plan::{ClusterRole, Gate, Plan, Step, StepName};
pub use verify::{check_artifacts, list_command, parse_listing};

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kmc_common::access::{ClusterAccess, KUBECONFIG_SECRET_KEY};
use kmc_common::collaborators::{
    ClusterBootstrap, JoinToken, JoinTokenIssuer, OperatorInstaller, RemoteShell,
};
use kmc_common::kube_utils::{node_internal_ip, ClusterApi, ClusterConnector};
use kmc_common::poll::PollPolicy;
use kmc_common::readiness::{node_ready, workload_ready};
use kmc_common::retry::{is_transient, retry_if, RetryConfig};
use kmc_common::tunnel::{TunnelBridge, TunnelSession};
use tokio::time::Instant;
use tracing::{error, info, info_span, Instrument};

use crate::config::ScenarioConfig;
use crate::manifest::NestedCluster;
use crate::Error;

/// External systems the scenario drives
#[derive(Clone)]
pub struct Collaborators {
    /// Host cluster bootstrap and node joins
    pub bootstrap: Arc<dyn ClusterBootstrap>,
    /// Commands on host machines
    pub shell: Arc<dyn RemoteShell>,
    /// API handles and port-forwards
    pub connector: Arc<dyn ClusterConnector>,
    /// Join tokens from the nested control plane
    pub tokens: Arc<dyn JoinTokenIssuer>,
    /// Operator installation
    pub operator: Arc<dyn OperatorInstaller>,
}

/// Timing of one completed step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepReport {
    /// The step
    pub step: StepName,
    /// Action plus gate
    pub elapsed: Duration,
}

/// Outcome of a successful run
#[derive(Clone, Debug)]
pub struct ScenarioReport {
    /// Completed steps in order
    pub steps: Vec<StepReport>,
    /// Entries found in the persistence directory
    pub artifacts: Vec<String>,
    /// Local address the tunnel listened on (released by now)
    pub tunnel_endpoint: Option<SocketAddr>,
}

/// Access plus API handle for one cluster
struct ClusterHandle {
    access: ClusterAccess,
    api: Arc<dyn ClusterApi>,
}

/// Values produced by earlier steps and consumed by later ones
#[derive(Default)]
struct ScenarioState {
    host: Option<ClusterHandle>,
    nested: Option<ClusterHandle>,
    token: Option<JoinToken>,
    tunnel: Option<TunnelSession>,
    listing: Option<String>,
    artifacts: Vec<String>,
}

impl ScenarioState {
    fn host(&self) -> Result<&ClusterHandle, kmc_common::Error> {
        self.host
            .as_ref()
            .ok_or_else(|| missing_state("host cluster is not bootstrapped"))
    }

    fn cluster(&self, role: ClusterRole) -> Result<&ClusterHandle, kmc_common::Error> {
        match role {
            ClusterRole::Host => self.host(),
            ClusterRole::Nested => self
                .nested
                .as_ref()
                .ok_or_else(|| missing_state("nested cluster is not connected")),
        }
    }

    /// Release the tunnel; returns its endpoint if one was open
    fn release_tunnel(&mut self) -> Option<SocketAddr> {
        self.tunnel.take().map(|session| {
            session.close();
            session.local_addr()
        })
    }
}

fn missing_state(msg: &str) -> kmc_common::Error {
    kmc_common::Error::internal_with_context("scenario", msg)
}

/// Runs the host-path scenario
pub struct Orchestrator {
    config: ScenarioConfig,
    collaborators: Collaborators,
    policy: PollPolicy,
    retry: RetryConfig,
}

impl Orchestrator {
    /// Orchestrator for `config` using `collaborators`
    pub fn new(config: ScenarioConfig, collaborators: Collaborators) -> Self {
        let policy = config.gate_policy();
        Self {
            config,
            collaborators,
            policy,
            retry: RetryConfig::default(),
        }
    }

    /// The configuration being run
    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Run every step of the plan in order.
    ///
    /// Fails with the first step error. The tunnel is closed before returning
    /// in both cases.
    pub async fn run(&self) -> Result<ScenarioReport, Error> {
        let plan = Plan::hostpath(&self.config);
        let mut state = ScenarioState::default();

        let result = self.execute(&plan, &mut state).await;
        let tunnel_endpoint = state.release_tunnel();

        match result {
            Ok(steps) => {
                info!(steps = steps.len(), "Scenario passed");
                Ok(ScenarioReport {
                    steps,
                    artifacts: state.artifacts,
                    tunnel_endpoint,
                })
            }
            Err(e) => {
                error!(error = %e, "Scenario failed");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        plan: &Plan,
        state: &mut ScenarioState,
    ) -> Result<Vec<StepReport>, Error> {
        let mut completed = Vec::with_capacity(plan.steps().len());

        for step in plan.steps() {
            let span = info_span!("step", step = %step.name);
            let started = Instant::now();

            self.run_step(step, state).instrument(span).await?;

            let elapsed = started.elapsed();
            info!(
                step = %step.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Step completed"
            );
            completed.push(StepReport {
                step: step.name,
                elapsed,
            });
        }

        Ok(completed)
    }

    async fn run_step(&self, step: &Step, state: &mut ScenarioState) -> Result<(), Error> {
        info!("Step started");

        self.perform(step.name, state)
            .await
            .map_err(|e| Error::step(step.name, e))?;

        if let Some(gate) = &step.gate {
            info!(gate = %gate, "Waiting for gate");
            self.await_gate(gate, state)
                .await
                .map_err(|e| Error::step(step.name, e))?;
        }

        if let Some(listing) = state.listing.take() {
            self.check_host_path(&listing, state)?;
        }
        Ok(())
    }

    async fn perform(
        &self,
        step: StepName,
        state: &mut ScenarioState,
    ) -> Result<(), kmc_common::Error> {
        let config = &self.config;
        let c = &self.collaborators;

        match step {
            StepName::BootstrapHost => {
                c.bootstrap.init_controller(&config.controller_args).await?;
                c.bootstrap.run_workers().await?;
                let access = c.bootstrap.admin_access().await?;
                // Client construction is local; a failure here is a bad kubeconfig
                let api = c.connector.api(&access).await?;
                state.host = Some(ClusterHandle { access, api });
            }
            StepName::PrepareHostPath => {
                let command = format!(
                    "mkdir -p {}",
                    shell_escape::unix::escape(Cow::Borrowed(config.host_path.as_str()))
                );
                c.shell
                    .exec_with_output(&config.host_worker, &command)
                    .await?;
            }
            StepName::ImportImages => {
                c.bootstrap
                    .import_images(&config.host_worker, &config.image_bundles)
                    .await?;
            }
            StepName::InstallOperator => {
                c.operator.install(&state.host()?.access).await?;
            }
            StepName::SubmitNestedCluster => {
                let host = state.host()?;
                retry_if(&self.retry, "create_namespace", is_transient, || {
                    host.api.create_namespace(&config.nested_namespace)
                })
                .await?;

                let address = node_internal_ip(host.api.as_ref(), &config.host_worker).await?;
                let cluster = NestedCluster::host_path(config, &address);
                let body = cluster.to_body().map_err(|e| {
                    kmc_common::Error::internal_with_context("nested_cluster", e.to_string())
                })?;
                host.api.post_raw(&cluster.api_path(), body).await?;
                info!(
                    cluster = %config.nested_name,
                    external_address = %address,
                    "Submitted nested cluster"
                );
            }
            StepName::IssueJoinToken => {
                let token = c
                    .tokens
                    .issue(
                        &state.host()?.access,
                        &config.nested_pod(),
                        &config.nested_namespace,
                    )
                    .await?;
                state.token = Some(token);
            }
            StepName::JoinNestedWorker => {
                let token = state
                    .token
                    .take()
                    .ok_or_else(|| missing_state("no join token issued"))?;
                c.bootstrap
                    .run_with_token(&config.nested_worker, token)
                    .await?;
            }
            StepName::OpenTunnel => {
                let upstream = c
                    .connector
                    .port_forward(
                        &state.host()?.access,
                        &config.nested_namespace,
                        &config.nested_pod(),
                        config.api_port,
                    )
                    .await?;
                let session = TunnelBridge::open(upstream, &config.tunnel_options()).await?;
                state.tunnel = Some(session);
            }
            StepName::ConnectNested => {
                let host = state.host()?;
                let mut access = ClusterAccess::from_secret(
                    host.api.as_ref(),
                    &config.nested_namespace,
                    &config.kubeconfig_secret(),
                    KUBECONFIG_SECRET_KEY,
                )
                .await?;

                if config.route_through_tunnel {
                    let tunnel = state
                        .tunnel
                        .as_ref()
                        .ok_or_else(|| missing_state("tunnel is not open"))?;
                    access = access.with_server(&tunnel.local_url());
                }

                let api = c.connector.api(&access).await?;
                state.nested = Some(ClusterHandle { access, api });
            }
            StepName::VerifyHostPath => {
                let listing = c
                    .shell
                    .exec_with_output(&config.host_worker, &list_command(&config.host_path))
                    .await?;
                state.listing = Some(listing);
            }
        }
        Ok(())
    }

    async fn await_gate(
        &self,
        gate: &Gate,
        state: &ScenarioState,
    ) -> Result<(), kmc_common::Error> {
        let api = state.cluster(gate.cluster())?.api.as_ref();
        let outcome = match gate {
            Gate::NodeReady { node, .. } => node_ready(api, node, &self.policy).await?,
            Gate::WorkloadReady {
                workload, replicas, ..
            } => workload_ready(api, workload, *replicas, &self.policy).await?,
        };
        info!(
            gate = %gate,
            attempts = outcome.attempts,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Gate passed"
        );
        Ok(())
    }

    /// Check a persistence directory listing produced by a step
    fn check_host_path(&self, listing: &str, state: &mut ScenarioState) -> Result<(), Error> {
        state.artifacts = check_artifacts(listing, &self.config.required_artifacts)?;
        info!(
            path = %self.config.host_path,
            entries = state.artifacts.len(),
            "Host path contains required artifacts"
        );
        Ok(())
    }
}
