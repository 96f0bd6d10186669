//! k0s cluster bootstrap driven over a [`RemoteShell`]
//!
//! The host cluster is one k0s controller plus workers, all footloose
//! machines. Everything here is a thin wrapper over the `k0s` CLI on those
//! machines.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kmc_common::access::ClusterAccess;
use kmc_common::collaborators::{ClusterBootstrap, JoinToken, RemoteShell};
use kmc_common::poll::{wait_for, Condition, PollPolicy, Probe};
use kmc_common::retry::{retry_with_backoff, RetryConfig};
use kmc_common::Error;
use serde::Deserialize;
use tracing::info;

/// File a joining worker reads its token from
pub const WORKER_TOKEN_PATH: &str = "/etc/k0s/worker-token";

/// Machines forming the host cluster
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct K0sSettings {
    /// Controller machine
    pub controller: String,
    /// Worker machines joined by `run_workers`
    pub workers: Vec<String>,
    /// API server URL written into the admin kubeconfig, for drivers that
    /// reach the controller through a forwarded port
    pub api_server: Option<String>,
}

impl Default for K0sSettings {
    fn default() -> Self {
        Self {
            controller: "controller0".to_string(),
            workers: vec!["worker0".to_string()],
            api_server: None,
        }
    }
}

fn quote(value: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(value))
}

fn install_controller_command(args: &[String]) -> String {
    let mut command = String::from("k0s install controller");
    for arg in args {
        command.push(' ');
        command.push_str(&quote(arg));
    }
    command.push_str(" && k0s start");
    command
}

fn join_command(token: &JoinToken) -> String {
    format!(
        "mkdir -p /etc/k0s && printf '%s' {} > {} && k0s install worker --token-file {} && k0s start",
        quote(token.expose()),
        WORKER_TOKEN_PATH,
        WORKER_TOKEN_PATH
    )
}

/// [`ClusterBootstrap`] for k0s on footloose machines
pub struct K0sBootstrap {
    shell: Arc<dyn RemoteShell>,
    settings: K0sSettings,
    ready_policy: PollPolicy,
    retry: RetryConfig,
}

impl K0sBootstrap {
    /// Bootstrap the machines in `settings` through `shell`
    pub fn new(shell: Arc<dyn RemoteShell>, settings: K0sSettings) -> Self {
        Self {
            shell,
            settings,
            ready_policy: PollPolicy::fixed(Duration::from_secs(2), Duration::from_secs(300)),
            retry: RetryConfig::default(),
        }
    }

    /// Override how long to wait for the controller API after start
    pub fn with_ready_policy(mut self, policy: PollPolicy) -> Self {
        self.ready_policy = policy;
        self
    }

    /// Override retries of token creation
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn wait_for_api(&self) -> Result<(), Error> {
        let controller = self.settings.controller.as_str();
        let shell = self.shell.as_ref();
        let condition = Condition::new(
            format!("k0s API on {} to report ready", controller),
            move || async move {
                let out = shell
                    .exec_with_output(controller, "k0s kubectl get --raw=/readyz")
                    .await?;
                Ok(match out.trim() {
                    "ok" => Probe::Ready,
                    other => Probe::pending(other.to_string()),
                })
            },
        );
        wait_for(condition, &self.ready_policy).await?;
        Ok(())
    }

    async fn create_worker_token(&self) -> Result<JoinToken, Error> {
        let controller = self.settings.controller.as_str();
        // The controller may still be generating its CA right after start
        let raw = retry_with_backoff(&self.retry, "k0s_token_create", || {
            self.shell
                .exec_with_output(controller, "k0s token create --role=worker")
        })
        .await?;
        JoinToken::new(raw)
    }

    async fn join(&self, node: &str, token: &JoinToken) -> Result<(), Error> {
        self.shell
            .exec_with_output(node, &join_command(token))
            .await?;
        info!(node = %node, "Worker joined");
        Ok(())
    }
}

#[async_trait]
impl ClusterBootstrap for K0sBootstrap {
    async fn init_controller(&self, args: &[String]) -> Result<(), Error> {
        let controller = &self.settings.controller;
        self.shell
            .exec_with_output(controller, &install_controller_command(args))
            .await?;
        info!(node = %controller, "k0s controller started");
        self.wait_for_api().await
    }

    async fn run_workers(&self) -> Result<(), Error> {
        if self.settings.workers.is_empty() {
            return Ok(());
        }
        let token = self.create_worker_token().await?;
        for worker in &self.settings.workers {
            self.join(worker, &token).await?;
        }
        Ok(())
    }

    async fn run_with_token(&self, node: &str, token: JoinToken) -> Result<(), Error> {
        self.join(node, &token).await
    }

    async fn admin_access(&self) -> Result<ClusterAccess, Error> {
        let yaml = self
            .shell
            .exec_with_output(&self.settings.controller, "k0s kubeconfig admin")
            .await?;
        let access = ClusterAccess::from_kubeconfig_yaml(&yaml)?;

        Ok(match &self.settings.api_server {
            Some(server) => access.with_server(server),
            None => access,
        })
    }

    async fn import_images(&self, node: &str, bundles: &[String]) -> Result<(), Error> {
        for bundle in bundles {
            let command = format!("k0s ctr images import {}", quote(bundle));
            self.shell.exec_with_output(node, &command).await?;
            info!(node = %node, bundle = %bundle, "Imported image bundle");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmc_common::collaborators::MockRemoteShell;
    use mockall::Sequence;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: local
  cluster:
    server: https://172.17.0.2:6443
contexts:
- name: Default
  context:
    cluster: local
    user: user
current-context: Default
users:
- name: user
  user:
    token: abc
"#;

    fn bootstrap(shell: MockRemoteShell, settings: K0sSettings) -> K0sBootstrap {
        K0sBootstrap::new(Arc::new(shell), settings)
            .with_ready_policy(PollPolicy::fixed(
                Duration::from_secs(1),
                Duration::from_secs(5),
            ))
            .with_retry(RetryConfig::with_max_attempts(2))
    }

    #[test]
    fn controller_args_are_quoted() {
        let cmd = install_controller_command(&[
            "--disable-components=konnectivity-server,metrics-server".to_string(),
            "--labels=a b".to_string(),
        ]);
        assert_eq!(
            cmd,
            "k0s install controller --disable-components=konnectivity-server,metrics-server '--labels=a b' && k0s start"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn init_controller_installs_then_waits_for_api() {
        let mut seq = Sequence::new();
        let mut shell = MockRemoteShell::new();
        shell
            .expect_exec_with_output()
            .withf(|node, cmd| node == "controller0" && cmd.starts_with("k0s install controller"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(String::new()));
        shell
            .expect_exec_with_output()
            .withf(|node, cmd| node == "controller0" && cmd == "k0s kubectl get --raw=/readyz")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(Error::remote("controller0", "readyz", "connection refused")));
        shell
            .expect_exec_with_output()
            .withf(|node, cmd| node == "controller0" && cmd == "k0s kubectl get --raw=/readyz")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("ok\n".to_string()));

        bootstrap(shell, K0sSettings::default())
            .init_controller(&[])
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_workers_joins_every_worker_with_one_token() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_exec_with_output()
            .withf(|node, cmd| node == "controller0" && cmd == "k0s token create --role=worker")
            .times(1)
            .returning(|_, _| Ok("H4sIAtoken\n".to_string()));
        shell
            .expect_exec_with_output()
            .withf(|node, cmd| {
                (node == "worker0" || node == "worker1")
                    && cmd.contains("printf '%s' H4sIAtoken > /etc/k0s/worker-token")
                    && cmd.ends_with("k0s start")
            })
            .times(2)
            .returning(|_, _| Ok(String::new()));

        let settings = K0sSettings {
            workers: vec!["worker0".to_string(), "worker1".to_string()],
            ..Default::default()
        };
        bootstrap(shell, settings).run_workers().await.unwrap();
    }

    #[tokio::test]
    async fn admin_access_applies_api_override() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_exec_with_output()
            .withf(|node, cmd| node == "controller0" && cmd == "k0s kubeconfig admin")
            .returning(|_, _| Ok(KUBECONFIG.to_string()));

        let settings = K0sSettings {
            api_server: Some("https://127.0.0.1:36443".to_string()),
            ..Default::default()
        };
        let access = bootstrap(shell, settings).admin_access().await.unwrap();
        assert_eq!(access.server(), Some("https://127.0.0.1:36443"));
    }

    #[tokio::test]
    async fn import_stops_at_first_failure() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_exec_with_output()
            .withf(|node, cmd| node == "worker0" && cmd == "k0s ctr images import /dist/bundle.tar")
            .times(1)
            .returning(|node, cmd| Err(Error::remote(node, cmd, "no such file")));

        let err = bootstrap(shell, K0sSettings::default())
            .import_images(
                "worker0",
                &["/dist/bundle.tar".to_string(), "/dist/other.tar".to_string()],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such file"));
    }
}
