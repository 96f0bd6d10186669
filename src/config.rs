//! Scenario configuration
//!
//! Resolution order, highest first: `KMC_*` environment variables, the YAML
//! (or JSON) file named by `KMC_SCENARIO_CONFIG`, built-in defaults. The
//! defaults reproduce the host-path scenario on a footloose k0s cluster with
//! one controller and one worker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kmc_common::poll::{PollPolicy, DEFAULT_CONVERGENCE_TIMEOUT, DEFAULT_POLL_INTERVAL};
use kmc_common::tunnel::{TunnelOptions, DEFAULT_READY_TIMEOUT};
use kmc_common::{K0SMOTRON_CONTROLLER, K0SMOTRON_NAMESPACE, NESTED_API_PORT};
use kmc_footloose::{K0sSettings, SshSettings};
use serde::Deserialize;

use crate::Error;

/// Variable naming a config file to load before env overrides
pub const CONFIG_FILE_ENV: &str = "KMC_SCENARIO_CONFIG";

/// Source of environment variables
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of `key`, if set
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Poll settings for readiness gates, in seconds
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateSettings {
    /// Delay between evaluations
    pub interval_secs: u64,
    /// Give up after this long; unset waits forever
    pub timeout_secs: Option<u64>,
    /// Interval growth per evaluation (1.0 = fixed)
    pub backoff_multiplier: f64,
    /// Cap for the grown interval
    pub max_interval_secs: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            timeout_secs: Some(DEFAULT_CONVERGENCE_TIMEOUT.as_secs()),
            backoff_multiplier: 1.0,
            max_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
        }
    }
}

impl GateSettings {
    /// Poll policy for every readiness gate
    pub fn policy(&self) -> PollPolicy {
        let interval = Duration::from_secs(self.interval_secs);
        let base = match self.timeout_secs {
            Some(timeout) => PollPolicy::fixed(interval, Duration::from_secs(timeout)),
            None => PollPolicy::unbounded(interval),
        };
        base.with_backoff(
            self.backoff_multiplier,
            Duration::from_secs(self.max_interval_secs.max(self.interval_secs)),
        )
    }
}

/// Every tunable of the host-path scenario
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Host cluster machines
    pub host: K0sSettings,
    /// SSH access to the machines
    pub ssh: SshSettings,
    /// Extra `k0s install controller` arguments
    pub controller_args: Vec<String>,
    /// Host worker that stores the nested cluster's state
    pub host_worker: String,
    /// Machine joined to the nested cluster
    pub nested_worker: String,
    /// Namespace of the operator
    pub operator_namespace: String,
    /// Deployment of the operator
    pub operator_deployment: String,
    /// Operator manifest bundle on the test driver's filesystem
    pub operator_manifest: PathBuf,
    /// Image bundles (paths on the host worker) imported before install
    pub image_bundles: Vec<String>,
    /// Namespace of the nested cluster object
    pub nested_namespace: String,
    /// Name of the nested cluster object
    pub nested_name: String,
    /// Service type exposing the nested API server
    pub service_type: String,
    /// Persistence directory on the host worker
    pub host_path: String,
    /// Entries the persistence directory must contain
    pub required_artifacts: Vec<String>,
    /// API port of the nested control-plane pod
    pub api_port: u16,
    /// Local tunnel port (0 = OS-assigned)
    pub tunnel_local_port: u16,
    /// Seconds to wait for the tunnel to become ready
    pub tunnel_ready_timeout_secs: u64,
    /// Talk to the nested API through the tunnel instead of the external address
    pub route_through_tunnel: bool,
    /// Readiness gate polling
    pub gates: GateSettings,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            host: K0sSettings::default(),
            ssh: SshSettings::default(),
            controller_args: vec![
                "--disable-components=konnectivity-server,metrics-server".to_string(),
            ],
            host_worker: "worker0".to_string(),
            nested_worker: "k0smotron0".to_string(),
            operator_namespace: K0SMOTRON_NAMESPACE.to_string(),
            operator_deployment: K0SMOTRON_CONTROLLER.to_string(),
            operator_manifest: PathBuf::from("/dist/install.yaml"),
            image_bundles: vec!["/dist/bundle.tar".to_string()],
            nested_namespace: "kmc-test".to_string(),
            nested_name: "kmc-test".to_string(),
            service_type: "NodePort".to_string(),
            host_path: "/tmp/kmc-test".to_string(),
            required_artifacts: vec![
                "bin".to_string(),
                "pki".to_string(),
                "manifests".to_string(),
                "konnectivity.conf".to_string(),
            ],
            api_port: NESTED_API_PORT,
            tunnel_local_port: 0,
            tunnel_ready_timeout_secs: DEFAULT_READY_TIMEOUT.as_secs(),
            route_through_tunnel: true,
            gates: GateSettings::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("{}={:?}: {}", key, value, e)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl ScenarioConfig {
    /// Load from the process environment
    pub fn load() -> Result<Self, Error> {
        Self::load_from(&OsEnv)
    }

    /// Load using `env` for the file location and overrides
    pub fn load_from(env: &dyn EnvSource) -> Result<Self, Error> {
        let mut config = match env.var(CONFIG_FILE_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML or JSON file; absent fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Overlay `KMC_*` variables
    pub fn apply_env(&mut self, env: &dyn EnvSource) -> Result<(), Error> {
        let string = |key: &str, target: &mut String| {
            if let Some(v) = env.var(key) {
                *target = v;
            }
        };
        string("KMC_HOST_WORKER", &mut self.host_worker);
        string("KMC_NESTED_WORKER", &mut self.nested_worker);
        string("KMC_NESTED_NAMESPACE", &mut self.nested_namespace);
        string("KMC_NESTED_NAME", &mut self.nested_name);
        string("KMC_HOST_PATH", &mut self.host_path);
        string("KMC_HOST_CONTROLLER", &mut self.host.controller);
        string("KMC_SSH_USER", &mut self.ssh.user);

        if let Some(v) = env.var("KMC_HOST_API_SERVER") {
            self.host.api_server = Some(v);
        }
        if let Some(v) = env.var("KMC_OPERATOR_MANIFEST") {
            self.operator_manifest = PathBuf::from(v);
        }
        if let Some(v) = env.var("KMC_IMAGE_BUNDLES") {
            self.image_bundles = split_list(&v);
        }
        if let Some(v) = env.var("KMC_HOST_WORKERS") {
            self.host.workers = split_list(&v);
        }
        if let Some(v) = env.var("KMC_SSH_KEY") {
            self.ssh.keyfile = Some(PathBuf::from(v));
        }
        if let Some(v) = env.var("KMC_SSH_HOSTS") {
            for entry in split_list(&v) {
                let (node, address) = entry.split_once('=').ok_or_else(|| {
                    Error::config(format!("KMC_SSH_HOSTS entry {:?} is not node=host[:port]", entry))
                })?;
                self.ssh
                    .hosts
                    .insert(node.trim().to_string(), address.trim().to_string());
            }
        }
        if let Some(v) = env.var("KMC_POLL_INTERVAL_SECS") {
            self.gates.interval_secs = parse_env("KMC_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = env.var("KMC_POLL_TIMEOUT_SECS") {
            // 0 requests unbounded waiting
            let secs: u64 = parse_env("KMC_POLL_TIMEOUT_SECS", &v)?;
            self.gates.timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(v) = env.var("KMC_TUNNEL_LOCAL_PORT") {
            self.tunnel_local_port = parse_env("KMC_TUNNEL_LOCAL_PORT", &v)?;
        }
        if let Some(v) = env.var("KMC_ROUTE_THROUGH_TUNNEL") {
            self.route_through_tunnel = parse_env("KMC_ROUTE_THROUGH_TUNNEL", &v)?;
        }
        Ok(())
    }

    /// Reject configurations the scenario cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        let names = [
            ("host.controller", &self.host.controller),
            ("host_worker", &self.host_worker),
            ("nested_worker", &self.nested_worker),
            ("operator_namespace", &self.operator_namespace),
            ("operator_deployment", &self.operator_deployment),
            ("nested_namespace", &self.nested_namespace),
            ("nested_name", &self.nested_name),
            ("service_type", &self.service_type),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(Error::config(format!("{} must not be empty", field)));
            }
        }

        // The node-ready gate only converges for a machine run_workers joins
        if !self.host.workers.contains(&self.host_worker) {
            return Err(Error::config(format!(
                "host_worker {:?} is not one of host.workers {:?}",
                self.host_worker, self.host.workers
            )));
        }

        if !self.host_path.starts_with('/') {
            return Err(Error::config(format!(
                "host_path must be absolute, got {:?}",
                self.host_path
            )));
        }
        if self.required_artifacts.is_empty() {
            return Err(Error::config("required_artifacts must not be empty"));
        }
        if self.api_port == 0 {
            return Err(Error::config("api_port must not be 0"));
        }

        let policy = self.gate_policy();
        policy
            .validate()
            .map_err(|e| Error::config(format!("gates: {}", e)))?;
        if policy.is_degenerate() {
            return Err(Error::config(
                "gates: timeout is shorter than the poll interval",
            ));
        }
        Ok(())
    }

    /// Policy for every readiness gate
    pub fn gate_policy(&self) -> PollPolicy {
        self.gates.policy()
    }

    /// Tunnel options
    pub fn tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            local_port: self.tunnel_local_port,
            ready_timeout: Duration::from_secs(self.tunnel_ready_timeout_secs),
        }
    }

    /// StatefulSet running the nested control plane
    pub fn nested_stateful_set(&self) -> String {
        format!("kmc-{}", self.nested_name)
    }

    /// First (and only) pod of the nested control plane
    pub fn nested_pod(&self) -> String {
        format!("kmc-{}-0", self.nested_name)
    }

    /// Secret holding the nested cluster's admin kubeconfig
    pub fn kubeconfig_secret(&self) -> String {
        format!("kmc-admin-kubeconfig-{}", self.nested_name)
    }
}
