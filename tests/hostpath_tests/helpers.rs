//! Wiring of the real collaborators

use std::sync::Arc;

use kmc_common::kube_utils::KubeConnector;
use kmc_common::manifests::ManifestInstaller;
use kmc_common::telemetry::{init_telemetry, TelemetryConfig};
use kmc_footloose::{K0sBootstrap, PodExecTokenIssuer, SshShell};
use kmc_inttest::{Collaborators, ScenarioConfig};

/// Install logging once per test binary
pub fn init_test_telemetry() {
    if let Err(e) = init_telemetry(TelemetryConfig::default()) {
        eprintln!("telemetry disabled: {e}");
    }
}

/// SSH-backed k0s bootstrap, kube-rs connector, pod exec tokens and the
/// manifest bundle named by `config`
pub fn footloose_collaborators(config: &ScenarioConfig) -> Collaborators {
    let shell = Arc::new(SshShell::new(config.ssh.clone()));
    let bootstrap = K0sBootstrap::new(shell.clone(), config.host.clone())
        .with_ready_policy(config.gate_policy());

    Collaborators {
        bootstrap: Arc::new(bootstrap),
        shell,
        connector: Arc::new(KubeConnector),
        tokens: Arc::new(PodExecTokenIssuer::new()),
        operator: Arc::new(ManifestInstaller::new(config.operator_manifest.clone())),
    }
}
