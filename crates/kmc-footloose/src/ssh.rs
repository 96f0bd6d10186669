//! Shell command execution on footloose machines over SSH
//!
//! Every call opens its own session and closes it before returning, whether
//! the command succeeded or not. Connection setup is retried because sshd in a
//! freshly started machine container can take a moment to come up.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use kmc_common::collaborators::RemoteShell;
use kmc_common::retry::{retry_with_backoff, RetryConfig};
use kmc_common::Error;
use openssh::{KnownHosts, Session, SessionBuilder};
use serde::Deserialize;
use tracing::{debug, warn};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH connection settings shared by all machines
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SshSettings {
    /// Login user
    pub user: String,
    /// Private key; the SSH agent and default keys are used when unset
    pub keyfile: Option<PathBuf>,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Machine name to `host[:port]`; unmapped machines are dialed by name
    pub hosts: BTreeMap<String, String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            keyfile: None,
            connect_timeout_secs: 10,
            hosts: BTreeMap::new(),
        }
    }
}

/// Resolved address of one machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    /// Hostname or IP
    pub host: String,
    /// SSH port
    pub port: u16,
}

impl SshTarget {
    /// Parse `host` or `host:port`
    pub fn parse(value: &str) -> Result<Self, Error> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::internal_with_context("ssh_target", "empty host"));
        }

        match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                let port = port.parse::<u16>().map_err(|e| {
                    Error::internal_with_context(
                        "ssh_target",
                        format!("invalid port in {}: {}", value, e),
                    )
                })?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Ok(Self {
                host: value.to_string(),
                port: DEFAULT_SSH_PORT,
            }),
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// [`RemoteShell`] backed by `openssh`
#[derive(Clone, Debug)]
pub struct SshShell {
    settings: SshSettings,
    retry: RetryConfig,
}

impl SshShell {
    /// Create a shell with default connect retries
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings,
            retry: RetryConfig::default(),
        }
    }

    /// Override the connect retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Address used to reach `node`
    pub fn target(&self, node: &str) -> Result<SshTarget, Error> {
        let address = self
            .settings
            .hosts
            .get(node)
            .map(String::as_str)
            .unwrap_or(node);
        SshTarget::parse(address)
    }

    fn builder(&self, target: &SshTarget) -> SessionBuilder {
        let mut builder = SessionBuilder::default();
        builder
            .user(self.settings.user.clone())
            .port(target.port)
            .connect_timeout(Duration::from_secs(self.settings.connect_timeout_secs))
            // Machines are recreated per run with fresh host keys
            .known_hosts_check(KnownHosts::Accept)
            .user_known_hosts_file("/dev/null");
        if let Some(keyfile) = &self.settings.keyfile {
            builder.keyfile(keyfile);
        }
        builder
    }

    async fn connect(&self, node: &str) -> Result<Session, Error> {
        let target = self.target(node)?;
        let builder = self.builder(&target);

        retry_with_backoff(&self.retry, "ssh_connect", || async {
            builder
                .connect(&target.host)
                .await
                .map_err(|e| Error::remote(node, "<connect>", e.to_string()))
        })
        .await
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec_with_output(&self, node: &str, command: &str) -> Result<String, Error> {
        let session = self.connect(node).await?;
        debug!(node = %node, command = %command, "Running remote command");

        let result = session.shell(command).output().await;

        // Release the connection before looking at the result
        if let Err(e) = session.close().await {
            warn!(node = %node, error = %e, "Failed to close SSH session");
        }

        let output = result.map_err(|e| Error::remote(node, command, e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::remote(
                node,
                command,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }

        String::from_utf8(output.stdout).map_err(|e| {
            Error::remote(node, command, format!("output is not valid UTF-8: {}", e))
        })
    }
}
