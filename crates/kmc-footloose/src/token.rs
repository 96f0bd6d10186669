//! Join-token issuance by exec'ing `k0s token create` in a control-plane pod

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kmc_common::access::ClusterAccess;
use kmc_common::collaborators::{JoinToken, JoinTokenIssuer};
use kmc_common::retry::{is_transient, retry_if, RetryConfig};
use kmc_common::Error;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Command that prints a worker join token
pub const TOKEN_CREATE_COMMAND: [&str; 4] = ["k0s", "token", "create", "--role=worker"];

/// [`JoinTokenIssuer`] using the pod exec subresource
#[derive(Clone, Debug, Default)]
pub struct PodExecTokenIssuer {
    retry: RetryConfig,
}

impl PodExecTokenIssuer {
    /// Issuer with default retries
    pub fn new() -> Self {
        Self::default()
    }

    /// Override retries of the exec call
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

async fn exec_token_create(client: &Client, namespace: &str, pod: &str) -> Result<String, Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = AttachParams::default().stdout(true).stderr(true);
    let mut attached = pods.exec(pod, TOKEN_CREATE_COMMAND, &params).await?;

    let target = format!("{}/{}", namespace, pod);
    let command = TOKEN_CREATE_COMMAND.join(" ");

    let mut stdout = String::new();
    if let Some(mut reader) = attached.stdout() {
        reader
            .read_to_string(&mut stdout)
            .await
            .map_err(|e| Error::remote(&target, &command, format!("reading stdout: {}", e)))?;
    }
    let mut stderr = String::new();
    if let Some(mut reader) = attached.stderr() {
        // Best effort; stderr only enriches the error
        let _ = reader.read_to_string(&mut stderr).await;
    }

    if let Some(status) = attached.take_status() {
        if let Some(status) = status.await {
            if status.status.as_deref() == Some("Failure") {
                return Err(Error::remote(
                    &target,
                    &command,
                    format!(
                        "{}: {}",
                        status.message.unwrap_or_default(),
                        stderr.trim()
                    ),
                ));
            }
        }
    }
    attached
        .join()
        .await
        .map_err(|e| Error::remote(&target, &command, e.to_string()))?;

    debug!(pod = %target, bytes = stdout.len(), "Token command finished");
    Ok(stdout)
}

#[async_trait]
impl JoinTokenIssuer for PodExecTokenIssuer {
    async fn issue(
        &self,
        access: &ClusterAccess,
        pod: &str,
        namespace: &str,
    ) -> Result<JoinToken, Error> {
        let client = access.client().await?;
        let raw = retry_if(&self.retry, "issue_join_token", is_transient, || {
            exec_token_create(&client, namespace, pod)
        })
        .await?;

        let token = JoinToken::new(raw)?;
        info!(pod = %pod, namespace = %namespace, "Issued join token");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_command_targets_workers() {
        assert_eq!(TOKEN_CREATE_COMMAND.join(" "), "k0s token create --role=worker");
    }
}
