//! Operator installation from a multi-document YAML bundle
//!
//! Documents are applied with server-side apply. Namespaces and CRDs go
//! first, then discovery is refreshed so the operator's own kinds resolve,
//! then everything else in kind priority order.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::Discovery;
use kube::Client;
use tracing::{debug, info};

use crate::access::ClusterAccess;
use crate::collaborators::OperatorInstaller;
use crate::Error;

/// Field manager recorded on applied objects
pub const FIELD_MANAGER: &str = "kmc-inttest";

/// Get priority for a Kubernetes resource kind (lower = apply first)
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" => 7,
        _ => 10,
    }
}

/// Split a multi-document YAML stream into documents that declare a kind
pub fn split_yaml_documents(yaml: &str) -> Vec<String> {
    yaml.split("\n---")
        .map(|doc| doc.trim().trim_start_matches("---").trim())
        .filter(|doc| !doc.is_empty() && doc.contains("kind:"))
        .map(str::to_string)
        .collect()
}

/// Parsed identity of one manifest document
#[derive(Debug)]
struct Document {
    gvk: GroupVersionKind,
    name: String,
    namespace: Option<String>,
    body: serde_json::Value,
}

impl Document {
    fn parse(manifest: &str) -> Result<Self, Error> {
        let body: serde_json::Value = serde_yaml::from_str(manifest)
            .map_err(|e| Error::manifest(format!("invalid YAML: {}", e)))?;

        let field = |pointer: &str| body.pointer(pointer).and_then(|v| v.as_str());
        let kind = field("/kind").ok_or_else(|| Error::manifest("missing kind"))?;
        let api_version =
            field("/apiVersion").ok_or_else(|| Error::manifest("missing apiVersion"))?;
        let name = field("/metadata/name")
            .ok_or_else(|| Error::manifest(format!("{} without metadata.name", kind)))?;

        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let name = name.to_string();
        let namespace = field("/metadata/namespace").map(str::to_string);

        Ok(Self {
            gvk,
            name,
            namespace,
            body,
        })
    }

    fn is_foundational(&self) -> bool {
        self.gvk.kind == "Namespace" || self.gvk.kind == "CustomResourceDefinition"
    }
}

/// Apply manifests in two phases (foundational kinds, then the rest)
pub async fn apply_manifests(client: &Client, manifests: &[String]) -> Result<usize, Error> {
    let mut documents = manifests
        .iter()
        .map(|m| Document::parse(m))
        .collect::<Result<Vec<_>, _>>()?;
    documents.sort_by_key(|d| kind_priority(&d.gvk.kind));

    let (foundational, rest): (Vec<Document>, Vec<Document>) =
        documents.into_iter().partition(Document::is_foundational);

    let params = PatchParams::apply(FIELD_MANAGER).force();
    let mut applied = 0;

    for phase in [foundational, rest] {
        if phase.is_empty() {
            continue;
        }
        // Rerun per phase so CRDs from the first phase are known
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(|e| Error::manifest(format!("API discovery failed: {}", e)))?;

        for document in &phase {
            apply_document(client, &discovery, document, &params).await?;
            applied += 1;
        }
    }

    Ok(applied)
}

async fn apply_document(
    client: &Client,
    discovery: &Discovery,
    document: &Document,
    params: &PatchParams,
) -> Result<(), Error> {
    let (resource, _) = discovery.resolve_gvk(&document.gvk).ok_or_else(|| {
        Error::manifest(format!(
            "unknown resource type {}/{} {}",
            document.gvk.group, document.gvk.version, document.gvk.kind
        ))
    })?;

    let api: Api<DynamicObject> = match &document.namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
        None => Api::all_with(client.clone(), &resource),
    };

    api.patch(&document.name, params, &Patch::Apply(&document.body))
        .await
        .map_err(|e| {
            Error::manifest(format!(
                "failed to apply {} {}: {}",
                document.gvk.kind, document.name, e
            ))
        })?;

    debug!(
        kind = %document.gvk.kind,
        name = %document.name,
        namespace = ?document.namespace,
        "Applied manifest"
    );
    Ok(())
}

/// [`OperatorInstaller`] that applies a YAML bundle from disk
#[derive(Clone, Debug)]
pub struct ManifestInstaller {
    bundle_path: PathBuf,
}

impl ManifestInstaller {
    /// Install from the bundle at `bundle_path`
    pub fn new(bundle_path: impl Into<PathBuf>) -> Self {
        Self {
            bundle_path: bundle_path.into(),
        }
    }

    /// Path of the manifest bundle
    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    async fn load(&self) -> Result<Vec<String>, Error> {
        let yaml = tokio::fs::read_to_string(&self.bundle_path)
            .await
            .map_err(|e| {
                Error::manifest(format!(
                    "failed to read {}: {}",
                    self.bundle_path.display(),
                    e
                ))
            })?;

        let documents = split_yaml_documents(&yaml);
        if documents.is_empty() {
            return Err(Error::manifest(format!(
                "{} contains no manifests",
                self.bundle_path.display()
            )));
        }
        Ok(documents)
    }
}

#[async_trait]
impl OperatorInstaller for ManifestInstaller {
    async fn install(&self, access: &ClusterAccess) -> Result<(), Error> {
        let documents = self.load().await?;
        let client = access.client().await?;
        let applied = apply_manifests(&client, &documents).await?;
        info!(
            bundle = %self.bundle_path.display(),
            applied,
            "Applied operator manifests"
        );
        Ok(())
    }
}
