//! Argo CD integration types.
//!
//! After every transform the engine regenerates one YAML file per
//! Argo-managed environment (`argocd/v1alpha1/<env>.yaml`) listing an
//! Application for each deployed app. The push-payload types mimic a
//! GitHub webhook body closely enough for Argo CD's webhook endpoint.

use crate::config::EnvironmentConfig;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The manifest API version currently rendered.
pub const API_VERSION: &str = "v1alpha1";

/// One application to render into an environment's file.
#[derive(Debug, Clone)]
pub struct AppData {
    pub name: String,
    pub team: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Application {
    api_version: String,
    kind: String,
    metadata: Metadata,
    spec: ApplicationSpec,
}

#[derive(Debug, Serialize)]
struct Metadata {
    name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationSpec {
    project: String,
    source: ApplicationSource,
    destination: Destination,
    sync_policy: SyncPolicy,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationSource {
    repo_url: String,
    path: String,
    target_revision: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Destination {
    server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncPolicy {
    automated: SyncAutomated,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sync_options: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncAutomated {
    prune: bool,
    self_heal: bool,
}

/// Render the per-API-version manifest files for one environment.
///
/// Applications appear in the order given; callers pass them sorted so
/// the output is deterministic.
pub fn render(
    repo_url: &str,
    branch: &str,
    env: &str,
    config: &EnvironmentConfig,
    apps: &[AppData],
) -> Result<BTreeMap<String, Vec<u8>>, Error> {
    let argo = config
        .argo_cd
        .as_ref()
        .ok_or_else(|| Error::InvalidInput(format!("environment {} has no argocd config", env)))?;

    let mut docs = Vec::with_capacity(apps.len());
    for app in apps {
        let mut labels = BTreeMap::new();
        if !app.team.is_empty() {
            labels.insert("team".to_string(), app.team.clone());
        }
        let application = Application {
            api_version: format!("argoproj.io/{}", API_VERSION),
            kind: "Application".to_string(),
            metadata: Metadata {
                name: format!("{}-{}", env, app.name),
                labels,
            },
            spec: ApplicationSpec {
                project: env.to_string(),
                source: ApplicationSource {
                    repo_url: repo_url.to_string(),
                    path: format!("environments/{}/applications/{}/manifests", env, app.name),
                    target_revision: branch.to_string(),
                },
                destination: Destination {
                    server: argo.destination.server.clone(),
                    namespace: argo.destination.namespace.clone(),
                },
                sync_policy: SyncPolicy {
                    automated: SyncAutomated {
                        prune: true,
                        self_heal: true,
                    },
                    sync_options: argo.sync_options.clone(),
                },
            },
        };
        let doc = serde_yaml::to_string(&application)
            .map_err(|e| Error::Internal(format!("rendering application {}: {}", app.name, e)))?;
        docs.push(doc);
    }

    let mut result = BTreeMap::new();
    result.insert(API_VERSION.to_string(), docs.join("---\n").into_bytes());
    Ok(result)
}

// ─────────────────────────────────────────────────────
// Webhook payload (GitHub push event shape)
// ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Empty string when the pushed commit has no parent.
    pub before: String,
    pub after: String,
    pub repository: PayloadRepository,
    pub commits: Vec<PayloadCommit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadRepository {
    pub html_url: String,
    pub default_branch: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadCommit {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}
