//! Webhook dispatcher for Argo CD.
//!
//! Sends a GitHub-shaped push event after every successful push so Argo
//! CD refreshes the affected applications immediately instead of on its
//! polling interval. Failures are logged and never fail the originating
//! request: the commit is already durable on the remote.

use crate::argocd::{PayloadCommit, PayloadRepository, PushPayload, API_VERSION};
use crate::config::RepositoryConfig;
use crate::transform::ChangeSet;
use crate::Error;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Attempts per commit. This runs inside a user request, so the budget
/// is tight.
const MAX_ATTEMPTS: u32 = 3;

pub struct WebhookDispatcher {
    url: String,
    web_url: String,
    branch: String,
    client: reqwest::Client,
    max_attempts: u32,
}

impl WebhookDispatcher {
    /// Build a dispatcher from the repository configuration. Returns
    /// `None` when no webhook URL is configured.
    pub fn from_config(config: &RepositoryConfig) -> Result<Option<Self>, Error> {
        let url = match &config.argo_webhook_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => return Ok(None),
        };
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
        if config.argo_insecure {
            // Argo CD is reached from inside the cluster without TLS.
            builder = builder.danger_accept_invalid_certs(true);
        }
        let certificates = config.certificates.load()?;
        builder = certificates.apply(builder);
        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("building webhook client: {}", e)))?;
        Ok(Some(Self {
            url,
            web_url: config.web_url.clone(),
            branch: config.branch.clone(),
            client,
            max_attempts: MAX_ATTEMPTS,
        }))
    }

    #[cfg(test)]
    pub fn for_tests(url: &str, web_url: &str, branch: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            web_url: web_url.to_string(),
            branch: branch.to_string(),
            client: reqwest::Client::new(),
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// Build the payload for an applied change-set.
    pub fn payload(&self, changes: &ChangeSet) -> PushPayload {
        let mut modified = Vec::with_capacity(changes.changed_apps.len());
        for change in &changes.changed_apps {
            modified.push(format!(
                "environments/{}/applications/{}/manifests/manifests.yaml",
                change.env, change.app
            ));
        }
        let mut removed = Vec::with_capacity(changes.deleted_root_apps.len());
        for root in &changes.deleted_root_apps {
            removed.push(format!("argocd/{}/{}.yaml", API_VERSION, root.env));
        }

        let (before, after) = match &changes.commits {
            Some(ids) => (
                ids.previous.map(|id| id.to_string()).unwrap_or_default(),
                ids.current.to_string(),
            ),
            None => (String::new(), String::new()),
        };

        PushPayload {
            git_ref: format!("refs/heads/{}", self.branch),
            before,
            after,
            repository: PayloadRepository {
                // Argo CD matches this against its configured repo URL and
                // silently ignores the event on mismatch.
                html_url: self.web_url.clone(),
                default_branch: self.branch.clone(),
            },
            commits: vec![PayloadCommit {
                added: Vec::new(),
                modified,
                removed,
            }],
        }
    }

    /// Fire the webhook with bounded retries. 5xx responses retry with a
    /// linearly growing sleep; any other status is terminal.
    pub async fn dispatch(&self, changes: &ChangeSet, cancellation: &CancellationToken) {
        let payload = self.payload(changes);
        let url = format!("{}/api/webhook", self.url);

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.post_once(&url, &payload).await {
                Ok(()) => {
                    info!(attempt, url = %url, "argo webhook delivered");
                    return;
                }
                Err(PostError::Retryable(msg)) => {
                    warn!(attempt, url = %url, error = %msg, "argo webhook attempt failed");
                    last_error = msg;
                    let backoff = Duration::from_millis(100 * attempt as u64);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancellation.cancelled() => {
                            warn!(url = %url, "argo webhook abandoned, request cancelled");
                            return;
                        }
                    }
                }
                Err(PostError::Terminal(msg)) => {
                    warn!(attempt, url = %url, error = %msg, "argo webhook rejected");
                    return;
                }
            }
        }
        tracing::error!(
            attempts = self.max_attempts,
            url = %url,
            error = %last_error,
            "argo webhook failed after all attempts"
        );
    }

    async fn post_once(&self, url: &str, payload: &PushPayload) -> Result<(), PostError> {
        let resp = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            // Argo CD only accepts events that look like they came from
            // GitHub.
            .header("X-GitHub-Event", "push")
            .json(payload)
            .send()
            .await
            .map_err(|e| PostError::Terminal(format!("could not send request: {}", e)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let message = format!("unexpected status {} from argo", status);
        if status.is_server_error() {
            Err(PostError::Retryable(message))
        } else {
            Err(PostError::Terminal(message))
        }
    }
}

enum PostError {
    Retryable(String),
    Terminal(String),
}
