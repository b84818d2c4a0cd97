//! Repository and environment configuration.
//!
//! The repository configuration is immutable once the repository is
//! created. Environment configurations live inside the manifest tree
//! (`environments/<env>/config.json`), or in a single JSON file in
//! bootstrap mode.

use crate::credentials::{Certificates, Credentials};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which object database backend holds the repository's objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// Embedded LSM keyspace. Never garbage-collected.
    #[default]
    EmbeddedKv,
    /// Loose objects plus packfiles; compacted by the GC.
    DiskPacks,
}

/// Process-scoped repository configuration.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Remote the manifest repository is fetched from and pushed to.
    /// A leading `/` or `./` means a local directory remote.
    pub url: String,
    /// Local path holding the object database.
    pub path: PathBuf,
    pub branch: String,
    pub committer_name: String,
    pub committer_email: String,
    /// Per-call bound on fetch and push.
    pub network_timeout: Duration,
    /// Repack after this many applied transformers; 0 disables GC.
    pub gc_frequency: u64,
    pub storage_backend: StorageBackend,
    /// In bootstrap mode environment configs are read from
    /// `environment_configs_path` instead of the manifest tree.
    pub bootstrap_mode: bool,
    pub environment_configs_path: PathBuf,
    /// If set, a push event is sent here after every write.
    pub argo_webhook_url: Option<String>,
    /// Skip TLS verification on the webhook call (in-cluster use).
    pub argo_insecure: bool,
    /// Browser-facing URL of the repository, as Argo CD knows it.
    pub web_url: String,
    pub credentials: Credentials,
    pub certificates: Certificates,
}

impl RepositoryConfig {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            branch: "master".to_string(),
            committer_name: "drydock".to_string(),
            committer_email: "drydock@example.com".to_string(),
            network_timeout: Duration::from_secs(60),
            gc_frequency: 0,
            storage_backend: StorageBackend::default(),
            bootstrap_mode: false,
            environment_configs_path: PathBuf::new(),
            argo_webhook_url: None,
            argo_insecure: false,
            web_url: String::new(),
            credentials: Credentials::default(),
            certificates: Certificates::default(),
        }
    }

    /// Build a configuration from `DRYDOCK_*` environment variables.
    pub fn from_env() -> Result<Self, crate::Error> {
        let url = std::env::var("DRYDOCK_GIT_URL")
            .map_err(|_| crate::Error::InvalidInput("DRYDOCK_GIT_URL is not set".into()))?;
        let path = std::env::var("DRYDOCK_REPO_PATH").unwrap_or_else(|_| "./repository".into());
        let mut cfg = Self::new(url, path);

        if let Ok(v) = std::env::var("DRYDOCK_GIT_BRANCH") {
            cfg.branch = v;
        }
        if let Ok(v) = std::env::var("DRYDOCK_COMMITTER_NAME") {
            cfg.committer_name = v;
        }
        if let Ok(v) = std::env::var("DRYDOCK_COMMITTER_EMAIL") {
            cfg.committer_email = v;
        }
        if let Ok(v) = std::env::var("DRYDOCK_NETWORK_TIMEOUT_SECS") {
            let secs: u64 = v
                .parse()
                .map_err(|_| crate::Error::InvalidInput("invalid DRYDOCK_NETWORK_TIMEOUT_SECS".into()))?;
            cfg.network_timeout = Duration::from_secs(secs);
        }
        if let Ok(v) = std::env::var("DRYDOCK_GC_FREQUENCY") {
            cfg.gc_frequency = v
                .parse()
                .map_err(|_| crate::Error::InvalidInput("invalid DRYDOCK_GC_FREQUENCY".into()))?;
        }
        if let Ok(v) = std::env::var("DRYDOCK_STORAGE_BACKEND") {
            cfg.storage_backend = match v.as_str() {
                "kv" => StorageBackend::EmbeddedKv,
                "packs" => StorageBackend::DiskPacks,
                other => {
                    return Err(crate::Error::InvalidInput(format!(
                        "unknown storage backend {:?}",
                        other
                    )))
                }
            };
        }
        if let Ok(v) = std::env::var("DRYDOCK_BOOTSTRAP_MODE") {
            cfg.bootstrap_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("DRYDOCK_ENVIRONMENT_CONFIGS_PATH") {
            cfg.environment_configs_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DRYDOCK_ARGO_WEBHOOK_URL") {
            if !v.is_empty() {
                cfg.argo_webhook_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("DRYDOCK_ARGO_INSECURE") {
            cfg.argo_insecure = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("DRYDOCK_WEB_URL") {
            cfg.web_url = v;
        }
        Ok(cfg)
    }

    /// Local directory remotes skip credential and certificate loading.
    pub fn is_local_remote(&self) -> bool {
        self.url.starts_with('/') || self.url.starts_with("./")
    }
}

/// Where an environment receives releases from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamConfig {
    /// Name of the upstream environment, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// True when this environment deploys straight from the latest release.
    pub latest: bool,
}

/// Argo CD target of an environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArgoCdDestination {
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArgoCdConfig {
    pub destination: ArgoCdDestination,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
}

/// Parsed `environments/<env>/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub argo_cd: Option<ArgoCdConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_to_upstream: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RepositoryConfig::new("/remote", "/tmp/repo");
        assert_eq!(cfg.branch, "master");
        assert_eq!(cfg.network_timeout, Duration::from_secs(60));
        assert_eq!(cfg.storage_backend, StorageBackend::EmbeddedKv);
        assert!(cfg.is_local_remote());
    }

    #[test]
    fn test_http_remote_is_not_local() {
        let cfg = RepositoryConfig::new("https://git.example.com/manifests", "/tmp/repo");
        assert!(!cfg.is_local_remote());
    }

    #[test]
    fn test_environment_config_parsing() {
        let raw = r#"{
            "upstream": {"environment": "staging"},
            "argoCd": {"destination": {"server": "https://kubernetes.default.svc", "namespace": "apps"}},
            "environmentGroup": "prod"
        }"#;
        let cfg: EnvironmentConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.upstream.as_ref().unwrap().environment.as_deref(), Some("staging"));
        assert!(!cfg.upstream.as_ref().unwrap().latest);
        assert_eq!(
            cfg.argo_cd.as_ref().unwrap().destination.namespace.as_deref(),
            Some("apps")
        );
        assert_eq!(cfg.environment_group.as_deref(), Some("prod"));
    }

    #[test]
    fn test_environment_config_empty_object() {
        let cfg: EnvironmentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, EnvironmentConfig::default());
    }
}
