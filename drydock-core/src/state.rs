//! Read-only view of the manifest tree at a commit.
//!
//! A `State` is created per read operation or per write attempt and
//! discarded afterwards. Accessors translate the on-disk layout
//! (environments, applications, releases, locks, version symlinks) into
//! typed values. Absent files are zero values; present-but-malformed
//! content is an error.

use crate::config::EnvironmentConfig;
use crate::object::ObjectId;
use crate::transform::Actor;
use crate::treefs::{self, FsError, TreeFs};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A versioned release of an application.
#[derive(Debug, Clone, Default)]
pub struct Release {
    pub version: u64,
    /// True for releases with intentionally empty manifests, used to
    /// garbage-collect an application through the normal release cycle.
    pub undeploy: bool,
    pub source_author: String,
    pub source_commit_id: String,
    pub source_message: String,
    pub display_version: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// A lock blocking automated deployment of its enclosing scope.
#[derive(Debug, Clone)]
pub struct Lock {
    pub message: String,
    pub created_by: Actor,
    pub created_at: Option<DateTime<Utc>>,
}

/// State view over a tree filesystem at a specific commit.
pub struct State {
    pub fs: TreeFs,
    /// The commit this state was opened at; `None` for an empty repository.
    pub head: Option<ObjectId>,
    bootstrap_mode: bool,
    environment_configs_path: PathBuf,
}

impl State {
    pub fn new(
        fs: TreeFs,
        head: Option<ObjectId>,
        bootstrap_mode: bool,
        environment_configs_path: PathBuf,
    ) -> Self {
        Self {
            fs,
            head,
            bootstrap_mode,
            environment_configs_path,
        }
    }

    // ── Releases ──────────────────────────────────────────────

    /// Release numbers of an application, sorted ascending. Directory
    /// entries that are not numeric are skipped.
    pub fn releases(&self, application: &str) -> Result<Vec<u64>> {
        let dir = format!("applications/{}/releases", application);
        let entries = match self.fs.read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut result: Vec<u64> = entries
            .iter()
            .filter_map(|e| e.name.parse::<u64>().ok())
            .collect();
        result.sort_unstable();
        Ok(result)
    }

    /// Per-environment manifest content of one release.
    pub fn release_manifests(&self, application: &str, release: u64) -> Result<BTreeMap<String, String>> {
        let base = format!("applications/{}/releases/{}/manifests", application, release);
        let entries = self.fs.read_dir(&base).map_err(|e| {
            if e.is_not_found() {
                Error::InvalidInput(format!(
                    "application {} has no release {}",
                    application, release
                ))
            } else {
                e.into()
            }
        })?;
        let mut result = BTreeMap::new();
        for entry in entries {
            let path = format!("{}/{}/manifests.yaml", base, entry.name);
            let data = self.fs.read_file(&path)?;
            let content = String::from_utf8(data.to_vec())
                .map_err(|_| Error::Internal(format!("{}: manifest is not utf-8", path)))?;
            result.insert(entry.name, content);
        }
        Ok(result)
    }

    /// Release metadata; missing files map to zero values.
    pub fn application_release(&self, application: &str, release: u64) -> Result<Release> {
        let base = format!("applications/{}/releases/{}", application, release);
        self.fs.stat(&base).map_err(|e| {
            if e.is_not_found() {
                Error::InvalidInput(format!(
                    "application {} has no release {}",
                    application, release
                ))
            } else {
                Error::from(e)
            }
        })?;

        let mut result = Release {
            version: release,
            ..Default::default()
        };
        if let Some(v) = self.read_optional(&format!("{}/source_commit_id", base))? {
            result.source_commit_id = v;
        }
        if let Some(v) = self.read_optional(&format!("{}/source_author", base))? {
            result.source_author = v;
        }
        if let Some(v) = self.read_optional(&format!("{}/source_message", base))? {
            result.source_message = v;
        }
        if let Some(v) = self.read_optional(&format!("{}/display_version", base))? {
            result.display_version = v;
        }
        if let Some(v) = self.read_optional(&format!("{}/created_at", base))? {
            let parsed = DateTime::parse_from_rfc3339(v.trim())
                .map_err(|e| Error::Internal(format!("{}/created_at: {}", base, e)))?;
            result.created_at = Some(parsed.with_timezone(&Utc));
        }
        result.undeploy = self.is_undeploy_version(application, release)?;
        Ok(result)
    }

    /// Presence of the `undeploy` sentinel file in a release.
    pub fn is_undeploy_version(&self, application: &str, release: u64) -> Result<bool> {
        let base = format!("applications/{}/releases/{}", application, release);
        self.fs.stat(&base).map_err(|e| {
            if e.is_not_found() {
                Error::InvalidInput(format!(
                    "application {} has no release {}",
                    application, release
                ))
            } else {
                Error::from(e)
            }
        })?;
        Ok(self.read_optional(&format!("{}/undeploy", base))?.is_some())
    }

    pub fn applications(&self) -> Result<Vec<String>> {
        self.dir_names("applications")
    }

    /// Team owning an application; empty when unset.
    pub fn team_owner(&self, application: &str) -> Result<String> {
        Ok(self
            .read_optional(&format!("applications/{}/team", application))?
            .unwrap_or_default())
    }

    /// Source repository of an application; empty when unset.
    pub fn source_repo_url(&self, application: &str) -> Result<String> {
        Ok(self
            .read_optional(&format!("applications/{}/sourceRepoUrl", application))?
            .unwrap_or_default())
    }

    // ── Locks ─────────────────────────────────────────────────

    pub fn environment_locks(&self, environment: &str) -> Result<BTreeMap<String, Lock>> {
        self.read_locks(&format!("environments/{}/locks", environment))
    }

    pub fn environment_application_locks(
        &self,
        environment: &str,
        application: &str,
    ) -> Result<BTreeMap<String, Lock>> {
        self.read_locks(&format!(
            "environments/{}/applications/{}/locks",
            environment, application
        ))
    }

    fn read_locks(&self, base: &str) -> Result<BTreeMap<String, Lock>> {
        let entries = match self.fs.read_dir(base) {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut result = BTreeMap::new();
        for entry in entries {
            if !entry.is_dir() {
                return Err(Error::LocksDirectoryFile {
                    path: format!("{}/{}", base, entry.name),
                });
            }
            let lock = self.read_lock(&format!("{}/{}", base, entry.name))?;
            result.insert(entry.name, lock);
        }
        Ok(result)
    }

    fn read_lock(&self, dir: &str) -> Result<Lock> {
        let message = self.read_optional(&format!("{}/message", dir))?.unwrap_or_default();
        let name = self
            .read_optional(&format!("{}/created_by_name", dir))?
            .unwrap_or_default();
        let email = self
            .read_optional(&format!("{}/created_by_email", dir))?
            .unwrap_or_default();
        let created_at = match self.read_optional(&format!("{}/created_at", dir))? {
            None => None,
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw.trim())
                    .map_err(|e| Error::Internal(format!("{}/created_at: {}", dir, e)))?
                    .with_timezone(&Utc),
            ),
        };
        Ok(Lock {
            message,
            created_by: Actor::new(name, email),
            created_at,
        })
    }

    // ── Deployments ───────────────────────────────────────────

    /// Currently deployed release of an app in an environment, or
    /// `None` when nothing is deployed.
    pub fn environment_application_version(
        &self,
        environment: &str,
        application: &str,
    ) -> Result<Option<u64>> {
        self.read_version_link(environment, application, "version")
            .map_err(|e| Error::Internal(e.to_string()))
    }

    /// Release waiting behind a lock, if any.
    pub fn queued_version(&self, environment: &str, application: &str) -> Result<Option<u64>> {
        self.read_version_link(environment, application, "queued_version")
            .map_err(|e| Error::Internal(e.to_string()))
    }

    /// Resolve one of the version symlinks. A missing link is `None`;
    /// a link whose target does not exist is an error.
    pub(crate) fn read_version_link(
        &self,
        environment: &str,
        application: &str,
        link_name: &str,
    ) -> std::result::Result<Option<u64>, FsError> {
        let dir = format!("environments/{}/applications/{}", environment, application);
        let link = format!("{}/{}", dir, link_name);
        let target = match self.fs.read_link(&link) {
            Ok(target) => target,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let resolved = treefs::join(&dir, &target);
        let meta = self.fs.stat(&resolved)?;
        meta.name.parse::<u64>().map(Some).map_err(|_| {
            FsError::Corrupt(format!(
                "{}: link target {} is not a release number",
                link, meta.name
            ))
        })
    }

    pub fn delete_queued_version(&self, environment: &str, application: &str) -> Result<()> {
        let path = format!(
            "environments/{}/applications/{}/queued_version",
            environment, application
        );
        self.fs.remove(&path).map_err(Error::from)
    }

    pub fn delete_queued_version_if_exists(&self, environment: &str, application: &str) -> Result<()> {
        if self.queued_version(environment, application)?.is_none() {
            return Ok(());
        }
        self.delete_queued_version(environment, application)
    }

    /// Drop a queued version that is already deployed. Returns a human
    /// message when the queue was cleaned up, `None` otherwise.
    pub fn process_queue(&self, environment: &str, application: &str) -> Result<Option<String>> {
        let queued = match self.queued_version(environment, application)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let deployed = self.environment_application_version(environment, application)?;
        if deployed == Some(queued) {
            self.delete_queued_version(environment, application)?;
            return Ok(Some(format!(
                "deleted queued version {} because it was already deployed. app={:?} env={:?}",
                queued, application, environment
            )));
        }
        Ok(None)
    }

    /// Who deployed, and when. Absent metadata maps to zero values.
    pub fn deployment_metadata(
        &self,
        environment: &str,
        application: &str,
    ) -> Result<(String, Option<DateTime<Utc>>)> {
        let base = format!("environments/{}/applications/{}", environment, application);
        let author = match self.read_optional(&format!("{}/deployed_by", base))? {
            Some(author) => author,
            None => return Ok((String::new(), None)),
        };
        let raw = match self.read_optional(&format!("{}/deployed_at_utc", base))? {
            Some(raw) => raw,
            None => return Ok((author, None)),
        };
        let deployed_at = parse_deployed_at(&raw)
            .map_err(|e| Error::Internal(format!("{}/deployed_at_utc: {}", base, e)))?;
        Ok((author, Some(deployed_at)))
    }

    pub fn environment_applications(&self, environment: &str) -> Result<Vec<String>> {
        self.dir_names(&format!("environments/{}/applications", environment))
    }

    // ── Environment configuration ─────────────────────────────

    /// All environment configs. In bootstrap mode these come from a
    /// single JSON file outside the tree; a missing file is an empty
    /// set, a malformed one is the distinguished invalid-JSON error.
    pub fn environment_configs(&self) -> Result<BTreeMap<String, EnvironmentConfig>> {
        if self.bootstrap_mode {
            let raw = match std::fs::read(&self.environment_configs_path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(BTreeMap::new());
                }
                Err(e) => return Err(Error::Internal(e.to_string())),
            };
            return serde_json::from_slice(&raw).map_err(|_| Error::InvalidJson {
                path: self.environment_configs_path.display().to_string(),
            });
        }

        let envs = match self.fs.read_dir("environments") {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut result = BTreeMap::new();
        for env in envs {
            if !env.is_dir() {
                continue;
            }
            let path = format!("environments/{}/config.json", env.name);
            match self.fs.read_file(&path) {
                Ok(raw) => {
                    let config = serde_json::from_slice(&raw)
                        .map_err(|_| Error::InvalidJson { path: path.clone() })?;
                    result.insert(env.name, config);
                }
                Err(e) if e.is_not_found() => {
                    result.insert(env.name, EnvironmentConfig::default());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(result)
    }

    /// `environment_configs` plus consistency warnings. Warnings never
    /// fail the call.
    pub fn environment_configs_validated(&self) -> Result<BTreeMap<String, EnvironmentConfig>> {
        let configs = self.environment_configs()?;
        if configs.is_empty() {
            tracing::warn!(
                "no environment configurations found; check git settings such as the branch name, \
                 the engine cannot deploy without environments"
            );
        }
        for (env, config) in &configs {
            let upstream = match &config.upstream {
                Some(upstream) => upstream,
                None => continue,
            };
            if let Some(upstream_env) = &upstream.environment {
                if !upstream_env.is_empty() && !configs.contains_key(upstream_env) {
                    tracing::warn!(
                        environment = %env,
                        upstream = %upstream_env,
                        "environment has an upstream that does not exist"
                    );
                }
            }
        }
        for (group, members) in map_environment_groups(&configs) {
            let first = members[0].1;
            if members.iter().any(|(_, d)| *d != first) {
                tracing::warn!(
                    group = %group,
                    "environment group has members with different distances to upstream"
                );
            }
        }
        Ok(configs)
    }

    /// Environments belonging to a group, sorted.
    pub fn environment_configs_for_group(&self, group: &str) -> Result<Vec<String>> {
        let configs = self.environment_configs()?;
        let mut names: Vec<String> = configs
            .iter()
            .filter(|(_, c)| c.environment_group.as_deref() == Some(group))
            .map(|(env, _)| env.clone())
            .collect();
        if names.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no environment found with given group {:?}",
                group
            )));
        }
        names.sort();
        Ok(names)
    }

    // ── Helpers ───────────────────────────────────────────────

    fn dir_names(&self, path: &str) -> Result<Vec<String>> {
        match self.fs.read_dir(path) {
            Ok(entries) => Ok(entries.into_iter().map(|e| e.name).collect()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_optional(&self, path: &str) -> Result<Option<String>> {
        match self.fs.read_file(path) {
            Ok(data) => String::from_utf8(data.to_vec())
                .map(Some)
                .map_err(|_| Error::Internal(format!("{}: not utf-8", path))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Distance of an environment from the top of its upstream chain.
/// An explicit `distance_to_upstream` overrides the computed value.
fn distance_to_upstream(
    env: &str,
    configs: &BTreeMap<String, EnvironmentConfig>,
    visited: &mut Vec<String>,
) -> u64 {
    let config = match configs.get(env) {
        Some(config) => config,
        None => return 0,
    };
    if let Some(explicit) = config.distance_to_upstream {
        return explicit;
    }
    let upstream = match &config.upstream {
        Some(upstream) => upstream,
        None => return 0,
    };
    if upstream.latest {
        return 0;
    }
    match &upstream.environment {
        Some(parent) if !parent.is_empty() && !visited.iter().any(|v| v == parent) => {
            visited.push(env.to_string());
            1 + distance_to_upstream(parent, configs, visited)
        }
        _ => 0,
    }
}

/// Group environments by their group name (an ungrouped environment is
/// its own group), with each member's distance to upstream.
fn map_environment_groups(
    configs: &BTreeMap<String, EnvironmentConfig>,
) -> BTreeMap<String, Vec<(String, u64)>> {
    let mut groups: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
    for (env, config) in configs {
        let group = config
            .environment_group
            .clone()
            .unwrap_or_else(|| env.clone());
        let distance = distance_to_upstream(env, configs, &mut Vec::new());
        groups.entry(group).or_default().push((env.clone(), distance));
    }
    groups
}

fn parse_deployed_at(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    let trimmed = raw.trim();
    // Layout "2006-01-02 15:04:05 -0700 MST": the trailing zone name
    // only repeats the numeric offset, so it is dropped before parsing.
    let without_zone = match trimmed.rsplit_once(' ') {
        Some((head, _)) => head,
        None => trimmed,
    };
    DateTime::parse_from_str(without_zone, "%Y-%m-%d %H:%M:%S %z").map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KvObjectStore;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn empty_state(dir: &TempDir) -> State {
        let store = Arc::new(KvObjectStore::open(dir.path()).unwrap());
        State::new(TreeFs::new(store, None), None, false, PathBuf::new())
    }

    fn deploy(state: &State, env: &str, app: &str, version: u64) {
        state
            .fs
            .symlink(
                &format!("../../../../applications/{}/releases/{}", app, version),
                &format!("environments/{}/applications/{}/version", env, app),
            )
            .unwrap();
    }

    #[test]
    fn test_releases_sorted_and_non_numeric_skipped() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        for release in ["3", "10", "1", "not-a-number"] {
            state
                .fs
                .write_file(
                    &format!("applications/web/releases/{}/created_at", release),
                    &b"x"[..],
                )
                .unwrap();
        }
        assert_eq!(state.releases("web").unwrap(), vec![1, 3, 10]);
    }

    #[test]
    fn test_releases_of_unknown_app_is_empty() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        assert!(state.releases("ghost").unwrap().is_empty());
    }

    #[test]
    fn test_release_manifests() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        state
            .fs
            .write_file(
                "applications/web/releases/7/manifests/dev/manifests.yaml",
                &b"kind: Deployment"[..],
            )
            .unwrap();
        let manifests = state.release_manifests("web", 7).unwrap();
        assert_eq!(manifests.get("dev").unwrap(), "kind: Deployment");
    }

    #[test]
    fn test_application_release_metadata_and_zero_values() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        state
            .fs
            .write_file("applications/web/releases/2/source_author", &b"alice"[..])
            .unwrap();
        state
            .fs
            .write_file(
                "applications/web/releases/2/created_at",
                &b"2024-03-01T10:00:00Z"[..],
            )
            .unwrap();

        let release = state.application_release("web", 2).unwrap();
        assert_eq!(release.version, 2);
        assert_eq!(release.source_author, "alice");
        // Files that do not exist read as zero values.
        assert_eq!(release.source_commit_id, "");
        assert_eq!(release.display_version, "");
        assert!(!release.undeploy);
        assert_eq!(
            release.created_at.unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_undeploy_sentinel() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        state
            .fs
            .write_file("applications/web/releases/4/undeploy", &b""[..])
            .unwrap();
        assert!(state.is_undeploy_version("web", 4).unwrap());
        let release = state.application_release("web", 4).unwrap();
        assert!(release.undeploy);
    }

    #[test]
    fn test_malformed_created_at_is_error() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        state
            .fs
            .write_file("applications/web/releases/1/created_at", &b"yesterday"[..])
            .unwrap();
        assert!(state.application_release("web", 1).is_err());
    }

    #[test]
    fn test_environment_locks() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        let base = "environments/prod/locks/lock-1";
        state.fs.write_file(&format!("{}/message", base), &b"frozen for release"[..]).unwrap();
        state.fs.write_file(&format!("{}/created_by_name", base), &b"bob"[..]).unwrap();
        state
            .fs
            .write_file(&format!("{}/created_by_email", base), &b"bob@example.com"[..])
            .unwrap();
        state
            .fs
            .write_file(&format!("{}/created_at", base), &b"2024-01-15T08:00:00Z"[..])
            .unwrap();

        let locks = state.environment_locks("prod").unwrap();
        let lock = locks.get("lock-1").unwrap();
        assert_eq!(lock.message, "frozen for release");
        assert_eq!(lock.created_by.name, "bob");
        assert_eq!(lock.created_by.email, "bob@example.com");
        assert!(lock.created_at.is_some());
    }

    #[test]
    fn test_no_locks_directory_means_no_locks() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        assert!(state.environment_locks("prod").unwrap().is_empty());
        assert!(state
            .environment_application_locks("prod", "web")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_loose_file_in_locks_directory_is_error() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        state
            .fs
            .write_file("environments/prod/locks/README", &b"do not do this"[..])
            .unwrap();
        let err = state.environment_locks("prod").unwrap_err();
        assert!(matches!(err, Error::LocksDirectoryFile { .. }));
    }

    #[test]
    fn test_application_lock_same_shape() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        state
            .fs
            .write_file(
                "environments/prod/applications/web/locks/l1/message",
                &b"hold"[..],
            )
            .unwrap();
        let locks = state.environment_application_locks("prod", "web").unwrap();
        assert_eq!(locks.get("l1").unwrap().message, "hold");
    }

    #[test]
    fn test_version_absent_means_not_deployed() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        assert_eq!(state.environment_application_version("dev", "web").unwrap(), None);
        assert_eq!(state.queued_version("dev", "web").unwrap(), None);
    }

    #[test]
    fn test_version_link_resolves_to_release_number() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        state
            .fs
            .write_file("applications/web/releases/7/created_at", &b"x"[..])
            .unwrap();
        deploy(&state, "dev", "web", 7);
        assert_eq!(state.environment_application_version("dev", "web").unwrap(), Some(7));
    }

    #[test]
    fn test_dangling_version_link_is_error() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        deploy(&state, "dev", "web", 9);
        assert!(state.environment_application_version("dev", "web").is_err());
    }

    #[test]
    fn test_process_queue_deletes_already_deployed_version() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        state
            .fs
            .write_file("applications/web/releases/5/created_at", &b"x"[..])
            .unwrap();
        deploy(&state, "dev", "web", 5);
        state
            .fs
            .symlink(
                "../../../../applications/web/releases/5",
                "environments/dev/applications/web/queued_version",
            )
            .unwrap();

        let message = state.process_queue("dev", "web").unwrap();
        assert!(message.unwrap().contains("deleted queued version 5"));
        assert_eq!(state.queued_version("dev", "web").unwrap(), None);
    }

    #[test]
    fn test_process_queue_keeps_pending_version() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        for v in [5, 6] {
            state
                .fs
                .write_file(&format!("applications/web/releases/{}/created_at", v), &b"x"[..])
                .unwrap();
        }
        deploy(&state, "dev", "web", 5);
        state
            .fs
            .symlink(
                "../../../../applications/web/releases/6",
                "environments/dev/applications/web/queued_version",
            )
            .unwrap();

        assert!(state.process_queue("dev", "web").unwrap().is_none());
        assert_eq!(state.queued_version("dev", "web").unwrap(), Some(6));
    }

    #[test]
    fn test_deployment_metadata_zero_values() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        assert_eq!(
            state.deployment_metadata("dev", "web").unwrap(),
            (String::new(), None)
        );
    }

    #[test]
    fn test_deployment_metadata_parses_go_layout() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        state
            .fs
            .write_file("environments/dev/applications/web/deployed_by", &b"alice"[..])
            .unwrap();
        state
            .fs
            .write_file(
                "environments/dev/applications/web/deployed_at_utc",
                &b"2024-03-01 10:30:00 +0000 UTC"[..],
            )
            .unwrap();
        let (author, at) = state.deployment_metadata("dev", "web").unwrap();
        assert_eq!(author, "alice");
        assert_eq!(at.unwrap(), Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_environment_configs_from_tree() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        state
            .fs
            .write_file(
                "environments/dev/config.json",
                &br#"{"upstream": {"latest": true}}"#[..],
            )
            .unwrap();
        // An environment directory without a config file gets defaults.
        state
            .fs
            .write_file("environments/prod/applications/web/deployed_by", &b"x"[..])
            .unwrap();

        let configs = state.environment_configs().unwrap();
        assert_eq!(configs.len(), 2);
        assert!(configs.get("dev").unwrap().upstream.as_ref().unwrap().latest);
        assert_eq!(configs.get("prod").unwrap(), &EnvironmentConfig::default());
    }

    #[test]
    fn test_malformed_config_is_invalid_json() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        state
            .fs
            .write_file("environments/dev/config.json", &b"{not json"[..])
            .unwrap();
        let err = state.environment_configs().unwrap_err();
        assert!(err.is_invalid_json());
    }

    #[test]
    fn test_bootstrap_configs_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KvObjectStore::open(dir.path()).unwrap());
        let state = State::new(
            TreeFs::new(store, None),
            None,
            true,
            dir.path().join("missing-configs.json"),
        );
        assert!(state.environment_configs().unwrap().is_empty());
    }

    #[test]
    fn test_bootstrap_configs_malformed_file_is_invalid_json() {
        let dir = TempDir::new().unwrap();
        let configs_path = dir.path().join("configs.json");
        std::fs::write(&configs_path, b"][").unwrap();
        let store = Arc::new(KvObjectStore::open(&dir.path().join("odb")).unwrap());
        let state = State::new(TreeFs::new(store, None), None, true, configs_path);
        let err = state.environment_configs().unwrap_err();
        assert!(err.is_invalid_json());
    }

    #[test]
    fn test_environment_configs_for_group() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);
        for (env, group) in [("de", "prod"), ("fr", "prod"), ("dev", "dev")] {
            state
                .fs
                .write_file(
                    &format!("environments/{}/config.json", env),
                    format!(r#"{{"environmentGroup": "{}"}}"#, group).into_bytes(),
                )
                .unwrap();
        }
        assert_eq!(state.environment_configs_for_group("prod").unwrap(), vec!["de", "fr"]);
        assert!(state.environment_configs_for_group("nope").is_err());
    }

    #[test]
    fn test_group_distance_computation() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "dev".to_string(),
            EnvironmentConfig {
                upstream: Some(crate::config::UpstreamConfig {
                    environment: None,
                    latest: true,
                }),
                ..Default::default()
            },
        );
        configs.insert(
            "staging".to_string(),
            EnvironmentConfig {
                upstream: Some(crate::config::UpstreamConfig {
                    environment: Some("dev".to_string()),
                    latest: false,
                }),
                ..Default::default()
            },
        );
        let groups = map_environment_groups(&configs);
        assert_eq!(groups.get("dev").unwrap()[0].1, 0);
        assert_eq!(groups.get("staging").unwrap()[0].1, 1);
    }
}
