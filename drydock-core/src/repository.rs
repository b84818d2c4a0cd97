//! The repository: multiple-reader, single-writer access to the
//! manifest repository.
//!
//! One writer task drains the queue, applies each element's
//! transformers into its own commit, and pushes the resulting chain.
//! A non-fast-forward push triggers one fetch-and-reset-and-reapply
//! cycle; a structurally broken JSON file in the tree triggers the same
//! reset during the apply pass. Readers open their own `State` at a
//! commit and never touch the writer's head.

use crate::argocd;
use crate::clock::{Clock, SystemClock};
use crate::config::{EnvironmentConfig, RepositoryConfig, StorageBackend};
use crate::notify::{Notify, Subscription};
use crate::object::{CommitObj, ObjectId, Signature};
use crate::queue::{Element, RequestContext, WriteQueue};
use crate::remote::{FileRemote, HttpRemote, Remote, RemoteError};
use crate::state::State;
use crate::store::{KvObjectStore, ObjectStore, PackObjectStore, StoreHandle};
use crate::transform::{Actor, ChangeSet, CommitIds, TransformContext, Transformer};
use crate::treefs::TreeFs;
use crate::webhook::WebhookDispatcher;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Initial delay of the push backoff.
const PUSH_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
/// The backoff gives up once the next sleep would cross this bound.
const PUSH_BACKOFF_MAX_ELAPSED: Duration = Duration::from_secs(7);
/// Upper bound on push attempts.
const PUSH_MAX_ATTEMPTS: u32 = 6;

/// Handle to an open manifest repository. Cheap to share; dropping the
/// last handle stops the writer task.
pub struct Repository {
    inner: Arc<Inner>,
    writer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct Inner {
    config: RepositoryConfig,
    store: Arc<StoreHandle>,
    remote: Arc<dyn Remote>,
    /// Guards branch resets against concurrent readers of the head.
    head: Mutex<Option<ObjectId>>,
    queue: WriteQueue,
    notify: Notify,
    clock: Arc<dyn Clock>,
    webhook: Option<WebhookDispatcher>,
    writes_done: AtomicU64,
    shutdown: CancellationToken,
}

enum PushFailure {
    NonFastForward,
    Cancelled,
    Other(String),
}

impl Repository {
    /// Open a repository: create or reuse the local object database,
    /// fetch the remote branch, validate the environment configuration,
    /// and start the writer task.
    pub async fn open(config: RepositoryConfig) -> Result<Repository> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(config: RepositoryConfig, clock: Arc<dyn Clock>) -> Result<Repository> {
        let remote: Arc<dyn Remote> = if config.is_local_remote() {
            debug!(url = %config.url, "remote is a local directory, skipping credentials and certificates");
            Arc::new(FileRemote::open(&config.url).map_err(Error::internal)?)
        } else if config.url.starts_with("http://") || config.url.starts_with("https://") {
            let credentials = config.credentials.load()?;
            let certificates = config.certificates.load()?;
            let builder = reqwest::Client::builder().timeout(config.network_timeout);
            let client = certificates
                .apply(builder)
                .build()
                .map_err(|e| Error::Internal(format!("building remote client: {}", e)))?;
            Arc::new(HttpRemote::new(
                config.url.clone(),
                client,
                credentials.authorization(),
            ))
        } else {
            return Err(Error::InvalidInput(format!(
                "unsupported remote url {:?}",
                config.url
            )));
        };
        Self::open_with_remote(config, remote, clock).await
    }

    /// Open against an externally constructed remote. Public so tests
    /// and embedders can substitute the transport.
    pub async fn open_with_remote(
        config: RepositoryConfig,
        remote: Arc<dyn Remote>,
        clock: Arc<dyn Clock>,
    ) -> Result<Repository> {
        let store = Arc::new(match config.storage_backend {
            StorageBackend::EmbeddedKv => {
                StoreHandle::Kv(KvObjectStore::open(&config.path.join("odb"))?)
            }
            StorageBackend::DiskPacks => {
                StoreHandle::Packs(PackObjectStore::open(&config.path.join("objects"))?)
            }
        });

        let webhook = WebhookDispatcher::from_config(&config)?;
        let (queue, rx) = WriteQueue::new();
        let inner = Arc::new(Inner {
            config,
            store,
            remote,
            head: Mutex::new(None),
            queue,
            notify: Notify::new(),
            clock,
            webhook,
            writes_done: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let startup = RequestContext::new(Actor::new(
            inner.config.committer_name.clone(),
            inner.config.committer_email.clone(),
        ));
        inner.fetch_and_reset(&startup).await?;

        // Abort early on a broken configuration rather than in the
        // first write.
        let state = inner.state_at(None)?;
        state.environment_configs_validated()?;

        let writer = tokio::spawn(Inner::process_queue(inner.clone(), rx));
        Ok(Repository {
            inner,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Queue a transformer batch and wait for it to be committed and
    /// pushed. Returns the first error of the batch, if any.
    pub async fn apply(
        &self,
        ctx: RequestContext,
        transformers: Vec<Arc<dyn Transformer>>,
    ) -> Result<()> {
        let cancellation = ctx.cancellation.clone();
        let rx = self.inner.queue.add(ctx, transformers).await;
        tokio::select! {
            _ = cancellation.cancelled() => Err(Error::Cancelled),
            result = rx => result.unwrap_or_else(|_| {
                Err(Error::Internal("writer dropped the request".to_string()))
            }),
        }
    }

    /// Apply transformers against the current head without queueing or
    /// committing. Used by tests and bootstrap tooling.
    pub fn apply_transformers_internal(
        &self,
        ctx: &RequestContext,
        transformers: &[Arc<dyn Transformer>],
    ) -> Result<(Vec<String>, State, Vec<ChangeSet>)> {
        let state = self.inner.state_at(None)?;
        let tctx = TransformContext::new(self.inner.clock.as_ref(), ctx.author.clone());
        let mut messages = Vec::with_capacity(transformers.len());
        let mut changes = Vec::with_capacity(transformers.len());
        for transformer in transformers {
            let (message, change) = transformer.transform(&tctx, &state)?;
            messages.push(message);
            changes.push(change);
        }
        Ok((messages, state, changes))
    }

    /// Snapshot of the current branch head.
    pub fn state(&self) -> Result<State> {
        self.inner.state_at(None)
    }

    /// Snapshot at a specific commit.
    pub fn state_at(&self, commit: Option<ObjectId>) -> Result<State> {
        self.inner.state_at(commit)
    }

    /// Current branch head commit, if any.
    pub fn head(&self) -> Option<ObjectId> {
        *self.inner.head.lock().unwrap()
    }

    /// Commits from the head backwards (first parents only).
    pub fn log(&self) -> Result<Vec<CommitObj>> {
        let mut result = Vec::new();
        let mut cursor = self.head();
        while let Some(id) = cursor {
            let commit = CommitObj::decode(&self.inner.store.get(id)?)?;
            cursor = commit.parents.first().copied();
            result.push(commit);
        }
        Ok(result)
    }

    /// Subscribe to successful-push notifications.
    pub fn subscribe(&self) -> Subscription {
        self.inner.notify.subscribe()
    }

    /// Stop the writer task and wait for it to drain.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let writer = self.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    // ── Writer loop ───────────────────────────────────────────

    async fn process_queue(inner: Arc<Inner>, mut rx: mpsc::Receiver<Element>) {
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                element = rx.recv() => match element {
                    Some(element) => inner.process_once(element, &mut rx).await,
                    None => break,
                }
            }
        }
        rx.close();
        while let Ok(element) = rx.try_recv() {
            let _ = element.result.send(Err(Error::Cancelled));
        }
    }

    async fn process_once(&self, first: Element, rx: &mut mpsc::Receiver<Element>) {
        if first.ctx.cancellation.is_cancelled() {
            let _ = first.result.send(Err(Error::Cancelled));
            return;
        }
        let ctx = first.ctx.clone();
        let mut elements = vec![first];
        // Coalesce everything already waiting into one push.
        Self::drain_ready(rx, &mut elements);

        let changes = match self.apply_elements(&mut elements, true).await {
            Ok(changes) => changes,
            Err(err) => {
                Self::finish(elements, Err(err));
                return;
            }
        };
        if elements.is_empty() {
            return;
        }

        match self.push_with_backoff(&ctx).await {
            Ok(report) if !report.ref_updated => {
                Self::finish(elements, Err(self.branch_protection_error()));
            }
            Ok(_) => {
                self.post_push(&changes, &ctx).await;
                Self::finish(elements, Ok(()));
                self.maybe_gc();
            }
            Err(PushFailure::NonFastForward) => {
                self.recover_and_retry(elements, &ctx).await;
            }
            Err(PushFailure::Cancelled) => {
                Self::finish(elements, Err(Error::Cancelled));
            }
            Err(PushFailure::Other(err)) => {
                error!(error = %err, "error while pushing");
                Self::finish(elements, Err(self.write_access_error()));
            }
        }
    }

    /// The branch diverged under us: reset to the remote head, re-apply
    /// every surviving element, and push exactly once more.
    async fn recover_and_retry(&self, mut elements: Vec<Element>, ctx: &RequestContext) {
        if let Err(err) = self.fetch_and_reset(ctx).await {
            Self::finish(elements, Err(err));
            return;
        }
        // The webhook must reflect what was actually applied on top of
        // the new head, so the re-applied change-set replaces the first.
        let changes = match self.apply_elements(&mut elements, false).await {
            Ok(changes) => changes,
            Err(err) => {
                Self::finish(elements, Err(err));
                return;
            }
        };
        if elements.is_empty() {
            return;
        }
        match self.push_once(ctx).await {
            Ok(report) if !report.ref_updated => {
                Self::finish(elements, Err(self.branch_protection_error()));
            }
            Ok(_) => {
                self.post_push(&changes, ctx).await;
                Self::finish(elements, Ok(()));
                self.maybe_gc();
            }
            Err(PushFailure::Cancelled) => {
                Self::finish(elements, Err(Error::Cancelled));
            }
            Err(PushFailure::NonFastForward) => {
                Self::finish(
                    elements,
                    Err(Error::Internal(
                        "push failed again after fetch and reset".to_string(),
                    )),
                );
            }
            Err(PushFailure::Other(err)) => {
                Self::finish(
                    elements,
                    Err(Error::Internal(format!(
                        "pushing after fetch and reset: {}",
                        err
                    ))),
                );
            }
        }
    }

    fn drain_ready(rx: &mut mpsc::Receiver<Element>, elements: &mut Vec<Element>) {
        while let Ok(element) = rx.try_recv() {
            if element.ctx.cancellation.is_cancelled() {
                let _ = element.result.send(Err(Error::Cancelled));
            } else {
                elements.push(element);
            }
        }
    }

    fn finish(elements: Vec<Element>, result: Result<()>) {
        for element in elements {
            let _ = element.result.send(result.clone());
        }
    }

    /// Apply each element's transformers into its own commit. A failing
    /// element is answered and dropped; the others continue from a
    /// fresh state. The distinguished invalid-JSON error aborts the
    /// pass, resets to the remote head, and restarts it once.
    async fn apply_elements(
        &self,
        elements: &mut Vec<Element>,
        mut allow_reset: bool,
    ) -> Result<ChangeSet> {
        'restart: loop {
            let mut changes = ChangeSet::default();
            let mut i = 0;
            while i < elements.len() {
                match self.apply_element(&elements[i]) {
                    Ok(sub) => {
                        changes.combine(sub);
                        i += 1;
                    }
                    Err(err) if err.is_invalid_json() && allow_reset => {
                        warn!(error = %err, "tree state is invalid, fetching and resetting");
                        let ctx = elements[i].ctx.clone();
                        self.fetch_and_reset(&ctx).await?;
                        allow_reset = false;
                        continue 'restart;
                    }
                    Err(err) => {
                        let element = elements.remove(i);
                        let _ = element.result.send(Err(err));
                    }
                }
            }
            return Ok(changes);
        }
    }

    /// Run one element against the current head and commit the result.
    fn apply_element(&self, element: &Element) -> Result<ChangeSet> {
        let state = self.state_at(None)?;
        let tctx = TransformContext::new(self.clock.as_ref(), element.ctx.author.clone());

        let mut messages = Vec::with_capacity(element.transformers.len());
        let mut changes = Vec::with_capacity(element.transformers.len());
        for transformer in &element.transformers {
            let (message, change) = transformer.transform(&tctx, &state)?;
            messages.push(message);
            changes.push(change);
        }
        self.after_transform(&state)?;

        let tree = state.fs.insert()?;
        let previous = state.head;
        let commit = CommitObj {
            tree,
            parents: previous.into_iter().collect(),
            author: Signature::new(
                element.ctx.author.name.clone(),
                element.ctx.author.email.clone(),
                tctx.now,
            ),
            committer: Signature::new(
                self.config.committer_name.clone(),
                self.config.committer_email.clone(),
                tctx.now,
            ),
            message: messages.join("\n"),
        };
        let id = self.store.put(&commit.encode()?)?;
        self.store.persist()?;
        *self.head.lock().unwrap() = Some(id);

        self.writes_done
            .fetch_add(element.transformers.len() as u64, Ordering::Relaxed);

        let mut result = ChangeSet::combine_all(changes);
        result.commits = Some(CommitIds {
            previous,
            current: id,
        });
        Ok(result)
    }

    /// Regenerate the Argo CD application files for every environment
    /// that has an Argo CD configuration.
    fn after_transform(&self, state: &State) -> Result<()> {
        let configs = state.environment_configs()?;
        for (env, config) in configs {
            if config.argo_cd.is_none() {
                continue;
            }
            self.update_argocd_apps(state, &env, &config)?;
        }
        Ok(())
    }

    fn update_argocd_apps(&self, state: &State, env: &str, config: &EnvironmentConfig) -> Result<()> {
        let mut apps = state.environment_applications(env)?;
        apps.sort();
        let mut app_data = Vec::with_capacity(apps.len());
        for app in apps {
            let version = match state.read_version_link(env, &app, "version") {
                Ok(version) => version,
                // Not deployed to this environment (or gone entirely).
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            match version {
                Some(v) if v > 0 => {}
                _ => continue,
            }
            let team = state.team_owner(&app)?;
            app_data.push(argocd::AppData { name: app, team });
        }

        let manifests = argocd::render(&self.config.url, &self.config.branch, env, config, &app_data)?;
        for (api_version, content) in manifests {
            let dir = format!("argocd/{}", api_version);
            state.fs.mkdir_all(&dir)?;
            state.fs.write_file(&format!("{}/{}.yaml", dir, env), content)?;
        }
        Ok(())
    }

    // ── Remote interaction ────────────────────────────────────

    /// Fetch the remote branch and reset the local head to it. A branch
    /// missing remotely resets to the empty state.
    async fn fetch_and_reset(&self, ctx: &RequestContext) -> Result<()> {
        let fetch = self.remote.fetch(&self.config.branch, self.store.as_ref());
        let head = tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(self.config.network_timeout, fetch) => match result {
                Err(_) => return Err(Error::Cancelled),
                Ok(Ok(head)) => head,
                Ok(Err(err)) => {
                    return Err(Error::Internal(format!(
                        "fetching {:?} from {:?}: {}",
                        self.config.branch, self.config.url, err
                    )))
                }
            }
        };
        *self.head.lock().unwrap() = head;
        match head {
            Some(revision) => debug!(%revision, "reset branch to remote head"),
            None => debug!("remote branch does not exist yet, starting from the empty tree"),
        }
        Ok(())
    }

    async fn push_once(&self, ctx: &RequestContext) -> std::result::Result<crate::remote::PushReport, PushFailure> {
        let head = match *self.head.lock().unwrap() {
            Some(head) => head,
            None => return Err(PushFailure::Other("nothing to push".to_string())),
        };
        let push = self.remote.push(&self.config.branch, head, self.store.as_ref());
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(PushFailure::Cancelled),
            result = tokio::time::timeout(self.config.network_timeout, push) => match result {
                Err(_) => Err(PushFailure::Cancelled),
                Ok(Ok(report)) => Ok(report),
                Ok(Err(RemoteError::NonFastForward(_))) => Err(PushFailure::NonFastForward),
                Ok(Err(err)) => Err(PushFailure::Other(err.to_string())),
            }
        }
    }

    /// Push under exponential backoff. Non-fast-forward is permanent
    /// and short-circuits the retries.
    async fn push_with_backoff(&self, ctx: &RequestContext) -> std::result::Result<crate::remote::PushReport, PushFailure> {
        let started = Instant::now();
        let mut delay = PUSH_BACKOFF_INITIAL;
        let mut attempt = 1;
        loop {
            match self.push_once(ctx).await {
                Ok(report) => return Ok(report),
                Err(PushFailure::NonFastForward) => return Err(PushFailure::NonFastForward),
                Err(PushFailure::Cancelled) => return Err(PushFailure::Cancelled),
                Err(PushFailure::Other(err)) => {
                    if attempt >= PUSH_MAX_ATTEMPTS
                        || started.elapsed() + delay > PUSH_BACKOFF_MAX_ELAPSED
                    {
                        return Err(PushFailure::Other(err));
                    }
                    warn!(attempt, error = %err, "push failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancellation.cancelled() => return Err(PushFailure::Cancelled),
                    }
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }

    async fn post_push(&self, changes: &ChangeSet, ctx: &RequestContext) {
        // Webhook strictly before the notifier: observers may depend on
        // Argo CD having been poked first.
        if let Some(webhook) = &self.webhook {
            webhook.dispatch(changes, &ctx.cancellation).await;
        }
        self.notify.notify();
    }

    fn branch_protection_error(&self) -> Error {
        Error::Public(format!(
            "failed to push, this indicates that branch protection is enabled in {:?} on branch {:?}",
            self.config.url, self.config.branch
        ))
    }

    fn write_access_error(&self) -> Error {
        Error::Public(format!(
            "could not push to manifest repository {:?} on branch {:?}, this indicates that the configured credentials do not have write access",
            self.config.url, self.config.branch
        ))
    }

    // ── State access ──────────────────────────────────────────

    fn state_at(&self, commit: Option<ObjectId>) -> Result<State> {
        let head = match commit {
            Some(id) => Some(id),
            None => *self.head.lock().unwrap(),
        };
        let store: Arc<dyn ObjectStore> = self.store.clone();
        match head {
            None => Ok(State::new(
                TreeFs::new(store, None),
                None,
                self.config.bootstrap_mode,
                self.config.environment_configs_path.clone(),
            )),
            Some(id) => {
                let commit = CommitObj::decode(&self.store.get(id)?)?;
                Ok(State::new(
                    TreeFs::new(store, Some(commit.tree)),
                    Some(id),
                    self.config.bootstrap_mode,
                    self.config.environment_configs_path.clone(),
                ))
            }
        }
    }

    // ── Garbage collection ────────────────────────────────────

    /// Repack the on-disk object database once enough transformers have
    /// been applied. Runs on the writer task after a successful push,
    /// so it never races a writer; readers are unaffected because
    /// repacking preserves object identity.
    fn maybe_gc(&self) {
        if self.config.gc_frequency == 0 || !self.store.supports_repack() {
            return;
        }
        if self.writes_done.load(Ordering::Relaxed) < self.config.gc_frequency {
            return;
        }
        self.writes_done.store(0, Ordering::Relaxed);

        let before = match self.store.object_count() {
            Ok(count) => count,
            Err(err) => {
                error!(error = %err, "counting objects before repack failed");
                return;
            }
        };
        let started = Instant::now();
        match self.store.repack() {
            Ok(packed) => {
                let after = self.store.object_count().unwrap_or_default();
                info!(
                    loose_before = before.loose,
                    loose_after = after.loose,
                    packed_total = after.packed,
                    collected = packed,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "object database repacked"
                );
            }
            Err(err) => error!(error = %err, "object database repack failed"),
        }
    }
}
