//! Drydock Core Library
//!
//! The manifest-repository transformation engine behind a git-driven
//! continuous-deployment control plane:
//! - Content-addressed object model (Blob, Tree, Commit)
//! - Object database backends (embedded KV, loose objects + packfiles)
//! - Tree-building filesystem with a staged write overlay
//! - Read-only state view (environments, applications, releases, locks)
//! - Single-writer queue with batching, fetch-and-reset recovery and
//!   push backoff
//! - Argo CD webhook dispatch and level-triggered change notification

pub mod argocd;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod notify;
pub mod object;
pub mod packfile;
pub mod queue;
pub mod remote;
pub mod repository;
pub mod state;
pub mod store;
pub mod transform;
pub mod treefs;
pub mod webhook;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{EnvironmentConfig, RepositoryConfig, StorageBackend, UpstreamConfig};
pub use error::{Error, Result};
pub use notify::{Notify, Subscription};
pub use object::{Blob, CommitObj, ObjectId, ObjectKind, ParseObjectIdError, Signature, Tree, TreeEntry};
pub use queue::RequestContext;
pub use remote::{FileRemote, HttpRemote, PushReport, Remote, RemoteError};
pub use repository::Repository;
pub use state::{Lock, Release, State};
pub use store::{KvObjectStore, ObjectStore, PackObjectStore, StoreError, StoreHandle};
pub use transform::{Actor, AppEnv, ChangeSet, CommitIds, RootApp, TransformContext, Transformer};
pub use treefs::{FsError, TreeFs};
pub use webhook::WebhookDispatcher;
