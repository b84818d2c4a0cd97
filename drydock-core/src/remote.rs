//! Remote manifest-repository transport.
//!
//! The writer only needs two verbs: fetch the branch head (plus the
//! object closure behind it) and push a new head with a fast-forward
//! check. `FileRemote` serves local directory remotes; `HttpRemote`
//! speaks a small bincode envelope and is where credentials and
//! certificates come into play.

use crate::object::{CommitObj, ObjectId, ObjectKind, Tree};
use crate::store::{ObjectStore, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from remote operations.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote branch tip is not an ancestor of the pushed head.
    #[error("non-fast-forward update of refs/heads/{0}")]
    NonFastForward(String),

    #[error("remote access denied: {0}")]
    AccessDenied(String),

    #[error("remote protocol error: {0}")]
    Protocol(String),

    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Outcome of a push whose transport succeeded.
#[derive(Debug, Clone, Copy)]
pub struct PushReport {
    /// False when the remote accepted the request but did not move the
    /// branch ref (branch protection).
    pub ref_updated: bool,
}

/// A remote the writer can fetch from and push to.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Fetch the branch head and copy its object closure into `dst`.
    /// A branch missing on the remote is an empty upstream, not an error.
    async fn fetch(&self, branch: &str, dst: &dyn ObjectStore) -> Result<Option<ObjectId>>;

    /// Upload the closure of `head` from `src` and advance the branch
    /// ref, failing with `NonFastForward` if the remote tip is not an
    /// ancestor of `head`.
    async fn push(&self, branch: &str, head: ObjectId, src: &dyn ObjectStore) -> Result<PushReport>;
}

fn decode_commit(id: ObjectId, data: &[u8]) -> Result<CommitObj> {
    CommitObj::decode(data).map_err(|e| RemoteError::Protocol(format!("commit {}: {}", id, e)))
}

fn decode_tree(id: ObjectId, data: &[u8]) -> Result<Tree> {
    Tree::decode(data).map_err(|e| RemoteError::Protocol(format!("tree {}: {}", id, e)))
}

/// Walk the typed object graph from `head`, invoking `fetch` for each
/// object exactly once and feeding children back into the walk.
fn walk_closure(
    head: ObjectId,
    mut fetch: impl FnMut(ObjectId) -> Result<Option<Vec<u8>>>,
) -> Result<()> {
    let mut stack = vec![(head, ObjectKind::Commit)];
    let mut seen = HashSet::new();
    while let Some((id, kind)) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let data = match fetch(id)? {
            Some(data) => data,
            // Already present on the receiving side; its closure is too.
            None => continue,
        };
        match kind {
            ObjectKind::Commit => {
                let commit = decode_commit(id, &data)?;
                stack.push((commit.tree, ObjectKind::Tree));
                for parent in commit.parents {
                    stack.push((parent, ObjectKind::Commit));
                }
            }
            ObjectKind::Tree => {
                let tree = decode_tree(id, &data)?;
                for entry in tree.iter() {
                    stack.push((entry.id, entry.kind));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────
// Local directory remote
// ─────────────────────────────────────────────────────

/// A remote living in a local directory: loose objects under
/// `objects/`, branch tips under `refs/heads/`.
pub struct FileRemote {
    root: PathBuf,
}

impl FileRemote {
    /// Open (creating if necessary) a directory remote.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let root = path.into();
        std::fs::create_dir_all(root.join("objects"))?;
        std::fs::create_dir_all(root.join("refs").join("heads"))?;
        Ok(Self { root })
    }

    fn ref_path(&self, branch: &str) -> PathBuf {
        self.root.join("refs").join("heads").join(branch)
    }

    fn obj_path(&self, id: ObjectId) -> PathBuf {
        let hex = id.to_string();
        self.root.join("objects").join(&hex[0..2]).join(&hex[2..])
    }

    /// Current branch tip, `None` when the branch does not exist yet.
    pub fn read_ref(&self, branch: &str) -> Result<Option<ObjectId>> {
        match std::fs::read_to_string(self.ref_path(branch)) {
            Ok(raw) => {
                let id = raw
                    .trim()
                    .parse::<ObjectId>()
                    .map_err(|e| RemoteError::Protocol(format!("bad ref {}: {}", branch, e)))?;
                Ok(Some(id))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_ref(&self, branch: &str, id: ObjectId) -> Result<()> {
        let path = self.ref_path(branch);
        std::fs::create_dir_all(path.parent().unwrap())?;
        let tmp = path.with_extension("lock");
        std::fs::write(&tmp, format!("{}\n", id))?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_obj(&self, id: ObjectId) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.obj_path(id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_obj(&self, id: ObjectId, data: &[u8]) -> Result<()> {
        let path = self.obj_path(id);
        if path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(path.parent().unwrap())?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Is `ancestor` reachable from `head` over the remote's commits?
    fn is_ancestor(&self, ancestor: ObjectId, head: ObjectId) -> Result<bool> {
        let mut stack = vec![head];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == ancestor {
                return Ok(true);
            }
            if !seen.insert(id) {
                continue;
            }
            let data = match self.read_obj(id)? {
                Some(data) => data,
                None => continue,
            };
            let commit = decode_commit(id, &data)?;
            stack.extend(commit.parents);
        }
        Ok(false)
    }
}

#[async_trait]
impl Remote for FileRemote {
    async fn fetch(&self, branch: &str, dst: &dyn ObjectStore) -> Result<Option<ObjectId>> {
        let head = match self.read_ref(branch)? {
            Some(head) => head,
            None => {
                tracing::debug!(branch, "remote branch not found, treating as empty upstream");
                return Ok(None);
            }
        };
        walk_closure(head, |id| {
            if dst.contains(id)? {
                return Ok(None);
            }
            let data = self
                .read_obj(id)?
                .ok_or_else(|| RemoteError::Protocol(format!("remote is missing object {}", id)))?;
            dst.put(&data)?;
            Ok(Some(data))
        })?;
        tracing::debug!(branch, revision = %head, "fetched remote head");
        Ok(Some(head))
    }

    async fn push(&self, branch: &str, head: ObjectId, src: &dyn ObjectStore) -> Result<PushReport> {
        walk_closure(head, |id| {
            if self.read_obj(id)?.is_some() {
                return Ok(None);
            }
            let data = src.get(id)?;
            self.write_obj(id, &data)?;
            Ok(Some(data.to_vec()))
        })?;

        if let Some(current) = self.read_ref(branch)? {
            if current != head && !self.is_ancestor(current, head)? {
                return Err(RemoteError::NonFastForward(branch.to_string()));
            }
        }
        self.write_ref(branch, head)?;
        Ok(PushReport { ref_updated: true })
    }
}

// ─────────────────────────────────────────────────────
// HTTP remote
// ─────────────────────────────────────────────────────

/// Envelope for `POST <base>/fetch`.
#[derive(Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    pub branch: String,
    /// Commit ids the client already has; the server omits their closures.
    pub have: Vec<ObjectId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchResponse {
    pub head: Option<ObjectId>,
    pub objects: Vec<(ObjectId, Vec<u8>)>,
}

/// Envelope for `POST <base>/push`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PushRequest {
    pub branch: String,
    /// Tip the client based its work on; the server re-checks ancestry.
    pub expected: Option<ObjectId>,
    pub head: ObjectId,
    pub objects: Vec<(ObjectId, Vec<u8>)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum PushStatus {
    Updated,
    /// Accepted but the ref did not move (branch protection).
    RefUnchanged,
    NonFastForward,
    Denied(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushResponse {
    pub status: PushStatus,
}

/// Remote reached over HTTP with optional bearer auth and pinned CA.
pub struct HttpRemote {
    base: String,
    client: reqwest::Client,
    authorization: Option<String>,
}

impl HttpRemote {
    pub fn new(
        base: impl Into<String>,
        client: reqwest::Client,
        authorization: Option<String>,
    ) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
            authorization,
        }
    }

    fn request(&self, url: String, body: Vec<u8>) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        if let Some(auth) = &self.authorization {
            req = req.header(reqwest::header::AUTHORIZATION, auth.clone());
        }
        req
    }

    async fn roundtrip(&self, endpoint: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.base, endpoint);
        let resp = self
            .request(url.clone(), body)
            .send()
            .await
            .map_err(|e| RemoteError::Protocol(format!("request to {} failed: {}", url, e)))?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RemoteError::AccessDenied(format!("{} from {}", status, url)));
        }
        if !status.is_success() {
            return Err(RemoteError::Protocol(format!("{} from {}", status, url)));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| RemoteError::Protocol(format!("reading response from {}: {}", url, e)))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Remote for HttpRemote {
    async fn fetch(&self, branch: &str, dst: &dyn ObjectStore) -> Result<Option<ObjectId>> {
        let request = FetchRequest {
            branch: branch.to_string(),
            have: Vec::new(),
        };
        let body = bincode::serialize(&request)
            .map_err(|e| RemoteError::Protocol(format!("encoding fetch request: {}", e)))?;
        let raw = self.roundtrip("fetch", body).await?;
        let response: FetchResponse = bincode::deserialize(&raw)
            .map_err(|e| RemoteError::Protocol(format!("decoding fetch response: {}", e)))?;
        for (id, data) in &response.objects {
            let stored = dst.put(data)?;
            if stored != *id {
                return Err(RemoteError::Protocol(format!(
                    "object {} hashed to {} on arrival",
                    id, stored
                )));
            }
        }
        Ok(response.head)
    }

    async fn push(&self, branch: &str, head: ObjectId, src: &dyn ObjectStore) -> Result<PushReport> {
        let mut objects = Vec::new();
        walk_closure(head, |id| {
            let data = src.get(id)?;
            objects.push((id, data.to_vec()));
            Ok(Some(data.to_vec()))
        })?;

        let request = PushRequest {
            branch: branch.to_string(),
            expected: None,
            head,
            objects,
        };
        let body = bincode::serialize(&request)
            .map_err(|e| RemoteError::Protocol(format!("encoding push request: {}", e)))?;
        let raw = self.roundtrip("push", body).await?;
        let response: PushResponse = bincode::deserialize(&raw)
            .map_err(|e| RemoteError::Protocol(format!("decoding push response: {}", e)))?;
        match response.status {
            PushStatus::Updated => Ok(PushReport { ref_updated: true }),
            PushStatus::RefUnchanged => Ok(PushReport { ref_updated: false }),
            PushStatus::NonFastForward => Err(RemoteError::NonFastForward(branch.to_string())),
            PushStatus::Denied(reason) => Err(RemoteError::AccessDenied(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Blob, Signature, TreeEntry};
    use crate::store::KvObjectStore;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn signature() -> Signature {
        Signature::new("tester", "tester@example.com", Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap())
    }

    /// Store a one-file tree plus commit, returning the commit id.
    fn make_commit(store: &dyn ObjectStore, parents: Vec<ObjectId>, content: &[u8]) -> ObjectId {
        let blob = Blob::new(content.to_vec());
        let blob_id = store.put(&blob.encode().unwrap()).unwrap();
        let mut tree = Tree::new();
        tree.insert(TreeEntry::new("file".to_string(), blob_id, ObjectKind::Blob));
        let tree_id = store.put(&tree.encode().unwrap()).unwrap();
        let commit = CommitObj {
            tree: tree_id,
            parents,
            author: signature(),
            committer: signature(),
            message: "test".to_string(),
        };
        store.put(&commit.encode().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_missing_branch_is_empty_upstream() {
        let dir = TempDir::new().unwrap();
        let remote = FileRemote::open(dir.path().join("remote")).unwrap();
        let store = KvObjectStore::open(&dir.path().join("local")).unwrap();
        let head = remote.fetch("master", &store).await.unwrap();
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn test_push_then_fetch_roundtrip() {
        let dir = TempDir::new().unwrap();
        let remote = FileRemote::open(dir.path().join("remote")).unwrap();
        let src = KvObjectStore::open(&dir.path().join("src")).unwrap();
        let dst = KvObjectStore::open(&dir.path().join("dst")).unwrap();

        let head = make_commit(&src, vec![], b"v1");
        let report = remote.push("master", head, &src).await.unwrap();
        assert!(report.ref_updated);

        let fetched = remote.fetch("master", &dst).await.unwrap();
        assert_eq!(fetched, Some(head));
        // The closure arrived too.
        let commit = CommitObj::decode(&dst.get(head).unwrap()).unwrap();
        assert!(dst.contains(commit.tree).unwrap());
    }

    #[tokio::test]
    async fn test_fast_forward_push_succeeds() {
        let dir = TempDir::new().unwrap();
        let remote = FileRemote::open(dir.path().join("remote")).unwrap();
        let src = KvObjectStore::open(&dir.path().join("src")).unwrap();

        let c1 = make_commit(&src, vec![], b"v1");
        remote.push("master", c1, &src).await.unwrap();
        let c2 = make_commit(&src, vec![c1], b"v2");
        remote.push("master", c2, &src).await.unwrap();
        assert_eq!(remote.read_ref("master").unwrap(), Some(c2));
    }

    #[tokio::test]
    async fn test_divergent_push_is_non_fast_forward() {
        let dir = TempDir::new().unwrap();
        let remote = FileRemote::open(dir.path().join("remote")).unwrap();
        let a = KvObjectStore::open(&dir.path().join("a")).unwrap();
        let b = KvObjectStore::open(&dir.path().join("b")).unwrap();

        let base = make_commit(&a, vec![], b"base");
        remote.push("master", base, &a).await.unwrap();
        remote.fetch("master", &b).await.unwrap();

        // Writer A advances the branch.
        let a2 = make_commit(&a, vec![base], b"a2");
        remote.push("master", a2, &a).await.unwrap();

        // Writer B pushes a sibling of a2 and must be rejected.
        let b2 = make_commit(&b, vec![base], b"b2");
        let err = remote.push("master", b2, &b).await.unwrap_err();
        assert!(matches!(err, RemoteError::NonFastForward(_)));
        assert_eq!(remote.read_ref("master").unwrap(), Some(a2));
    }

    #[test]
    fn test_push_envelope_roundtrip() {
        let request = PushRequest {
            branch: "master".to_string(),
            expected: None,
            head: ObjectId::hash(b"head"),
            objects: vec![(ObjectId::hash(b"obj"), b"obj".to_vec())],
        };
        let raw = bincode::serialize(&request).unwrap();
        let decoded: PushRequest = bincode::deserialize(&raw).unwrap();
        assert_eq!(decoded.branch, "master");
        assert_eq!(decoded.head, request.head);
        assert_eq!(decoded.objects.len(), 1);
    }
}
