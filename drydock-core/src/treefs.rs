//! Tree-building filesystem over the object database.
//!
//! Presents a POSIX-shaped view of a git-style tree so transformers need
//! no object-graph awareness. Reads resolve against a frozen base tree;
//! writes accumulate in a staged overlay keyed by path. `insert` walks
//! the overlay and emits blob and tree objects bottom-up, reusing
//! untouched subtrees by object identity.

use crate::object::{Blob, ObjectId, ObjectKind, Tree, TreeEntry};
use crate::store::{ObjectStore, StoreError};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Upper bound on symlink hops while resolving a path.
const MAX_LINK_DEPTH: usize = 40;

/// Errors raised by the tree filesystem.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("{path}: no such file or directory")]
    NotFound { path: String },

    #[error("{path}: not a directory")]
    NotADirectory { path: String },

    #[error("{path}: is a directory")]
    IsADirectory { path: String },

    #[error("{path}: not a symlink")]
    NotASymlink { path: String },

    #[error("{path}: too many levels of symbolic links")]
    TooManyLinks { path: String },

    #[error("tree is frozen, no writes after insert")]
    Frozen,

    #[error("corrupt tree object: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FsError {
    /// The predicate the state layer keys its "absent means empty or
    /// nil" behaviour on.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FsError::NotFound { .. } | FsError::Store(StoreError::NotFound(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// What a path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Symlink,
    Dir,
}

/// A single directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }
}

/// Result of `stat`. The name is the basename of the queried path; the
/// kind is that of the resolved node (symlinks followed).
#[derive(Debug, Clone)]
pub struct Metadata {
    pub name: String,
    pub kind: NodeKind,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }
}

#[derive(Debug, Clone)]
enum Node {
    File(Bytes),
    Symlink(String),
    Dir,
    Removed,
}

#[derive(Debug, Clone)]
enum Resolved {
    File(Bytes),
    Symlink(String),
    Dir,
}

/// Normalize a slash-separated path: drops empty and `.` segments,
/// resolves `..` (clamped at the root, like a chrooted view).
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Join a relative target onto a directory, normalizing the result.
/// This is how symlink targets are resolved against the link's parent.
pub fn join(dir: &str, rel: &str) -> String {
    if dir.is_empty() {
        normalize(rel)
    } else {
        normalize(&format!("{}/{}", dir, rel))
    }
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Filesystem view rooted at an optional base tree, with a mutable
/// write overlay. Created per read operation or per write attempt and
/// discarded afterwards; the object database outlives it.
pub struct TreeFs {
    store: Arc<dyn ObjectStore>,
    base: Option<ObjectId>,
    overlay: Mutex<BTreeMap<String, Node>>,
    frozen: AtomicBool,
}

impl TreeFs {
    /// Open a view of `base` (a tree object id); `None` is the empty tree.
    pub fn new(store: Arc<dyn ObjectStore>, base: Option<ObjectId>) -> Self {
        Self {
            store,
            base,
            overlay: Mutex::new(BTreeMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    /// The base tree this view was opened at.
    pub fn base(&self) -> Option<ObjectId> {
        self.base
    }

    // ── Reads ─────────────────────────────────────────────────

    /// Read a file's content, following symlinks.
    pub fn read_file(&self, path: &str) -> Result<Bytes> {
        let path = normalize(path);
        let overlay = self.overlay.lock().unwrap();
        match self.resolve(&overlay, &path)? {
            Some(Resolved::File(data)) => Ok(data),
            Some(Resolved::Dir) => Err(FsError::IsADirectory { path }),
            Some(Resolved::Symlink(_)) => unreachable!("resolve follows symlinks"),
            None => Err(FsError::NotFound { path }),
        }
    }

    /// Stat a path, following symlinks.
    pub fn stat(&self, path: &str) -> Result<Metadata> {
        let path = normalize(path);
        let overlay = self.overlay.lock().unwrap();
        let kind = match self.resolve(&overlay, &path)? {
            Some(Resolved::File(_)) => NodeKind::File,
            Some(Resolved::Dir) => NodeKind::Dir,
            Some(Resolved::Symlink(_)) => unreachable!("resolve follows symlinks"),
            None => return Err(FsError::NotFound { path }),
        };
        Ok(Metadata {
            name: basename(&path).to_string(),
            kind,
        })
    }

    /// Return a symlink's stored target without following it.
    pub fn read_link(&self, path: &str) -> Result<String> {
        let path = normalize(path);
        let overlay = self.overlay.lock().unwrap();
        match self.lookup(&overlay, &path)? {
            Some(Resolved::Symlink(target)) => Ok(target),
            Some(_) => Err(FsError::NotASymlink { path }),
            None => Err(FsError::NotFound { path }),
        }
    }

    /// List a directory, merging base entries with the staged overlay.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = normalize(path);
        let overlay = self.overlay.lock().unwrap();
        match self.resolve(&overlay, &path)? {
            Some(Resolved::Dir) => {}
            Some(_) => return Err(FsError::NotADirectory { path }),
            None => return Err(FsError::NotFound { path }),
        }

        let mut entries: BTreeMap<String, NodeKind> = BTreeMap::new();

        if self.base_visible(&overlay, &path) {
            if let Some((id, ObjectKind::Tree)) = self.base_node(&path)? {
                for entry in self.load_tree(id)?.iter() {
                    let kind = match entry.kind {
                        ObjectKind::Tree => NodeKind::Dir,
                        ObjectKind::Symlink => NodeKind::Symlink,
                        _ => NodeKind::File,
                    };
                    entries.insert(entry.name.clone(), kind);
                }
            }
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let mut last_child: Option<String> = None;
        for (key, node) in overlay.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            let child = rest.split('/').next().unwrap().to_string();
            if last_child.as_deref() == Some(child.as_str()) {
                continue;
            }
            last_child = Some(child.clone());
            let child_path = format!("{}{}", prefix, child);
            let is_exact = *key == child_path;
            match node {
                Node::File(_) if is_exact => {
                    entries.insert(child, NodeKind::File);
                }
                Node::Symlink(_) if is_exact => {
                    entries.insert(child, NodeKind::Symlink);
                }
                Node::Dir if is_exact => {
                    entries.insert(child, NodeKind::Dir);
                }
                Node::Removed if is_exact => {
                    if self.has_live_descendants(&overlay, &child_path) {
                        entries.insert(child, NodeKind::Dir);
                    } else {
                        entries.remove(&child);
                    }
                }
                // A deeper overlay key implies the child is a directory.
                _ => {
                    entries.insert(child, NodeKind::Dir);
                }
            }
        }

        Ok(entries
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    // ── Writes ────────────────────────────────────────────────

    /// Stage a file write, creating parent directories implicitly.
    pub fn write_file(&self, path: &str, data: impl Into<Bytes>) -> Result<()> {
        self.check_unfrozen()?;
        let path = normalize(path);
        if path.is_empty() {
            return Err(FsError::IsADirectory { path });
        }
        let mut overlay = self.overlay.lock().unwrap();
        overlay.insert(path, Node::File(data.into()));
        Ok(())
    }

    /// Stage a symlink pointing at `target` (a path relative to the
    /// link's parent directory).
    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        self.check_unfrozen()?;
        let link = normalize(link);
        if link.is_empty() {
            return Err(FsError::IsADirectory { path: link });
        }
        let mut overlay = self.overlay.lock().unwrap();
        overlay.insert(link, Node::Symlink(target.to_string()));
        Ok(())
    }

    /// Ensure a directory (and its parents) exists.
    pub fn mkdir_all(&self, path: &str) -> Result<()> {
        self.check_unfrozen()?;
        let path = normalize(path);
        if path.is_empty() {
            return Ok(());
        }
        let mut overlay = self.overlay.lock().unwrap();
        match self.lookup(&overlay, &path)? {
            Some(Resolved::Dir) => Ok(()),
            Some(_) => Err(FsError::NotADirectory { path }),
            None => {
                overlay.insert(path, Node::Dir);
                Ok(())
            }
        }
    }

    /// Remove a file, symlink, or directory subtree.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.check_unfrozen()?;
        let path = normalize(path);
        if path.is_empty() {
            return Err(FsError::IsADirectory { path });
        }
        let mut overlay = self.overlay.lock().unwrap();
        if self.lookup(&overlay, &path)?.is_none() {
            return Err(FsError::NotFound { path });
        }

        let prefix = format!("{}/", path);
        let descendants: Vec<String> = overlay
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in descendants {
            overlay.remove(&key);
        }
        overlay.remove(&path);

        // Mask the base entry if one shines through.
        if self.base_visible(&overlay, &path) && self.base_node(&path)?.is_some() {
            overlay.insert(path, Node::Removed);
        }
        Ok(())
    }

    // ── Commit ────────────────────────────────────────────────

    /// Serialise the overlay into a new tree object and return its id.
    /// The view is frozen afterwards; further writes fail.
    pub fn insert(&self) -> Result<ObjectId> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(FsError::Frozen);
        }
        let overlay = self.overlay.lock().unwrap();
        match self.build_dir("", self.base, &overlay)? {
            Some(id) => Ok(id),
            None => self.put_tree(&Tree::new()),
        }
    }

    fn build_dir(
        &self,
        prefix: &str,
        base: Option<ObjectId>,
        overlay: &BTreeMap<String, Node>,
    ) -> Result<Option<ObjectId>> {
        let child_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        };

        // Which direct children does the overlay touch?
        let mut children: Vec<String> = Vec::new();
        for (key, _) in overlay.range(child_prefix.clone()..) {
            if !key.starts_with(child_prefix.as_str()) {
                break;
            }
            let child = key[child_prefix.len()..]
                .split('/')
                .next()
                .unwrap()
                .to_string();
            if children.last() != Some(&child) {
                children.push(child);
            }
        }
        if children.is_empty() {
            // Untouched subtree: reuse the base object as-is.
            return Ok(base);
        }

        let mut tree = match base {
            Some(id) => self.load_tree(id)?,
            None => Tree::new(),
        };

        for child in children {
            let child_path = format!("{}{}", child_prefix, child);
            match overlay.get(&child_path) {
                Some(Node::File(data)) => {
                    let blob = Blob::new(data.to_vec());
                    let id = self.put_obj(&blob.encode().map_err(codec)?)?;
                    tree.insert(TreeEntry::new(child, id, ObjectKind::Blob));
                }
                Some(Node::Symlink(target)) => {
                    let blob = Blob::new(target.clone().into_bytes());
                    let id = self.put_obj(&blob.encode().map_err(codec)?)?;
                    tree.insert(TreeEntry::new(child, id, ObjectKind::Symlink));
                }
                Some(Node::Removed) => {
                    if self.has_live_descendants(overlay, &child_path) {
                        // Directory recreated on top of a removal.
                        match self.build_dir(&child_path, None, overlay)? {
                            Some(id) => tree.insert(TreeEntry::new(child, id, ObjectKind::Tree)),
                            None => {
                                tree.remove(&child);
                            }
                        }
                    } else {
                        tree.remove(&child);
                    }
                }
                Some(Node::Dir) | None => {
                    let sub_base = tree
                        .get(&child)
                        .filter(|e| e.kind == ObjectKind::Tree)
                        .map(|e| e.id);
                    match self.build_dir(&child_path, sub_base, overlay)? {
                        Some(id) => tree.insert(TreeEntry::new(child, id, ObjectKind::Tree)),
                        None => {
                            tree.remove(&child);
                        }
                    }
                }
            }
        }

        // Tree objects cannot encode empty directories; they vanish.
        if tree.is_empty() && !prefix.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.put_tree(&tree)?))
    }

    // ── Internals ─────────────────────────────────────────────

    fn check_unfrozen(&self) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            Err(FsError::Frozen)
        } else {
            Ok(())
        }
    }

    /// Resolve a path to its final node, following symlinks.
    fn resolve(&self, overlay: &BTreeMap<String, Node>, path: &str) -> Result<Option<Resolved>> {
        let mut current = path.to_string();
        for _ in 0..MAX_LINK_DEPTH {
            match self.lookup(overlay, &current)? {
                Some(Resolved::Symlink(target)) => {
                    current = join(parent(&current), &target);
                }
                other => return Ok(other),
            }
        }
        Err(FsError::TooManyLinks {
            path: path.to_string(),
        })
    }

    /// Locate a path without following a symlink at the final segment.
    fn lookup(&self, overlay: &BTreeMap<String, Node>, path: &str) -> Result<Option<Resolved>> {
        if path.is_empty() {
            return Ok(Some(Resolved::Dir));
        }
        match overlay.get(path) {
            Some(Node::File(data)) => return Ok(Some(Resolved::File(data.clone()))),
            Some(Node::Symlink(target)) => return Ok(Some(Resolved::Symlink(target.clone()))),
            Some(Node::Dir) => return Ok(Some(Resolved::Dir)),
            Some(Node::Removed) => {
                if self.has_live_descendants(overlay, path) {
                    return Ok(Some(Resolved::Dir));
                }
                return Ok(None);
            }
            None => {}
        }
        if self.has_live_descendants(overlay, path) {
            return Ok(Some(Resolved::Dir));
        }
        if !self.base_visible(overlay, path) {
            return Ok(None);
        }
        match self.base_node(path)? {
            Some((_, ObjectKind::Tree)) => Ok(Some(Resolved::Dir)),
            Some((id, ObjectKind::Symlink)) => {
                let blob = self.load_blob(id)?;
                let target = String::from_utf8(blob.data)
                    .map_err(|_| FsError::Corrupt(format!("{}: non-utf8 symlink target", path)))?;
                Ok(Some(Resolved::Symlink(target)))
            }
            Some((id, _)) => {
                let blob = self.load_blob(id)?;
                Ok(Some(Resolved::File(Bytes::from(blob.data))))
            }
            None => Ok(None),
        }
    }

    /// Does the overlay contain anything (other than removals) below
    /// this path?
    fn has_live_descendants(&self, overlay: &BTreeMap<String, Node>, path: &str) -> bool {
        let prefix = format!("{}/", path);
        overlay
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .any(|(_, node)| !matches!(node, Node::Removed))
    }

    /// Is the base tree still visible at this path, or does an overlay
    /// ancestor (removal or replacement by a file) mask it?
    fn base_visible(&self, overlay: &BTreeMap<String, Node>, path: &str) -> bool {
        let mut current = path;
        loop {
            current = parent(current);
            match overlay.get(current) {
                Some(Node::Removed) | Some(Node::File(_)) | Some(Node::Symlink(_)) => return false,
                _ => {}
            }
            if current.is_empty() {
                return true;
            }
        }
    }

    /// Walk the base tree to a path. Returns the entry's object id and
    /// kind, or `None` if any segment is missing or not a directory.
    fn base_node(&self, path: &str) -> Result<Option<(ObjectId, ObjectKind)>> {
        let root = match self.base {
            Some(id) => id,
            None => return Ok(None),
        };
        if path.is_empty() {
            return Ok(Some((root, ObjectKind::Tree)));
        }
        let mut current = (root, ObjectKind::Tree);
        for seg in path.split('/') {
            if current.1 != ObjectKind::Tree {
                return Ok(None);
            }
            let tree = self.load_tree(current.0)?;
            match tree.get(seg) {
                Some(entry) => current = (entry.id, entry.kind),
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn load_tree(&self, id: ObjectId) -> Result<Tree> {
        let data = self.store.get(id)?;
        Tree::decode(&data).map_err(|e| FsError::Corrupt(format!("tree {}: {}", id, e)))
    }

    fn load_blob(&self, id: ObjectId) -> Result<Blob> {
        let data = self.store.get(id)?;
        Blob::decode(&data).map_err(|e| FsError::Corrupt(format!("blob {}: {}", id, e)))
    }

    fn put_obj(&self, data: &[u8]) -> Result<ObjectId> {
        Ok(self.store.put(data)?)
    }

    fn put_tree(&self, tree: &Tree) -> Result<ObjectId> {
        self.put_obj(&tree.encode().map_err(codec)?)
    }
}

fn codec(e: bincode::Error) -> FsError {
    FsError::Corrupt(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KvObjectStore;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Arc<KvObjectStore> {
        Arc::new(KvObjectStore::open(dir.path()).unwrap())
    }

    fn empty_fs(store: &Arc<KvObjectStore>) -> TreeFs {
        TreeFs::new(store.clone(), None)
    }

    fn reopen(store: &Arc<KvObjectStore>, root: ObjectId) -> TreeFs {
        TreeFs::new(store.clone(), Some(root))
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.write_file("applications/app1/team", &b"backend"[..]).unwrap();
        assert_eq!(
            fs.read_file("applications/app1/team").unwrap(),
            Bytes::from_static(b"backend")
        );
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        let err = fs.read_file("nope/nothing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_insert_and_reopen_sees_same_tree() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.write_file("environments/dev/config.json", &b"{}"[..]).unwrap();
        fs.write_file("applications/app1/releases/1/created_at", &b"t"[..])
            .unwrap();
        let root = fs.insert().unwrap();

        let fs2 = reopen(&store, root);
        assert_eq!(
            fs2.read_file("environments/dev/config.json").unwrap(),
            Bytes::from_static(b"{}")
        );
        let entries = fs2.read_dir("applications/app1/releases").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "1");
        assert!(entries[0].is_dir());
    }

    #[test]
    fn test_insert_reuses_untouched_subtrees() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.write_file("applications/app1/team", &b"a"[..]).unwrap();
        fs.write_file("environments/dev/config.json", &b"{}"[..]).unwrap();
        let root1 = fs.insert().unwrap();

        let fs2 = reopen(&store, root1);
        fs2.write_file("environments/dev/locks/l1/message", &b"m"[..])
            .unwrap();
        let root2 = fs2.insert().unwrap();

        let read_tree = |root: ObjectId, name: &str| {
            let t = Tree::decode(&store.get(root).unwrap()).unwrap();
            t.get(name).unwrap().id
        };
        // The applications subtree was untouched and must be shared.
        assert_eq!(read_tree(root1, "applications"), read_tree(root2, "applications"));
        assert_ne!(read_tree(root1, "environments"), read_tree(root2, "environments"));
    }

    #[test]
    fn test_read_dir_merges_overlay_and_base() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.write_file("environments/dev/a", &b"1"[..]).unwrap();
        let root = fs.insert().unwrap();

        let fs2 = reopen(&store, root);
        fs2.write_file("environments/dev/b", &b"2"[..]).unwrap();
        let names: Vec<_> = fs2
            .read_dir("environments/dev")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_remove_masks_base_entry() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.write_file("environments/dev/a", &b"1"[..]).unwrap();
        fs.write_file("environments/dev/b", &b"2"[..]).unwrap();
        let root = fs.insert().unwrap();

        let fs2 = reopen(&store, root);
        fs2.remove("environments/dev/a").unwrap();
        assert!(fs2.read_file("environments/dev/a").unwrap_err().is_not_found());
        let names: Vec<_> = fs2
            .read_dir("environments/dev")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["b"]);

        let root2 = fs2.insert().unwrap();
        let fs3 = reopen(&store, root2);
        assert!(fs3.read_file("environments/dev/a").unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_directory_subtree() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.write_file("environments/dev/locks/l1/message", &b"m"[..])
            .unwrap();
        fs.write_file("environments/dev/locks/l1/created_by_name", &b"n"[..])
            .unwrap();
        let root = fs.insert().unwrap();

        let fs2 = reopen(&store, root);
        fs2.remove("environments/dev/locks/l1").unwrap();
        assert!(fs2.stat("environments/dev/locks/l1").unwrap_err().is_not_found());
        let root2 = fs2.insert().unwrap();

        let fs3 = reopen(&store, root2);
        // The locks directory is now empty and vanished with it.
        assert!(fs3.read_dir("environments/dev/locks").unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        assert!(fs.remove("does/not/exist").unwrap_err().is_not_found());
    }

    #[test]
    fn test_symlink_readlink_and_stat_follow() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.write_file("applications/app1/releases/7/created_at", &b"t"[..])
            .unwrap();
        fs.symlink(
            "../../../../applications/app1/releases/7",
            "environments/dev/applications/app1/version",
        )
        .unwrap();

        let target = fs
            .read_link("environments/dev/applications/app1/version")
            .unwrap();
        assert_eq!(target, "../../../../applications/app1/releases/7");

        let joined = join("environments/dev/applications/app1", &target);
        assert_eq!(joined, "applications/app1/releases/7");
        let meta = fs.stat(&joined).unwrap();
        assert_eq!(meta.name, "7");
        assert!(meta.is_dir());

        // Stat on the link itself follows it to the release directory.
        let meta = fs.stat("environments/dev/applications/app1/version").unwrap();
        assert!(meta.is_dir());
    }

    #[test]
    fn test_symlink_survives_insert() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.write_file("applications/app1/releases/3/created_at", &b"t"[..])
            .unwrap();
        fs.symlink(
            "../../../../applications/app1/releases/3",
            "environments/dev/applications/app1/version",
        )
        .unwrap();
        let root = fs.insert().unwrap();

        let fs2 = reopen(&store, root);
        assert_eq!(
            fs2.read_link("environments/dev/applications/app1/version")
                .unwrap(),
            "../../../../applications/app1/releases/3"
        );
    }

    #[test]
    fn test_read_link_on_regular_file() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.write_file("file", &b"x"[..]).unwrap();
        assert!(matches!(
            fs.read_link("file"),
            Err(FsError::NotASymlink { .. })
        ));
    }

    #[test]
    fn test_mkdir_all_then_empty_dir_vanishes_on_insert() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.mkdir_all("argocd/v1alpha1").unwrap();
        assert!(fs.read_dir("argocd/v1alpha1").unwrap().is_empty());

        let root = fs.insert().unwrap();
        let fs2 = reopen(&store, root);
        assert!(fs2.read_dir("argocd/v1alpha1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_frozen_after_insert() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.write_file("a", &b"1"[..]).unwrap();
        fs.insert().unwrap();
        assert!(matches!(fs.write_file("b", &b"2"[..]), Err(FsError::Frozen)));
        assert!(matches!(fs.insert(), Err(FsError::Frozen)));
    }

    #[test]
    fn test_normalize_clamps_at_root() {
        assert_eq!(normalize("a/b/../c"), "a/c");
        assert_eq!(normalize("../../a"), "a");
        assert_eq!(normalize("./a//b/"), "a/b");
    }

    #[test]
    fn test_symlink_loop_detected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fs = empty_fs(&store);
        fs.symlink("b", "a").unwrap();
        fs.symlink("a", "b").unwrap();
        assert!(matches!(
            fs.stat("a"),
            Err(FsError::TooManyLinks { .. })
        ));
    }
}
