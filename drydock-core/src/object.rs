//! Content-addressed object model for the manifest repository.
//!
//! Blobs, trees and commits mirror git's object graph. Symlinks are
//! first-class tree entries because the manifest layout encodes
//! "currently deployed version" as a relative link.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Identifies a stored object by the SHA-256 digest of its encoded body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

/// Error parsing a hexadecimal object id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed object id")]
pub struct ParseObjectIdError;

impl ObjectId {
    /// Digest width in bytes.
    pub const LEN: usize = 32;

    /// Digest an encoded object body.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for ObjectId {
    fn from(digest: [u8; 32]) -> Self {
        Self(digest)
    }
}

impl std::str::FromStr for ObjectId {
    type Err = ParseObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut digest = [0u8; Self::LEN];
        // Rejects bad characters and any length other than 2 * LEN.
        hex::decode_to_slice(s, &mut digest).map_err(|_| ParseObjectIdError)?;
        Ok(Self(digest))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Discriminates what a tree entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Blob,
    /// A blob whose content is the link target path.
    Symlink,
    Tree,
    Commit,
}

/// File content object. Symlink targets are stored as blobs too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// A single named entry of a tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub id: ObjectId,
    pub kind: ObjectKind,
}

impl TreeEntry {
    pub fn new(name: String, id: ObjectId, kind: ObjectKind) -> Self {
        Self { name, id, kind }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Tree
    }
}

/// Directory object. Entries are kept sorted so encoding is deterministic
/// and identical directories always hash to the same id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tree {
    pub entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: TreeEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Identity plus timestamp, as recorded in a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub when: DateTime<Utc>,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>, when: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            when,
        }
    }
}

/// Commit object. The author is the caller that requested the change,
/// the committer is the service identity of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitObj {
    pub tree: ObjectId,
    /// Empty for the initial commit.
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl CommitObj {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn is_initial(&self) -> bool {
        self.parents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_object_id_display_parse_roundtrip() {
        let id = ObjectId::hash(b"some object body");
        let parsed: ObjectId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), 2 * ObjectId::LEN);
    }

    #[test]
    fn test_object_id_rejects_malformed_input() {
        assert!("abcd".parse::<ObjectId>().is_err());
        assert!("zz".repeat(ObjectId::LEN).parse::<ObjectId>().is_err());
    }

    #[test]
    fn test_tree_insert_remove() {
        let mut tree = Tree::new();
        let entry = TreeEntry::new(
            "config.json".to_string(),
            ObjectId::from([0u8; 32]),
            ObjectKind::Blob,
        );
        tree.insert(entry);
        assert!(tree.get("config.json").is_some());
        tree.remove("config.json");
        assert!(tree.get("config.json").is_none());
    }

    #[test]
    fn test_identical_trees_hash_identically() {
        let mut a = Tree::new();
        let mut b = Tree::new();
        for name in ["beta", "alpha"] {
            let entry = TreeEntry::new(name.to_string(), ObjectId::from([7u8; 32]), ObjectKind::Tree);
            a.insert(entry.clone());
            b.insert(entry);
        }
        let id_a = ObjectId::hash(&a.encode().unwrap());
        let id_b = ObjectId::hash(&b.encode().unwrap());
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn test_commit_serialization() {
        let when = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let commit = CommitObj {
            tree: ObjectId::from([1u8; 32]),
            parents: vec![ObjectId::from([2u8; 32])],
            author: Signature::new("Alice", "alice@example.com", when),
            committer: Signature::new("deploy-bot", "deploy@example.com", when),
            message: "create release 7".to_string(),
        };
        let bytes = commit.encode().unwrap();
        let commit2 = CommitObj::decode(&bytes).unwrap();
        assert_eq!(commit2.author.name, "Alice");
        assert_eq!(commit2.committer.email, "deploy@example.com");
        assert!(!commit2.is_initial());
        assert_eq!(
            ObjectId::hash(&bytes),
            ObjectId::hash(&commit2.encode().unwrap())
        );
    }
}
