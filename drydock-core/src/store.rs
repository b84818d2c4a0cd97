//! Object database backends.
//!
//! Two interchangeable backends hold the repository's object graph:
//! an embedded LSM keyspace (fjall) and a plain directory of loose,
//! content-addressed files plus immutable packfiles. Only the latter is
//! ever compacted by the garbage collector.

use crate::object::ObjectId;
use crate::packfile::{PackReader, PackWriter};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Result type for object database operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the object database.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Codec(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Content-addressed object storage.
pub trait ObjectStore: Send + Sync {
    /// Fetch an object body by id.
    fn get(&self, id: ObjectId) -> Result<Bytes>;

    /// Check whether an object exists.
    fn contains(&self, id: ObjectId) -> Result<bool>;

    /// Store an object body, returning its id. Storing the same bytes
    /// twice is a no-op.
    fn put(&self, data: &[u8]) -> Result<ObjectId>;
}

/// Object counts reported around a repack cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectCount {
    pub loose: u64,
    pub packed: u64,
}

/// Embedded key-value backend.
pub struct KvObjectStore {
    keyspace: fjall::Keyspace,
    objects: fjall::PartitionHandle,
}

impl KvObjectStore {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let keyspace = fjall::Config::new(path)
            .open()
            .map_err(|e| StoreError::Backend(format!("failed to open object keyspace: {}", e)))?;
        let objects = keyspace
            .open_partition("objects", fjall::PartitionCreateOptions::default())
            .map_err(|e| StoreError::Backend(format!("failed to open objects partition: {}", e)))?;
        Ok(Self { keyspace, objects })
    }

    /// Flush buffered writes to disk.
    pub fn persist(&self) -> Result<()> {
        self.keyspace
            .persist(fjall::PersistMode::SyncAll)
            .map_err(|e| StoreError::Backend(format!("failed to persist objects: {}", e)))
    }

    pub fn object_count(&self) -> Result<ObjectCount> {
        let loose = self
            .objects
            .approximate_len() as u64;
        Ok(ObjectCount { loose, packed: 0 })
    }
}

impl ObjectStore for KvObjectStore {
    fn get(&self, id: ObjectId) -> Result<Bytes> {
        self.objects
            .get(id.as_bytes())
            .map_err(|e| StoreError::Backend(format!("get failed: {}", e)))?
            .map(|v| Bytes::from(v.to_vec()))
            .ok_or(StoreError::NotFound(id))
    }

    fn contains(&self, id: ObjectId) -> Result<bool> {
        self.objects
            .contains_key(id.as_bytes())
            .map_err(|e| StoreError::Backend(format!("contains failed: {}", e)))
    }

    fn put(&self, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::hash(data);
        self.objects
            .insert(id.as_bytes(), data)
            .map_err(|e| StoreError::Backend(format!("put failed: {}", e)))?;
        Ok(id)
    }
}

/// On-disk backend: loose objects under `loose/aa/bb..`, packfiles under
/// `packs/`. New writes always land loose; `repack` folds them into a
/// pack, which preserves object identity.
pub struct PackObjectStore {
    root: PathBuf,
    packs: RwLock<Vec<PackReader>>,
}

impl PackObjectStore {
    pub fn open(path: &Path) -> Result<Self> {
        let root = path.to_path_buf();
        std::fs::create_dir_all(root.join("loose"))?;
        std::fs::create_dir_all(root.join("packs"))?;

        let mut packs = Vec::new();
        for entry in std::fs::read_dir(root.join("packs"))? {
            let entry = entry?;
            if entry.path().extension().map(|e| e == "pack").unwrap_or(false) {
                packs.push(PackReader::open(&entry.path())?);
            }
        }

        Ok(Self {
            root,
            packs: RwLock::new(packs),
        })
    }

    fn loose_path(&self, id: ObjectId) -> PathBuf {
        let hex = id.to_string();
        self.root.join("loose").join(&hex[0..2]).join(&hex[2..])
    }

    fn loose_ids(&self) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        for prefix in std::fs::read_dir(self.root.join("loose"))? {
            let prefix = prefix?;
            if !prefix.file_type()?.is_dir() {
                continue;
            }
            let head = prefix.file_name().to_string_lossy().to_string();
            for entry in std::fs::read_dir(prefix.path())? {
                let entry = entry?;
                let tail = entry.file_name().to_string_lossy().to_string();
                if let Ok(id) = format!("{}{}", head, tail).parse::<ObjectId>() {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    pub fn object_count(&self) -> Result<ObjectCount> {
        let loose = self.loose_ids()?.len() as u64;
        let packed = self.packs.read().unwrap().iter().map(|p| p.len() as u64).sum();
        Ok(ObjectCount { loose, packed })
    }

    /// Fold all loose objects into a new packfile and delete the loose
    /// files. Returns the number of objects packed.
    pub fn repack(&self) -> Result<u64> {
        let ids = self.loose_ids()?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut writer = PackWriter::new();
        for id in &ids {
            let data = std::fs::read(self.loose_path(*id))?;
            writer.add(*id, data);
        }
        let pack_path = self
            .root
            .join("packs")
            .join(format!("pack-{}.pack", uuid::Uuid::new_v4()));
        writer.write(&pack_path)?;

        // Register the pack before dropping loose files so readers never
        // observe a gap.
        let reader = PackReader::open(&pack_path)?;
        self.packs.write().unwrap().push(reader);

        for id in &ids {
            let path = self.loose_path(*id);
            std::fs::remove_file(&path)?;
            // Leave empty fan-out directories in place.
        }
        Ok(ids.len() as u64)
    }
}

impl ObjectStore for PackObjectStore {
    fn get(&self, id: ObjectId) -> Result<Bytes> {
        match std::fs::read(self.loose_path(id)) {
            Ok(data) => return Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let packs = self.packs.read().unwrap();
        for pack in packs.iter() {
            if let Some(data) = pack.get(id)? {
                return Ok(Bytes::from(data));
            }
        }
        Err(StoreError::NotFound(id))
    }

    fn contains(&self, id: ObjectId) -> Result<bool> {
        if self.loose_path(id).exists() {
            return Ok(true);
        }
        Ok(self.packs.read().unwrap().iter().any(|p| p.contains(id)))
    }

    fn put(&self, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::hash(data);
        if self.contains(id)? {
            return Ok(id);
        }
        let path = self.loose_path(id);
        std::fs::create_dir_all(path.parent().unwrap())?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(id)
    }
}

/// The backend actually wired into a repository.
pub enum StoreHandle {
    Kv(KvObjectStore),
    Packs(PackObjectStore),
}

impl StoreHandle {
    /// Flush to disk after a commit. Loose-file writes are already
    /// durable, so only the KV backend has work to do.
    pub fn persist(&self) -> Result<()> {
        match self {
            StoreHandle::Kv(s) => s.persist(),
            StoreHandle::Packs(_) => Ok(()),
        }
    }

    /// Whether the garbage collector has anything to compact here.
    pub fn supports_repack(&self) -> bool {
        matches!(self, StoreHandle::Packs(_))
    }

    pub fn repack(&self) -> Result<u64> {
        match self {
            StoreHandle::Kv(_) => Ok(0),
            StoreHandle::Packs(s) => s.repack(),
        }
    }

    pub fn object_count(&self) -> Result<ObjectCount> {
        match self {
            StoreHandle::Kv(s) => s.object_count(),
            StoreHandle::Packs(s) => s.object_count(),
        }
    }
}

impl ObjectStore for StoreHandle {
    fn get(&self, id: ObjectId) -> Result<Bytes> {
        match self {
            StoreHandle::Kv(s) => s.get(id),
            StoreHandle::Packs(s) => s.get(id),
        }
    }

    fn contains(&self, id: ObjectId) -> Result<bool> {
        match self {
            StoreHandle::Kv(s) => s.contains(id),
            StoreHandle::Packs(s) => s.contains(id),
        }
    }

    fn put(&self, data: &[u8]) -> Result<ObjectId> {
        match self {
            StoreHandle::Kv(s) => s.put(data),
            StoreHandle::Packs(s) => s.put(data),
        }
    }
}
