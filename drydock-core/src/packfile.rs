//! Packfile format for the on-disk object database.
//!
//! A pack holds many zstd-compressed objects in one file so the garbage
//! collector can fold thousands of loose objects into a single unit.
//! Packs are immutable once written.

use crate::object::ObjectId;
use crate::store::{Result, StoreError};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Magic prefix of every pack file.
pub const PACK_MAGIC: &[u8; 4] = b"DDP\x01";

/// Zstd compression level used for pack entries.
const PACK_COMPRESSION_LEVEL: i32 = 3;

/// Location of one object inside a pack.
#[derive(Debug, Clone)]
pub struct PackEntry {
    pub id: ObjectId,
    pub offset: u64,
    pub size: u64,
}

/// Accumulates objects and writes them out as a single pack.
///
/// Objects are kept sorted by id so the same object set always produces
/// byte-identical packs.
pub struct PackWriter {
    objects: BTreeMap<ObjectId, Vec<u8>>,
}

impl PackWriter {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, id: ObjectId, data: Vec<u8>) {
        self.objects.insert(id, data);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Write the pack to `path`, returning the entry table.
    pub fn write(&self, path: &Path) -> Result<Vec<PackEntry>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;

        file.write_all(PACK_MAGIC)?;
        file.write_all(&(self.objects.len() as u32).to_le_bytes())?;

        let mut entries = Vec::with_capacity(self.objects.len());
        let mut offset = 8u64;
        for (id, data) in &self.objects {
            let compressed = zstd::encode_all(&data[..], PACK_COMPRESSION_LEVEL)
                .map_err(|e| StoreError::Codec(format!("pack compression failed: {}", e)))?;

            file.write_all(id.as_bytes())?;
            file.write_all(&(data.len() as u32).to_le_bytes())?;
            file.write_all(&(compressed.len() as u32).to_le_bytes())?;
            file.write_all(&compressed)?;

            entries.push(PackEntry {
                id: *id,
                offset,
                size: data.len() as u64,
            });
            offset += 32 + 4 + 4 + compressed.len() as u64;
        }
        file.flush()?;
        Ok(entries)
    }
}

impl Default for PackWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of a pack file. The whole pack is mapped into memory
/// on open; packs stay small because GC writes one per cycle.
pub struct PackReader {
    entries: Vec<PackEntry>,
    data: Vec<u8>,
}

impl PackReader {
    pub fn open(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        if data.len() < 8 || &data[0..4] != PACK_MAGIC {
            return Err(StoreError::Codec(format!(
                "{}: not a pack file",
                path.display()
            )));
        }
        let count = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;

        let mut entries = Vec::with_capacity(count);
        let mut pos = 8usize;
        for _ in 0..count {
            if pos + 40 > data.len() {
                return Err(StoreError::Codec(format!(
                    "{}: truncated pack entry header",
                    path.display()
                )));
            }
            let offset = pos as u64;
            let mut id_bytes = [0u8; 32];
            id_bytes.copy_from_slice(&data[pos..pos + 32]);
            pos += 32;
            let size = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as u64;
            pos += 4;
            let compressed_size = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + compressed_size > data.len() {
                return Err(StoreError::Codec(format!(
                    "{}: truncated pack entry body",
                    path.display()
                )));
            }
            pos += compressed_size;

            entries.push(PackEntry {
                id: ObjectId::from(id_bytes),
                offset,
                size,
            });
        }

        Ok(Self { entries, data })
    }

    pub fn get(&self, id: ObjectId) -> Result<Option<Vec<u8>>> {
        let entry = match self.entries.iter().find(|e| e.id == id) {
            Some(e) => e,
            None => return Ok(None),
        };
        let mut pos = entry.offset as usize + 32 + 4;
        let compressed_size = u32::from_le_bytes(self.data[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        let decompressed = zstd::decode_all(&self.data[pos..pos + compressed_size])
            .map_err(|e| StoreError::Codec(format!("pack decompression failed: {}", e)))?;
        Ok(Some(decompressed))
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pack_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("objects.pack");

        let mut writer = PackWriter::new();
        let id1 = ObjectId::hash(b"hello world");
        writer.add(id1, b"hello world".to_vec());
        let id2 = ObjectId::hash(b"manifest: v2");
        writer.add(id2, b"manifest: v2".to_vec());

        let entries = writer.write(&path).unwrap();
        assert_eq!(entries.len(), 2);

        let reader = PackReader::open(&path).unwrap();
        assert_eq!(reader.get(id1).unwrap().unwrap(), b"hello world");
        assert_eq!(reader.get(id2).unwrap().unwrap(), b"manifest: v2");
    }

    #[test]
    fn test_pack_get_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("objects.pack");

        let mut writer = PackWriter::new();
        writer.add(ObjectId::hash(b"a"), b"a".to_vec());
        writer.write(&path).unwrap();

        let reader = PackReader::open(&path).unwrap();
        assert!(reader.get(ObjectId::hash(b"missing")).unwrap().is_none());
    }

    #[test]
    fn test_pack_compresses_repetitive_data() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("objects.pack");

        let large = vec![b'y'; 16_384];
        let id = ObjectId::hash(&large);
        let mut writer = PackWriter::new();
        writer.add(id, large.clone());
        writer.write(&path).unwrap();

        let file_size = std::fs::metadata(&path).unwrap().len();
        assert!(file_size < large.len() as u64);

        let reader = PackReader::open(&path).unwrap();
        assert_eq!(reader.get(id).unwrap().unwrap(), large);
    }

    #[test]
    fn test_pack_deterministic_output() {
        let tmp = TempDir::new().unwrap();
        let path_a = tmp.path().join("a.pack");
        let path_b = tmp.path().join("b.pack");

        let mut writer_a = PackWriter::new();
        let mut writer_b = PackWriter::new();
        // Insertion order differs, output must not.
        for data in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
            writer_a.add(ObjectId::hash(&data), data);
        }
        for data in [b"three".to_vec(), b"one".to_vec(), b"two".to_vec()] {
            writer_b.add(ObjectId::hash(&data), data);
        }
        writer_a.write(&path_a).unwrap();
        writer_b.write(&path_b).unwrap();

        assert_eq!(std::fs::read(&path_a).unwrap(), std::fs::read(&path_b).unwrap());
    }

    #[test]
    fn test_pack_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bogus.pack");
        std::fs::write(&path, b"not a pack at all").unwrap();
        assert!(PackReader::open(&path).is_err());
    }

    #[test]
    fn test_empty_pack() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.pack");
        let entries = PackWriter::new().write(&path).unwrap();
        assert!(entries.is_empty());
        let reader = PackReader::open(&path).unwrap();
        assert!(reader.is_empty());
    }
}
