use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::BlobError;

/// Compute the hex-encoded SHA-1 checksum of `data`.
///
/// SHA-1 is the on-disk identity of every blob: the checksum doubles as
/// the storage path, so the algorithm and hex encoding must never change
/// under an existing filestore.
pub fn content_checksum(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// ContentStore provides content-addressed storage for attachment bytes.
///
/// A blob's storage name is derived from its checksum, so identical
/// content always converges on one file (dedup). Deletion is deferred:
/// callers only mark a name for garbage collection, and an out-of-band
/// sweep removes files once no metadata row references them.
///
/// The default implementation (`FileStore`) uses the local filesystem.
/// Can be swapped for S3/OSS backends by implementing this trait.
pub trait ContentStore: Send + Sync {
    /// Store a blob, returning `(checksum, store_fname)`.
    ///
    /// Never overwrites: if a file already exists at the derived path its
    /// content must match byte for byte, otherwise `BlobError::Collision`.
    fn add(&self, data: &[u8]) -> Result<(String, String), BlobError>;

    /// Read a blob by storage name.
    ///
    /// Tolerant: a missing file is logged and returned as empty content,
    /// so a filestore/metadata desync never blocks reading the rest of
    /// the record.
    fn read(&self, store_fname: &str) -> Vec<u8>;

    /// Mark a storage name for deferred garbage collection.
    ///
    /// Never deletes the file. Idempotent — concurrent markers for the
    /// same name are harmless.
    fn mark_for_gc(&self, store_fname: &str) -> Result<(), BlobError>;

    /// Whether a blob file physically exists.
    fn exists(&self, store_fname: &str) -> bool;
}

/// FileStore is a ContentStore backed by the local filesystem.
///
/// Layout under `root`:
///   blob       → `{root}/<sha1[0..2]>/<sha1>`
///   GC marker  → `{root}/checklist/<sha1[0..2]>/<sha1>`
///
/// A legacy 3-char shard (`<sha1[0..3]>/<sha1>`) is still probed on
/// reads so a filestore written by an older version stays readable.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a filestore rooted at `root`, creating the directory if needed.
    pub fn open(root: &Path) -> Result<Self, BlobError> {
        fs::create_dir_all(root).map_err(|e| BlobError::Io(e.to_string()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Derive the sharded storage name for a checksum: `ab/ab04fe...`.
    pub fn store_fname(checksum: &str) -> String {
        format!("{}/{}", &checksum[..2], checksum)
    }

    /// Resolve a storage name to a path under the filestore root.
    /// Rejects names that escape the root.
    fn resolve(&self, store_fname: &str) -> Result<PathBuf, BlobError> {
        if store_fname.is_empty()
            || store_fname.starts_with('/')
            || store_fname.starts_with('\\')
            || store_fname.contains("..")
        {
            return Err(BlobError::Io(format!(
                "invalid store name: {:?}",
                store_fname
            )));
        }
        Ok(self.root.join(store_fname))
    }

    /// Locate an existing blob file, probing the current 2-char shard
    /// first and the legacy 3-char shard second.
    fn find_path(&self, store_fname: &str) -> Result<Option<PathBuf>, BlobError> {
        let path = self.resolve(store_fname)?;
        if path.is_file() {
            return Ok(Some(path));
        }
        // Legacy layout: `abc/<sha1>` instead of `ab/<sha1>`.
        if let Some(name) = store_fname.rsplit('/').next() {
            if name.len() >= 3 {
                let legacy = self.resolve(&format!("{}/{}", &name[..3], name))?;
                if legacy.is_file() {
                    return Ok(Some(legacy));
                }
            }
        }
        Ok(None)
    }

    fn checklist_path(&self, store_fname: &str) -> Result<PathBuf, BlobError> {
        self.resolve(&format!("checklist/{}", store_fname))
    }

    /// Run the garbage-collection sweep.
    ///
    /// `live` is the set of checksums still referenced by metadata rows.
    /// For each checklist marker whose checksum is not live, the blob
    /// file is removed; the marker is cleared either way. Returns the
    /// number of blob files deleted.
    ///
    /// The sweep is an explicit entrypoint: the hosting process decides
    /// when to call it (cron, maintenance endpoint). Nothing in the core
    /// triggers it implicitly, so unlinks stay cheap and rollback-safe.
    pub fn gc(&self, live: &BTreeSet<String>) -> Result<usize, BlobError> {
        let checklist_root = self.root.join("checklist");
        if !checklist_root.is_dir() {
            return Ok(0);
        }

        let mut removed = 0;
        let shards = fs::read_dir(&checklist_root).map_err(|e| BlobError::Io(e.to_string()))?;
        for shard in shards {
            let shard = shard.map_err(|e| BlobError::Io(e.to_string()))?;
            if !shard.path().is_dir() {
                continue;
            }
            let entries = fs::read_dir(shard.path()).map_err(|e| BlobError::Io(e.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|e| BlobError::Io(e.to_string()))?;
                let checksum = entry.file_name().to_string_lossy().to_string();
                let fname = Self::store_fname(&checksum);

                if !live.contains(&checksum) {
                    if let Some(path) = self.find_path(&fname)? {
                        fs::remove_file(&path).map_err(|e| BlobError::Io(e.to_string()))?;
                        removed += 1;
                        debug!(fname = %fname, "filestore gc: removed orphaned blob");
                    }
                }
                // Clear the marker whether or not the blob was live.
                fs::remove_file(entry.path()).map_err(|e| BlobError::Io(e.to_string()))?;
            }
        }

        Ok(removed)
    }
}

impl ContentStore for FileStore {
    fn add(&self, data: &[u8]) -> Result<(String, String), BlobError> {
        let checksum = content_checksum(data);
        let fname = Self::store_fname(&checksum);
        let path = self.resolve(&fname)?;

        if path.is_file() {
            // Same hash already on disk: either a dedup hit or a true
            // collision. Verify byte-for-byte, never overwrite.
            let existing = fs::read(&path).map_err(|e| BlobError::Io(e.to_string()))?;
            if existing != data {
                return Err(BlobError::Collision(fname));
            }
            return Ok((checksum, fname));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BlobError::Io(e.to_string()))?;
        }
        fs::write(&path, data).map_err(|e| BlobError::Io(e.to_string()))?;

        // Fresh blobs go straight onto the GC checklist: if the owning
        // DB transaction aborts after this point, the sweep can still
        // reclaim the orphan.
        self.mark_for_gc(&fname)?;

        Ok((checksum, fname))
    }

    fn read(&self, store_fname: &str) -> Vec<u8> {
        match self.find_path(store_fname) {
            Ok(Some(path)) => match fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(fname = %store_fname, error = %e, "filestore: unreadable blob, serving empty content");
                    Vec::new()
                }
            },
            Ok(None) => {
                warn!(fname = %store_fname, "filestore: missing blob, serving empty content");
                Vec::new()
            }
            Err(e) => {
                warn!(fname = %store_fname, error = %e, "filestore: bad store name, serving empty content");
                Vec::new()
            }
        }
    }

    fn mark_for_gc(&self, store_fname: &str) -> Result<(), BlobError> {
        let marker = self.checklist_path(store_fname)?;
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent).map_err(|e| BlobError::Io(e.to_string()))?;
        }
        // An empty marker file; rewriting an existing one is a no-op.
        fs::write(&marker, b"").map_err(|e| BlobError::Io(e.to_string()))?;
        Ok(())
    }

    fn exists(&self, store_fname: &str) -> bool {
        matches!(self.find_path(store_fname), Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let fs = FileStore::open(dir.path()).unwrap();
        (dir, fs)
    }

    #[test]
    fn checksum_is_sha1_hex() {
        // sha1("hello")
        assert_eq!(
            content_checksum(b"hello"),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }

    #[test]
    fn add_shards_by_checksum_prefix() {
        let (_dir, fs) = store();
        let (checksum, fname) = fs.add(b"hello").unwrap();
        assert_eq!(checksum, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(fname, "aa/aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(fs.read(&fname), b"hello");
    }

    #[test]
    fn identical_content_dedups_to_same_fname() {
        let (_dir, fs) = store();
        let (_, a) = fs.add(b"same bytes").unwrap();
        let (_, b) = fs.add(b"same bytes").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_content_gets_distinct_paths() {
        let (_dir, fs) = store();
        let (_, a) = fs.add(b"one").unwrap();
        let (_, b) = fs.add(b"two").unwrap();
        assert_ne!(a, b);
        assert_eq!(fs.read(&a), b"one");
        assert_eq!(fs.read(&b), b"two");
    }

    #[test]
    fn true_collision_is_a_hard_error() {
        let (dir, fs) = store();
        // Forge a collision: place different bytes at the path "hello"
        // hashes to, then try to add "hello".
        let forged = dir.path().join("aa/aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        std::fs::create_dir_all(forged.parent().unwrap()).unwrap();
        std::fs::write(&forged, b"not hello").unwrap();

        let err = fs.add(b"hello").unwrap_err();
        assert!(matches!(err, BlobError::Collision(_)));
        // The forged file was not overwritten.
        assert_eq!(std::fs::read(&forged).unwrap(), b"not hello");
    }

    #[test]
    fn missing_blob_reads_empty() {
        let (_dir, fs) = store();
        assert!(fs.read("aa/aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d").is_empty());
    }

    #[test]
    fn legacy_three_char_shard_is_readable() {
        let (dir, fs) = store();
        let checksum = content_checksum(b"old data");
        let legacy = dir.path().join(format!("{}/{}", &checksum[..3], checksum));
        std::fs::create_dir_all(legacy.parent().unwrap()).unwrap();
        std::fs::write(&legacy, b"old data").unwrap();

        let fname = FileStore::store_fname(&checksum);
        assert_eq!(fs.read(&fname), b"old data");
        assert!(fs.exists(&fname));
    }

    #[test]
    fn mark_for_gc_does_not_delete() {
        let (_dir, fs) = store();
        let (_, fname) = fs.add(b"keep me around").unwrap();
        fs.mark_for_gc(&fname).unwrap();
        fs.mark_for_gc(&fname).unwrap(); // idempotent
        assert_eq!(fs.read(&fname), b"keep me around");
    }

    #[test]
    fn gc_removes_only_dead_blobs() {
        let (_dir, fs) = store();
        let (live_sum, live_fname) = fs.add(b"still referenced").unwrap();
        let (_, dead_fname) = fs.add(b"orphaned").unwrap();

        let mut live = BTreeSet::new();
        live.insert(live_sum);

        let removed = fs.gc(&live).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(fs.read(&live_fname), b"still referenced");
        assert!(!fs.exists(&dead_fname));

        // Sweep is idempotent once the checklist is drained.
        assert_eq!(fs.gc(&live).unwrap(), 0);
    }

    #[test]
    fn store_name_traversal_rejected() {
        let (_dir, fs) = store();
        assert!(fs.resolve("../etc/passwd").is_err());
        assert!(fs.resolve("/abs/path").is_err());
        assert!(fs.resolve("").is_err());
    }
}
