//! Blob stores: durable address -> bytes mappings.
//!
//! Layout of the filesystem store:
//! ```text
//! {base_path}/
//! ├── objects/
//! │   ├── ab/
//! │   │   └── cde123...  # blob bytes (remainder of hex digest)
//! │   └── 12/
//! │       └── 3456789...
//! └── staging/           # see staging.rs
//! ```
//!
//! Writes are staged, fsynced, then linked into place, so a blob is either
//! absent or complete under its address. Every read re-hashes the bytes.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::address::{Algorithm, ContentAddress};
use crate::error::{CasError, IoContext, Result};
use crate::hasher;
use crate::staging::{Publish, StagingArea};

/// Result of a blob write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    AlreadyExists,
}

impl From<Publish> for WriteOutcome {
    fn from(publish: Publish) -> Self {
        match publish {
            Publish::Created => WriteOutcome::Created,
            Publish::AlreadyExists => WriteOutcome::AlreadyExists,
        }
    }
}

/// Lazily produced addresses; each call is a fresh snapshot.
pub type AddressIter<'a> = Box<dyn Iterator<Item = Result<ContentAddress>> + Send + 'a>;

/// Trait for blob storage backends.
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Store `data` under `address`. Idempotent.
    ///
    /// Fails with `IntegrityViolation` if `data` does not hash to `address`.
    fn put(&self, address: &ContentAddress, data: &[u8]) -> Result<WriteOutcome>;

    /// Read and verify a blob.
    fn get(&self, address: &ContentAddress) -> Result<Vec<u8>>;

    /// Remove a blob. Deleting an absent blob succeeds.
    fn delete(&self, address: &ContentAddress) -> Result<()>;

    fn exists(&self, address: &ContentAddress) -> bool;

    /// Stored size in bytes.
    fn size(&self, address: &ContentAddress) -> Result<u64>;

    /// Every stored address.
    fn list_addresses(&self) -> Result<AddressIter<'_>>;

    /// Overwrite a blob with bytes that verify against `address`.
    ///
    /// Only used to restore a quarantined blob on the caller's request.
    fn replace(&self, address: &ContentAddress, data: &[u8]) -> Result<()>;
}

fn check(address: &ContentAddress, data: &[u8]) -> Result<()> {
    let actual = hasher::hash(data);
    if actual != *address {
        return Err(CasError::IntegrityViolation {
            address: *address,
            actual,
        });
    }
    Ok(())
}

/// Filesystem blob store with two-level hex sharding.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    objects_dir: PathBuf,
    staging: StagingArea,
    read_only: bool,
}

impl FileBlobStore {
    /// Open a store rooted at `objects_dir`, staging writes in `staging`.
    ///
    /// Creates the objects directory unless `read_only`.
    pub fn open(objects_dir: impl Into<PathBuf>, staging: StagingArea, read_only: bool) -> Result<Self> {
        let objects_dir = objects_dir.into();
        if !read_only {
            fs::create_dir_all(&objects_dir)
                .io_context(|| format!("create objects directory {}", objects_dir.display()))?;
        }
        Ok(Self {
            objects_dir,
            staging,
            read_only,
        })
    }

    /// Get the path where a blob is (or would be) stored.
    pub fn path(&self, address: &ContentAddress) -> PathBuf {
        self.objects_dir
            .join(address.prefix())
            .join(address.remainder())
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            return Err(CasError::ReadOnly);
        }
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, address: &ContentAddress, data: &[u8]) -> Result<WriteOutcome> {
        self.writable()?;
        check(address, data)?;

        let path = self.path(address);
        if path.exists() {
            return Ok(WriteOutcome::AlreadyExists);
        }

        let staged = self.staging.stage(data)?;
        // Verify what actually reached the disk before it becomes visible.
        let staged_bytes =
            fs::read(staged.path()).io_context(|| format!("re-read {}", staged.path().display()))?;
        check(address, &staged_bytes)?;

        let outcome = WriteOutcome::from(staged.publish(&path)?);
        debug!(%address, ?outcome, size = data.len(), "blob put");
        Ok(outcome)
    }

    fn get(&self, address: &ContentAddress) -> Result<Vec<u8>> {
        let path = self.path(address);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CasError::NotFound(*address))
            }
            Err(e) => return Err(e).io_context(|| format!("read {}", path.display())),
        };

        if let Err(e) = check(address, &data) {
            error!(%address, path = %path.display(), "blob failed integrity check");
            return Err(e);
        }
        Ok(data)
    }

    fn delete(&self, address: &ContentAddress) -> Result<()> {
        self.writable()?;
        let path = self.path(address);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(%address, "blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).io_context(|| format!("delete {}", path.display())),
        }
    }

    fn exists(&self, address: &ContentAddress) -> bool {
        self.path(address).exists()
    }

    fn size(&self, address: &ContentAddress) -> Result<u64> {
        let path = self.path(address);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CasError::NotFound(*address)),
            Err(e) => Err(e).io_context(|| format!("stat {}", path.display())),
        }
    }

    fn list_addresses(&self) -> Result<AddressIter<'_>> {
        Ok(Box::new(walk_sharded(&self.objects_dir, "")?))
    }

    fn replace(&self, address: &ContentAddress, data: &[u8]) -> Result<()> {
        self.writable()?;
        check(address, data)?;
        self.staging.stage(data)?.replace(&self.path(address))?;
        warn!(%address, "blob replaced");
        Ok(())
    }
}

/// Walk a `{root}/{prefix}/{remainder}{suffix}` tree, yielding addresses.
///
/// Entries whose names don't parse are skipped with a warning.
pub(crate) fn walk_sharded(
    root: &Path,
    suffix: &'static str,
) -> Result<impl Iterator<Item = Result<ContentAddress>> + Send> {
    let shards: Vec<PathBuf> = match fs::read_dir(root) {
        Ok(entries) => {
            let mut shards = Vec::new();
            for entry in entries {
                let entry = entry.io_context(|| format!("read {}", root.display()))?;
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    shards.push(entry.path());
                }
            }
            shards.sort();
            shards
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e).io_context(|| format!("read {}", root.display())),
    };

    Ok(shards.into_iter().flat_map(move |shard| {
        let prefix = shard
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entries: Vec<Result<ContentAddress>> = match fs::read_dir(&shard) {
            Ok(entries) => entries
                .filter_map(|entry| {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => {
                            return Some(Err(CasError::io(format!("read {}", shard.display()), e)))
                        }
                    };
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let remainder = name.strip_suffix(suffix)?;
                    match ContentAddress::from_hex(Algorithm::Blake3, &format!("{}{}", prefix, remainder)) {
                        Ok(address) => Some(Ok(address)),
                        Err(_) => {
                            warn!(path = %entry.path().display(), "skipping unrecognized entry");
                            None
                        }
                    }
                })
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => vec![Err(CasError::io(format!("read {}", shard.display()), e))],
        };
        entries
    }))
}

/// In-memory blob store, mostly for tests and ephemeral engines.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<ContentAddress, Arc<Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Overwrite stored bytes without any check, simulating media corruption.
    pub fn corrupt(&self, address: &ContentAddress, data: Vec<u8>) {
        self.blobs.write().insert(*address, Arc::new(data));
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, address: &ContentAddress, data: &[u8]) -> Result<WriteOutcome> {
        check(address, data)?;
        let mut blobs = self.blobs.write();
        if blobs.contains_key(address) {
            return Ok(WriteOutcome::AlreadyExists);
        }
        blobs.insert(*address, Arc::new(data.to_vec()));
        Ok(WriteOutcome::Created)
    }

    fn get(&self, address: &ContentAddress) -> Result<Vec<u8>> {
        let data = self
            .blobs
            .read()
            .get(address)
            .cloned()
            .ok_or(CasError::NotFound(*address))?;
        check(address, &data)?;
        Ok((*data).clone())
    }

    fn delete(&self, address: &ContentAddress) -> Result<()> {
        self.blobs.write().remove(address);
        Ok(())
    }

    fn exists(&self, address: &ContentAddress) -> bool {
        self.blobs.read().contains_key(address)
    }

    fn size(&self, address: &ContentAddress) -> Result<u64> {
        self.blobs
            .read()
            .get(address)
            .map(|d| d.len() as u64)
            .ok_or(CasError::NotFound(*address))
    }

    fn list_addresses(&self) -> Result<AddressIter<'_>> {
        let snapshot: Vec<_> = self.blobs.read().keys().copied().collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    fn replace(&self, address: &ContentAddress, data: &[u8]) -> Result<()> {
        check(address, data)?;
        self.blobs.write().insert(*address, Arc::new(data.to_vec()));
        Ok(())
    }
}
