//! Manifest stores: root address -> manifest.
//!
//! The filesystem store keeps one JSON file per manifest, sharded like the
//! objects directory:
//! ```text
//! {base_path}/manifests/
//! ├── ab/
//! │   └── cde123....json
//! └── 12/
//!     └── 3456789....json
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::address::ContentAddress;
use crate::blob::{walk_sharded, AddressIter, WriteOutcome};
use crate::error::{CasError, IoContext, Result};
use crate::manifest::Manifest;
use crate::staging::{Publish, StagingArea};

/// Trait for manifest storage backends.
pub trait ManifestStore: Send + Sync + fmt::Debug {
    /// Record a manifest. Idempotent for an identical manifest; a different
    /// manifest under an existing root fails with `ManifestConflict`.
    fn put_manifest(&self, manifest: &Manifest) -> Result<WriteOutcome>;

    fn get_manifest(&self, address: &ContentAddress) -> Result<Manifest>;

    fn contains(&self, address: &ContentAddress) -> bool;

    /// Remove a manifest. Deleting an absent manifest succeeds.
    fn delete_manifest(&self, address: &ContentAddress) -> Result<()>;

    /// Every root address, as a fresh snapshot per call.
    fn list_addresses(&self) -> Result<AddressIter<'_>>;
}

fn reconcile(existing: &Manifest, incoming: &Manifest) -> Result<WriteOutcome> {
    if existing.same_content(incoming) {
        Ok(WriteOutcome::AlreadyExists)
    } else {
        error!(address = %incoming.root, "manifest conflict: root already names different content");
        Err(CasError::ManifestConflict {
            address: incoming.root,
        })
    }
}

/// Filesystem manifest store.
#[derive(Debug, Clone)]
pub struct FileManifestStore {
    manifests_dir: PathBuf,
    staging: StagingArea,
    read_only: bool,
}

impl FileManifestStore {
    pub fn open(manifests_dir: impl Into<PathBuf>, staging: StagingArea, read_only: bool) -> Result<Self> {
        let manifests_dir = manifests_dir.into();
        if !read_only {
            fs::create_dir_all(&manifests_dir)
                .io_context(|| format!("create manifests directory {}", manifests_dir.display()))?;
        }
        Ok(Self {
            manifests_dir,
            staging,
            read_only,
        })
    }

    /// Get the path where a manifest is (or would be) stored.
    pub fn path(&self, address: &ContentAddress) -> PathBuf {
        self.manifests_dir
            .join(address.prefix())
            .join(format!("{}.json", address.remainder()))
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            return Err(CasError::ReadOnly);
        }
        Ok(())
    }
}

impl ManifestStore for FileManifestStore {
    fn put_manifest(&self, manifest: &Manifest) -> Result<WriteOutcome> {
        self.writable()?;
        manifest.validate()?;

        if self.contains(&manifest.root) {
            return reconcile(&self.get_manifest(&manifest.root)?, manifest);
        }

        let json = serde_json::to_vec_pretty(manifest)?;
        let staged = self.staging.stage(&json)?;
        match staged.publish(&self.path(&manifest.root))? {
            Publish::Created => {
                debug!(address = %manifest.root, chunks = manifest.chunks.len(), "manifest stored");
                Ok(WriteOutcome::Created)
            }
            // Lost a race with another writer: theirs must match ours.
            Publish::AlreadyExists => reconcile(&self.get_manifest(&manifest.root)?, manifest),
        }
    }

    fn get_manifest(&self, address: &ContentAddress) -> Result<Manifest> {
        let path = self.path(address);
        let json = match fs::read(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CasError::NotFound(*address))
            }
            Err(e) => return Err(e).io_context(|| format!("read {}", path.display())),
        };

        let manifest: Manifest = serde_json::from_slice(&json)?;
        if manifest.root != *address {
            error!(%address, found = %manifest.root, "manifest stored under the wrong address");
            return Err(CasError::ManifestConflict { address: *address });
        }
        Ok(manifest)
    }

    fn contains(&self, address: &ContentAddress) -> bool {
        self.path(address).exists()
    }

    fn delete_manifest(&self, address: &ContentAddress) -> Result<()> {
        self.writable()?;
        let path = self.path(address);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(%address, "manifest deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).io_context(|| format!("delete {}", path.display())),
        }
    }

    fn list_addresses(&self) -> Result<AddressIter<'_>> {
        Ok(Box::new(walk_sharded(&self.manifests_dir, ".json")?))
    }
}

/// In-memory manifest store.
#[derive(Debug, Default)]
pub struct MemoryManifestStore {
    manifests: RwLock<HashMap<ContentAddress, Manifest>>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.manifests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.read().is_empty()
    }
}

impl ManifestStore for MemoryManifestStore {
    fn put_manifest(&self, manifest: &Manifest) -> Result<WriteOutcome> {
        manifest.validate()?;
        let mut manifests = self.manifests.write();
        if let Some(existing) = manifests.get(&manifest.root) {
            return reconcile(existing, manifest);
        }
        manifests.insert(manifest.root, manifest.clone());
        Ok(WriteOutcome::Created)
    }

    fn get_manifest(&self, address: &ContentAddress) -> Result<Manifest> {
        self.manifests
            .read()
            .get(address)
            .cloned()
            .ok_or(CasError::NotFound(*address))
    }

    fn contains(&self, address: &ContentAddress) -> bool {
        self.manifests.read().contains_key(address)
    }

    fn delete_manifest(&self, address: &ContentAddress) -> Result<()> {
        self.manifests.write().remove(address);
        Ok(())
    }

    fn list_addresses(&self) -> Result<AddressIter<'_>> {
        let snapshot: Vec<_> = self.manifests.read().keys().copied().collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher;
    use crate::manifest::ChunkRef;
    use crate::transform::{Compression, Transform};
    use tempfile::TempDir;

    fn manifest(parts: &[&[u8]], transform: Transform) -> Manifest {
        let chunks = parts
            .iter()
            .map(|p| ChunkRef {
                address: hasher::hash(p),
                size: p.len() as u64,
            })
            .collect::<Vec<_>>();
        let logical = chunks.iter().map(|c| c.size).sum();
        Manifest::new(chunks, logical, transform)
    }

    fn file_store(temp_dir: &TempDir) -> Result<FileManifestStore> {
        FileManifestStore::open(
            temp_dir.path().join("manifests"),
            StagingArea::new(temp_dir.path().join("staging")),
            false,
        )
    }

    fn stores(temp_dir: &TempDir) -> Result<Vec<Box<dyn ManifestStore>>> {
        Ok(vec![
            Box::new(file_store(temp_dir)?),
            Box::new(MemoryManifestStore::new()),
        ])
    }

    #[test]
    fn test_put_and_get() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        for store in stores(&temp_dir)? {
            let m = manifest(&[b"one", b"two"], Transform::None).with_mime_type("text/plain");
            assert_eq!(store.put_manifest(&m)?, WriteOutcome::Created);
            assert_eq!(store.get_manifest(&m.root)?, m);
            assert!(store.contains(&m.root));
        }
        Ok(())
    }

    #[test]
    fn test_identical_put_is_idempotent() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        for store in stores(&temp_dir)? {
            let m = manifest(&[b"same"], Transform::None);
            store.put_manifest(&m)?;
            let again = manifest(&[b"same"], Transform::None).with_mime_type("text/plain");
            assert_eq!(store.put_manifest(&again)?, WriteOutcome::AlreadyExists);
            // First writer wins; the stored manifest is unchanged.
            assert_eq!(store.get_manifest(&m.root)?.mime_type, None);
        }
        Ok(())
    }

    #[test]
    fn test_conflicting_manifest_is_rejected() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        for store in stores(&temp_dir)? {
            let m = manifest(&[b"payload"], Transform::compressed(Compression::Lz4));
            store.put_manifest(&m)?;

            // Same root and chunks, but a different claim about the content.
            let mut forged = m.clone();
            forged.logical_size += 1;
            let err = store.put_manifest(&forged).unwrap_err();
            assert!(matches!(err, CasError::ManifestConflict { address } if address == m.root));
        }
        Ok(())
    }

    #[test]
    fn test_same_bytes_under_two_transforms_coexist() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        for store in stores(&temp_dir)? {
            let plain = manifest(&[b"payload"], Transform::None);
            let packed = manifest(&[b"payload"], Transform::compressed(Compression::Lz4));
            assert_ne!(plain.root, packed.root);
            assert_eq!(store.put_manifest(&plain)?, WriteOutcome::Created);
            assert_eq!(store.put_manifest(&packed)?, WriteOutcome::Created);
        }
        Ok(())
    }

    #[test]
    fn test_invalid_manifest_is_rejected() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        for store in stores(&temp_dir)? {
            let mut m = manifest(&[b"a", b"b"], Transform::None);
            m.root = hasher::hash(b"something else");
            assert!(store.put_manifest(&m).is_err());
            assert!(!store.contains(&m.root));
        }
        Ok(())
    }

    #[test]
    fn test_get_missing() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        for store in stores(&temp_dir)? {
            let missing = hasher::hash(b"nothing");
            assert!(matches!(store.get_manifest(&missing), Err(CasError::NotFound(_))));
        }
        Ok(())
    }

    #[test]
    fn test_list_is_restartable() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        for store in stores(&temp_dir)? {
            for i in 0..5u8 {
                store.put_manifest(&manifest(&[&[i]], Transform::None))?;
            }
            assert_eq!(store.list_addresses()?.count(), 5);
            let first = store.list_addresses()?.next().transpose()?;
            if let Some(address) = first {
                store.delete_manifest(&address)?;
            }
            assert_eq!(store.list_addresses()?.count(), 4);
        }
        Ok(())
    }
}
