//! The storage engine: one handle over blobs, manifests, references and
//! transforms.
//!
//! Write path: transform the payload, chunk the transformed bytes, store
//! each chunk once, then record the manifest. Read path: manifest, chunks
//! (each re-hashed), reassemble, reverse the transform.
//!
//! A `Cas` is an ordinary value; in-memory stores are fully independent. On
//! disk, one writable handle owns a directory at a time: `open` holds an
//! exclusive lock on `{base_path}/LOCK` until the handle is dropped, and a
//! second writable `open` fails with `Locked`. Read-only handles take no lock
//! and see references as of the moment they were opened.

use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs4::FileExt;
use tracing::{debug, info, warn};

use crate::address::ContentAddress;
use crate::blob::{BlobStore, FileBlobStore, MemoryBlobStore, WriteOutcome};
use crate::chunker::{Chunk, Chunker, ChunkingConfig};
use crate::config::CasConfig;
use crate::error::{CasError, IoContext, Result};
use crate::gc::{GateGuard, GcGate};
use crate::manifest::{ChunkRef, Manifest};
use crate::metadata::{FileManifestStore, ManifestStore, MemoryManifestStore};
use crate::quarantine::Quarantine;
use crate::refs::{RefEvent, RefUpdate, ReferenceTracker};
use crate::staging::StagingArea;
use crate::transform::{KeyRing, Transform};

/// Per-call storage options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub transform: Transform,
    pub mime_type: Option<String>,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// What a `put` did.
#[derive(Debug, Clone)]
pub struct PutResult {
    pub address: ContentAddress,
    /// The manifest as stored. For a duplicate this is the first writer's.
    pub manifest: Manifest,
    /// Whether the manifest was new.
    pub outcome: WriteOutcome,
    /// Chunks that were not already present.
    pub new_chunks: usize,
}

/// Store-wide counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CasStats {
    pub manifests: usize,
    pub blobs: usize,
    pub stored_bytes: u64,
    pub references: usize,
    pub quarantined: usize,
}

/// Content-addressed store handle.
#[derive(Debug)]
pub struct Cas {
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) manifests: Arc<dyn ManifestStore>,
    pub(crate) refs: ReferenceTracker,
    pub(crate) quarantine: Quarantine,
    pub(crate) gc: GcGate,
    chunker: Chunker,
    keys: KeyRing,
    staging: Option<StagingArea>,
    read_only: bool,
    /// Held for the handle's lifetime; released on drop.
    _dir_lock: Option<File>,
}

/// Upper bound on buffer space reserved before a payload's bytes are read.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Take the exclusive writer lock on a store directory.
fn lock_directory(config: &CasConfig) -> Result<File> {
    let base = &config.base_path;
    fs::create_dir_all(base).io_context(|| format!("create store directory {}", base.display()))?;

    let path = config.lock_path();
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .io_context(|| format!("open {}", path.display()))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(CasError::Locked(base.clone())),
        Err(e) => Err(e).io_context(|| format!("lock {}", path.display())),
    }
}

impl Cas {
    /// Open (or create) a store on disk.
    pub fn open(config: CasConfig, keys: KeyRing) -> Result<Self> {
        let read_only = config.read_only;
        let dir_lock = if read_only {
            None
        } else {
            Some(lock_directory(&config)?)
        };
        let staging = StagingArea::new(config.staging_dir());

        let blobs = FileBlobStore::open(config.objects_dir(), staging.clone(), read_only)?;
        let manifests = FileManifestStore::open(config.manifests_dir(), staging.clone(), read_only)?;
        let refs = ReferenceTracker::open(config.refs_dir(), staging.clone(), read_only)?;
        let quarantine = Quarantine::open(config.quarantine_dir(), read_only)?;

        info!(
            path = %config.base_path.display(),
            read_only,
            chunk_size = config.chunking.chunk_size,
            references = refs.len(),
            "CAS opened"
        );

        Ok(Self {
            blobs: Arc::new(blobs),
            manifests: Arc::new(manifests),
            refs,
            quarantine,
            gc: GcGate::default(),
            chunker: Chunker::new(config.chunking),
            keys,
            staging: Some(staging),
            read_only,
            _dir_lock: dir_lock,
        })
    }

    /// A store that lives entirely in memory.
    pub fn in_memory(chunking: ChunkingConfig, keys: KeyRing) -> Self {
        Self::with_stores(
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryManifestStore::new()),
            chunking,
            keys,
        )
    }

    /// Build an engine over caller-supplied backends.
    pub fn with_stores(
        blobs: Arc<dyn BlobStore>,
        manifests: Arc<dyn ManifestStore>,
        chunking: ChunkingConfig,
        keys: KeyRing,
    ) -> Self {
        Self {
            blobs,
            manifests,
            refs: ReferenceTracker::in_memory(),
            quarantine: Quarantine::in_memory(),
            gc: GcGate::default(),
            chunker: Chunker::new(chunking),
            keys,
            staging: None,
            read_only: false,
            _dir_lock: None,
        }
    }

    pub fn chunking(&self) -> &ChunkingConfig {
        self.chunker.config()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn writable(&self) -> Result<()> {
        if self.read_only {
            return Err(CasError::ReadOnly);
        }
        Ok(())
    }

    // --- write path ---

    /// Store a payload and return its root address.
    pub fn put(&self, data: &[u8], options: PutOptions) -> Result<PutResult> {
        self.writable()?;

        let stored: Cow<'_, [u8]> = if options.transform.is_identity() {
            Cow::Borrowed(data)
        } else {
            Cow::Owned(options.transform.forward(data, &self.keys)?)
        };

        let gate = self.gc.enter();
        let mut chunks = Vec::new();
        let mut new_chunks = 0;
        for chunk in self.chunker.split(&stored) {
            if self.store_chunk(&gate, &chunk)? == WriteOutcome::Created {
                new_chunks += 1;
            }
            chunks.push(ChunkRef {
                address: chunk.address,
                size: chunk.len() as u64,
            });
        }

        self.finish_put(&gate, chunks, data.len() as u64, options, new_chunks)
    }

    /// Store a payload read from `reader`.
    ///
    /// Untransformed payloads are chunked as they are read. A transform works
    /// on the whole payload, so with one configured the reader is drained
    /// into memory first.
    pub fn put_reader<R: Read>(&self, mut reader: R, options: PutOptions) -> Result<PutResult> {
        if !options.transform.is_identity() {
            let mut data = Vec::new();
            reader
                .read_to_end(&mut data)
                .io_context(|| "read payload".to_string())?;
            return self.put(&data, options);
        }
        self.writable()?;

        let gate = self.gc.enter();
        let mut chunks = Vec::new();
        let mut new_chunks = 0;
        let mut logical_size = 0;
        for chunk in self.chunker.split_reader(reader) {
            let chunk = chunk.io_context(|| "read payload".to_string())?;
            if self.store_chunk(&gate, &chunk)? == WriteOutcome::Created {
                new_chunks += 1;
            }
            logical_size += chunk.len() as u64;
            chunks.push(ChunkRef {
                address: chunk.address,
                size: chunk.len() as u64,
            });
        }

        self.finish_put(&gate, chunks, logical_size, options, new_chunks)
    }

    fn store_chunk(&self, gate: &GateGuard<'_>, chunk: &Chunk) -> Result<WriteOutcome> {
        let outcome = self.blobs.put(&chunk.address, &chunk.data)?;
        gate.touch(&chunk.address);
        if outcome == WriteOutcome::AlreadyExists && self.quarantine.contains(&chunk.address) {
            warn!(address = %chunk.address, "stored chunk is quarantined; restore it to serve reads");
        }
        Ok(outcome)
    }

    fn finish_put(
        &self,
        gate: &GateGuard<'_>,
        chunks: Vec<ChunkRef>,
        logical_size: u64,
        options: PutOptions,
        new_chunks: usize,
    ) -> Result<PutResult> {
        let mut manifest = Manifest::new(chunks, logical_size, options.transform);
        manifest.mime_type = options.mime_type;

        let outcome = self.manifests.put_manifest(&manifest)?;
        gate.touch(&manifest.root);
        if outcome == WriteOutcome::AlreadyExists {
            manifest = self.manifests.get_manifest(&manifest.root)?;
        }

        debug!(
            address = %manifest.root,
            ?outcome,
            chunks = manifest.chunk_count(),
            new_chunks,
            size = manifest.size,
            transform = %manifest.transform,
            "object stored"
        );

        Ok(PutResult {
            address: manifest.root,
            manifest,
            outcome,
            new_chunks,
        })
    }

    // --- read path ---

    /// Retrieve and verify a payload, reversing its transform.
    pub fn get(&self, address: &ContentAddress) -> Result<Vec<u8>> {
        let manifest = self.manifest(address)?;
        let stored = self.read_stored(&manifest)?;
        manifest
            .transform
            .reverse_to_size(&stored, &self.keys, manifest.logical_size)
    }

    /// Retrieve a payload as stored, without reversing its transform.
    pub fn get_stored(&self, address: &ContentAddress) -> Result<Vec<u8>> {
        let manifest = self.manifest(address)?;
        self.read_stored(&manifest)
    }

    /// Whether a manifest exists for `address`.
    pub fn exists(&self, address: &ContentAddress) -> bool {
        self.manifests.contains(address)
    }

    pub fn manifest(&self, address: &ContentAddress) -> Result<Manifest> {
        if self.quarantine.contains(address) {
            return Err(CasError::Quarantined(*address));
        }
        let manifest = self.manifests.get_manifest(address)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub(crate) fn read_stored(&self, manifest: &Manifest) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(manifest.size.min(MAX_PREALLOC) as usize);
        for chunk in &manifest.chunks {
            out.extend_from_slice(&self.read_chunk(&chunk.address)?);
        }

        if out.len() as u64 != manifest.size {
            return Err(CasError::ManifestConflict {
                address: manifest.root,
            });
        }
        Ok(out)
    }

    fn read_chunk(&self, address: &ContentAddress) -> Result<Vec<u8>> {
        if self.quarantine.contains(address) {
            return Err(CasError::Quarantined(*address));
        }
        match self.blobs.get(address) {
            Err(e @ CasError::IntegrityViolation { .. }) => {
                self.quarantine.isolate(address)?;
                Err(e)
            }
            other => other,
        }
    }

    // --- references ---

    /// Point `name` at a stored object.
    ///
    /// The object must be complete: its manifest and every chunk present.
    pub fn tag(&self, name: &str, address: &ContentAddress) -> Result<RefUpdate> {
        self.writable()?;
        let _gate = self.gc.enter();
        self.ensure_complete(address)?;
        self.refs.set_reference(name, address)
    }

    /// Repoint `name` only if it still points at `expected`.
    pub fn compare_and_tag(
        &self,
        name: &str,
        expected: Option<&ContentAddress>,
        address: &ContentAddress,
    ) -> Result<RefUpdate> {
        self.writable()?;
        let _gate = self.gc.enter();
        self.ensure_complete(address)?;
        self.refs.compare_and_set(name, expected, address)
    }

    pub fn untag(&self, name: &str) -> Result<RefUpdate> {
        self.writable()?;
        let _gate = self.gc.enter();
        self.refs.delete_reference(name)
    }

    pub fn resolve(&self, name: &str) -> Result<ContentAddress> {
        self.refs.get_reference(name)
    }

    /// Retrieve the payload a name currently points at.
    pub fn get_named(&self, name: &str) -> Result<Vec<u8>> {
        self.get(&self.resolve(name)?)
    }

    pub fn references(&self) -> Vec<(String, ContentAddress)> {
        self.refs.list_references()
    }

    pub fn history(&self, name: &str) -> Vec<RefEvent> {
        self.refs.history(name)
    }

    pub fn resolve_at(&self, name: &str, at: DateTime<Utc>) -> Option<ContentAddress> {
        self.refs.resolve_at(name, at)
    }

    pub fn reference_tracker(&self) -> &ReferenceTracker {
        &self.refs
    }

    fn ensure_complete(&self, address: &ContentAddress) -> Result<()> {
        let manifest = self.manifests.get_manifest(address)?;
        if let Some(missing) = manifest
            .chunk_addresses()
            .find(|chunk| !self.blobs.exists(chunk))
        {
            warn!(%address, chunk = %missing, "refusing to reference an incomplete object");
            return Err(CasError::NotFound(*missing));
        }
        Ok(())
    }

    // --- maintenance ---

    /// Replace the bytes of a quarantined blob with verified ones.
    ///
    /// `data` must hash to `address`. The blob is rewritten and the address
    /// served again.
    pub fn restore(&self, address: &ContentAddress, data: &[u8]) -> Result<()> {
        self.writable()?;
        let _gate = self.gc.enter();
        self.blobs.replace(address, data)?;
        self.quarantine.release(address)?;
        info!(%address, size = data.len(), "blob restored");
        Ok(())
    }

    pub fn quarantined(&self) -> Vec<ContentAddress> {
        self.quarantine.list()
    }

    /// Remove staging files left by writers that died more than `older_than` ago.
    pub fn clean_staging(&self, older_than: Duration) -> Result<usize> {
        self.writable()?;
        match &self.staging {
            Some(staging) => staging.clean(older_than),
            None => Ok(0),
        }
    }

    pub fn stats(&self) -> Result<CasStats> {
        let mut stats = CasStats {
            references: self.refs.len(),
            quarantined: self.quarantine.len(),
            ..CasStats::default()
        };
        for address in self.manifests.list_addresses()? {
            address?;
            stats.manifests += 1;
        }
        for address in self.blobs.list_addresses()? {
            let address = address?;
            stats.blobs += 1;
            match self.blobs.size(&address) {
                Ok(size) => stats.stored_bytes += size,
                // Deleted between listing and stat.
                Err(CasError::NotFound(_)) => stats.blobs -= 1,
                Err(e) => return Err(e),
            }
        }
        Ok(stats)
    }
}
