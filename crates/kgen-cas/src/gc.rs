//! Mark-and-sweep garbage collection.
//!
//! Roots are the reference table. A root is live along with every chunk its
//! manifest lists; everything else is a candidate. Collection is explicit:
//! nothing runs in the background.
//!
//! Writers (put, tag, import) hold the gate shared. GC takes it exclusively
//! only to snapshot the roots and, per candidate, to re-check and delete.
//! While a collection is active every address a writer touches is recorded,
//! and recorded addresses are never deleted by that run. If the reference
//! generation moved since the last mark, the new roots are marked before the
//! next delete.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::address::ContentAddress;
use crate::engine::Cas;
use crate::error::{CasError, Result};
use crate::refs::RefSnapshot;

/// Coordination between writers and the collector.
#[derive(Debug, Default)]
pub(crate) struct GcGate {
    lock: RwLock<()>,
    active: AtomicBool,
    recent: Mutex<HashSet<ContentAddress>>,
    running: Mutex<()>,
}

impl GcGate {
    /// Enter as a writer. Must not be nested on one thread.
    pub(crate) fn enter(&self) -> GateGuard<'_> {
        GateGuard {
            gate: self,
            _shared: self.lock.read(),
        }
    }

    fn is_recent(&self, address: &ContentAddress) -> bool {
        self.recent.lock().contains(address)
    }
}

pub(crate) struct GateGuard<'a> {
    gate: &'a GcGate,
    _shared: RwLockReadGuard<'a, ()>,
}

impl GateGuard<'_> {
    /// Record that this writer produced or reused `address`.
    pub(crate) fn touch(&self, address: &ContentAddress) {
        if self.gate.active.load(Ordering::Acquire) {
            self.gate.recent.lock().insert(*address);
        }
    }
}

/// Clears the active flag when a run ends, however it ends.
struct ActiveRun<'a>(&'a GcGate);

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.active.store(false, Ordering::Release);
        self.0.recent.lock().clear();
    }
}

/// Summary of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// References in the root snapshot.
    pub roots: usize,
    /// Addresses found live.
    pub marked: usize,
    pub manifests_deleted: usize,
    pub blobs_deleted: usize,
    pub bytes_reclaimed: u64,
    /// Candidates kept because they became live or were written during the run.
    pub retained: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct Marks {
    live: HashSet<ContentAddress>,
    generation: u64,
}

impl Marks {
    fn contains(&self, address: &ContentAddress) -> bool {
        self.live.contains(address)
    }
}

impl Cas {
    /// Run a full collection.
    pub fn run_gc(&self) -> Result<GcReport> {
        self.run_gc_with(&AtomicBool::new(false))
    }

    /// Run a collection, stopping between deletions once `cancel` is set.
    ///
    /// A cancelled run leaves the store consistent; the next run picks up
    /// whatever it left behind.
    pub fn run_gc_with(&self, cancel: &AtomicBool) -> Result<GcReport> {
        self.writable()?;
        let _running = self.gc.running.lock();
        let started = Instant::now();

        let (snapshot, _active) = {
            let _exclusive = self.gc.lock.write();
            self.gc.recent.lock().clear();
            self.gc.active.store(true, Ordering::Release);
            (self.refs.snapshot(), ActiveRun(&self.gc))
        };

        let mut report = GcReport {
            roots: snapshot.entries.len(),
            ..GcReport::default()
        };
        info!(roots = report.roots, generation = snapshot.generation, "gc started");

        let mut marks = Marks::default();
        self.mark(&snapshot, &mut marks)?;

        let mut candidates = Vec::new();
        for address in self.manifests.list_addresses()? {
            let address = address?;
            if !marks.contains(&address) {
                candidates.push(address);
            }
        }
        debug!(candidates = candidates.len(), marked = marks.live.len(), "mark phase done");

        for root in candidates {
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                break;
            }
            self.sweep_manifest(&root, &mut marks, &mut report)?;
        }

        if !report.cancelled {
            self.sweep_orphans(cancel, &mut marks, &mut report)?;
        }

        report.marked = marks.live.len();
        info!(
            manifests_deleted = report.manifests_deleted,
            blobs_deleted = report.blobs_deleted,
            bytes_reclaimed = report.bytes_reclaimed,
            retained = report.retained,
            cancelled = report.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "gc finished"
        );
        Ok(report)
    }

    fn mark(&self, snapshot: &RefSnapshot, marks: &mut Marks) -> Result<()> {
        for (name, root) in &snapshot.entries {
            marks.live.insert(*root);
            match self.manifests.get_manifest(root) {
                Ok(manifest) => marks.live.extend(manifest.chunk_addresses().copied()),
                Err(e) if e.is_not_found() => {
                    warn!(name = %name, address = %root, "reference points at a missing manifest");
                }
                Err(e) => return Err(e),
            }
        }
        marks.generation = snapshot.generation;
        Ok(())
    }

    /// Mark any roots added since the last mark. Marks only grow within a run.
    fn remark_if_moved(&self, marks: &mut Marks) -> Result<()> {
        let generation = self.refs.generation();
        if generation != marks.generation {
            debug!(from = marks.generation, to = generation, "references moved during gc, re-marking");
            self.mark(&self.refs.snapshot(), marks)?;
        }
        Ok(())
    }

    fn is_protected(&self, address: &ContentAddress, marks: &Marks) -> bool {
        marks.contains(address) || self.gc.is_recent(address)
    }

    fn sweep_manifest(&self, root: &ContentAddress, marks: &mut Marks, report: &mut GcReport) -> Result<()> {
        let _exclusive = self.gc.lock.write();
        self.remark_if_moved(marks)?;

        if self.is_protected(root, marks) {
            warn!(address = %root, "gc candidate became live, retaining");
            report.retained += 1;
            return Ok(());
        }

        let manifest = match self.manifests.get_manifest(root) {
            Ok(manifest) => manifest,
            Err(CasError::NotFound(_)) => return Ok(()),
            Err(e) if e.is_integrity_failure() || matches!(e, CasError::Serialization(_)) => {
                warn!(address = %root, error = %e, "unreadable manifest, retaining");
                report.retained += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Blobs first: a crash here leaves a manifest whose chunks are gone,
        // which the next run collects, never a reachable manifest without bytes.
        let mut seen = HashSet::new();
        for chunk in manifest.chunk_addresses() {
            if seen.insert(*chunk) && !self.is_protected(chunk, marks) {
                self.reclaim_blob(chunk, report)?;
            }
        }
        self.manifests.delete_manifest(root)?;
        report.manifests_deleted += 1;
        debug!(address = %root, chunks = manifest.chunk_count(), "manifest collected");
        Ok(())
    }

    /// Delete blobs no manifest names, e.g. chunks of a put that died before
    /// its manifest was written.
    fn sweep_orphans(&self, cancel: &AtomicBool, marks: &mut Marks, report: &mut GcReport) -> Result<()> {
        let mut named: HashSet<ContentAddress> = HashSet::new();
        for address in self.manifests.list_addresses()? {
            let address = address?;
            match self.manifests.get_manifest(&address) {
                Ok(manifest) => named.extend(manifest.chunk_addresses().copied()),
                Err(CasError::NotFound(_)) => {}
                Err(e) => {
                    warn!(address = %address, error = %e, "cannot read manifest, skipping orphan sweep");
                    return Ok(());
                }
            }
        }

        let mut orphans = Vec::new();
        for address in self.blobs.list_addresses()? {
            let address = address?;
            if !named.contains(&address) && !marks.contains(&address) {
                orphans.push(address);
            }
        }

        for address in orphans {
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                break;
            }
            let _exclusive = self.gc.lock.write();
            self.remark_if_moved(marks)?;
            if self.is_protected(&address, marks) {
                report.retained += 1;
                continue;
            }
            debug!(%address, "collecting orphan blob");
            self.reclaim_blob(&address, report)?;
        }
        Ok(())
    }

    fn reclaim_blob(&self, address: &ContentAddress, report: &mut GcReport) -> Result<()> {
        let size = match self.blobs.size(address) {
            Ok(size) => size,
            Err(CasError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.blobs.delete(address)?;
        self.quarantine.release(address)?;
        report.blobs_deleted += 1;
        report.bytes_reclaimed += size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::blob::{BlobStore, MemoryBlobStore};
    use crate::chunker::ChunkingConfig;
    use crate::engine::{Cas, PutOptions};
    use crate::hasher::hash;
    use crate::metadata::MemoryManifestStore;
    use crate::transform::KeyRing;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn cas() -> Cas {
        Cas::in_memory(ChunkingConfig::fixed(16), KeyRing::new())
    }

    #[test]
    fn test_unreferenced_objects_are_collected() -> crate::Result<()> {
        let cas = cas();
        let kept = cas.put(&[1u8; 40], PutOptions::new())?;
        let dropped = cas.put(&[2u8; 40], PutOptions::new())?;
        cas.tag("keep", &kept.address)?;

        let report = cas.run_gc()?;
        assert_eq!(report.roots, 1);
        assert_eq!(report.manifests_deleted, 1);
        assert_eq!(report.blobs_deleted, 2);
        assert_eq!(report.bytes_reclaimed, 24);
        assert!(cas.exists(&kept.address));
        assert!(!cas.exists(&dropped.address));
        assert_eq!(cas.get(&kept.address)?, vec![1u8; 40]);
        Ok(())
    }

    #[test]
    fn test_shared_chunks_survive() -> crate::Result<()> {
        let cas = cas();
        let mut live = vec![7u8; 16];
        live.extend_from_slice(&[8u8; 16]);
        let mut dead = vec![7u8; 16];
        dead.extend_from_slice(&[9u8; 16]);

        let live = cas.put(&live, PutOptions::new())?;
        cas.put(&dead, PutOptions::new())?;
        cas.tag("live", &live.address)?;

        let report = cas.run_gc()?;
        assert_eq!(report.blobs_deleted, 1);
        assert_eq!(cas.get(&live.address)?.len(), 32);
        Ok(())
    }

    #[test]
    fn test_gc_is_idempotent() -> crate::Result<()> {
        let cas = cas();
        cas.put(b"garbage", PutOptions::new())?;

        let first = cas.run_gc()?;
        assert_eq!(first.manifests_deleted, 1);
        let second = cas.run_gc()?;
        assert_eq!(second.manifests_deleted, 0);
        assert_eq!(second.blobs_deleted, 0);
        Ok(())
    }

    #[test]
    fn test_orphan_blobs_are_collected() -> crate::Result<()> {
        let blobs = Arc::new(MemoryBlobStore::new());
        let cas = Cas::with_stores(
            blobs.clone(),
            Arc::new(MemoryManifestStore::new()),
            ChunkingConfig::fixed(16),
            KeyRing::new(),
        );
        // A chunk written by a put that never recorded its manifest.
        let orphan = hash(b"left behind");
        blobs.put(&orphan, b"left behind")?;

        let report = cas.run_gc()?;
        assert_eq!(report.blobs_deleted, 1);
        assert!(!blobs.exists(&orphan));
        Ok(())
    }

    #[test]
    fn test_cancelled_run_deletes_nothing_more() -> crate::Result<()> {
        let cas = cas();
        for i in 0..5u8 {
            cas.put(&[i; 8], PutOptions::new())?;
        }

        let report = cas.run_gc_with(&AtomicBool::new(true))?;
        assert!(report.cancelled);
        assert_eq!(report.manifests_deleted, 0);

        let report = cas.run_gc()?;
        assert_eq!(report.manifests_deleted, 5);
        Ok(())
    }

    #[test]
    fn test_retag_keeps_object() -> crate::Result<()> {
        let cas = cas();
        let a = cas.put(b"version a", PutOptions::new())?;
        let b = cas.put(b"version b", PutOptions::new())?;
        cas.tag("current", &a.address)?;
        cas.tag("current", &b.address)?;

        cas.run_gc()?;
        assert!(!cas.exists(&a.address));
        assert_eq!(cas.get_named("current")?, b"version b");
        // History still names the old target even after its bytes are gone.
        assert_eq!(cas.history("current")[0].new, Some(a.address));
        Ok(())
    }
}
