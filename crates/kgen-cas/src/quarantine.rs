//! Quarantine: addresses that failed an integrity check.
//!
//! A quarantined address is never served. Nothing is repaired here; the set
//! only shrinks when a caller restores verified bytes or GC deletes the
//! address outright. On disk each entry is a marker file named by hex digest
//! holding the time it was isolated:
//! ```text
//! {base_path}/quarantine/
//! └── 9f86d081884c7d65...
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::address::{Algorithm, ContentAddress};
use crate::error::{IoContext, Result};

#[derive(Debug)]
pub struct Quarantine {
    dir: Option<PathBuf>,
    entries: RwLock<HashSet<ContentAddress>>,
    read_only: bool,
}

impl Quarantine {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            entries: RwLock::new(HashSet::new()),
            read_only: false,
        }
    }

    /// Load the quarantine list from `dir`.
    pub fn open(dir: impl Into<PathBuf>, read_only: bool) -> Result<Self> {
        let dir = dir.into();
        let mut entries = HashSet::new();

        match fs::read_dir(&dir) {
            Ok(listing) => {
                for entry in listing {
                    let entry = entry.io_context(|| format!("read {}", dir.display()))?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    match ContentAddress::from_hex(Algorithm::Blake3, &name) {
                        Ok(address) => {
                            entries.insert(address);
                        }
                        Err(_) => warn!(path = %entry.path().display(), "skipping unrecognized quarantine entry"),
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).io_context(|| format!("read {}", dir.display())),
        }

        if !entries.is_empty() {
            warn!(count = entries.len(), "store has quarantined addresses");
        }
        Ok(Self {
            dir: Some(dir),
            entries: RwLock::new(entries),
            read_only,
        })
    }

    pub fn contains(&self, address: &ContentAddress) -> bool {
        self.entries.read().contains(address)
    }

    /// Isolate `address`. Returns true if it was not already quarantined.
    ///
    /// A read-only store still refuses the address for the life of the
    /// process but cannot persist the marker.
    pub fn isolate(&self, address: &ContentAddress) -> Result<bool> {
        if !self.entries.write().insert(*address) {
            return Ok(false);
        }
        error!(%address, "address quarantined after failed integrity check");

        if let (Some(dir), false) = (&self.dir, self.read_only) {
            fs::create_dir_all(dir).io_context(|| format!("create {}", dir.display()))?;
            let marker = dir.join(address.hex());
            fs::write(&marker, Utc::now().to_rfc3339())
                .io_context(|| format!("write {}", marker.display()))?;
        }
        Ok(true)
    }

    /// Lift the quarantine on `address`. Returns true if it was quarantined.
    pub fn release(&self, address: &ContentAddress) -> Result<bool> {
        if !self.entries.write().remove(address) {
            return Ok(false);
        }
        if let (Some(dir), false) = (&self.dir, self.read_only) {
            let marker = dir.join(address.hex());
            match fs::remove_file(&marker) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).io_context(|| format!("remove {}", marker.display())),
            }
        }
        info!(%address, "quarantine lifted");
        Ok(true)
    }

    /// Quarantined addresses, sorted.
    pub fn list(&self) -> Vec<ContentAddress> {
        let mut list: Vec<_> = self.entries.read().iter().copied().collect();
        list.sort();
        list
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash;
    use tempfile::TempDir;

    #[test]
    fn test_isolate_and_release() -> Result<()> {
        let quarantine = Quarantine::in_memory();
        let address = hash(b"bad");

        assert!(quarantine.isolate(&address)?);
        assert!(!quarantine.isolate(&address)?);
        assert!(quarantine.contains(&address));

        assert!(quarantine.release(&address)?);
        assert!(!quarantine.release(&address)?);
        assert!(quarantine.is_empty());
        Ok(())
    }

    #[test]
    fn test_markers_survive_reopen() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let dir = temp_dir.path().join("quarantine");
        let (a, b) = (hash(b"a"), hash(b"b"));
        {
            let quarantine = Quarantine::open(&dir, false)?;
            quarantine.isolate(&a)?;
            quarantine.isolate(&b)?;
            quarantine.release(&b)?;
        }

        let quarantine = Quarantine::open(&dir, false)?;
        assert_eq!(quarantine.list(), vec![a]);
        assert!(dir.join(a.hex()).exists());
        assert!(!dir.join(b.hex()).exists());
        Ok(())
    }
}
