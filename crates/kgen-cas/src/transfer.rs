//! Export and import of stored objects.
//!
//! Exported bytes are the stored form (after any transform), so an export
//! can be imported into another store without its keys. Import trusts
//! nothing: every chunk and every root is re-hashed before it is written.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::address::ContentAddress;
use crate::engine::Cas;
use crate::error::Result;
use crate::hasher;
use crate::manifest::Manifest;

/// Which objects an export covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportScope {
    /// Objects some reference points at.
    #[default]
    Reachable,
    /// Every object with a manifest, referenced or not.
    All,
}

/// One exported object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportItem {
    pub address: ContentAddress,
    pub manifest: Manifest,
    /// Stored bytes, all chunks concatenated.
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
}

/// Per-item import result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImportOutcome {
    Imported,
    /// Already present and complete; nothing written.
    Duplicate,
    /// The item's bytes or manifest do not hash to what it claims.
    IntegrityViolation { actual: ContentAddress },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub items: Vec<(ContentAddress, ImportOutcome)>,
}

impl ImportReport {
    pub fn imported(&self) -> usize {
        self.count(|o| matches!(o, ImportOutcome::Imported))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|o| matches!(o, ImportOutcome::Duplicate))
    }

    pub fn violations(&self) -> usize {
        self.count(|o| matches!(o, ImportOutcome::IntegrityViolation { .. }))
    }

    fn count(&self, pred: impl Fn(&ImportOutcome) -> bool) -> usize {
        self.items.iter().filter(|(_, o)| pred(o)).count()
    }
}

impl Cas {
    /// Lazily export objects with their manifests and stored bytes.
    pub fn export(&self, scope: ExportScope) -> Result<Box<dyn Iterator<Item = Result<ExportItem>> + '_>> {
        let export_one = move |address: ContentAddress| -> Result<ExportItem> {
            let manifest = self.manifest(&address)?;
            let bytes = self.read_stored(&manifest)?;
            Ok(ExportItem {
                address,
                manifest,
                bytes,
            })
        };

        match scope {
            ExportScope::Reachable => {
                let roots: BTreeSet<ContentAddress> =
                    self.refs.list_references().into_iter().map(|(_, a)| a).collect();
                Ok(Box::new(roots.into_iter().map(export_one)))
            }
            ExportScope::All => {
                let addresses = self.manifests.list_addresses()?;
                Ok(Box::new(addresses.map(move |a| a.and_then(export_one))))
            }
        }
    }

    /// Export every reachable object, or every stored object for a full backup.
    pub fn export_all(
        &self,
        include_unreachable: bool,
    ) -> Result<Box<dyn Iterator<Item = Result<ExportItem>> + '_>> {
        self.export(if include_unreachable {
            ExportScope::All
        } else {
            ExportScope::Reachable
        })
    }

    /// Import exported objects, verifying each one.
    ///
    /// Items that fail verification are reported, not written. Storage
    /// errors abort the import.
    pub fn import<I>(&self, items: I) -> Result<ImportReport>
    where
        I: IntoIterator<Item = ExportItem>,
    {
        self.writable()?;
        let mut report = ImportReport::default();

        for item in items {
            let outcome = self.import_one(&item)?;
            if let ImportOutcome::IntegrityViolation { actual } = &outcome {
                warn!(address = %item.address, %actual, "rejected import item");
            }
            report.items.push((item.address, outcome));
        }

        info!(
            imported = report.imported(),
            duplicates = report.duplicates(),
            violations = report.violations(),
            "import finished"
        );
        Ok(report)
    }

    fn import_one(&self, item: &ExportItem) -> Result<ImportOutcome> {
        let manifest = &item.manifest;
        let violation = |actual: ContentAddress| -> Result<ImportOutcome> {
            Ok(ImportOutcome::IntegrityViolation { actual })
        };

        // The root must be derived from the chunk list, not taken on trust.
        let computed = manifest.computed_root();
        if computed != item.address || manifest.root != item.address {
            return violation(computed);
        }
        if manifest.chunks.is_empty() || item.bytes.len() as u64 != manifest.size {
            return violation(hasher::hash(&item.bytes));
        }
        if let Err(e) = manifest.validate() {
            warn!(address = %item.address, error = %e, "imported manifest is inconsistent");
            return violation(computed);
        }

        let mut pieces = Vec::with_capacity(manifest.chunks.len());
        let mut offset = 0usize;
        for chunk in &manifest.chunks {
            let end = match usize::try_from(chunk.size)
                .ok()
                .and_then(|len| offset.checked_add(len))
            {
                Some(end) if end <= item.bytes.len() => end,
                _ => return violation(hasher::hash(&item.bytes)),
            };
            let piece = &item.bytes[offset..end];
            let actual = hasher::hash(piece);
            if actual != chunk.address {
                return violation(actual);
            }
            pieces.push(piece);
            offset = end;
        }

        let gate = self.gc.enter();
        let complete = self.manifests.contains(&item.address)
            && manifest.chunk_addresses().all(|c| self.blobs.exists(c));

        for (chunk, piece) in manifest.chunks.iter().zip(pieces) {
            self.blobs.put(&chunk.address, piece)?;
            gate.touch(&chunk.address);
        }
        self.manifests.put_manifest(manifest)?;
        gate.touch(&item.address);

        Ok(if complete {
            ImportOutcome::Duplicate
        } else {
            ImportOutcome::Imported
        })
    }
}

/// Hex encoding for byte payloads in JSON exports.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
