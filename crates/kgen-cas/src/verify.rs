//! Integrity verification: re-hash what is stored and report.
//!
//! Verification reads around the quarantine, so a previously isolated
//! address can be re-checked. A corrupted chunk is quarantined; nothing is
//! repaired.

use serde::Serialize;
use tracing::{debug, error};

use crate::address::ContentAddress;
use crate::engine::Cas;
use crate::error::{CasError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationStatus {
    Valid,
    /// A chunk's bytes, or the manifest's chunk list, hash to something else.
    Corrupted {
        chunk: ContentAddress,
        actual: ContentAddress,
    },
    /// The manifest exists but a chunk's blob does not.
    Missing { chunk: ContentAddress },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub address: ContentAddress,
    pub status: VerificationStatus,
    pub chunks_checked: usize,
    pub bytes_checked: u64,
}

impl VerificationReport {
    pub fn is_valid(&self) -> bool {
        self.status == VerificationStatus::Valid
    }
}

impl Cas {
    /// Verify one stored object.
    pub fn verify(&self, address: &ContentAddress) -> Result<VerificationReport> {
        let manifest = self.manifests.get_manifest(address)?;
        let mut report = VerificationReport {
            address: *address,
            status: VerificationStatus::Valid,
            chunks_checked: 0,
            bytes_checked: 0,
        };

        let computed = manifest.computed_root();
        if computed != *address {
            error!(%address, actual = %computed, "manifest chunk list does not match its root");
            report.status = VerificationStatus::Corrupted {
                chunk: *address,
                actual: computed,
            };
            return Ok(report);
        }

        for chunk in &manifest.chunks {
            match self.blobs.get(&chunk.address) {
                Ok(data) => {
                    report.chunks_checked += 1;
                    report.bytes_checked += data.len() as u64;
                }
                Err(CasError::IntegrityViolation { address: chunk_address, actual }) => {
                    self.quarantine.isolate(&chunk_address)?;
                    report.status = VerificationStatus::Corrupted {
                        chunk: chunk_address,
                        actual,
                    };
                    break;
                }
                Err(CasError::NotFound(missing)) => {
                    error!(%address, chunk = %missing, "manifest names a missing chunk");
                    report.status = VerificationStatus::Missing { chunk: missing };
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        debug!(%address, status = ?report.status, chunks = report.chunks_checked, "verified");
        Ok(report)
    }

    /// Verify every stored object, lazily. Dropping the iterator stops the walk.
    pub fn verify_all(&self) -> Result<impl Iterator<Item = Result<VerificationReport>> + '_> {
        let addresses = self.manifests.list_addresses()?;
        Ok(addresses.map(move |address| address.and_then(|address| self.verify(&address))))
    }
}
