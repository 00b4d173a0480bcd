//! Content-addressed storage for KGEN artifacts.
//!
//! Payloads are stored immutably under the BLAKE3 digest of their stored
//! bytes. Large payloads are split into chunks that are deduplicated
//! individually; a manifest records how a root address maps onto its
//! chunks. Names (tags, versions, "latest") point at roots and form the root
//! set for garbage collection.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use kgen_cas::{Cas, CasConfig, KeyRing, PutOptions};
//!
//! // Create from environment (reads KGEN_CAS_PATH)
//! let config = CasConfig::from_env().unwrap();
//! let cas = Cas::open(config, KeyRing::new()).unwrap();
//!
//! // Store content
//! let put = cas.put(b"Hello, World!", PutOptions::new().with_mime_type("text/plain")).unwrap();
//! println!("Stored as: {}", put.address);
//!
//! // Name it, so garbage collection keeps it
//! cas.tag("greeting", &put.address).unwrap();
//!
//! // Retrieve content, re-verified on every read
//! let data = cas.get(&put.address).unwrap();
//! assert_eq!(data, b"Hello, World!");
//!
//! // Reclaim everything no name reaches
//! let report = cas.run_gc().unwrap();
//! println!("reclaimed {} bytes", report.bytes_reclaimed);
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `KGEN_CAS_PATH`: Base path for storage (default: `~/.kgen/cas`)
//! - `KGEN_CAS_READONLY`: Set to "true" for read-only mode
//! - `KGEN_CAS_CHUNK_SIZE`: Chunk size and single-chunk threshold in bytes
//!
//! Compression and encryption are chosen per `put` through
//! [`PutOptions::with_transform`]; encryption keys are held in the
//! [`KeyRing`] the store is opened with.
//!
//! # Layout
//!
//! ```text
//! {base_path}/
//! ├── objects/      # chunk blobs, sharded by the first two hex digits
//! ├── manifests/    # one JSON manifest per root address
//! ├── refs/         # reference table snapshot + append-only history
//! ├── quarantine/   # markers for addresses that failed verification
//! ├── staging/      # in-progress writes
//! └── LOCK          # held by the one writable handle
//! ```
//!
//! Every durable write is staged, fsynced and then published with a single
//! link or rename, so readers never see a partial object.

pub mod address;
pub mod blob;
pub mod chunker;
pub mod config;
pub mod engine;
pub mod error;
pub mod gc;
pub mod hasher;
pub mod manifest;
pub mod metadata;
pub mod quarantine;
pub mod refs;
pub mod staging;
pub mod transfer;
pub mod transform;
pub mod verify;

// Re-exports for convenience
pub use address::{AddressError, Algorithm, ContentAddress};
pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore, WriteOutcome};
pub use chunker::{Chunk, Chunker, ChunkingConfig, ChunkingStrategy};
pub use config::CasConfig;
pub use engine::{Cas, CasStats, PutOptions, PutResult};
pub use error::{CasError, Result};
pub use gc::GcReport;
pub use hasher::{hash, hash_stream, StreamHasher, TreeHasher};
pub use manifest::{ChunkRef, Manifest};
pub use metadata::{FileManifestStore, ManifestStore, MemoryManifestStore};
pub use refs::{RefEntry, RefEvent, RefSnapshot, RefUpdate, ReferenceTracker};
pub use transfer::{ExportItem, ExportScope, ImportOutcome, ImportReport};
pub use transform::{Compression, Encryption, KeyRing, Transform};
pub use verify::{VerificationReport, VerificationStatus};
