//! Manifests: how one logical object maps onto stored chunks.
//!
//! A manifest is created once, when its payload is first stored, and never
//! modified. Different content always means a different root address and a
//! new manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::ContentAddress;
use crate::error::{CasError, Result};
use crate::hasher;
use crate::transform::Transform;

/// One entry in a manifest's chunk list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    pub address: ContentAddress,
    pub size: u64,
}

/// Describes one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Root address. An untransformed single-chunk object is addressed by its
    /// chunk; everything else by a tree hash of the chunk list, keyed by the
    /// transform when there is one.
    pub root: ContentAddress,

    /// Chunks in payload order. Never empty.
    pub chunks: Vec<ChunkRef>,

    /// Stored size in bytes (after the transform).
    pub size: u64,

    /// Size before the transform.
    pub logical_size: u64,

    pub transform: Transform,

    /// MIME type hint supplied by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Manifest {
    /// Build a manifest over `chunks`, computing root and stored size.
    pub fn new(chunks: Vec<ChunkRef>, logical_size: u64, transform: Transform) -> Self {
        let root = root_for(&chunks, &transform);
        let size = chunks.iter().fold(0u64, |acc, c| acc.saturating_add(c.size));
        Self {
            root,
            chunks,
            size,
            logical_size,
            transform,
            mime_type: None,
            created_at: Utc::now(),
        }
    }

    /// Builder: set the MIME hint.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn is_chunked(&self) -> bool {
        self.chunks.len() > 1
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_addresses(&self) -> impl Iterator<Item = &ContentAddress> {
        self.chunks.iter().map(|c| &c.address)
    }

    /// Root recomputed from the chunk list.
    pub fn computed_root(&self) -> ContentAddress {
        root_for(&self.chunks, &self.transform)
    }

    /// Check internal consistency: root, sizes, non-empty chunk list.
    pub fn validate(&self) -> Result<()> {
        if self.chunks.is_empty() {
            return Err(CasError::ManifestConflict { address: self.root });
        }
        let actual = self.computed_root();
        if actual != self.root {
            return Err(CasError::IntegrityViolation {
                address: self.root,
                actual,
            });
        }
        let total = self
            .chunks
            .iter()
            .try_fold(0u64, |acc, c| acc.checked_add(c.size));
        if total != Some(self.size) {
            return Err(CasError::ManifestConflict { address: self.root });
        }
        if self.transform.is_identity() && self.logical_size != self.size {
            return Err(CasError::ManifestConflict { address: self.root });
        }
        Ok(())
    }

    /// Whether two manifests describe the same stored object.
    ///
    /// Creation time and MIME hint are descriptive; they don't change what
    /// the root names.
    pub fn same_content(&self, other: &Manifest) -> bool {
        self.root == other.root
            && self.chunks == other.chunks
            && self.size == other.size
            && self.logical_size == other.logical_size
            && self.transform == other.transform
    }
}

fn root_for(chunks: &[ChunkRef], transform: &Transform) -> ContentAddress {
    let pairs = chunks.iter().map(|c| (&c.address, c.size));
    match transform.tag() {
        None => hasher::root_of(pairs),
        Some(tag) => hasher::transformed_root_of(&tag, pairs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Compression;

    fn chunk(data: &[u8]) -> ChunkRef {
        ChunkRef {
            address: hasher::hash(data),
            size: data.len() as u64,
        }
    }

    #[test]
    fn test_single_chunk_root_is_blob_address() {
        let manifest = Manifest::new(vec![chunk(b"small")], 5, Transform::None);
        assert_eq!(manifest.root, hasher::hash(b"small"));
        assert!(!manifest.is_chunked());
        assert_eq!(manifest.size, 5);
        manifest.validate().unwrap();
    }

    #[test]
    fn test_chunked_root_covers_all_chunks() {
        let manifest = Manifest::new(vec![chunk(b"aa"), chunk(b"bbb")], 5, Transform::None);
        assert!(manifest.is_chunked());
        assert_eq!(manifest.size, 5);
        assert_ne!(manifest.root, hasher::hash(b"aabbb"));
        manifest.validate().unwrap();
    }

    #[test]
    fn test_validate_catches_tampered_chunk_list() {
        let mut manifest = Manifest::new(vec![chunk(b"aa"), chunk(b"bbb")], 5, Transform::None);
        manifest.chunks.swap(0, 1);
        assert!(matches!(
            manifest.validate(),
            Err(CasError::IntegrityViolation { .. })
        ));
    }

    #[test]
    fn test_transformed_root_is_not_the_blob_address() {
        let plain = Manifest::new(vec![chunk(b"packed")], 6, Transform::None);
        let lz4 = Manifest::new(vec![chunk(b"packed")], 40, Transform::compressed(Compression::Lz4));
        assert_eq!(plain.root, hasher::hash(b"packed"));
        assert_ne!(lz4.root, plain.root);
        lz4.validate().unwrap();

        let mut relabelled = lz4.clone();
        relabelled.transform = Transform::compressed(Compression::zstd());
        assert!(matches!(
            relabelled.validate(),
            Err(CasError::IntegrityViolation { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_overflowing_sizes() {
        let mut manifest = Manifest::new(vec![chunk(b"a"), chunk(b"b")], 2, Transform::None);
        manifest.chunks[0].size = u64::MAX;
        manifest.root = manifest.computed_root();
        assert!(matches!(
            manifest.validate(),
            Err(CasError::ManifestConflict { .. })
        ));
    }

    #[test]
    fn test_untransformed_sizes_must_agree() {
        let mut manifest = Manifest::new(vec![chunk(b"abc")], 3, Transform::None);
        manifest.logical_size = 4;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_same_content_ignores_descriptive_fields() {
        let a = Manifest::new(vec![chunk(b"x")], 1, Transform::None).with_mime_type("text/plain");
        let mut b = Manifest::new(vec![chunk(b"x")], 1, Transform::None);
        b.created_at = a.created_at - chrono::Duration::hours(1);
        assert!(a.same_content(&b));

        let c = Manifest::new(vec![chunk(b"x")], 1, Transform::compressed(Compression::Lz4));
        assert!(!a.same_content(&c));
    }

    #[test]
    fn test_manifest_serde() {
        let manifest = Manifest::new(vec![chunk(b"a"), chunk(b"b")], 2, Transform::None)
            .with_mime_type("application/json");
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains(&manifest.root.to_string()));
        let restored: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, manifest);
    }
}
