//! Transform pipeline: optional compression and encryption around storage.
//!
//! The transform is recorded in each manifest, so retrieval always knows
//! exactly which reverse steps to run and in which order. Addresses are
//! computed over the transformed bytes.
//!
//! Encryption is convergent: the nonce is derived from the key and the
//! plaintext, so the same content under the same key always produces the same
//! ciphertext and still deduplicates.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{CasError, Result};

/// Key length for XChaCha20-Poly1305.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 24;

/// Default zstd level used by [`Compression::zstd`].
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum Compression {
    Zstd { level: i32 },
    Lz4,
}

impl Compression {
    pub fn zstd() -> Self {
        Compression::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::Zstd { level } => zstd::stream::encode_all(data, *level)
                .map_err(|e| CasError::Transform(format!("zstd compression failed: {}", e))),
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        }
    }

    /// Decompress, producing at most `limit + 1` bytes when a limit is given.
    fn decompress(&self, data: &[u8], limit: Option<u64>) -> Result<Vec<u8>> {
        match (self, limit) {
            (Compression::Zstd { .. }, None) => zstd::stream::decode_all(data)
                .map_err(|e| CasError::Transform(format!("zstd decompression failed: {}", e))),
            (Compression::Zstd { .. }, Some(limit)) => {
                let decoder = zstd::stream::read::Decoder::new(data)
                    .map_err(|e| CasError::Transform(format!("zstd decompression failed: {}", e)))?;
                let mut out = Vec::new();
                decoder
                    .take(limit.saturating_add(1))
                    .read_to_end(&mut out)
                    .map_err(|e| CasError::Transform(format!("zstd decompression failed: {}", e)))?;
                Ok(out)
            }
            (Compression::Lz4, limit) => {
                if let Some(limit) = limit {
                    // The size prefix drives the allocation; check it first.
                    let claimed = data
                        .get(..4)
                        .map(|p| u64::from(u32::from_le_bytes([p[0], p[1], p[2], p[3]])));
                    if claimed != Some(limit) {
                        return Err(CasError::Transform(format!(
                            "lz4 header claims {:?} bytes, expected {}",
                            claimed, limit
                        )));
                    }
                }
                lz4_flex::decompress_size_prepended(data)
                    .map_err(|e| CasError::Transform(format!("lz4 decompression failed: {}", e)))
            }
        }
    }

    /// Canonical name, including parameters that change the output.
    fn tag(&self) -> String {
        match self {
            Compression::Zstd { level } => format!("zstd:{}", level),
            Compression::Lz4 => "lz4".to_string(),
        }
    }
}

/// Encryption scheme and the name of the key it uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum Encryption {
    XChaCha20Poly1305 { key_ref: String },
}

impl Encryption {
    pub fn xchacha(key_ref: impl Into<String>) -> Self {
        Encryption::XChaCha20Poly1305 {
            key_ref: key_ref.into(),
        }
    }

    pub fn key_ref(&self) -> &str {
        match self {
            Encryption::XChaCha20Poly1305 { key_ref } => key_ref,
        }
    }

    fn tag(&self) -> String {
        match self {
            Encryption::XChaCha20Poly1305 { key_ref } => format!("xchacha20poly1305:{}", key_ref),
        }
    }

    fn encrypt(&self, keys: &KeyRing, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = keys.get(self.key_ref())?;
        let derived = blake3::keyed_hash(key, plaintext);
        let nonce = XNonce::from_slice(&derived.as_bytes()[..NONCE_LEN]);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CasError::Transform(format!("XChaCha20-Poly1305 encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, keys: &KeyRing, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(CasError::Transform(
                "ciphertext too short for XChaCha20-Poly1305".into(),
            ));
        }
        let key = keys.get(self.key_ref())?;
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|e| CasError::Transform(format!("XChaCha20-Poly1305 decryption failed: {}", e)))
    }
}

/// The transform applied before hashing and storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    #[default]
    None,
    Compressed {
        compression: Compression,
    },
    Encrypted {
        encryption: Encryption,
    },
    CompressedThenEncrypted {
        compression: Compression,
        encryption: Encryption,
    },
}

impl Transform {
    pub fn compressed(compression: Compression) -> Self {
        Transform::Compressed { compression }
    }

    pub fn encrypted(encryption: Encryption) -> Self {
        Transform::Encrypted { encryption }
    }

    pub fn compressed_then_encrypted(compression: Compression, encryption: Encryption) -> Self {
        Transform::CompressedThenEncrypted {
            compression,
            encryption,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Transform::None)
    }

    /// Key reference, if the transform encrypts.
    pub fn key_ref(&self) -> Option<&str> {
        match self {
            Transform::Encrypted { encryption }
            | Transform::CompressedThenEncrypted { encryption, .. } => Some(encryption.key_ref()),
            _ => None,
        }
    }

    /// Apply the transform: compress, then encrypt.
    pub fn forward(&self, data: &[u8], keys: &KeyRing) -> Result<Vec<u8>> {
        match self {
            Transform::None => Ok(data.to_vec()),
            Transform::Compressed { compression } => compression.compress(data),
            Transform::Encrypted { encryption } => encryption.encrypt(keys, data),
            Transform::CompressedThenEncrypted {
                compression,
                encryption,
            } => {
                let compressed = compression.compress(data)?;
                encryption.encrypt(keys, &compressed)
            }
        }
    }

    /// Undo the transform: decrypt, then decompress.
    pub fn reverse(&self, data: &[u8], keys: &KeyRing) -> Result<Vec<u8>> {
        self.reverse_limited(data, keys, None)
    }

    /// Undo the transform of a payload known to be `logical_size` bytes.
    ///
    /// Decompression stops once the output passes `logical_size`, so a
    /// forged header cannot force a large allocation. Output of any other
    /// length is an error.
    pub fn reverse_to_size(&self, data: &[u8], keys: &KeyRing, logical_size: u64) -> Result<Vec<u8>> {
        let out = self.reverse_limited(data, keys, Some(logical_size))?;
        if out.len() as u64 != logical_size {
            return Err(CasError::Transform(format!(
                "reversed payload is {} bytes, expected {}",
                out.len(),
                logical_size
            )));
        }
        Ok(out)
    }

    fn reverse_limited(&self, data: &[u8], keys: &KeyRing, limit: Option<u64>) -> Result<Vec<u8>> {
        match self {
            Transform::None => Ok(data.to_vec()),
            Transform::Compressed { compression } => compression.decompress(data, limit),
            Transform::Encrypted { encryption } => encryption.decrypt(keys, data),
            Transform::CompressedThenEncrypted {
                compression,
                encryption,
            } => {
                let compressed = encryption.decrypt(keys, data)?;
                compression.decompress(&compressed, limit)
            }
        }
    }

    /// Canonical name of the transform, covering every field a manifest
    /// records. `None` for the identity transform.
    pub fn tag(&self) -> Option<String> {
        match self {
            Transform::None => None,
            Transform::Compressed { compression } => Some(compression.tag()),
            Transform::Encrypted { encryption } => Some(encryption.tag()),
            Transform::CompressedThenEncrypted {
                compression,
                encryption,
            } => Some(format!("{}+{}", compression.tag(), encryption.tag())),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::None => write!(f, "none"),
            Transform::Compressed { compression } => write!(f, "{:?}", compression),
            Transform::Encrypted { encryption } => write!(f, "encrypted({})", encryption.key_ref()),
            Transform::CompressedThenEncrypted {
                compression,
                encryption,
            } => write!(f, "{:?}+encrypted({})", compression, encryption.key_ref()),
        }
    }
}

/// Named encryption keys supplied by the caller.
///
/// Keys never leave the ring and are zeroed on drop. Manifests only record
/// the key's name.
#[derive(Default)]
pub struct KeyRing {
    keys: HashMap<String, Zeroizing<[u8; KEY_LEN]>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_ref: impl Into<String>, key: [u8; KEY_LEN]) {
        self.keys.insert(key_ref.into(), Zeroizing::new(key));
    }

    pub fn with_key(mut self, key_ref: impl Into<String>, key: [u8; KEY_LEN]) -> Self {
        self.insert(key_ref, key);
        self
    }

    pub fn contains(&self, key_ref: &str) -> bool {
        self.keys.contains_key(key_ref)
    }

    fn get(&self, key_ref: &str) -> Result<&[u8; KEY_LEN]> {
        self.keys
            .get(key_ref)
            .map(|k| &**k)
            .ok_or_else(|| CasError::KeyNotFound(key_ref.to_string()))
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.keys.keys().collect();
        names.sort();
        f.debug_struct("KeyRing").field("keys", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys() -> KeyRing {
        KeyRing::new().with_key("primary", [7u8; KEY_LEN])
    }

    fn all_transforms() -> Vec<Transform> {
        vec![
            Transform::None,
            Transform::compressed(Compression::zstd()),
            Transform::compressed(Compression::Lz4),
            Transform::encrypted(Encryption::xchacha("primary")),
            Transform::compressed_then_encrypted(Compression::Lz4, Encryption::xchacha("primary")),
        ]
    }

    #[test]
    fn test_compression_shrinks_repetitive_data() -> Result<()> {
        let data = vec![b'a'; 64 * 1024];
        for compression in [Compression::zstd(), Compression::Lz4] {
            let stored = Transform::compressed(compression).forward(&data, &keys())?;
            assert!(stored.len() < data.len() / 10);
        }
        Ok(())
    }

    #[test]
    fn test_encryption_is_convergent() -> Result<()> {
        let t = Transform::encrypted(Encryption::xchacha("primary"));
        let a = t.forward(b"same plaintext", &keys())?;
        let b = t.forward(b"same plaintext", &keys())?;
        assert_eq!(a, b);
        assert_ne!(&a[NONCE_LEN..], b"same plaintext");
        Ok(())
    }

    #[test]
    fn test_different_keys_produce_different_ciphertext() -> Result<()> {
        let ring = keys().with_key("other", [9u8; KEY_LEN]);
        let a = Transform::encrypted(Encryption::xchacha("primary")).forward(b"x", &ring)?;
        let b = Transform::encrypted(Encryption::xchacha("other")).forward(b"x", &ring)?;
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn test_missing_key_is_reported() {
        let t = Transform::encrypted(Encryption::xchacha("absent"));
        let err = t.forward(b"data", &keys()).unwrap_err();
        assert!(matches!(err, CasError::KeyNotFound(ref k) if k == "absent"));
    }

    #[test]
    fn test_tampered_ciphertext_fails() -> Result<()> {
        let t = Transform::encrypted(Encryption::xchacha("primary"));
        let mut stored = t.forward(b"authentic", &keys())?;
        let last = stored.len() - 1;
        stored[last] ^= 1;
        assert!(matches!(t.reverse(&stored, &keys()), Err(CasError::Transform(_))));
        Ok(())
    }

    #[test]
    fn test_transform_serde_is_tagged() {
        let t = Transform::compressed_then_encrypted(Compression::zstd(), Encryption::xchacha("k1"));
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["kind"], "compressed_then_encrypted");
        assert_eq!(json["compression"]["algorithm"], "zstd");
        assert_eq!(json["encryption"]["key_ref"], "k1");
        let restored: Transform = serde_json::from_value(json).unwrap();
        assert_eq!(restored, t);
    }

    #[test]
    fn test_tags_cover_every_parameter() {
        let tags: Vec<_> = [
            Transform::None,
            Transform::compressed(Compression::Zstd { level: 3 }),
            Transform::compressed(Compression::Zstd { level: 9 }),
            Transform::compressed(Compression::Lz4),
            Transform::encrypted(Encryption::xchacha("a")),
            Transform::encrypted(Encryption::xchacha("b")),
            Transform::compressed_then_encrypted(Compression::Lz4, Encryption::xchacha("a")),
        ]
        .iter()
        .map(Transform::tag)
        .collect();
        assert_eq!(tags[0], None);
        let distinct: std::collections::HashSet<_> = tags.iter().collect();
        assert_eq!(distinct.len(), tags.len());
        assert_eq!(tags[6].as_deref(), Some("lz4+xchacha20poly1305:a"));
    }

    #[test]
    fn test_forged_lz4_size_is_refused_before_allocating() -> Result<()> {
        let t = Transform::compressed(Compression::Lz4);
        let mut stored = t.forward(b"tiny payload", &keys())?;
        stored[..4].copy_from_slice(&u32::MAX.to_le_bytes());

        let err = t.reverse_to_size(&stored, &keys(), 12).unwrap_err();
        assert!(matches!(err, CasError::Transform(ref m) if m.contains("lz4 header")));
        Ok(())
    }

    #[test]
    fn test_zstd_output_is_capped_at_logical_size() -> Result<()> {
        let t = Transform::compressed(Compression::zstd());
        let stored = t.forward(&vec![0u8; 1 << 20], &keys())?;

        assert!(matches!(
            t.reverse_to_size(&stored, &keys(), 16),
            Err(CasError::Transform(_))
        ));
        assert_eq!(t.reverse_to_size(&stored, &keys(), 1 << 20)?.len(), 1 << 20);
        Ok(())
    }

    #[test]
    fn test_identity_reverse_checks_length() -> Result<()> {
        assert_eq!(Transform::None.reverse_to_size(b"abc", &keys(), 3)?, b"abc");
        assert!(Transform::None.reverse_to_size(b"abc", &keys(), 4).is_err());
        Ok(())
    }

    #[test]
    fn test_key_ring_debug_hides_keys() {
        let debug = format!("{:?}", keys());
        assert!(debug.contains("primary"));
        assert!(!debug.contains('7'));
    }

    proptest! {
        #[test]
        fn prop_reverse_undoes_forward(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
            let ring = keys();
            for t in all_transforms() {
                let stored = t.forward(&data, &ring).unwrap();
                prop_assert_eq!(t.reverse(&stored, &ring).unwrap(), data.clone());
                prop_assert_eq!(t.reverse_to_size(&stored, &ring, data.len() as u64).unwrap(), data.clone());
            }
        }
    }
}
