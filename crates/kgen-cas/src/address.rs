//! ContentAddress: the canonical `<algorithm>:<hex-digest>` name of stored bytes.
//!
//! The digest is a full 256-bit BLAKE3 output. The string form is the only
//! identifier that leaves the engine, so parsing and display must round-trip
//! exactly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Digest algorithms the engine can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Blake3,
}

impl Algorithm {
    /// Identifier used in the canonical string form.
    pub fn id(&self) -> &'static str {
        match self {
            Algorithm::Blake3 => "blake3",
        }
    }
}

impl FromStr for Algorithm {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blake3" => Ok(Algorithm::Blake3),
            other => Err(AddressError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Errors that can occur when parsing a content address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("missing algorithm prefix in address {0:?}")]
    MissingAlgorithm(String),

    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid digest length: expected {expected} hex chars, got {0}", expected = DIGEST_LEN * 2)]
    InvalidLength(usize),

    #[error("invalid hex character in digest")]
    InvalidHex,
}

/// A content address: algorithm plus fixed-length digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentAddress {
    algorithm: Algorithm,
    digest: [u8; DIGEST_LEN],
}

impl ContentAddress {
    /// Build an address from a raw BLAKE3 digest.
    pub fn from_blake3(digest: [u8; DIGEST_LEN]) -> Self {
        Self {
            algorithm: Algorithm::Blake3,
            digest,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Lowercase hex of the digest, without the algorithm prefix.
    pub fn hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// First 2 hex characters (used for directory sharding).
    pub fn prefix(&self) -> String {
        hex::encode(&self.digest[..1])
    }

    /// Hex digest after the prefix (used as filename).
    pub fn remainder(&self) -> String {
        hex::encode(&self.digest[1..])
    }

    /// Parse the `<prefix><remainder>` hex form used in on-disk filenames.
    pub(crate) fn from_hex(algorithm: Algorithm, s: &str) -> Result<Self, AddressError> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(AddressError::InvalidLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::InvalidHex);
        }
        let mut digest = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s.to_ascii_lowercase(), &mut digest)
            .map_err(|_| AddressError::InvalidHex)?;
        Ok(Self { algorithm, digest })
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.id(), self.hex())
    }
}

impl fmt::Debug for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentAddress({})", self)
    }
}

impl FromStr for ContentAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, digest) = s
            .split_once(':')
            .ok_or_else(|| AddressError::MissingAlgorithm(s.to_string()))?;
        Self::from_hex(algorithm.parse()?, digest)
    }
}

impl TryFrom<String> for ContentAddress {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContentAddress> for String {
    fn from(address: ContentAddress) -> Self {
        address.to_string()
    }
}
