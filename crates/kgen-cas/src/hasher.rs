//! Hashing: BLAKE3 over bytes, streams, and chunk sequences.
//!
//! Single blobs are addressed by the plain BLAKE3 hash of their bytes. A
//! chunked payload's root address is a tree hash over the ordered chunk
//! digests and lengths, computed under a derived-key context so it can never
//! collide with a plain blob hash. Objects stored through a transform get
//! their roots from a second context that also covers the transform's tag,
//! so the same stored bytes under different transforms never share a root.
//! Appending a chunk only feeds 40 more bytes into the root hasher; the
//! chunk payloads are never re-read.

use std::io::{self, Read, Write};

use crate::address::ContentAddress;

/// Context string for root digests of chunked manifests.
const TREE_CONTEXT: &str = "kgen-cas 2024-06-01 manifest root v1";

/// Context string for root digests of transformed objects.
const TRANSFORMED_TREE_CONTEXT: &str = "kgen-cas 2024-06-01 transformed manifest root v1";

const READ_BUF_SIZE: usize = 64 * 1024;

/// Hash a byte slice.
pub fn hash(data: &[u8]) -> ContentAddress {
    ContentAddress::from_blake3(*blake3::hash(data).as_bytes())
}

/// Hash everything a reader produces, without buffering it.
pub fn hash_stream<R: Read>(mut reader: R) -> io::Result<ContentAddress> {
    let mut hasher = StreamHasher::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Incremental hasher for a single blob.
#[derive(Debug, Clone, Default)]
pub struct StreamHasher {
    inner: blake3::Hasher,
    len: u64,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(&self) -> ContentAddress {
        ContentAddress::from_blake3(*self.inner.finalize().as_bytes())
    }
}

impl Write for StreamHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Root hasher over an ordered sequence of chunk digests.
///
/// The hasher state can be cloned and extended, so a manifest that grows by
/// one chunk only needs the new chunk's digest.
#[derive(Debug, Clone)]
pub struct TreeHasher {
    inner: blake3::Hasher,
    chunks: u64,
    total_len: u64,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new_derive_key(TREE_CONTEXT),
            chunks: 0,
            total_len: 0,
        }
    }

    /// Root hasher for an object stored through the transform named `tag`.
    pub fn for_transform(tag: &str) -> Self {
        let mut inner = blake3::Hasher::new_derive_key(TRANSFORMED_TREE_CONTEXT);
        inner.update(&(tag.len() as u64).to_le_bytes());
        inner.update(tag.as_bytes());
        Self {
            inner,
            chunks: 0,
            total_len: 0,
        }
    }

    /// Feed the next chunk in order.
    pub fn push(&mut self, chunk: &ContentAddress, len: u64) {
        self.inner.update(chunk.digest());
        self.inner.update(&len.to_le_bytes());
        self.chunks += 1;
        // Lengths come from untrusted manifests too.
        self.total_len = self.total_len.saturating_add(len);
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Root digest over everything pushed so far.
    ///
    /// The chunk count is mixed in last so prefixes of a sequence never share
    /// a root with the full sequence.
    pub fn finalize(&self) -> ContentAddress {
        let mut inner = self.inner.clone();
        inner.update(&self.chunks.to_le_bytes());
        ContentAddress::from_blake3(*inner.finalize().as_bytes())
    }
}

impl Default for TreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Root address for a chunk list.
///
/// A single chunk is its own root, so small payloads are addressed exactly
/// like plain blobs.
pub fn root_of<'a, I>(chunks: I) -> ContentAddress
where
    I: IntoIterator<Item = (&'a ContentAddress, u64)>,
{
    let mut tree = TreeHasher::new();
    let mut first = None;
    for (address, len) in chunks {
        if tree.chunk_count() == 0 {
            first = Some(*address);
        }
        tree.push(address, len);
    }
    match (tree.chunk_count(), first) {
        (1, Some(only)) => only,
        _ => tree.finalize(),
    }
}

/// Root address for a chunk list stored through the transform named `tag`.
///
/// Always a tree hash, even for a single chunk.
pub fn transformed_root_of<'a, I>(tag: &str, chunks: I) -> ContentAddress
where
    I: IntoIterator<Item = (&'a ContentAddress, u64)>,
{
    let mut tree = TreeHasher::for_transform(tag);
    for (address, len) in chunks {
        tree.push(address, len);
    }
    tree.finalize()
}
