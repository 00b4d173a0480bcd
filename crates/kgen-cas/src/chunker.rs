//! Chunker: splits payloads into bounded, independently addressed chunks.
//!
//! Payloads at or below `threshold` become one chunk equal to the whole
//! payload. Larger payloads are cut either at fixed offsets or at
//! content-defined boundaries found with a gear rolling hash. Chunk
//! boundaries depend only on the bytes, so the same payload always splits the
//! same way.

use std::io::{self, Read};

use serde::{Deserialize, Serialize};

use crate::address::ContentAddress;
use crate::hasher;

const MIB: usize = 1024 * 1024;

/// How large payloads are cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    /// Every chunk is `chunk_size` bytes except the last.
    #[default]
    Fixed,
    /// Gear-hash boundaries averaging `chunk_size`, bounded by `min_size`/`max_size`.
    ContentDefined,
}

/// Chunking parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub strategy: ChunkingStrategy,

    /// Payloads at or below this size are stored as a single chunk.
    #[serde(default = "default_chunk_size")]
    pub threshold: usize,

    /// Fixed chunk size, or the target average for content-defined chunking.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Smallest content-defined chunk (except a payload's tail).
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    /// Largest content-defined chunk.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

fn default_chunk_size() -> usize {
    MIB
}

fn default_min_size() -> usize {
    MIB / 4
}

fn default_max_size() -> usize {
    4 * MIB
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self::fixed(MIB)
    }
}

impl ChunkingConfig {
    /// Fixed-size chunks, with the threshold equal to the chunk size.
    pub fn fixed(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            strategy: ChunkingStrategy::Fixed,
            threshold: chunk_size,
            chunk_size,
            min_size: chunk_size,
            max_size: chunk_size,
        }
    }

    /// Content-defined chunks averaging `avg_size`, within `[avg/4, avg*4]`.
    pub fn content_defined(avg_size: usize) -> Self {
        let avg_size = avg_size.max(64);
        Self {
            strategy: ChunkingStrategy::ContentDefined,
            threshold: avg_size,
            chunk_size: avg_size,
            min_size: avg_size / 4,
            max_size: avg_size * 4,
        }
    }

    /// Largest chunk this configuration can emit.
    pub fn max_chunk_len(&self) -> usize {
        match self.strategy {
            ChunkingStrategy::Fixed => self.chunk_size.max(1),
            ChunkingStrategy::ContentDefined => self.max_size.max(self.min_size).max(1),
        }
    }
}

/// A slice of a payload with its own address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position within the parent manifest.
    pub index: usize,
    /// Byte offset within the payload.
    pub offset: u64,
    pub address: ContentAddress,
    pub data: Vec<u8>,
}

impl Chunk {
    fn new(index: usize, offset: u64, data: Vec<u8>) -> Self {
        Self {
            index,
            offset,
            address: hasher::hash(&data),
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Splits payloads according to a [`ChunkingConfig`].
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    mask: u64,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        let bits = config.chunk_size.max(2).next_power_of_two().trailing_zeros();
        let mask = u64::MAX << (64 - bits.min(63));
        Self { config, mask }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split an in-memory payload.
    pub fn split<'a>(&'a self, data: &'a [u8]) -> SliceChunks<'a> {
        SliceChunks {
            chunker: self,
            data,
            pos: 0,
            index: 0,
            single: data.len() <= self.config.threshold,
            done: false,
        }
    }

    /// Split a stream lazily. The iterator is not restartable.
    pub fn split_reader<R: Read>(&self, reader: R) -> ReaderChunks<'_, R> {
        ReaderChunks {
            chunker: self,
            reader,
            buf: Vec::new(),
            eof: false,
            started: false,
            single: false,
            offset: 0,
            index: 0,
            done: false,
        }
    }

    /// Length of the next chunk at the start of `window`, or `None` when more
    /// input is needed to decide.
    fn boundary(&self, window: &[u8], eof: bool) -> Option<usize> {
        match self.config.strategy {
            ChunkingStrategy::Fixed => {
                let size = self.config.chunk_size.max(1);
                if window.len() >= size {
                    Some(size)
                } else if eof {
                    Some(window.len())
                } else {
                    None
                }
            }
            ChunkingStrategy::ContentDefined => self.gear_boundary(window, eof),
        }
    }

    fn gear_boundary(&self, window: &[u8], eof: bool) -> Option<usize> {
        let min = self.config.min_size.max(1);
        let max = self.config.max_chunk_len();
        if window.len() <= min {
            return eof.then_some(window.len());
        }

        let end = window.len().min(max);
        let mut h: u64 = 0;
        for (i, &b) in window.iter().enumerate().take(end).skip(min) {
            h = (h << 1).wrapping_add(GEAR[b as usize]);
            if h & self.mask == 0 {
                return Some(i + 1);
            }
        }

        if end == max {
            Some(max)
        } else if eof {
            Some(window.len())
        } else {
            None
        }
    }
}

/// Chunks of an in-memory payload.
pub struct SliceChunks<'a> {
    chunker: &'a Chunker,
    data: &'a [u8],
    pos: usize,
    index: usize,
    single: bool,
    done: bool,
}

impl Iterator for SliceChunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }
        if self.single {
            self.done = true;
            return Some(Chunk::new(0, 0, self.data.to_vec()));
        }
        if self.pos >= self.data.len() {
            self.done = true;
            return None;
        }

        let rest = &self.data[self.pos..];
        let len = self.chunker.boundary(rest, true).unwrap_or(rest.len());
        let chunk = Chunk::new(self.index, self.pos as u64, rest[..len].to_vec());
        self.pos += len;
        self.index += 1;
        Some(chunk)
    }
}

/// Chunks of a stream, read on demand.
pub struct ReaderChunks<'a, R> {
    chunker: &'a Chunker,
    reader: R,
    buf: Vec<u8>,
    eof: bool,
    started: bool,
    single: bool,
    offset: u64,
    index: usize,
    done: bool,
}

impl<R: Read> ReaderChunks<'_, R> {
    /// Read until `buf` holds at least `want` bytes or the stream ends.
    fn fill(&mut self, want: usize) -> io::Result<()> {
        let mut scratch = vec![0u8; 64 * 1024];
        while !self.eof && self.buf.len() < want {
            let room = (want - self.buf.len()).min(scratch.len());
            match self.reader.read(&mut scratch[..room]) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        if !self.started {
            self.started = true;
            let threshold = self.chunker.config.threshold;
            self.fill(threshold.saturating_add(1))?;
            self.single = self.eof && self.buf.len() <= threshold;
            if self.single {
                self.done = true;
                let data = std::mem::take(&mut self.buf);
                return Ok(Some(Chunk::new(0, 0, data)));
            }
        }

        let want = self.chunker.config.max_chunk_len();
        self.fill(want)?;
        if self.buf.is_empty() {
            self.done = true;
            return Ok(None);
        }

        let len = self
            .chunker
            .boundary(&self.buf, true)
            .unwrap_or(self.buf.len());
        let rest = self.buf.split_off(len);
        let data = std::mem::replace(&mut self.buf, rest);
        let chunk = Chunk::new(self.index, self.offset, data);
        self.offset += len as u64;
        self.index += 1;
        Ok(Some(chunk))
    }
}

impl<R: Read> Iterator for ReaderChunks<'_, R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Gear table: 256 pseudo-random words from a fixed splitmix64 sequence.
static GEAR: [u64; 256] = gear_table();

const fn gear_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state: u64 = 0x6b67_656e_2d63_6173;
    let mut i = 0;
    while i < 256 {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        table[i] = z ^ (z >> 31);
        i += 1;
    }
    table
}
