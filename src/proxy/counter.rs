//! Byte accounting for request and response streams.

/// Running total of encoded bytes seen on one direction of a connection.
///
/// Chunks are counted by their encoded length, so text containing
/// multi-byte characters contributes one unit per byte, not per character.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounter {
    total: u64,
}

impl ByteCounter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk's byte length to the running total.
    pub fn add(&mut self, chunk: impl AsRef<[u8]>) -> u64 {
        let len = chunk.as_ref().len() as u64;
        self.total = self.total.saturating_add(len);
        len
    }

    /// Bytes counted so far.
    pub fn total(&self) -> u64 {
        self.total
    }
}
