//! FIFO byte-chunk queue used for both relay directions.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;

/// Ordered queue of byte chunks with byte accounting.
///
/// A partial write is recorded with [`ChunkQueue::consume`], which advances
/// the head chunk in place. The unsent remainder therefore stays ahead of
/// every later chunk.
#[derive(Debug, Default, Clone)]
pub struct ChunkQueue {
    chunks: VecDeque<Bytes>,
    bytes: usize,
}

impl ChunkQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Empty chunks are ignored.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// The chunk to write next.
    #[must_use]
    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Remove and return the head chunk.
    pub fn pop_front(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.bytes -= chunk.len();
        Some(chunk)
    }

    /// Mark `n` bytes from the front as written.
    ///
    /// Fully written chunks are dropped; a partially written head keeps its
    /// unsent tail at the front.
    pub fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };
            let step = n.min(head.len());
            head.advance(step);
            self.bytes -= step;
            n -= step;
            if head.is_empty() {
                self.chunks.pop_front();
            }
        }
    }

    /// Remove every chunk, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.bytes = 0;
        self.chunks.drain(..)
    }

    /// Number of queued chunks.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Total queued bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    /// Whether nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
