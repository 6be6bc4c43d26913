//! Growable output buffer for one decode call.

use super::{DecodeError, Result};

/// First block size when the limit does not say otherwise.
const INITIAL_BLOCK: usize = 32 * 1024;

/// Largest single growth step.
const MAX_BLOCK: usize = 256 * 1024 * 1024;

/// Accumulates decoded bytes, growing in blocks and never past the limit.
#[derive(Debug)]
pub struct OutputSink {
    buf: Vec<u8>,
    limit: Option<usize>,
}

impl OutputSink {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether the limit has been reached.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.buf.len() >= limit)
    }

    /// Bytes still allowed before the limit, `None` when unbounded.
    #[inline]
    pub fn room(&self) -> Option<usize> {
        self.limit.map(|limit| limit.saturating_sub(self.buf.len()))
    }

    /// Make sure one more byte fits without an infallible reallocation.
    #[inline]
    pub fn ensure_capacity(&mut self) -> Result<()> {
        if self.buf.len() < self.buf.capacity() {
            return Ok(());
        }
        self.grow()
    }

    #[cold]
    fn grow(&mut self) -> Result<()> {
        let mut block = self.buf.capacity().clamp(INITIAL_BLOCK, MAX_BLOCK);
        if let Some(room) = self.room() {
            block = block.min(room.max(1));
        }
        self.buf
            .try_reserve_exact(block)
            .map_err(|_| DecodeError::OutOfMemory {
                requested: self.buf.len().saturating_add(block),
            })
    }

    /// Append one decoded byte.
    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        self.ensure_capacity()?;
        self.buf.push(byte);
        Ok(())
    }

    /// Hand the bytes over.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_respects_limit() {
        let mut sink = OutputSink::new(Some(10));
        for b in 0..10u8 {
            assert!(!sink.is_full());
            sink.push(b).unwrap();
        }
        assert!(sink.is_full());
        assert_eq!(sink.room(), Some(0));
        let out = sink.finish();
        assert_eq!(out.len(), 10);
        assert!(out.capacity() < INITIAL_BLOCK);
    }

    #[test]
    fn test_unbounded_sink() {
        let mut sink = OutputSink::new(None);
        assert_eq!(sink.room(), None);
        for &b in b"abcd" {
            sink.push(b).unwrap();
        }
        assert!(!sink.is_full());
        assert_eq!(sink.finish(), b"abcd");
    }

    #[test]
    fn test_zero_limit_is_full() {
        let sink = OutputSink::new(Some(0));
        assert!(sink.is_full());
        assert!(sink.is_empty());
    }
}
