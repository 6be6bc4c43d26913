//! Compressed-input plumbing: the per-call [`InputWindow`] and the
//! [`CarryBuffer`] that keeps undecoded bytes between calls.
//!
//! ```text
//!  feed(chunk)
//!      |
//!      v
//!  carry empty? --yes--> window borrows `chunk`       (no copy)
//!      |
//!      no
//!      v
//!  carry.append(chunk) -> window borrows carry bytes
//!
//!  after decoding:
//!      window from chunk  -> carry.store_suffix(rest)
//!      window from carry  -> carry.consume(n)
//! ```

use std::collections::TryReserveError;

/// Pull-style byte supplier for the range decoder.
///
/// `None` means nothing is available right now; the decoder cannot tell
/// whether more will ever arrive.
pub trait ByteSource {
    fn next_byte(&mut self) -> Option<u8>;
}

/// Where the bytes of an [`InputWindow`] live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSource {
    /// The caller's chunk, borrowed as is.
    Chunk,
    /// The session's carry-over buffer (old leftovers plus the new chunk).
    Carry,
}

/// Borrowed view of the bytes available to one decode call.
#[derive(Debug)]
pub struct InputWindow<'a> {
    data: &'a [u8],
    pos: usize,
    source: WindowSource,
}

impl<'a> InputWindow<'a> {
    /// Window over a caller chunk.
    pub fn borrowed(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            source: WindowSource::Chunk,
        }
    }

    /// Window over carry-over bytes.
    pub fn from_carry(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            source: WindowSource::Carry,
        }
    }

    #[inline]
    pub fn source(&self) -> WindowSource {
        self.source
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Rewind (or advance) to a previously observed position.
    #[inline]
    pub fn set_position(&mut self, pos: usize) {
        debug_assert!(pos <= self.data.len());
        self.pos = pos;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// The unconsumed suffix.
    #[inline]
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

impl ByteSource for InputWindow<'_> {
    #[inline]
    fn next_byte(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }
}

/// Undecoded input retained between calls.
///
/// `buf.len()` is the allocated size; live bytes are `buf[begin..end]`.
/// Capacity is never given back eagerly.
#[derive(Debug, Default)]
pub struct CarryBuffer {
    buf: Vec<u8>,
    begin: usize,
    end: usize,
}

impl CarryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Allocated size, live or not.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.begin..self.end]
    }

    /// Append a chunk behind the live bytes.
    ///
    /// Leftovers are slid to the front when that makes room; a new buffer is
    /// only allocated when the total does not fit.
    pub fn append(&mut self, data: &[u8]) -> Result<(), TryReserveError> {
        if data.is_empty() {
            return Ok(());
        }
        let used = self.len();
        let avail_now = self.buf.len() - self.end;
        let avail_total = self.buf.len() - used;

        if avail_total < data.len() {
            let mut grown = Vec::new();
            grown.try_reserve_exact(used + data.len())?;
            grown.extend_from_slice(self.as_slice());
            grown.resize(used + data.len(), 0);
            self.buf = grown;
            self.begin = 0;
            self.end = used;
        } else if avail_now < data.len() {
            self.buf.copy_within(self.begin..self.end, 0);
            self.begin = 0;
            self.end = used;
        }

        self.buf[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
        Ok(())
    }

    /// Replace the contents with `rest`, the unconsumed tail of a caller chunk.
    pub fn store_suffix(&mut self, rest: &[u8]) -> Result<(), TryReserveError> {
        if self.buf.len() < rest.len() {
            let mut grown = Vec::new();
            grown.try_reserve_exact(rest.len())?;
            grown.resize(rest.len(), 0);
            self.buf = grown;
        }
        self.buf[..rest.len()].copy_from_slice(rest);
        self.begin = 0;
        self.end = rest.len();
        Ok(())
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.begin += n;
        if self.begin == self.end {
            self.clear();
        }
    }

    /// Forget the live bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_reads_then_stops() {
        let mut win = InputWindow::borrowed(&[1, 2]);
        assert_eq!(win.next_byte(), Some(1));
        assert_eq!(win.next_byte(), Some(2));
        assert_eq!(win.next_byte(), None);
        assert!(win.rest().is_empty());
        assert_eq!(win.position(), 2);
    }

    #[test]
    fn test_window_rewind() {
        let mut win = InputWindow::from_carry(&[9, 8, 7]);
        assert_eq!(win.source(), WindowSource::Carry);
        let mark = win.position();
        win.next_byte();
        win.next_byte();
        win.set_position(mark);
        assert_eq!(win.rest(), &[9, 8, 7]);
    }

    #[test]
    fn test_carry_append_grows_then_reuses() {
        let mut carry = CarryBuffer::new();
        carry.append(b"abc").unwrap();
        assert_eq!(carry.as_slice(), b"abc");
        assert_eq!(carry.capacity(), 3);

        carry.consume(2);
        assert_eq!(carry.as_slice(), b"c");
        // Two free bytes once "c" slides to the front.
        carry.append(b"de").unwrap();
        assert_eq!(carry.as_slice(), b"cde");
        assert_eq!(carry.capacity(), 3);

        carry.append(b"f").unwrap();
        assert_eq!(carry.as_slice(), b"cdef");
        assert_eq!(carry.capacity(), 4);
    }

    #[test]
    fn test_carry_consume_all_keeps_capacity() {
        let mut carry = CarryBuffer::new();
        carry.store_suffix(b"hello").unwrap();
        carry.consume(5);
        assert!(carry.is_empty());
        assert_eq!(carry.capacity(), 5);

        carry.store_suffix(b"hey").unwrap();
        assert_eq!(carry.as_slice(), b"hey");
        assert_eq!(carry.capacity(), 5);
    }

    #[test]
    fn test_carry_append_empty_is_noop() {
        let mut carry = CarryBuffer::new();
        carry.append(&[]).unwrap();
        assert!(carry.is_empty());
        assert_eq!(carry.capacity(), 0);
    }
}
