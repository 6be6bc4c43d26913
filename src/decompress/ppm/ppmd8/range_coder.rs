//! Range decoder for PPMd var.I streams.
//!
//! Dmitry Subbotin's carryless coder: `low` is tracked alongside `range`, and
//! whenever the top byte of the interval could still change while `range` has
//! shrunk below 2^15, `range` is cut down to the next 2^15 boundary. No carry
//! ever reaches bytes already written, so the decoder only ever shifts bytes
//! in. `code` is kept relative to `low`.
//!
//! ## Stream preamble
//!
//! ```text
//! +------+------+------+------+----------------
//! |  code (big endian, 4 bytes) | symbols ...
//! +------+------+------+------+----------------
//! ```

use crate::decompress::input::ByteSource;
use crate::decompress::ppm::{RangeCoder, RangeError};

const TOP: u32 = 1 << 24;
const BOT: u32 = 1 << 15;

/// Bytes in the stream preamble.
pub const PREAMBLE_LEN: u8 = 4;

/// Saved arithmetic state, used to retry a symbol that ran out of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSnapshot {
    low: u32,
    range: u32,
    code: u32,
}

/// Range decoder state.
#[derive(Debug, Clone)]
pub struct RangeDecoder {
    low: u32,
    range: u32,
    code: u32,
    header_read: u8,
}

impl RangeDecoder {
    pub fn new() -> Self {
        Self {
            low: 0,
            range: 0xFFFF_FFFF,
            code: 0,
            header_read: 0,
        }
    }

    /// Shift in bytes until the interval is settled.
    #[inline]
    pub fn normalize<S: ByteSource>(&mut self, src: &mut S) -> Result<(), RangeError> {
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) >= TOP {
                if self.range >= BOT {
                    return Ok(());
                }
                self.range = self.low.wrapping_neg() & (BOT - 1);
            }
            let byte = src.next_byte().ok_or(RangeError::NeedMore)?;
            self.code = (self.code << 8) | u32::from(byte);
            self.range <<= 8;
            self.low <<= 8;
        }
    }

    /// Clamp a frequency total to what the current range can resolve.
    #[inline]
    pub fn correct_sum_range(&self, total: u32) -> u32 {
        total.min(self.range)
    }

    /// Scale `range` to `total` and return where `code` falls in it.
    #[inline]
    pub fn get_threshold(&mut self, total: u32) -> u32 {
        self.range /= total;
        self.code / self.range
    }

    /// Narrow to `[start, start + size)` of the last threshold scale.
    #[inline]
    pub fn decode<S: ByteSource>(
        &mut self,
        src: &mut S,
        start: u32,
        size: u32,
    ) -> Result<(), RangeError> {
        let start = start.wrapping_mul(self.range);
        self.low = self.low.wrapping_add(start);
        self.code = self.code.wrapping_sub(start);
        self.range = self.range.wrapping_mul(size);
        self.normalize(src)
    }

    /// Decode one binary decision where `size0` out of 2^14 is the zero bit.
    #[inline]
    pub fn decode_bit<S: ByteSource>(&mut self, src: &mut S, size0: u32) -> Result<u32, RangeError> {
        let bound = (self.range >> 14).wrapping_mul(size0);
        let bit = if self.code < bound {
            self.range = bound;
            0
        } else {
            self.low = self.low.wrapping_add(bound);
            self.code -= bound;
            self.range = (self.range & !0x3FFF).wrapping_sub(bound);
            1
        };
        self.normalize(src)?;
        Ok(bit)
    }
}

impl RangeCoder for RangeDecoder {
    type Snapshot = RangeSnapshot;

    const PREAMBLE_LEN: u8 = PREAMBLE_LEN;

    /// Pull preamble bytes from `src` until the header is complete.
    ///
    /// A preamble of four `0xFF` bytes is rejected once the last byte lands.
    fn init<S: ByteSource>(&mut self, src: &mut S) -> Result<(), RangeError> {
        while !self.is_ready() {
            let byte = src.next_byte().ok_or(RangeError::NeedMore)?;
            self.code = (self.code << 8) | u32::from(byte);
            self.header_read += 1;
        }
        if self.code == 0xFFFF_FFFF {
            return Err(RangeError::BadInitialCode);
        }
        Ok(())
    }

    #[inline]
    fn is_ready(&self) -> bool {
        self.header_read == PREAMBLE_LEN
    }

    #[inline]
    fn header_bytes_consumed(&self) -> u8 {
        self.header_read
    }

    #[inline]
    fn code(&self) -> u32 {
        self.code
    }

    #[inline]
    fn snapshot(&self) -> RangeSnapshot {
        RangeSnapshot {
            low: self.low,
            range: self.range,
            code: self.code,
        }
    }

    #[inline]
    fn restore(&mut self, snap: RangeSnapshot) {
        self.low = snap.low;
        self.range = snap.range;
        self.code = snap.code;
    }
}

impl Default for RangeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress::input::InputWindow;

    #[test]
    fn test_preamble_across_chunks() {
        let mut rc = RangeDecoder::new();
        let first = [0x12u8];
        assert_eq!(
            rc.init(&mut InputWindow::borrowed(&first)),
            Err(RangeError::NeedMore)
        );
        assert_eq!(rc.header_bytes_consumed(), 1);

        let rest = [0x34u8, 0x56, 0x78, 0xAA];
        let mut win = InputWindow::borrowed(&rest);
        assert_eq!(rc.init(&mut win), Ok(()));
        assert_eq!(rc.code(), 0x1234_5678);
        assert_eq!(win.rest(), &[0xAA]);
    }

    #[test]
    fn test_all_ones_preamble_is_rejected() {
        let mut rc = RangeDecoder::new();
        let mut win = InputWindow::borrowed(&[0xFF; 4]);
        assert_eq!(rc.init(&mut win), Err(RangeError::BadInitialCode));
    }

    #[test]
    fn test_normalize_cuts_range_at_boundary() {
        let mut rc = RangeDecoder::new();
        rc.init(&mut InputWindow::borrowed(&[0, 0, 0, 0])).unwrap();
        // The interval straddles a top-byte boundary with a tiny range.
        rc.low = 0x00FF_FFF0;
        rc.range = 0x100;
        let mut win = InputWindow::borrowed(&[0xAB, 0xCD]);
        assert_eq!(rc.normalize(&mut win), Ok(()));
        // range = -low & 0x7FFF = 0x10, then two shifts.
        assert_eq!(rc.range, 0x10_0000);
        assert_eq!(rc.low, 0xFFF0_0000);
        assert_eq!(rc.code, 0xABCD);
    }

    #[test]
    fn test_starved_normalize_restores_cleanly() {
        let mut rc = RangeDecoder::new();
        rc.init(&mut InputWindow::borrowed(&[0, 0x10, 0x20, 0x30])).unwrap();
        let snap = rc.snapshot();
        let _ = rc.get_threshold(1 << 20);
        let mut empty = InputWindow::borrowed(&[]);
        assert_eq!(rc.decode(&mut empty, 0, 1), Err(RangeError::NeedMore));
        rc.restore(snap);
        assert_eq!(rc.snapshot(), snap);
    }

    #[test]
    fn test_correct_sum_range() {
        let mut rc = RangeDecoder::new();
        rc.range = 300;
        assert_eq!(rc.correct_sum_range(257), 257);
        assert_eq!(rc.correct_sum_range(1000), 300);
    }
}
