//! Range decoder for PPMd var.H streams (7z flavour).
//!
//! Unlike the carryless Subbotin coder used by RAR, the 7z coder keeps only
//! `range` and `code`; the encoder resolves carries itself. Every byte is
//! pulled through a [`ByteSource`], so a decoder that runs dry stops at a byte
//! boundary and can pick up where it left off once more input shows up.
//!
//! ## Stream preamble
//!
//! ```text
//! +------+------+------+------+------+----------------
//! | 0x00 |  code (big endian, 4 bytes) | symbols ...
//! +------+------+------+------+------+----------------
//! ```

use crate::decompress::input::ByteSource;
use crate::decompress::ppm::{RangeCoder, RangeError};

/// Normalization threshold.
const TOP: u32 = 1 << 24;

/// Bytes in the stream preamble.
pub const PREAMBLE_LEN: u8 = 5;

/// Saved arithmetic state, used to retry a symbol that ran out of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSnapshot {
    range: u32,
    code: u32,
}

impl RangeSnapshot {
    /// `code` at the time of the snapshot.
    #[inline]
    pub fn code(&self) -> u32 {
        self.code
    }
}

/// Range decoder state.
#[derive(Debug, Clone)]
pub struct RangeDecoder {
    range: u32,
    code: u32,
    /// Progress through the 5-byte preamble.
    header_read: u8,
}

impl RangeDecoder {
    /// Create a decoder that still has to see its preamble.
    pub fn new() -> Self {
        Self {
            range: 0xFFFF_FFFF,
            code: 0,
            header_read: 0,
        }
    }

    /// Feed one preamble byte. Returns `true` once all five are in.
    pub fn init_step(&mut self, byte: u8) -> Result<bool, RangeError> {
        debug_assert!(!self.is_ready());
        if self.header_read == 0 {
            if byte != 0 {
                return Err(RangeError::BadPreamble(byte));
            }
        } else {
            self.code = (self.code << 8) | u32::from(byte);
        }
        self.header_read += 1;
        Ok(self.is_ready())
    }

    /// Shift in bytes while `range` is below 2^24 (at most twice).
    ///
    /// Each byte is applied as soon as it is read, so an interrupted
    /// normalization resumes from the byte it stopped at.
    #[inline]
    pub fn normalize<S: ByteSource>(&mut self, src: &mut S) -> Result<(), RangeError> {
        while self.range < TOP {
            let byte = src.next_byte().ok_or(RangeError::NeedMore)?;
            self.code = (self.code << 8) | u32::from(byte);
            self.range <<= 8;
        }
        Ok(())
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
        self.code = self.code.wrapping_sub(start.wrapping_mul(self.range));
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
            self.code -= bound;
            self.range -= bound;
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
    /// Bytes are committed as they arrive; a short source leaves the partial
    /// header in place for the next call.
    fn init<S: ByteSource>(&mut self, src: &mut S) -> Result<(), RangeError> {
        while !self.is_ready() {
            let byte = src.next_byte().ok_or(RangeError::NeedMore)?;
            self.init_step(byte)?;
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
            range: self.range,
            code: self.code,
        }
    }

    #[inline]
    fn restore(&mut self, snap: RangeSnapshot) {
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
    fn test_preamble_rejects_nonzero_lead() {
        let mut rc = RangeDecoder::new();
        assert_eq!(rc.init_step(7), Err(RangeError::BadPreamble(7)));
        assert_eq!(rc.header_bytes_consumed(), 0);
    }

    #[test]
    fn test_preamble_across_chunks() {
        let mut rc = RangeDecoder::new();
        let first = [0u8, 0x12];
        let mut win = InputWindow::borrowed(&first);
        assert_eq!(rc.init(&mut win), Err(RangeError::NeedMore));
        assert_eq!(rc.header_bytes_consumed(), 2);

        let rest = [0x34u8, 0x56, 0x78, 0xAA];
        let mut win = InputWindow::borrowed(&rest);
        assert_eq!(rc.init(&mut win), Ok(()));
        assert!(rc.is_ready());
        assert_eq!(rc.code(), 0x1234_5678);
        // The preamble never reads past its fifth byte.
        assert_eq!(win.rest(), &[0xAA]);
    }

    #[test]
    fn test_normalize_resumes_mid_way() {
        let mut rc = RangeDecoder::new();
        let mut win = InputWindow::borrowed(&[0, 0, 0, 0, 1]);
        rc.init(&mut win).unwrap();

        // Force two normalization steps.
        rc.range = 0x0000_8000;
        let one = [0xABu8];
        let mut win = InputWindow::borrowed(&one);
        assert_eq!(rc.normalize(&mut win), Err(RangeError::NeedMore));
        assert_eq!(rc.range, 0x0080_0000);
        assert_eq!(rc.code, 0x0000_01AB);

        let two = [0xCDu8];
        let mut win = InputWindow::borrowed(&two);
        assert_eq!(rc.normalize(&mut win), Ok(()));
        assert_eq!(rc.range, 0x8000_0000);
        assert_eq!(rc.code, 0x0001_ABCD);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut rc = RangeDecoder::new();
        let mut win = InputWindow::borrowed(&[0, 0x10, 0x20, 0x30, 0x40]);
        rc.init(&mut win).unwrap();
        let snap = rc.snapshot();
        let _ = rc.get_threshold(300);
        assert_ne!(rc.snapshot(), snap);
        rc.restore(snap);
        assert_eq!(rc.snapshot(), snap);
    }

    #[test]
    fn test_decode_bit_splits_interval() {
        let mut rc = RangeDecoder::new();
        let mut win = InputWindow::borrowed(&[0, 0, 0, 0, 0]);
        rc.init(&mut win).unwrap();
        let mut empty = InputWindow::borrowed(&[]);
        // code == 0 always lands in the zero half.
        assert_eq!(rc.decode_bit(&mut empty, 1 << 13), Ok(0));
        assert_eq!(rc.range, (0xFFFF_FFFF >> 14) * (1 << 13));
    }
}
