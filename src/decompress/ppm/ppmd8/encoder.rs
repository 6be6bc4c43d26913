//! PPMd var.I encoder (zip flavour).
//!
//! Only built for tests, benches and fuzzing (feature `test-support`).

use super::model::{get_mean, Ppmd8Model, EXP_ESCAPE, STATE_SIZE};
use super::RestoreMethod;
use crate::decompress::Result;

const TOP: u32 = 1 << 24;
const BOT: u32 = 1 << 15;

/// Carryless range encoder.
pub struct RangeEncoder {
    low: u32,
    range: u32,
    out: Vec<u8>,
}

impl RangeEncoder {
    pub fn new() -> Self {
        Self {
            low: 0,
            range: 0xFFFF_FFFF,
            out: Vec::new(),
        }
    }

    fn normalize(&mut self) {
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) >= TOP {
                if self.range >= BOT {
                    return;
                }
                self.range = self.low.wrapping_neg() & (BOT - 1);
            }
            self.out.push((self.low >> 24) as u8);
            self.range <<= 8;
            self.low <<= 8;
        }
    }

    #[inline]
    fn correct_sum_range(&self, total: u32) -> u32 {
        total.min(self.range)
    }

    pub fn encode(&mut self, start: u32, size: u32, total: u32) {
        self.range /= total;
        self.low = self.low.wrapping_add(start.wrapping_mul(self.range));
        self.range = self.range.wrapping_mul(size);
        self.normalize();
    }

    pub fn encode_bit_0(&mut self, size0: u32) {
        self.range = (self.range >> 14).wrapping_mul(size0);
        self.normalize();
    }

    pub fn encode_bit_1(&mut self, size0: u32) {
        let bound = (self.range >> 14).wrapping_mul(size0);
        self.low = self.low.wrapping_add(bound);
        self.range = (self.range & !0x3FFF).wrapping_sub(bound);
        self.normalize();
    }

    /// Push out the last four bytes of `low` and return the stream.
    pub fn finish(mut self) -> Vec<u8> {
        for _ in 0..4 {
            self.out.push((self.low >> 24) as u8);
            self.low <<= 8;
        }
        self.out
    }
}

impl Default for RangeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppmd8Model {
    /// Encode one symbol, or the end marker for `None`.
    pub(super) fn encode_symbol(&mut self, rc: &mut RangeEncoder, symbol: Option<u8>) {
        self.clear_journal();
        let mc = self.min_context;
        if self.num_stats(mc) != 0 {
            let summ = rc.correct_sum_range(self.summ_freq(mc));
            let mut s = self.stats(mc);
            if Some(self.symbol(s)) == symbol {
                rc.encode(0, self.freq(s), summ);
                self.found_state = s;
                self.update1_0();
                return;
            }
            self.prev_success = 0;
            let mut sum = self.freq(s);
            for _ in 0..self.num_stats(mc) {
                s += STATE_SIZE;
                if Some(self.symbol(s)) == symbol {
                    rc.encode(sum, self.freq(s), summ);
                    self.found_state = s;
                    self.update1();
                    return;
                }
                sum += self.freq(s);
            }
            self.clear_mask();
            self.mask_context(mc);
            rc.encode(sum, summ.wrapping_sub(sum), summ);
        } else {
            let (row, col) = self.bin_summ_index();
            let prob = u32::from(self.bin_summ[row][col]);
            let pr = prob - get_mean(prob);
            let s = Ppmd8Model::one_state(mc);
            if Some(self.symbol(s)) == symbol {
                rc.encode_bit_0(prob);
                self.set_bin_summ(row, col, (pr + 128) as u16);
                self.found_state = s;
                self.update_bin();
                return;
            }
            rc.encode_bit_1(prob);
            self.set_bin_summ(row, col, pr as u16);
            self.init_esc = u32::from(EXP_ESCAPE[(pr >> 10) as usize]);
            self.clear_mask();
            let sym = self.symbol(s);
            self.mask(sym);
            self.prev_success = 0;
        }

        loop {
            let num_masked = self.num_stats(self.min_context);
            loop {
                self.order_fall += 1;
                let suffix = self.suffix(self.min_context);
                if suffix == 0 {
                    // End marker: escaped out of the root.
                    return;
                }
                self.min_context = suffix;
                if self.num_stats(suffix) != num_masked {
                    break;
                }
            }

            let mc = self.min_context;
            let (see, esc_freq) = self.make_esc_freq(num_masked);
            let stats = self.stats(mc);
            let mut sum = 0;
            let mut found = None;
            for i in 0..=self.num_stats(mc) {
                let s = stats + i * STATE_SIZE;
                let sym = self.symbol(s);
                if self.is_masked(sym) {
                    continue;
                }
                if found.is_none() && Some(sym) == symbol {
                    found = Some((s, sum));
                }
                sum += self.freq(s);
            }

            let total = sum + esc_freq;
            if let Some((s, low)) = found {
                let total = rc.correct_sum_range(total);
                rc.encode(low, self.freq(s), total);
                self.see_update(see);
                self.found_state = s;
                self.update2();
                return;
            }

            self.see_add(see, total);
            let corrected = rc.correct_sum_range(total);
            rc.encode(sum, corrected.wrapping_sub(sum), corrected);
            self.mask_context(mc);
        }
    }
}

/// Compress bytes into a raw PPMd8 stream.
pub struct Ppmd8Encoder {
    model: Ppmd8Model,
    rc: RangeEncoder,
}

impl Ppmd8Encoder {
    pub fn new(max_order: u32, mem_size: u32, restore_method: RestoreMethod) -> Result<Self> {
        Ok(Self {
            model: Ppmd8Model::new(max_order, mem_size, restore_method)?,
            rc: RangeEncoder::new(),
        })
    }

    pub fn encode(&mut self, data: &[u8]) {
        for &byte in data {
            self.model.encode_symbol(&mut self.rc, Some(byte));
        }
    }

    /// Optionally append the end marker, then flush.
    pub fn finish(mut self, end_mark: bool) -> Vec<u8> {
        if end_mark {
            self.model.encode_symbol(&mut self.rc, None);
        }
        self.rc.finish()
    }

    /// One-shot helper.
    pub fn compress(
        data: &[u8],
        max_order: u32,
        mem_size: u32,
        restore_method: RestoreMethod,
        end_mark: bool,
    ) -> Result<Vec<u8>> {
        let mut enc = Self::new(max_order, mem_size, restore_method)?;
        enc.encode(data);
        Ok(enc.finish(end_mark))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SOURCE: &[u8] = b"This file is located in a folder.This file is located in the root.\n";
    const ENCODED: [u8; 42] = [
        0x54, 0x16, 0x43, 0x6d, 0x5c, 0xd8, 0xd7, 0x3a, 0xb3, 0x58, 0x31, 0xac, 0x1d, 0x09,
        0x23, 0xfd, 0x11, 0xd5, 0x72, 0x62, 0x73, 0x13, 0xb6, 0xce, 0xb2, 0xe7, 0x6a, 0xb9,
        0xf6, 0xe8, 0x66, 0xf5, 0x08, 0xc3, 0x0a, 0x09, 0x36, 0x12, 0xeb, 0xda, 0xda, 0xba,
    ];

    #[test]
    fn test_known_answer_stream() {
        let out = Ppmd8Encoder::compress(SOURCE, 6, 8 << 20, RestoreMethod::Restart, true).unwrap();
        assert_eq!(out, ENCODED.to_vec());
    }

    #[test]
    fn test_split_input_matches_one_shot() {
        let mut enc = Ppmd8Encoder::new(6, 8 << 20, RestoreMethod::Restart).unwrap();
        enc.encode(&SOURCE[..33]);
        enc.encode(&SOURCE[33..]);
        assert_eq!(enc.finish(true), ENCODED.to_vec());
    }

    #[test]
    fn test_empty_stream_without_end_mark() {
        let out = Ppmd8Encoder::compress(b"", 6, 1 << 16, RestoreMethod::Restart, false).unwrap();
        assert_eq!(out, vec![0, 0, 0, 0]);
    }
}
