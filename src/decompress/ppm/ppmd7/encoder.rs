//! PPMd var.H encoder (7z flavour).
//!
//! Only built for tests, benches and fuzzing (feature `test-support`): it
//! produces the streams the decoder is checked against.

use super::model::{get_mean, Ppmd7Model, EXP_ESCAPE, STATE_SIZE};
use crate::decompress::Result;

const TOP: u32 = 1 << 24;

/// 7z range encoder with carry propagation through `cache`.
pub struct RangeEncoder {
    low: u64,
    range: u32,
    cache: u8,
    cache_size: u64,
    out: Vec<u8>,
}

impl RangeEncoder {
    pub fn new() -> Self {
        Self {
            low: 0,
            range: 0xFFFF_FFFF,
            cache: 0,
            cache_size: 1,
            out: Vec::new(),
        }
    }

    fn shift_low(&mut self) {
        if (self.low as u32) < 0xFF00_0000 || (self.low >> 32) != 0 {
            let mut temp = self.cache;
            loop {
                self.out.push(temp.wrapping_add((self.low >> 32) as u8));
                temp = 0xFF;
                self.cache_size -= 1;
                if self.cache_size == 0 {
                    break;
                }
            }
            self.cache = ((self.low as u32) >> 24) as u8;
        }
        self.cache_size += 1;
        self.low = u64::from((self.low as u32) << 8);
    }

    fn normalize(&mut self) {
        while self.range < TOP {
            self.range <<= 8;
            self.shift_low();
        }
    }

    pub fn encode(&mut self, start: u32, size: u32, total: u32) {
        self.range /= total;
        self.low += u64::from(start) * u64::from(self.range);
        self.range *= size;
        self.normalize();
    }

    pub fn encode_bit_0(&mut self, size0: u32) {
        self.range = (self.range >> 14) * size0;
        self.normalize();
    }

    pub fn encode_bit_1(&mut self, size0: u32) {
        let bound = (self.range >> 14) * size0;
        self.low += u64::from(bound);
        self.range -= bound;
        self.normalize();
    }

    /// Push out the pending bytes and return the stream.
    pub fn finish(mut self) -> Vec<u8> {
        for _ in 0..5 {
            self.shift_low();
        }
        self.out
    }
}

impl Default for RangeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppmd7Model {
    /// Encode one symbol, or the end marker for `None`.
    ///
    /// After the end marker the model is spent.
    pub(super) fn encode_symbol(&mut self, rc: &mut RangeEncoder, symbol: Option<u8>) {
        self.clear_journal();
        let mc = self.min_context;
        if self.num_stats(mc) != 1 {
            let summ = self.summ_freq(mc);
            let mut s = self.stats(mc);
            if Some(self.symbol(s)) == symbol {
                rc.encode(0, self.freq(s), summ);
                self.found_state = s;
                self.update1_0();
                return;
            }
            self.prev_success = 0;
            let mut sum = self.freq(s);
            for _ in 1..self.num_stats(mc) {
                s += STATE_SIZE;
                if Some(self.symbol(s)) == symbol {
                    rc.encode(sum, self.freq(s), summ);
                    self.found_state = s;
                    self.update1();
                    return;
                }
                sum += self.freq(s);
            }
            self.hi_bits_flag = u32::from(self.hb2flag[self.symbol(self.found_state) as usize]);
            self.clear_mask();
            let stats = self.stats(mc);
            for i in 0..self.num_stats(mc) {
                let sym = self.symbol(stats + i * STATE_SIZE);
                self.mask(sym);
            }
            rc.encode(sum, summ - sum, summ);
        } else {
            let (row, col) = self.bin_summ_index();
            let prob = u32::from(self.bin_summ[row][col]);
            let s = Ppmd7Model::one_state(mc);
            if Some(self.symbol(s)) == symbol {
                rc.encode_bit_0(prob);
                self.set_bin_summ(row, col, (prob + 128 - get_mean(prob)) as u16);
                self.found_state = s;
                self.update_bin();
                return;
            }
            rc.encode_bit_1(prob);
            let prob = prob - get_mean(prob);
            self.set_bin_summ(row, col, prob as u16);
            self.init_esc = u32::from(EXP_ESCAPE[(prob >> 10) as usize]);
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
            let num_stats = self.num_stats(mc);
            let mut sum = 0;
            let mut found = None;
            for i in 0..num_stats {
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

            if let Some((s, low)) = found {
                rc.encode(low, self.freq(s), sum + esc_freq);
                self.see_update(see);
                self.found_state = s;
                self.update2();
                return;
            }

            rc.encode(sum, esc_freq, sum + esc_freq);
            self.see_add(see, sum + esc_freq);
            for i in 0..num_stats {
                let sym = self.symbol(stats + i * STATE_SIZE);
                self.mask(sym);
            }
        }
    }
}

/// Compress bytes into a raw PPMd7 stream.
pub struct Ppmd7Encoder {
    model: Ppmd7Model,
    rc: RangeEncoder,
}

impl Ppmd7Encoder {
    pub fn new(max_order: u32, mem_size: u32) -> Result<Self> {
        Ok(Self {
            model: Ppmd7Model::new(max_order, mem_size)?,
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
    pub fn compress(data: &[u8], max_order: u32, mem_size: u32, end_mark: bool) -> Result<Vec<u8>> {
        let mut enc = Self::new(max_order, mem_size)?;
        enc.encode(data);
        Ok(enc.finish(end_mark))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_starts_with_zero() {
        let out = Ppmd7Encoder::compress(b"hello", 6, 1 << 16, true).unwrap();
        assert_eq!(out[0], 0);
        assert!(out.len() >= 5);
    }

    #[test]
    fn test_empty_stream_without_end_mark() {
        let out = Ppmd7Encoder::compress(b"", 6, 1 << 16, false).unwrap();
        assert_eq!(out, vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_carry_propagates() {
        let mut rc = RangeEncoder::new();
        rc.cache = 0x12;
        // A 0xFF byte stays pending until the carry is known.
        rc.low = 0xFF00_0000;
        rc.shift_low();
        assert!(rc.out.is_empty());
        rc.low = 0x1_0000_0000;
        rc.shift_low();
        let out = rc.finish();
        assert_eq!(&out[..2], &[0x13, 0x00]);
    }
}
