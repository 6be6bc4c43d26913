//! PPMd var.I rev.1 model (zip flavour).
//!
//! Based on Dmitry Shkarin's PPMd var.I.
//!
//! ## Memory layout
//!
//! | Structure | Size | Fields |
//! |-----------|------|--------|
//! | State | 6 | symbol `u8`, freq `u8`, successor `u32` |
//! | Context | 12 | num_stats `u8`, flags `u8`, summ_freq `u16`, stats `u32`, suffix `u32` |
//!
//! `num_stats` holds the symbol count minus one, so the root context stores
//! 255 and a binary context stores 0. A binary context keeps its state inline
//! at offset 2.
//!
//! ## Flags
//!
//! | Bit | Meaning |
//! |-----|---------|
//! | 0x04 | frequencies were rescaled |
//! | 0x08 | some symbol is >= 0x40 |
//! | 0x10 | the symbol that led here was >= 0x40 |
//!
//! ## Memory pressure
//!
//! When the arena runs out the model either restarts from scratch
//! ([`RestoreMethod::Restart`]) or prunes the context tree until a quarter of
//! the arena is free again ([`RestoreMethod::CutOff`]).
//!
//! Rollback of starved symbols works as in var.H: the estimator writes made
//! before the last input byte are journaled.

use super::range_coder::RangeDecoder;
use super::sub_alloc::SubAllocator;
use super::RestoreMethod;
use crate::decompress::input::ByteSource;
use crate::decompress::ppm::{RangeError, Step, SymbolModel, PPMD8_MAX_ORDER, PPMD8_MIN_ORDER};
use crate::decompress::{DecodeError, Result};

const PERIOD_BITS: u32 = 7;
const INTERVAL: u32 = 1 << 7;
const BIN_SCALE: u32 = 1 << 14;
pub(super) const MAX_FREQ: u32 = 124;
/// Successor chain length `create_successors` can build in one go.
const MAX_O: usize = PPMD8_MAX_ORDER as usize + 1;

/// State record size in bytes.
pub(super) const STATE_SIZE: u32 = 6;

const FLAG_RESCALED: u8 = 1 << 2;
const FLAG_PREV_HIGH: u8 = 1 << 4;

const INIT_BIN_ESC: [u16; 8] = [
    0x3CDD, 0x1F3F, 0x59BF, 0x48F3, 0x64A1, 0x5ABC, 0x6632, 0x6051,
];

pub(super) const EXP_ESCAPE: [u8; 16] = [25, 14, 9, 7, 5, 5, 4, 4, 4, 3, 3, 3, 2, 2, 2, 2];

/// 8 when `sym >= 0x40`.
#[inline]
fn hi_bits_flag3(sym: u8) -> u8 {
    (((u32::from(sym) + 0xC0) >> 5) & 8) as u8
}

/// 0x10 when `sym >= 0x40`.
#[inline]
fn hi_bits_flag4(sym: u8) -> u8 {
    (((u32::from(sym) + 0xC0) >> 4) & 0x10) as u8
}

/// SEE context for escape estimation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct See {
    pub(super) summ: u16,
    shift: u8,
    count: u8,
}

impl See {
    fn new(summ: u16) -> Self {
        Self {
            summ,
            shift: (PERIOD_BITS - 4) as u8,
            count: 7,
        }
    }

    fn dummy() -> Self {
        Self {
            summ: 0,
            shift: PERIOD_BITS as u8,
            count: 64,
        }
    }

    fn take_mean(&mut self) -> u32 {
        let summ = u32::from(self.summ);
        let r = summ >> self.shift;
        self.summ = summ.wrapping_sub(r) as u16;
        r + u32::from(r == 0)
    }

    fn update(&mut self) {
        if u32::from(self.shift) < PERIOD_BITS {
            self.count = self.count.wrapping_sub(1);
            if self.count == 0 {
                self.summ = self.summ.wrapping_shl(1);
                self.count = (3u32 << self.shift) as u8;
                self.shift += 1;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum SeeRef {
    Table(usize, usize),
    Dummy,
}

#[derive(Clone, Copy, Debug)]
enum Undo {
    See { row: usize, col: usize, summ: u16 },
    DummySee(u16),
    BinSumm { row: usize, col: usize, prob: u16 },
}

#[derive(Clone, Copy, Debug)]
struct Scalars {
    min_context: u32,
    order_fall: u32,
    prev_success: u32,
    init_esc: u32,
}

/// PPMd var.I model.
pub struct Ppmd8Model {
    pub(super) alloc: SubAllocator,
    pub(super) min_context: u32,
    pub(super) max_context: u32,
    pub(super) found_state: u32,
    pub(super) order_fall: u32,
    pub(super) init_esc: u32,
    pub(super) prev_success: u32,
    pub(super) max_order: u32,
    restore_method: RestoreMethod,
    pub(super) run_length: i32,
    pub(super) init_rl: i32,
    /// Symbol count to SEE row; indexed up to 259.
    ns2index: [u8; 260],
    ns2bs_index: [u8; 256],
    pub(super) bin_summ: [[u16; 64]; 25],
    pub(super) see: [[See; 32]; 24],
    pub(super) dummy_see: See,
    char_mask: [u8; 256],
    esc_count: u8,
    journal: Vec<Undo>,
}

impl Ppmd8Model {
    /// Create a model with the given order, arena size and memory-pressure
    /// strategy.
    ///
    /// Callers clamp order and size to the PPMd8 limits first.
    pub fn new(max_order: u32, mem_size: u32, restore_method: RestoreMethod) -> Result<Self> {
        debug_assert!((PPMD8_MIN_ORDER..=PPMD8_MAX_ORDER).contains(&max_order));
        let alloc = SubAllocator::new(mem_size).map_err(|_| DecodeError::OutOfMemory {
            requested: mem_size as usize,
        })?;

        let mut ns2bs_index = [0u8; 256];
        ns2bs_index[0] = 0;
        ns2bs_index[1] = 2;
        ns2bs_index[2..11].fill(4);
        ns2bs_index[11..].fill(6);

        let mut ns2index = [0u8; 260];
        for (i, v) in ns2index.iter_mut().enumerate().take(5) {
            *v = i as u8;
        }
        let mut m = 5u8;
        let mut k = 1u32;
        for v in ns2index.iter_mut().skip(5) {
            *v = m;
            k -= 1;
            if k == 0 {
                m += 1;
                k = u32::from(m) - 4;
            }
        }

        let mut model = Self {
            alloc,
            min_context: 0,
            max_context: 0,
            found_state: 0,
            order_fall: 0,
            init_esc: 0,
            prev_success: 0,
            max_order,
            restore_method,
            run_length: 0,
            init_rl: 0,
            ns2index,
            ns2bs_index,
            bin_summ: [[0; 64]; 25],
            see: [[See::default(); 32]; 24],
            dummy_see: See::dummy(),
            char_mask: [0; 256],
            esc_count: 0,
            journal: Vec::with_capacity(16),
        };
        model.init_model();
        Ok(model)
    }

    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    pub fn mem_size(&self) -> u32 {
        self.alloc.size()
    }

    pub fn restore_method(&self) -> RestoreMethod {
        self.restore_method
    }

    fn init_model(&mut self) {
        self.init_esc = 0;
        self.char_mask = [0; 256];
        self.esc_count = 0;
        self.journal.clear();
        self.restart_model();
    }

    /// Drop all statistics. `init_esc` survives.
    pub(super) fn restart_model(&mut self) {
        self.alloc.restart();

        self.order_fall = self.max_order;
        self.init_rl = -(self.max_order.min(12) as i32) - 1;
        self.run_length = self.init_rl;
        self.prev_success = 0;

        let mc = self.alloc.take_hi_unit();
        let stats = self.alloc.take_lo_units(256 / 2);
        self.min_context = mc;
        self.max_context = mc;
        self.found_state = stats;
        self.set_flags(mc, 0);
        self.set_num_stats(mc, 255);
        self.set_summ_freq(mc, 256 + 1);
        self.set_stats(mc, stats);
        self.set_suffix(mc, 0);
        for i in 0..256u32 {
            let s = stats + i * STATE_SIZE;
            self.alloc.write_byte(s, i as u8);
            self.set_freq(s, 1);
            self.set_successor(s, 0);
        }

        let mut i = 0usize;
        for (m, row) in self.bin_summ.iter_mut().enumerate() {
            while usize::from(self.ns2index[i]) == m {
                i += 1;
            }
            for (k, &esc) in INIT_BIN_ESC.iter().enumerate() {
                let val = (BIN_SCALE - u32::from(esc) / (i as u32 + 1)) as u16;
                for r in (0..64).step_by(8) {
                    row[k + r] = val;
                }
            }
        }

        let mut i = 0usize;
        for (m, row) in self.see.iter_mut().enumerate() {
            while usize::from(self.ns2index[i + 3]) == m + 3 {
                i += 1;
            }
            row.fill(See::new(((2 * i + 5) << (PERIOD_BITS - 4)) as u16));
        }

        self.dummy_see = See::dummy();
    }

    // Context accessors

    #[inline]
    pub(super) fn num_stats(&self, ctx: u32) -> u32 {
        u32::from(self.alloc.read_byte(ctx))
    }

    #[inline]
    fn set_num_stats(&mut self, ctx: u32, val: u32) {
        self.alloc.write_byte(ctx, val as u8);
    }

    #[inline]
    pub(super) fn flags(&self, ctx: u32) -> u8 {
        self.alloc.read_byte(ctx + 1)
    }

    #[inline]
    fn set_flags(&mut self, ctx: u32, val: u8) {
        self.alloc.write_byte(ctx + 1, val);
    }

    #[inline]
    pub(super) fn summ_freq(&self, ctx: u32) -> u32 {
        u32::from(self.alloc.read_u16(ctx + 2))
    }

    #[inline]
    fn set_summ_freq(&mut self, ctx: u32, val: u32) {
        self.alloc.write_u16(ctx + 2, val as u16);
    }

    #[inline]
    pub(super) fn stats(&self, ctx: u32) -> u32 {
        self.alloc.read_u32(ctx + 4)
    }

    #[inline]
    fn set_stats(&mut self, ctx: u32, val: u32) {
        self.alloc.write_u32(ctx + 4, val);
    }

    #[inline]
    pub(super) fn suffix(&self, ctx: u32) -> u32 {
        self.alloc.read_u32(ctx + 8)
    }

    #[inline]
    fn set_suffix(&mut self, ctx: u32, val: u32) {
        self.alloc.write_u32(ctx + 8, val);
    }

    #[inline]
    pub(super) fn one_state(ctx: u32) -> u32 {
        ctx + 2
    }

    // State accessors

    #[inline]
    pub(super) fn symbol(&self, s: u32) -> u8 {
        self.alloc.read_byte(s)
    }

    #[inline]
    pub(super) fn freq(&self, s: u32) -> u32 {
        u32::from(self.alloc.read_byte(s + 1))
    }

    #[inline]
    fn set_freq(&mut self, s: u32, freq: u32) {
        self.alloc.write_byte(s + 1, freq as u8);
    }

    #[inline]
    fn successor(&self, s: u32) -> u32 {
        self.alloc.read_u32(s + 2)
    }

    #[inline]
    fn set_successor(&mut self, s: u32, val: u32) {
        self.alloc.write_u32(s + 2, val);
    }

    fn copy_state(&mut self, dst: u32, src: u32) {
        self.alloc.copy_bytes(dst, src, STATE_SIZE);
    }

    fn read_state(&self, s: u32) -> [u8; STATE_SIZE as usize] {
        let mut tmp = [0u8; STATE_SIZE as usize];
        for (i, byte) in tmp.iter_mut().enumerate() {
            *byte = self.alloc.read_byte(s + i as u32);
        }
        tmp
    }

    fn write_state(&mut self, s: u32, state: [u8; STATE_SIZE as usize]) {
        for (i, byte) in state.iter().enumerate() {
            self.alloc.write_byte(s + i as u32, *byte);
        }
    }

    fn swap_states(&mut self, a: u32, b: u32) {
        let tmp = self.read_state(a);
        self.copy_state(a, b);
        self.write_state(b, tmp);
    }

    fn find_state(&self, ctx: u32, sym: u8) -> u32 {
        let mut s = self.stats(ctx);
        while self.symbol(s) != sym {
            s += STATE_SIZE;
        }
        s
    }

    // Symbol masking

    pub(super) fn clear_mask(&mut self) {
        self.esc_count = self.esc_count.wrapping_add(1);
        if self.esc_count == 0 {
            self.esc_count = 1;
            self.char_mask = [0; 256];
        }
    }

    #[inline]
    pub(super) fn mask(&mut self, sym: u8) {
        self.char_mask[sym as usize] = self.esc_count;
    }

    #[inline]
    pub(super) fn is_masked(&self, sym: u8) -> bool {
        self.char_mask[sym as usize] == self.esc_count
    }

    /// Mask every symbol of the multi-symbol context `ctx`.
    pub(super) fn mask_context(&mut self, ctx: u32) {
        let stats = self.stats(ctx);
        for i in 0..=self.num_stats(ctx) {
            let sym = self.symbol(stats + i * STATE_SIZE);
            self.mask(sym);
        }
    }

    // Estimators

    pub(super) fn bin_summ_index(&self) -> (usize, usize) {
        let mc = self.min_context;
        let s = Self::one_state(mc);
        let row = self.ns2index[self.freq(s) as usize - 1] as usize;
        let suffix_ns = self.num_stats(self.suffix(mc)) as usize;
        let col = self.prev_success
            + ((self.run_length >> 26) as u32 & 0x20)
            + u32::from(self.ns2bs_index[suffix_ns])
            + u32::from(self.flags(mc));
        (row, col as usize)
    }

    pub(super) fn set_bin_summ(&mut self, row: usize, col: usize, prob: u16) {
        self.journal.push(Undo::BinSumm {
            row,
            col,
            prob: self.bin_summ[row][col],
        });
        self.bin_summ[row][col] = prob;
    }

    /// Pick the SEE context for a masked escape and take its estimate.
    pub(super) fn make_esc_freq(&mut self, num_masked: u32) -> (SeeRef, u32) {
        let mc = self.min_context;
        let num_stats = self.num_stats(mc);
        if num_stats == 0xFF {
            return (SeeRef::Dummy, 1);
        }
        let row = self.ns2index[num_stats as usize + 2] as usize - 3;
        let suffix_ns = self.num_stats(self.suffix(mc));
        let col = u32::from(self.summ_freq(mc) > 11 * (num_stats + 1))
            + 2 * u32::from(2 * num_stats < suffix_ns + num_masked)
            + u32::from(self.flags(mc));
        let col = col as usize;
        let see = &mut self.see[row][col];
        self.journal.push(Undo::See {
            row,
            col,
            summ: see.summ,
        });
        let esc = see.take_mean();
        (SeeRef::Table(row, col), esc)
    }

    pub(super) fn see_update(&mut self, see: SeeRef) {
        match see {
            SeeRef::Table(row, col) => self.see[row][col].update(),
            SeeRef::Dummy => self.dummy_see.update(),
        }
    }

    pub(super) fn see_add(&mut self, see: SeeRef, freq_sum: u32) {
        let cell = match see {
            SeeRef::Table(row, col) => {
                let cell = &mut self.see[row][col];
                self.journal.push(Undo::See {
                    row,
                    col,
                    summ: cell.summ,
                });
                cell
            }
            SeeRef::Dummy => {
                self.journal.push(Undo::DummySee(self.dummy_see.summ));
                &mut self.dummy_see
            }
        };
        cell.summ = (u32::from(cell.summ).wrapping_add(freq_sum)) as u16;
    }

    #[cfg(any(test, feature = "test-support"))]
    pub(super) fn clear_journal(&mut self) {
        self.journal.clear();
    }

    fn save_scalars(&self) -> Scalars {
        Scalars {
            min_context: self.min_context,
            order_fall: self.order_fall,
            prev_success: self.prev_success,
            init_esc: self.init_esc,
        }
    }

    fn rollback(&mut self, saved: Scalars) {
        while let Some(undo) = self.journal.pop() {
            match undo {
                Undo::See { row, col, summ } => self.see[row][col].summ = summ,
                Undo::DummySee(summ) => self.dummy_see.summ = summ,
                Undo::BinSumm { row, col, prob } => self.bin_summ[row][col] = prob,
            }
        }
        self.min_context = saved.min_context;
        self.order_fall = saved.order_fall;
        self.prev_success = saved.prev_success;
        self.init_esc = saved.init_esc;
    }

    // Model updates

    pub(super) fn update1_0(&mut self) {
        let s = self.found_state;
        let mc = self.min_context;
        let freq = self.freq(s);
        let summ = self.summ_freq(mc);
        self.prev_success = u32::from(2 * freq >= summ);
        self.run_length += self.prev_success as i32;
        self.set_summ_freq(mc, summ + 4);
        self.set_freq(s, freq + 4);
        if freq + 4 > MAX_FREQ {
            self.rescale();
        }
        self.next_context();
    }

    pub(super) fn update1(&mut self) {
        let s = self.found_state;
        let mc = self.min_context;
        let freq = self.freq(s) + 4;
        self.set_summ_freq(mc, self.summ_freq(mc) + 4);
        self.set_freq(s, freq);
        let prev = s - STATE_SIZE;
        if freq > self.freq(prev) {
            self.swap_states(s, prev);
            self.found_state = prev;
            if freq > MAX_FREQ {
                self.rescale();
            }
        }
        self.next_context();
    }

    pub(super) fn update2(&mut self) {
        let s = self.found_state;
        let mc = self.min_context;
        let freq = self.freq(s) + 4;
        self.run_length = self.init_rl;
        self.set_summ_freq(mc, self.summ_freq(mc) + 4);
        self.set_freq(s, freq);
        if freq > MAX_FREQ {
            self.rescale();
        }
        self.update_model();
    }

    pub(super) fn update_bin(&mut self) {
        let s = self.found_state;
        let freq = self.freq(s);
        self.set_freq(s, freq + u32::from(freq < 196));
        self.prev_success = 1;
        self.run_length += 1;
        self.next_context();
    }

    fn next_context(&mut self) {
        let c = self.successor(self.found_state);
        if self.order_fall == 0 && c >= self.alloc.units_start() {
            self.min_context = c;
            self.max_context = c;
        } else {
            self.update_model();
        }
    }

    /// Build the missing higher-order contexts for the found symbol,
    /// starting from the suffixes of `c`. `s1`, when non-zero, is the state
    /// already located in the first suffix. Returns 0 when the arena is
    /// exhausted.
    fn create_successors(&mut self, skip: bool, mut s1: u32, mut c: u32) -> u32 {
        let fs = self.found_state;
        let fs_symbol = self.symbol(fs);
        let mut up_branch = self.successor(fs);
        let mut ps = [0u32; MAX_O];
        let mut num_ps = 0usize;

        if !skip {
            ps[num_ps] = fs;
            num_ps += 1;
        }

        while self.suffix(c) != 0 {
            c = self.suffix(c);
            let s = if s1 != 0 {
                std::mem::take(&mut s1)
            } else if self.num_stats(c) != 0 {
                let s = self.find_state(c, fs_symbol);
                if self.freq(s) < MAX_FREQ - 9 {
                    self.set_freq(s, self.freq(s) + 1);
                    self.set_summ_freq(c, self.summ_freq(c) + 1);
                }
                s
            } else {
                let s = Self::one_state(c);
                let suffix_binary = self.num_stats(self.suffix(c)) == 0;
                let freq = self.freq(s);
                self.set_freq(s, freq + u32::from(suffix_binary && freq < 24));
                s
            };
            let successor = self.successor(s);
            if successor != up_branch {
                c = successor;
                if num_ps == 0 {
                    return c;
                }
                break;
            }
            if num_ps == MAX_O {
                return 0;
            }
            ps[num_ps] = s;
            num_ps += 1;
        }

        let new_sym = self.alloc.read_byte(up_branch);
        up_branch += 1;
        let flags = hi_bits_flag4(fs_symbol) + hi_bits_flag3(new_sym);

        let new_freq = if self.num_stats(c) == 0 {
            self.freq(Self::one_state(c))
        } else {
            let s = self.find_state(c, new_sym);
            let cf = self.freq(s) - 1;
            let s0 = self
                .summ_freq(c)
                .wrapping_sub(self.num_stats(c))
                .wrapping_sub(cf);
            1 + if 2 * cf <= s0 {
                u32::from(5 * cf > s0)
            } else {
                (cf + 2 * s0 - 3) / s0.max(1)
            }
        };

        while num_ps != 0 {
            let Some(c1) = self.alloc.alloc_context() else {
                return 0;
            };
            self.set_flags(c1, flags);
            self.set_num_stats(c1, 0);
            let one = Self::one_state(c1);
            self.alloc.write_byte(one, new_sym);
            self.set_freq(one, new_freq);
            self.set_successor(one, up_branch);
            self.set_suffix(c1, c);
            num_ps -= 1;
            self.set_successor(ps[num_ps], c1);
            c = c1;
        }
        c
    }

    /// Walk down from `c` pointing successor-less states at the text, then
    /// hang the first real successor found. Returns 0 when the arena is
    /// exhausted.
    fn reduce_order(&mut self, mut s1: u32, mut c: u32) -> u32 {
        let c1 = c;
        let up_branch = self.alloc.text();
        let fs_symbol = self.symbol(self.found_state);
        self.set_successor(self.found_state, up_branch);
        self.order_fall += 1;

        let s = loop {
            let s = if s1 != 0 {
                c = self.suffix(c);
                std::mem::take(&mut s1)
            } else {
                if self.suffix(c) == 0 {
                    return c;
                }
                c = self.suffix(c);
                if self.num_stats(c) != 0 {
                    let s = self.find_state(c, fs_symbol);
                    if self.freq(s) < MAX_FREQ - 9 {
                        self.set_freq(s, self.freq(s) + 2);
                        self.set_summ_freq(c, self.summ_freq(c) + 2);
                    }
                    s
                } else {
                    let s = Self::one_state(c);
                    let freq = self.freq(s);
                    self.set_freq(s, freq + u32::from(freq < 32));
                    s
                }
            };
            if self.successor(s) != 0 {
                break s;
            }
            self.set_successor(s, up_branch);
            self.order_fall += 1;
        };

        if self.successor(s) <= up_branch {
            let found = self.found_state;
            self.found_state = s;
            let cs = self.create_successors(false, 0, c);
            self.set_successor(s, cs);
            self.found_state = found;
        }

        let successor = self.successor(s);
        if self.order_fall == 1 && c1 == self.max_context {
            self.set_successor(self.found_state, successor);
            self.alloc.set_text(self.alloc.text() - 1);
        }
        successor
    }

    fn update_model(&mut self) {
        let fs = self.found_state;
        let fs_symbol = self.symbol(fs);
        let fs_freq = self.freq(fs);
        let mut min_successor = self.successor(fs);
        let mut s = 0u32;

        if fs_freq < MAX_FREQ / 4 && self.suffix(self.min_context) != 0 {
            let c = self.suffix(self.min_context);
            if self.num_stats(c) == 0 {
                s = Self::one_state(c);
                if self.freq(s) < 32 {
                    self.set_freq(s, self.freq(s) + 1);
                }
            } else {
                s = self.stats(c);
                if self.symbol(s) != fs_symbol {
                    s = self.find_state(c, fs_symbol);
                    if self.freq(s) >= self.freq(s - STATE_SIZE) {
                        self.swap_states(s, s - STATE_SIZE);
                        s -= STATE_SIZE;
                    }
                }
                if self.freq(s) < MAX_FREQ - 9 {
                    self.set_freq(s, self.freq(s) + 2);
                    self.set_summ_freq(c, self.summ_freq(c) + 2);
                }
            }
        }

        let mut c = self.max_context;
        if self.order_fall == 0 && min_successor != 0 {
            let cs = self.create_successors(true, s, self.min_context);
            if cs == 0 {
                self.set_successor(self.found_state, 0);
                self.restore_model(c);
                return;
            }
            self.set_successor(self.found_state, cs);
            self.min_context = cs;
            self.max_context = cs;
            return;
        }

        let text = self.alloc.push_text(fs_symbol);
        if text >= self.alloc.units_start() {
            self.restore_model(c);
            return;
        }
        let mut max_successor = text;

        if min_successor == 0 {
            let cs = self.reduce_order(s, self.min_context);
            if cs == 0 {
                self.restore_model(c);
                return;
            }
            min_successor = cs;
        } else if min_successor < self.alloc.units_start() {
            let cs = self.create_successors(false, s, self.min_context);
            if cs == 0 {
                self.restore_model(c);
                return;
            }
            min_successor = cs;
        }

        self.order_fall -= 1;
        if self.order_fall == 0 {
            max_successor = min_successor;
            if self.max_context != self.min_context {
                self.alloc.set_text(self.alloc.text() - 1);
            }
        }

        let flag = hi_bits_flag3(fs_symbol);
        let ns = self.num_stats(self.min_context);
        let s0 = self
            .summ_freq(self.min_context)
            .wrapping_sub(ns)
            .wrapping_sub(fs_freq);

        while c != self.min_context {
            let ns1 = self.num_stats(c);
            let mut sum;
            if ns1 != 0 {
                if ns1 & 1 != 0 {
                    let Some(stats) = self.alloc.expand_units(self.stats(c), (ns1 + 1) >> 1) else {
                        self.restore_model(c);
                        return;
                    };
                    self.set_stats(c, stats);
                }
                sum = self.summ_freq(c) + u32::from(3 * ns1 + 1 < ns);
            } else {
                let Some(st) = self.alloc.alloc_units(0) else {
                    self.restore_model(c);
                    return;
                };
                let one = Self::one_state(c);
                let mut freq = self.freq(one);
                self.copy_state(st, one);
                self.set_stats(c, st);
                freq = if freq < MAX_FREQ / 4 - 1 {
                    freq << 1
                } else {
                    MAX_FREQ - 4
                };
                self.set_freq(st, freq);
                sum = freq + self.init_esc + u32::from(ns > 2);
            }

            let s = self.stats(c) + (ns1 + 1) * STATE_SIZE;
            let mut cf = 2 * (sum + 6) * fs_freq;
            let sf = s0.wrapping_add(sum);
            self.alloc.write_byte(s, fs_symbol);
            self.set_num_stats(c, ns1 + 1);
            self.set_successor(s, max_successor);
            self.set_flags(c, self.flags(c) | flag);
            if cf < 6 * sf {
                cf = 1 + u32::from(cf > sf) + u32::from(cf >= 4 * sf);
                sum += 4;
            } else {
                cf = 4 + u32::from(cf > 9 * sf) + u32::from(cf > 12 * sf) + u32::from(cf > 15 * sf);
                sum += cf;
            }
            self.set_summ_freq(c, sum);
            self.set_freq(s, cf);
            c = self.suffix(c);
        }
        self.min_context = min_successor;
        self.max_context = min_successor;
    }

    /// Halve the frequencies of the current context once one overflows.
    fn rescale(&mut self) {
        let mc = self.min_context;
        let stats = self.stats(mc);
        let mut s = self.found_state;

        if s != stats {
            let tmp = self.read_state(s);
            while s != stats {
                self.copy_state(s, s - STATE_SIZE);
                s -= STATE_SIZE;
            }
            self.write_state(s, tmp);
        }

        let mut sum_freq = self.freq(s);
        let mut esc_freq = self.summ_freq(mc).wrapping_sub(sum_freq);
        let adder = u32::from(self.order_fall != 0);
        sum_freq = (sum_freq + 4 + adder) >> 1;
        self.set_freq(s, sum_freq);

        let num_stats = self.num_stats(mc);
        for _ in 0..num_stats {
            s += STATE_SIZE;
            let mut freq = self.freq(s);
            esc_freq = esc_freq.wrapping_sub(freq);
            freq = (freq + adder) >> 1;
            sum_freq += freq;
            self.set_freq(s, freq);
            if freq > self.freq(s - STATE_SIZE) {
                let tmp = self.read_state(s);
                let mut s1 = s;
                loop {
                    self.copy_state(s1, s1 - STATE_SIZE);
                    s1 -= STATE_SIZE;
                    if s1 == stats || freq <= self.freq(s1 - STATE_SIZE) {
                        break;
                    }
                }
                self.write_state(s1, tmp);
            }
        }

        if self.freq(s) == 0 {
            let mut zeros = 0;
            while self.freq(s) == 0 {
                zeros += 1;
                s -= STATE_SIZE;
            }
            esc_freq = esc_freq.wrapping_add(zeros);
            let num_stats_new = num_stats - zeros;
            self.set_num_stats(mc, num_stats_new);
            let n0 = (num_stats + 2) >> 1;

            if num_stats_new == 0 {
                let freq = ((2 * self.freq(stats) + esc_freq - 1) / esc_freq).min(MAX_FREQ / 3);
                let flags = (self.flags(mc) & FLAG_PREV_HIGH) + hi_bits_flag3(self.symbol(stats));
                self.set_flags(mc, flags);
                let one = Self::one_state(mc);
                self.copy_state(one, stats);
                self.set_freq(one, freq);
                self.found_state = one;
                self.alloc.free_units(stats, n0);
                return;
            }

            let n1 = (num_stats_new + 2) >> 1;
            if n0 != n1 {
                let shrunk = self.alloc.shrink_units(stats, n0, n1);
                self.set_stats(mc, shrunk);
            }
        }

        self.set_summ_freq(mc, sum_freq + esc_freq - (esc_freq >> 1));
        self.set_flags(mc, self.flags(mc) | FLAG_RESCALED);
        self.found_state = self.stats(mc);
    }

    /// Shrink a context's state array to fit and divide its frequencies by
    /// `2^scale` (scale is 0 or 1, forced to 1 for very large sums).
    fn refresh(&mut self, ctx: u32, old_nu: u32, scale: u32) {
        let mut i = self.num_stats(ctx);
        let mut s = self.alloc.shrink_units(self.stats(ctx), old_nu, (i + 2) >> 1);
        self.set_stats(ctx, s);

        let scale = scale | u32::from(self.summ_freq(ctx) >= 1 << 15);
        let mut hi_bits = u32::from(self.symbol(s)) + 0xC0;
        let mut freq = self.freq(s);
        let mut esc_freq = self.summ_freq(ctx).wrapping_sub(freq);
        freq = (freq + scale) >> scale;
        let mut sum_freq = freq;
        self.set_freq(s, freq);

        loop {
            s += STATE_SIZE;
            let mut freq = self.freq(s);
            esc_freq = esc_freq.wrapping_sub(freq);
            freq = (freq + scale) >> scale;
            sum_freq += freq;
            self.set_freq(s, freq);
            hi_bits |= u32::from(self.symbol(s)) + 0xC0;
            i -= 1;
            if i == 0 {
                break;
            }
        }

        self.set_summ_freq(ctx, sum_freq.wrapping_add(esc_freq.wrapping_add(scale) >> scale));
        let keep = FLAG_PREV_HIGH + FLAG_RESCALED * scale as u8;
        let flags = (self.flags(ctx) & keep) + ((hi_bits >> 5) & 8) as u8;
        self.set_flags(ctx, flags);
    }

    /// Turn the multi-symbol context `c` whose `num_stats` just dropped to
    /// zero into a binary context holding `stats[0]`.
    fn collapse_to_binary(&mut self, c: u32, stats: u32) {
        let sym = self.symbol(stats);
        let flags = (self.flags(c) & FLAG_PREV_HIGH) + hi_bits_flag3(sym);
        self.set_flags(c, flags);
        let freq = (self.freq(stats) + 11) >> 3;
        let one = Self::one_state(c);
        self.copy_state(one, stats);
        self.set_freq(one, freq);
    }

    /// Prune the subtree under `ctx` (at depth `order`): drop states whose
    /// successors point into the text and contexts left with nothing useful.
    /// Returns the context, or 0 if it was freed.
    fn cut_off(&mut self, ctx: u32, order: u32) -> u32 {
        let mut ns = self.num_stats(ctx) as i32;

        if ns == 0 {
            let s = Self::one_state(ctx);
            let mut successor = self.successor(s);
            if successor >= self.alloc.units_start() {
                successor = if order < self.max_order {
                    self.cut_off(successor, order + 1)
                } else {
                    0
                };
                self.set_successor(s, successor);
                if successor != 0 || order <= 9 {
                    return ctx;
                }
            }
            self.alloc.special_free_unit(ctx);
            return 0;
        }

        let nu = (ns as u32 + 2) >> 1;
        let indx = self.alloc.u2i(nu);
        let mut stats = self.stats(ctx);
        if stats.wrapping_sub(self.alloc.units_start()) <= 1 << 14
            && stats <= self.alloc.free_list_head(indx)
        {
            stats = self.alloc.move_units_to_free(stats, nu);
            self.set_stats(ctx, stats);
        }

        let mut s = stats + ns as u32 * STATE_SIZE;
        loop {
            let successor = self.successor(s);
            if successor < self.alloc.units_start() {
                let s2 = stats + ns as u32 * STATE_SIZE;
                ns -= 1;
                if order != 0 {
                    if s != s2 {
                        self.copy_state(s, s2);
                    }
                } else {
                    self.swap_states(s, s2);
                    self.set_successor(s2, 0);
                }
            } else if order < self.max_order {
                let cs = self.cut_off(successor, order + 1);
                self.set_successor(s, cs);
            } else {
                self.set_successor(s, 0);
            }
            if s == stats {
                break;
            }
            s -= STATE_SIZE;
        }

        if ns != self.num_stats(ctx) as i32 && order != 0 {
            if ns < 0 {
                self.alloc.free_units(stats, nu);
                self.alloc.special_free_unit(ctx);
                return 0;
            }
            self.set_num_stats(ctx, ns as u32);
            if ns == 0 {
                self.collapse_to_binary(ctx, stats);
                self.alloc.free_units(stats, nu);
            } else {
                let scale = u32::from(self.summ_freq(ctx) > 16 * ns as u32);
                self.refresh(ctx, nu, scale);
            }
        }
        ctx
    }

    /// Recover from an exhausted arena. `ctx_error` is the first context
    /// the interrupted update did not reach.
    fn restore_model(&mut self, ctx_error: u32) {
        self.alloc.set_text(0);

        // Undo the half-finished symbol additions.
        let mut c = self.max_context;
        while c != ctx_error && c != 0 {
            let ns = self.num_stats(c).wrapping_sub(1) & 0xFF;
            self.set_num_stats(c, ns);
            if ns == 0 {
                let s = self.stats(c);
                self.collapse_to_binary(c, s);
                self.alloc.special_free_unit(s);
            } else {
                self.refresh(c, (ns + 3) >> 1, 0);
            }
            c = self.suffix(c);
        }

        while c != self.min_context && c != 0 {
            if self.num_stats(c) == 0 {
                let one = Self::one_state(c);
                self.set_freq(one, (self.freq(one) + 1) >> 1);
            } else {
                let summ = self.summ_freq(c) + 4;
                self.set_summ_freq(c, summ);
                let ns = self.num_stats(c);
                if summ > 128 + 4 * ns {
                    self.refresh(c, (ns + 2) >> 1, 1);
                }
            }
            c = self.suffix(c);
        }

        let size = self.alloc.size();
        if self.restore_method == RestoreMethod::Restart || self.alloc.used_memory() < size >> 1 {
            log::debug!("PPMd8 model out of memory, restarting");
            self.restart_model();
        } else {
            while self.suffix(self.max_context) != 0 {
                self.max_context = self.suffix(self.max_context);
            }
            let mut last_used = u32::MAX;
            loop {
                self.cut_off(self.max_context, 0);
                self.alloc.expand_text_area();
                let used = self.alloc.used_memory();
                if used <= 3 * (size >> 2) {
                    break;
                }
                if used >= last_used {
                    // The root alone outgrows the target; pruning cannot finish.
                    log::debug!("PPMd8 cut-off stalled at {used} bytes, restarting");
                    self.restart_model();
                    break;
                }
                last_used = used;
            }
            log::debug!("PPMd8 model pruned to {} bytes", self.alloc.used_memory());
            self.alloc.reset_glue_count();
            self.order_fall = self.max_order;
        }
        self.min_context = self.max_context;
    }

    /// Decode one symbol, leaving the rollback to the caller on starvation.
    fn decode_inner<S: ByteSource>(
        &mut self,
        rc: &mut RangeDecoder,
        src: &mut S,
    ) -> std::result::Result<Step, RangeError> {
        let mc = self.min_context;
        if self.num_stats(mc) != 0 {
            let mut s = self.stats(mc);
            let summ = rc.correct_sum_range(self.summ_freq(mc));
            let count = rc.get_threshold(summ);
            let mut hi_cnt = self.freq(s);
            if count < hi_cnt {
                rc.decode(src, 0, hi_cnt)?;
                self.found_state = s;
                let symbol = self.symbol(s);
                self.update1_0();
                return Ok(Step::Symbol(symbol));
            }
            self.prev_success = 0;
            for _ in 0..self.num_stats(mc) {
                s += STATE_SIZE;
                let freq = self.freq(s);
                hi_cnt += freq;
                if hi_cnt > count {
                    rc.decode(src, hi_cnt - freq, freq)?;
                    self.found_state = s;
                    let symbol = self.symbol(s);
                    self.update1();
                    return Ok(Step::Symbol(symbol));
                }
            }
            if count >= summ {
                return Ok(Step::DataError);
            }
            rc.decode(src, hi_cnt, summ - hi_cnt)?;
            self.clear_mask();
            self.mask_context(mc);
        } else {
            let (row, col) = self.bin_summ_index();
            let prob = u32::from(self.bin_summ[row][col]);
            let bit = rc.decode_bit(src, prob)?;
            let pr = prob - get_mean(prob);
            let s = Self::one_state(mc);
            if bit == 0 {
                self.set_bin_summ(row, col, (pr + INTERVAL) as u16);
                self.found_state = s;
                let symbol = self.symbol(s);
                self.update_bin();
                return Ok(Step::Symbol(symbol));
            }
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
                    return Ok(Step::EndOfStream);
                }
                self.min_context = suffix;
                if self.num_stats(suffix) != num_masked {
                    break;
                }
            }

            let mc = self.min_context;
            let stats = self.stats(mc);
            let n = self.num_stats(mc) + 1;
            let mut hi_cnt = 0;
            for i in 0..n {
                let s = stats + i * STATE_SIZE;
                if !self.is_masked(self.symbol(s)) {
                    hi_cnt += self.freq(s);
                }
            }

            let (see, esc_freq) = self.make_esc_freq(num_masked);
            let freq_sum = esc_freq + hi_cnt;
            let freq_sum2 = rc.correct_sum_range(freq_sum);
            let count = rc.get_threshold(freq_sum2);

            if count < hi_cnt {
                let mut acc = 0;
                let mut s = stats;
                loop {
                    if !self.is_masked(self.symbol(s)) {
                        acc += self.freq(s);
                        if acc > count {
                            break;
                        }
                    }
                    s += STATE_SIZE;
                }
                let freq = self.freq(s);
                rc.decode(src, acc - freq, freq)?;
                self.see_update(see);
                self.found_state = s;
                let symbol = self.symbol(s);
                self.update2();
                return Ok(Step::Symbol(symbol));
            }
            if count >= freq_sum2 {
                return Ok(Step::DataError);
            }
            rc.decode(src, hi_cnt, freq_sum2 - hi_cnt)?;
            self.see_add(see, freq_sum);
            self.mask_context(mc);
        }
    }
}

/// Mean used by the binary probability updates.
#[inline]
pub(super) fn get_mean(prob: u32) -> u32 {
    (prob + (1 << (PERIOD_BITS - 2))) >> PERIOD_BITS
}

impl SymbolModel for Ppmd8Model {
    type Coder = RangeDecoder;

    const NAME: &'static str = "PPMd8";

    fn decode_symbol<S: ByteSource>(&mut self, rc: &mut RangeDecoder, src: &mut S) -> Step {
        let saved = self.save_scalars();
        self.journal.clear();
        match self.decode_inner(rc, src) {
            Ok(step) => step,
            Err(_) => {
                self.rollback(saved);
                Step::NeedMoreInput
            }
        }
    }

    fn restart(&mut self) {
        self.init_model();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress::input::InputWindow;
    use crate::decompress::ppm::RangeCoder;

    fn model() -> Ppmd8Model {
        Ppmd8Model::new(6, 1 << 16, RestoreMethod::Restart).unwrap()
    }

    #[test]
    fn test_root_context_after_restart() {
        let m = model();
        let root = m.min_context;
        assert_eq!(m.num_stats(root), 255);
        assert_eq!(m.summ_freq(root), 257);
        assert_eq!(m.flags(root), 0);
        assert_eq!(m.suffix(root), 0);
        let stats = m.stats(root);
        for i in 0..256u32 {
            assert_eq!(m.symbol(stats + i * STATE_SIZE), i as u8);
            assert_eq!(m.freq(stats + i * STATE_SIZE), 1);
        }
        assert_eq!(m.order_fall, 6);
        assert_eq!(m.run_length, -7);
    }

    #[test]
    fn test_estimator_tables() {
        let m = model();
        assert_eq!(&m.ns2index[..12], &[0, 1, 2, 3, 4, 5, 6, 6, 7, 7, 7, 8]);
        assert_eq!(m.ns2index[195], 24);
        assert_eq!(m.ns2index[256], 26);
        assert_eq!(m.bin_summ[0][0], (BIN_SCALE - 0x3CDD / 2) as u16);
        assert_eq!(m.bin_summ[0][56], m.bin_summ[0][0]);
        assert_eq!(m.see[0][0], See::new(7 << 3));
        assert_eq!(m.see[23][31].summ, 515 << 3);
        assert_eq!(m.dummy_see, See::dummy());
    }

    #[test]
    fn test_hi_bits_flags() {
        assert_eq!(hi_bits_flag3(0x3F), 0);
        assert_eq!(hi_bits_flag3(0x40), 8);
        assert_eq!(hi_bits_flag3(0xFF), 8);
        assert_eq!(hi_bits_flag4(0x3F), 0);
        assert_eq!(hi_bits_flag4(0x40), 0x10);
    }

    #[test]
    fn test_see_mean_and_update() {
        let mut see = See::new(56);
        assert_eq!(see.take_mean(), 7);
        assert_eq!(see.summ, 49);
        for _ in 0..7 {
            see.update();
        }
        assert_eq!(see.shift, 4);
        assert_eq!(see.count, 24);
        assert_eq!(see.summ, 98);
    }

    #[test]
    fn test_starved_symbol_leaves_model_untouched() {
        let mut m = model();
        let mut rc = RangeDecoder::new();
        // Symbol 0 of the root leaves low and low + range in one top byte,
        // so the carryless coder must shift in another byte.
        rc.init(&mut InputWindow::borrowed(&[0x00, 0x00, 0x12, 0x34])).unwrap();
        let snap = rc.snapshot();

        let before_see = m.see;
        let before_bin = m.bin_summ;
        let before_ctx = m.min_context;
        let before_fall = m.order_fall;

        let mut empty = InputWindow::borrowed(&[]);
        assert_eq!(m.decode_symbol(&mut rc, &mut empty), Step::NeedMoreInput);
        assert_eq!(m.see, before_see);
        assert_eq!(m.bin_summ, before_bin);
        assert_eq!(m.min_context, before_ctx);
        assert_eq!(m.order_fall, before_fall);
        assert_eq!(m.alloc.text(), 0);
        assert_eq!(m.freq(m.stats(m.min_context)), 1);

        rc.restore(snap);
        let mut more = InputWindow::borrowed(&[0x56]);
        assert_eq!(m.decode_symbol(&mut rc, &mut more), Step::Symbol(0));
    }

    #[test]
    fn test_restart_keeps_escape_seed() {
        let mut m = model();
        m.init_esc = 9;
        m.restart_model();
        assert_eq!(m.init_esc, 9);

        m.restart();
        assert_eq!(m.init_esc, 0);
        assert_eq!(m.restore_method(), RestoreMethod::Restart);
    }

    #[test]
    fn test_cut_off_on_tiny_arena_falls_back_to_restart() {
        // The root context alone fills more than three quarters of 2 KiB,
        // so pruning can never reach its target.
        let mut m = Ppmd8Model::new(4, 2048, RestoreMethod::CutOff).unwrap();
        let root = m.min_context;
        m.run_length = 5;
        m.restore_model(m.max_context);
        assert_eq!(m.min_context, root);
        assert_eq!(m.max_context, root);
        assert_eq!(m.num_stats(root), 255);
        assert_eq!(m.order_fall, 4);
        assert_eq!(m.run_length, m.init_rl);
    }

    #[test]
    fn test_cut_off_drops_text_successors() {
        let mut m = Ppmd8Model::new(4, 1 << 16, RestoreMethod::CutOff).unwrap();
        let root = m.max_context;
        let stats = m.stats(root);
        // Symbol 'a' of the root points into the text area.
        let a = stats + u32::from(b'a') * STATE_SIZE;
        m.set_successor(a, 1);
        m.cut_off(root, 0);
        // The root keeps all of its symbols but loses the text pointer.
        assert_eq!(m.num_stats(root), 255);
        assert_eq!(m.successor(a), 0);
    }
}
