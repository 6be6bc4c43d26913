//! PPMd var.H model (7z flavour).
//!
//! Based on Dmitry Shkarin's PPMd var.H.
//!
//! ## Memory layout
//!
//! Every structure lives in the [`SubAllocator`] arena and is addressed by a
//! `u32` offset:
//!
//! | Structure | Size | Fields |
//! |-----------|------|--------|
//! | State | 6 | symbol `u8`, freq `u8`, successor `u32` |
//! | Context | 12 | num_stats `u16`, summ_freq `u16`, stats `u32`, suffix `u32` |
//!
//! A context with a single symbol stores that state inline at offset 2,
//! overlapping `summ_freq` and `stats`.
//!
//! ## Rollback
//!
//! Decoding a symbol touches a handful of model cells before its last input
//! byte is read: the walk through suffix contexts, the binary-context
//! probability and the SEE escape estimators. Those writes are journaled and
//! undone when the range decoder runs dry, which is what lets the controller
//! retry a starved symbol from scratch. All structural updates happen after
//! the final byte and need no journal.

use super::range_coder::RangeDecoder;
use super::sub_alloc::SubAllocator;
use crate::decompress::input::ByteSource;
use crate::decompress::ppm::{RangeError, Step, SymbolModel, PPMD7_MAX_ORDER, PPMD7_MIN_ORDER};
use crate::decompress::{DecodeError, Result};

/// PPMd constants.
const INT_BITS: u32 = 7;
const PERIOD_BITS: u32 = 7;
const TOT_BITS: u32 = INT_BITS + PERIOD_BITS;
const INTERVAL: u32 = 1 << INT_BITS;
const BIN_SCALE: u32 = 1 << TOT_BITS;
pub(super) const MAX_FREQ: u32 = 124;
const MAX_O: usize = PPMD7_MAX_ORDER as usize;

/// State record size in bytes.
pub(super) const STATE_SIZE: u32 = 6;

const INIT_BIN_ESC: [u16; 8] = [
    0x3CDD, 0x1F3F, 0x59BF, 0x48F3, 0x64A1, 0x5ABC, 0x6632, 0x6051,
];

pub(super) const EXP_ESCAPE: [u8; 16] = [25, 14, 9, 7, 5, 5, 4, 4, 4, 3, 3, 3, 2, 2, 2, 2];

/// SEE context for escape estimation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct See {
    pub(super) summ: u16,
    shift: u8,
    count: u8,
}

impl See {
    fn new(init_val: u16) -> Self {
        Self {
            summ: init_val << (PERIOD_BITS - 4),
            shift: (PERIOD_BITS - 4) as u8,
            count: 4,
        }
    }

    fn dummy() -> Self {
        Self {
            summ: 0,
            shift: PERIOD_BITS as u8,
            count: 64,
        }
    }

    /// Take the current mean escape frequency out of the estimator.
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

/// Which escape estimator a masked context used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum SeeRef {
    Table(usize, usize),
    Dummy,
}

/// Model cell overwritten before a symbol's last byte.
#[derive(Clone, Copy, Debug)]
enum Undo {
    See { row: usize, col: usize, summ: u16 },
    DummySee(u16),
    BinSumm { row: usize, col: usize, prob: u16 },
}

/// Scalar fields a starved symbol may have changed.
#[derive(Clone, Copy, Debug)]
struct Scalars {
    min_context: u32,
    order_fall: u32,
    prev_success: u32,
    hi_bits_flag: u32,
    init_esc: u32,
}

/// PPMd var.H model.
pub struct Ppmd7Model {
    /// Arena for contexts, states and text.
    pub(super) alloc: SubAllocator,
    /// Current (lowest-order active) context.
    pub(super) min_context: u32,
    /// Highest-order context of the current position.
    pub(super) max_context: u32,
    /// State of the last coded symbol.
    pub(super) found_state: u32,
    /// How far below `max_order` the current context is.
    pub(super) order_fall: u32,
    /// Escape frequency seed for newly widened binary contexts.
    pub(super) init_esc: u32,
    pub(super) prev_success: u32,
    pub(super) max_order: u32,
    pub(super) hi_bits_flag: u32,
    pub(super) run_length: i32,
    pub(super) init_rl: i32,
    /// NumStats-1 to SEE row.
    pub(super) ns2index: [u8; 256],
    /// NumStats-1 to binary SEE column bits.
    ns2bs_index: [u8; 256],
    /// 0 below 0x40, 8 otherwise.
    pub(super) hb2flag: [u8; 256],
    /// Binary context probabilities.
    pub(super) bin_summ: [[u16; 64]; 128],
    /// SEE contexts.
    pub(super) see: [[See; 16]; 25],
    pub(super) dummy_see: See,
    /// Masked-symbol stamps; `char_mask[s] == esc_count` means masked.
    char_mask: [u8; 256],
    esc_count: u8,
    /// Cells to restore if the current symbol starves.
    journal: Vec<Undo>,
}

impl Ppmd7Model {
    /// Create a model with the given order and arena size.
    ///
    /// Callers clamp both to the PPMd7 limits first.
    pub fn new(max_order: u32, mem_size: u32) -> Result<Self> {
        debug_assert!((PPMD7_MIN_ORDER..=PPMD7_MAX_ORDER).contains(&max_order));
        let alloc = SubAllocator::new(mem_size).map_err(|_| DecodeError::OutOfMemory {
            requested: mem_size as usize,
        })?;

        let mut ns2bs_index = [0u8; 256];
        ns2bs_index[0] = 0;
        ns2bs_index[1] = 2;
        ns2bs_index[2..11].fill(4);
        ns2bs_index[11..].fill(6);

        let mut ns2index = [0u8; 256];
        for (i, v) in ns2index.iter_mut().enumerate().take(3) {
            *v = i as u8;
        }
        let mut m = 3u8;
        let mut k = 1u32;
        for v in ns2index.iter_mut().skip(3) {
            *v = m;
            k -= 1;
            if k == 0 {
                m += 1;
                k = u32::from(m) - 2;
            }
        }

        let mut hb2flag = [0u8; 256];
        hb2flag[0x40..].fill(8);

        let mut model = Self {
            alloc,
            min_context: 0,
            max_context: 0,
            found_state: 0,
            order_fall: 0,
            init_esc: 0,
            prev_success: 0,
            max_order,
            hi_bits_flag: 0,
            run_length: 0,
            init_rl: 0,
            ns2index,
            ns2bs_index,
            hb2flag,
            bin_summ: [[0; 64]; 128],
            see: [[See::default(); 16]; 25],
            dummy_see: See::dummy(),
            char_mask: [0; 256],
            esc_count: 0,
            journal: Vec::with_capacity(16),
        };
        model.init_model();
        Ok(model)
    }

    /// Model order.
    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Arena size in bytes.
    pub fn mem_size(&self) -> u32 {
        self.alloc.size()
    }

    /// Fresh model, as after construction.
    fn init_model(&mut self) {
        self.init_esc = 0;
        self.hi_bits_flag = 0;
        self.char_mask = [0; 256];
        self.esc_count = 0;
        self.journal.clear();
        self.restart_model();
        self.dummy_see = See::dummy();
    }

    /// Drop all statistics once the arena is exhausted.
    ///
    /// `init_esc`, `hi_bits_flag` and the dummy SEE survive a restart.
    pub(super) fn restart_model(&mut self) {
        self.alloc.restart();

        self.order_fall = self.max_order;
        self.init_rl = -(self.max_order.min(12) as i32) - 1;
        self.run_length = self.init_rl;
        self.prev_success = 0;

        // Root context: all 256 symbols with freq 1.
        let mc = self.alloc.take_hi_unit();
        let stats = self.alloc.take_lo_units(256 / 2);
        self.min_context = mc;
        self.max_context = mc;
        self.found_state = stats;
        self.set_num_stats(mc, 256);
        self.set_summ_freq(mc, 256 + 1);
        self.set_stats(mc, stats);
        self.set_suffix(mc, 0);
        for i in 0..256u32 {
            let s = stats + i * STATE_SIZE;
            self.alloc.write_byte(s, i as u8);
            self.set_freq(s, 1);
            self.set_successor(s, 0);
        }

        for (i, row) in self.bin_summ.iter_mut().enumerate() {
            for (k, &esc) in INIT_BIN_ESC.iter().enumerate() {
                let val = (BIN_SCALE - u32::from(esc) / (i as u32 + 2)) as u16;
                for m in (0..64).step_by(8) {
                    row[k + m] = val;
                }
            }
        }

        for (i, row) in self.see.iter_mut().enumerate() {
            row.fill(See::new((5 * i + 10) as u16));
        }
    }

    // Context accessors

    #[inline]
    pub(super) fn num_stats(&self, ctx: u32) -> u32 {
        u32::from(self.alloc.read_u16(ctx))
    }

    #[inline]
    fn set_num_stats(&mut self, ctx: u32, val: u32) {
        self.alloc.write_u16(ctx, val as u16);
    }

    #[inline]
    pub(super) fn summ_freq(&self, ctx: u32) -> u32 {
        u32::from(self.alloc.read_u16(ctx + 2))
    }

    #[inline]
    pub(super) fn set_summ_freq(&mut self, ctx: u32, val: u32) {
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

    /// Inline state of a binary context.
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
    pub(super) fn set_freq(&mut self, s: u32, freq: u32) {
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

    fn swap_states(&mut self, a: u32, b: u32) {
        let mut tmp = [0u8; STATE_SIZE as usize];
        for (i, byte) in tmp.iter_mut().enumerate() {
            *byte = self.alloc.read_byte(a + i as u32);
        }
        self.copy_state(a, b);
        for (i, byte) in tmp.iter().enumerate() {
            self.alloc.write_byte(b + i as u32, *byte);
        }
    }

    /// Find the state for `sym` in a multi-symbol context.
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

    // Estimators

    /// Binary-context probability cell for the current context.
    pub(super) fn bin_summ_index(&mut self) -> (usize, usize) {
        let mc = self.min_context;
        let s = Self::one_state(mc);
        let row = self.freq(s) as usize - 1;
        self.hi_bits_flag = u32::from(self.hb2flag[self.symbol(self.found_state) as usize]);
        let suffix_ns = self.num_stats(self.suffix(mc));
        let col = self.prev_success
            + u32::from(self.ns2bs_index[suffix_ns as usize - 1])
            + self.hi_bits_flag
            + 2 * u32::from(self.hb2flag[self.symbol(s) as usize])
            + ((self.run_length >> 26) as u32 & 0x20);
        (row, col as usize)
    }

    /// Overwrite a binary probability, journaling the old value.
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
        if num_stats == 256 {
            return (SeeRef::Dummy, 1);
        }
        let non_masked = num_stats - num_masked;
        let row = self.ns2index[non_masked as usize - 1] as usize;
        let suffix_ns = self.num_stats(self.suffix(mc));
        let col = u32::from(non_masked < suffix_ns.wrapping_sub(num_stats))
            + 2 * u32::from(self.summ_freq(mc) < 11 * num_stats)
            + 4 * u32::from(num_masked > non_masked)
            + self.hi_bits_flag;
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

    /// Credit an escape to its estimator, journaling the old sum.
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
        cell.summ = (u32::from(cell.summ) + freq_sum) as u16;
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
            hi_bits_flag: self.hi_bits_flag,
            init_esc: self.init_esc,
        }
    }

    /// Undo everything the starved symbol touched.
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
        self.hi_bits_flag = saved.hi_bits_flag;
        self.init_esc = saved.init_esc;
    }

    // Model updates

    /// Found the most probable symbol of a multi-symbol context.
    pub(super) fn update1_0(&mut self) {
        let s = self.found_state;
        let mc = self.min_context;
        let freq = self.freq(s);
        let summ = self.summ_freq(mc);
        self.prev_success = u32::from(2 * freq > summ);
        self.run_length += self.prev_success as i32;
        self.set_summ_freq(mc, summ + 4);
        self.set_freq(s, freq + 4);
        if freq + 4 > MAX_FREQ {
            self.rescale();
        }
        self.next_context();
    }

    /// Found a later symbol of a multi-symbol context.
    pub(super) fn update1(&mut self) {
        let mut s = self.found_state;
        let mc = self.min_context;
        let freq = self.freq(s) + 4;
        self.set_summ_freq(mc, self.summ_freq(mc) + 4);
        self.set_freq(s, freq);
        let prev = s - STATE_SIZE;
        if freq > self.freq(prev) {
            self.swap_states(s, prev);
            s = prev;
            self.found_state = s;
            if freq > MAX_FREQ {
                self.rescale();
            }
        }
        self.next_context();
    }

    /// Found a symbol after one or more escapes.
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

    /// Found the symbol of a binary context.
    pub(super) fn update_bin(&mut self) {
        let s = self.found_state;
        let freq = self.freq(s);
        self.set_freq(s, freq + u32::from(freq < 128));
        self.prev_success = 1;
        self.run_length += 1;
        self.next_context();
    }

    fn next_context(&mut self) {
        let c = self.successor(self.found_state);
        if self.order_fall == 0 && c > self.alloc.text() {
            self.min_context = c;
            self.max_context = c;
        } else {
            self.update_model();
        }
    }

    /// Build the missing higher-order contexts for the found symbol.
    /// Returns 0 when the arena is exhausted.
    fn create_successors(&mut self) -> u32 {
        let mut c = self.min_context;
        let mut up_branch = self.successor(self.found_state);
        let fs_symbol = self.symbol(self.found_state);
        let mut ps = [0u32; MAX_O];
        let mut num_ps = 0usize;

        if self.order_fall != 0 {
            ps[num_ps] = self.found_state;
            num_ps += 1;
        }

        while self.suffix(c) != 0 {
            c = self.suffix(c);
            let s = if self.num_stats(c) != 1 {
                self.find_state(c, fs_symbol)
            } else {
                Self::one_state(c)
            };
            let successor = self.successor(s);
            if successor != up_branch {
                c = successor;
                if num_ps == 0 {
                    return c;
                }
                break;
            }
            if num_ps >= MAX_O {
                return 0;
            }
            ps[num_ps] = s;
            num_ps += 1;
        }

        let new_sym = self.alloc.read_byte(up_branch);
        up_branch += 1;

        let new_freq = if self.num_stats(c) == 1 {
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
                (2 * cf + s0 - 1) / (2 * s0) + 1
            }
        };

        while num_ps != 0 {
            let Some(c1) = self.alloc.alloc_context() else {
                return 0;
            };
            self.set_num_stats(c1, 1);
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

    fn update_model(&mut self) {
        let fs = self.found_state;
        let fs_symbol = self.symbol(fs);
        let fs_freq = self.freq(fs);

        if fs_freq < MAX_FREQ / 4 && self.suffix(self.min_context) != 0 {
            let c = self.suffix(self.min_context);
            if self.num_stats(c) == 1 {
                let s = Self::one_state(c);
                if self.freq(s) < 32 {
                    self.set_freq(s, self.freq(s) + 1);
                }
            } else {
                let mut s = self.stats(c);
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

        if self.order_fall == 0 {
            let c = self.create_successors();
            self.min_context = c;
            self.max_context = c;
            if c == 0 {
                self.restart_model();
                return;
            }
            self.set_successor(self.found_state, c);
            return;
        }

        let text = self.alloc.push_text(fs_symbol);
        if text >= self.alloc.units_start() {
            self.restart_model();
            return;
        }

        let mut max_successor = text;
        let mut min_successor = self.successor(fs);
        if min_successor != 0 {
            if min_successor <= max_successor {
                let cs = self.create_successors();
                if cs == 0 {
                    self.restart_model();
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
        } else {
            self.set_successor(fs, max_successor);
            min_successor = self.min_context;
        }

        let mc = self.min_context;
        let mut c = self.max_context;
        self.min_context = min_successor;
        self.max_context = min_successor;
        if c == mc {
            return;
        }

        let ns = self.num_stats(mc);
        let s0 = self
            .summ_freq(mc)
            .wrapping_sub(ns)
            .wrapping_sub(fs_freq - 1);

        while c != mc {
            let ns1 = self.num_stats(c);
            let mut sum;
            if ns1 != 1 {
                if ns1 & 1 == 0 {
                    let Some(stats) = self.alloc.expand_units(self.stats(c), ns1 >> 1) else {
                        self.restart_model();
                        return;
                    };
                    self.set_stats(c, stats);
                }
                sum = self.summ_freq(c);
                sum += u32::from(2 * ns1 < ns)
                    + 2 * (u32::from(4 * ns1 <= ns) & u32::from(sum <= 8 * ns1));
            } else {
                let Some(s) = self.alloc.alloc_units(0) else {
                    self.restart_model();
                    return;
                };
                let one = Self::one_state(c);
                let mut freq = self.freq(one);
                self.copy_state(s, one);
                self.set_stats(c, s);
                freq = if freq < MAX_FREQ / 4 - 1 {
                    freq << 1
                } else {
                    MAX_FREQ - 4
                };
                self.set_freq(s, freq);
                sum = freq + self.init_esc + u32::from(ns > 3);
            }

            let s = self.stats(c) + ns1 * STATE_SIZE;
            let mut cf = 2 * (sum + 6) * fs_freq;
            let sf = s0 + sum;
            self.alloc.write_byte(s, fs_symbol);
            self.set_successor(s, max_successor);
            self.set_num_stats(c, ns1 + 1);
            if cf < 6 * sf {
                cf = 1 + u32::from(cf > sf) + u32::from(cf >= 4 * sf);
                sum += 3;
            } else {
                cf = 4 + u32::from(cf >= 9 * sf) + u32::from(cf >= 12 * sf) + u32::from(cf >= 15 * sf);
                sum += cf;
            }
            self.set_summ_freq(c, sum);
            self.set_freq(s, cf);
            c = self.suffix(c);
        }
    }

    /// Halve the frequencies of the current context once one overflows.
    fn rescale(&mut self) {
        let mc = self.min_context;
        let stats = self.stats(mc);
        let mut s = self.found_state;

        // Move the found state to the front.
        while s != stats {
            self.swap_states(s, s - STATE_SIZE);
            s -= STATE_SIZE;
        }

        let mut sum_freq = self.freq(s);
        let mut esc_freq = self.summ_freq(mc) - sum_freq;
        let adder = u32::from(self.order_fall != 0);
        sum_freq = (sum_freq + 4 + adder) >> 1;
        self.set_freq(s, sum_freq);

        let num_stats = self.num_stats(mc);
        for _ in 1..num_stats {
            s += STATE_SIZE;
            let mut freq = self.freq(s);
            esc_freq -= freq;
            freq = (freq + adder) >> 1;
            sum_freq += freq;
            self.set_freq(s, freq);
            if freq > self.freq(s - STATE_SIZE) {
                // Keep the array sorted by descending frequency.
                let mut s1 = s;
                let mut tmp = [0u8; STATE_SIZE as usize];
                for (i, byte) in tmp.iter_mut().enumerate() {
                    *byte = self.alloc.read_byte(s + i as u32);
                }
                loop {
                    self.copy_state(s1, s1 - STATE_SIZE);
                    s1 -= STATE_SIZE;
                    if s1 == stats || freq <= self.freq(s1 - STATE_SIZE) {
                        break;
                    }
                }
                for (i, byte) in tmp.iter().enumerate() {
                    self.alloc.write_byte(s1 + i as u32, *byte);
                }
            }
        }

        if self.freq(s) == 0 {
            let mut zeros = 0;
            while self.freq(s) == 0 {
                zeros += 1;
                s -= STATE_SIZE;
            }
            esc_freq += zeros;
            let num_stats_new = num_stats - zeros;
            self.set_num_stats(mc, num_stats_new);
            let n0 = (num_stats + 1) >> 1;

            if num_stats_new == 1 {
                let mut freq = self.freq(stats);
                loop {
                    esc_freq >>= 1;
                    freq = (freq + 1) >> 1;
                    if esc_freq <= 1 {
                        break;
                    }
                }
                let one = Self::one_state(mc);
                self.copy_state(one, stats);
                self.set_freq(one, freq);
                self.found_state = one;
                self.alloc.free_units(stats, n0);
                return;
            }

            let n1 = (num_stats_new + 1) >> 1;
            if n0 != n1 {
                let shrunk = self.alloc.shrink_units(stats, n0, n1);
                self.set_stats(mc, shrunk);
            }
        }

        self.set_summ_freq(mc, sum_freq + esc_freq - (esc_freq >> 1));
        self.found_state = self.stats(mc);
    }

    /// Decode one symbol, leaving the rollback to the caller on starvation.
    fn decode_inner<S: ByteSource>(
        &mut self,
        rc: &mut RangeDecoder,
        src: &mut S,
    ) -> std::result::Result<Step, RangeError> {
        let mc = self.min_context;
        if self.num_stats(mc) != 1 {
            let mut s = self.stats(mc);
            let summ = self.summ_freq(mc);
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
            for _ in 1..self.num_stats(mc) {
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
            self.hi_bits_flag = u32::from(self.hb2flag[self.symbol(self.found_state) as usize]);
            rc.decode(src, hi_cnt, summ - hi_cnt)?;
            self.clear_mask();
            let stats = self.stats(mc);
            for i in 0..self.num_stats(mc) {
                let sym = self.symbol(stats + i * STATE_SIZE);
                self.mask(sym);
            }
        } else {
            let (row, col) = self.bin_summ_index();
            let prob = u32::from(self.bin_summ[row][col]);
            let bit = rc.decode_bit(src, prob)?;
            if bit == 0 {
                self.set_bin_summ(row, col, (prob + INTERVAL - get_mean(prob)) as u16);
                let s = Self::one_state(mc);
                self.found_state = s;
                let symbol = self.symbol(s);
                self.update_bin();
                return Ok(Step::Symbol(symbol));
            }
            let prob = prob - get_mean(prob);
            self.set_bin_summ(row, col, prob as u16);
            self.init_esc = u32::from(EXP_ESCAPE[(prob >> 10) as usize]);
            self.clear_mask();
            let sym = self.symbol(Self::one_state(mc));
            self.mask(sym);
            self.prev_success = 0;
        }

        let mut ps = [0u32; 256];
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
            let num = (self.num_stats(mc) - num_masked) as usize;
            let mut hi_cnt = 0;
            let mut s = self.stats(mc);
            let mut i = 0;
            while i != num {
                let sym = self.symbol(s);
                if !self.is_masked(sym) {
                    hi_cnt += self.freq(s);
                    ps[i] = s;
                    i += 1;
                }
                s += STATE_SIZE;
            }

            let (see, esc_freq) = self.make_esc_freq(num_masked);
            let freq_sum = esc_freq + hi_cnt;
            let count = rc.get_threshold(freq_sum);

            if count < hi_cnt {
                let mut acc = 0;
                let mut k = 0;
                loop {
                    acc += self.freq(ps[k]);
                    if acc > count {
                        break;
                    }
                    k += 1;
                }
                let s = ps[k];
                let freq = self.freq(s);
                rc.decode(src, acc - freq, freq)?;
                self.see_update(see);
                self.found_state = s;
                let symbol = self.symbol(s);
                self.update2();
                return Ok(Step::Symbol(symbol));
            }
            if count >= freq_sum {
                return Ok(Step::DataError);
            }
            rc.decode(src, hi_cnt, freq_sum - hi_cnt)?;
            self.see_add(see, freq_sum);
            for &s in &ps[..num] {
                let sym = self.symbol(s);
                self.mask(sym);
            }
        }
    }
}

/// Mean used by the binary probability updates.
#[inline]
pub(super) fn get_mean(prob: u32) -> u32 {
    (prob + (1 << (PERIOD_BITS - 2))) >> PERIOD_BITS
}

impl SymbolModel for Ppmd7Model {
    type Coder = RangeDecoder;

    const NAME: &'static str = "PPMd7";

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

    fn model() -> Ppmd7Model {
        Ppmd7Model::new(6, 1 << 16).unwrap()
    }

    #[test]
    fn test_root_context_after_restart() {
        let m = model();
        assert_eq!(m.num_stats(m.min_context), 256);
        assert_eq!(m.summ_freq(m.min_context), 257);
        assert_eq!(m.suffix(m.min_context), 0);
        let stats = m.stats(m.min_context);
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
        assert_eq!(&m.ns2index[..10], &[0, 1, 2, 3, 4, 4, 5, 5, 5, 6]);
        assert_eq!(m.ns2bs_index[1], 2);
        assert_eq!(m.ns2bs_index[10], 4);
        assert_eq!(m.ns2bs_index[11], 6);
        assert_eq!(m.hb2flag[0x3F], 0);
        assert_eq!(m.hb2flag[0x40], 8);
        assert_eq!(m.bin_summ[0][0], (BIN_SCALE - 0x3CDD / 2) as u16);
        assert_eq!(m.bin_summ[0][8], m.bin_summ[0][0]);
        assert_eq!(m.see[0][0].summ, 10 << 3);
        assert_eq!(m.see[24][15].summ, 130 << 3);
    }

    #[test]
    fn test_see_mean_and_update() {
        let mut see = See::new(10);
        assert_eq!(see.take_mean(), 10);
        assert_eq!(see.summ, 70);
        for _ in 0..4 {
            see.update();
        }
        assert_eq!(see.shift, 4);
        assert_eq!(see.count, 24);
        assert_eq!(see.summ, 140);
    }

    #[test]
    fn test_starved_symbol_leaves_model_untouched() {
        let mut m = model();
        let mut rc = RangeDecoder::new();
        let header = [0u8, 0x12, 0x34, 0x56, 0x78];
        rc.init(&mut InputWindow::borrowed(&header)).unwrap();

        let before_see = m.see;
        let before_bin = m.bin_summ;
        let before_ctx = m.min_context;
        let before_fall = m.order_fall;

        // Symbol 0x12 narrows the range below 2^24, so it needs a byte.
        let mut empty = InputWindow::borrowed(&[]);
        assert_eq!(m.decode_symbol(&mut rc, &mut empty), Step::NeedMoreInput);
        assert_eq!(m.see, before_see);
        assert_eq!(m.bin_summ, before_bin);
        assert_eq!(m.min_context, before_ctx);
        assert_eq!(m.order_fall, before_fall);
        assert_eq!(m.freq(m.stats(m.min_context) + 0x12 * STATE_SIZE), 1);
    }

    #[test]
    fn test_restart_keeps_escape_seed() {
        let mut m = model();
        m.init_esc = 9;
        m.dummy_see.summ = 77;
        m.restart_model();
        assert_eq!(m.init_esc, 9);
        assert_eq!(m.dummy_see.summ, 77);

        m.restart();
        assert_eq!(m.init_esc, 0);
        assert_eq!(m.dummy_see, See::dummy());
    }
}
