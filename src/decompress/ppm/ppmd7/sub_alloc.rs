//! Sub-allocator for PPMd model memory.
//!
//! One flat arena addressed by `u32` offsets (offset 0 is null). Layout:
//!
//! ```text
//! 0        text ->          units_start   lo_unit ->      <- hi_unit      size
//! |--------- text ---------|---- stats units ----|  gap  |--- contexts ---|
//! ```
//!
//! Text grows up from the start, state arrays are carved from `lo_unit` and
//! contexts from `hi_unit`. Freed blocks go to 38 size-class free lists and are
//! merged by [`SubAllocator::glue_free_blocks`] when allocation gets tight.

use std::collections::TryReserveError;

/// Number of unit size classes.
pub const N_INDEXES: usize = 4 + 4 + 4 + (128 + 3 - 4 - 2 * 4 - 3 * 4) / 4;

/// Unit size in bytes (12 bytes - size of a context).
pub const UNIT_SIZE: u32 = 12;

/// Free-block node layout used while gluing.
const NODE_STAMP: u32 = 0;
const NODE_NU: u32 = 2;
const NODE_NEXT: u32 = 4;

/// Sub-allocator for PPMd contexts and state arrays.
pub struct SubAllocator {
    /// Arena, one spare unit past `size`.
    heap: Vec<u8>,
    /// Usable arena size.
    size: u32,
    /// Next free text byte (grows up).
    text: u32,
    /// Start of the units area.
    units_start: u32,
    /// Low unit pointer (grows up).
    lo_unit: u32,
    /// High unit pointer (grows down).
    hi_unit: u32,
    /// Heads of the free lists for each size class.
    free_list: [u32; N_INDEXES],
    /// Index to number of units mapping.
    index2units: [u8; N_INDEXES],
    /// Number of units (minus one) to index mapping.
    units2index: [u8; 128],
    /// Allocations left before the next glue pass.
    glue_count: u32,
}

impl SubAllocator {
    /// Allocate an arena of `size` bytes.
    pub fn new(size: u32) -> Result<Self, TryReserveError> {
        let total = size as usize + UNIT_SIZE as usize;
        let mut heap = Vec::new();
        heap.try_reserve_exact(total)?;
        heap.resize(total, 0);

        let mut index2units = [0u8; N_INDEXES];
        let mut units2index = [0u8; 128];
        let mut k = 0usize;
        for (i, units) in index2units.iter_mut().enumerate() {
            let step = if i >= 12 { 4 } else { (i >> 2) + 1 };
            for _ in 0..step {
                units2index[k] = i as u8;
                k += 1;
            }
            *units = k as u8;
        }

        let mut sa = Self {
            heap,
            size,
            text: 0,
            units_start: 0,
            lo_unit: 0,
            hi_unit: 0,
            free_list: [0; N_INDEXES],
            index2units,
            units2index,
            glue_count: 0,
        };
        sa.restart();
        Ok(sa)
    }

    /// Forget every allocation.
    pub fn restart(&mut self) {
        self.free_list = [0; N_INDEXES];
        self.text = 0;
        self.hi_unit = self.size;
        self.units_start = self.hi_unit - self.size / 8 / UNIT_SIZE * 7 * UNIT_SIZE;
        self.lo_unit = self.units_start;
        self.glue_count = 0;
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Units in size class `indx`.
    #[inline]
    pub fn i2u(&self, indx: usize) -> u32 {
        u32::from(self.index2units[indx])
    }

    /// Size class holding `nu` units (`1..=128`).
    #[inline]
    pub fn u2i(&self, nu: u32) -> usize {
        self.units2index[nu as usize - 1] as usize
    }

    #[inline]
    pub fn text(&self) -> u32 {
        self.text
    }

    #[inline]
    pub fn set_text(&mut self, text: u32) {
        self.text = text;
    }

    #[inline]
    pub fn units_start(&self) -> u32 {
        self.units_start
    }

    /// Append one byte to the text area. Returns the new text pointer.
    #[inline]
    pub fn push_text(&mut self, byte: u8) -> u32 {
        self.write_byte(self.text, byte);
        self.text += 1;
        self.text
    }

    /// Carve `nu` units off the low end of the gap. Used once per restart
    /// for the root state array.
    pub fn take_lo_units(&mut self, nu: u32) -> u32 {
        let ptr = self.lo_unit;
        self.lo_unit += nu * UNIT_SIZE;
        ptr
    }

    /// Carve one unit off the high end of the gap. Used once per restart for
    /// the root context.
    pub fn take_hi_unit(&mut self) -> u32 {
        self.hi_unit -= UNIT_SIZE;
        self.hi_unit
    }

    /// Allocate a context (1 unit).
    pub fn alloc_context(&mut self) -> Option<u32> {
        if self.hi_unit != self.lo_unit {
            self.hi_unit -= UNIT_SIZE;
            return Some(self.hi_unit);
        }
        if self.free_list[0] != 0 {
            return Some(self.remove_node(0));
        }
        self.alloc_units_rare(0)
    }

    /// Allocate a block of size class `indx`.
    pub fn alloc_units(&mut self, indx: usize) -> Option<u32> {
        if self.free_list[indx] != 0 {
            return Some(self.remove_node(indx));
        }
        let bytes = self.i2u(indx) * UNIT_SIZE;
        if self.hi_unit - self.lo_unit >= bytes {
            let ptr = self.lo_unit;
            self.lo_unit += bytes;
            return Some(ptr);
        }
        self.alloc_units_rare(indx)
    }

    /// Allocate from the rare path: glue, then larger lists, then the text tail.
    fn alloc_units_rare(&mut self, indx: usize) -> Option<u32> {
        if self.glue_count == 0 {
            self.glue_free_blocks();
            if self.free_list[indx] != 0 {
                return Some(self.remove_node(indx));
            }
        }

        let mut i = indx;
        loop {
            i += 1;
            if i == N_INDEXES {
                let bytes = self.i2u(indx) * UNIT_SIZE;
                self.glue_count = self.glue_count.wrapping_sub(1);
                if self.units_start - self.text > bytes {
                    self.units_start -= bytes;
                    return Some(self.units_start);
                }
                return None;
            }
            if self.free_list[i] != 0 {
                break;
            }
        }

        let block = self.remove_node(i);
        self.split_block(block, i, indx);
        Some(block)
    }

    /// Pop the head of free list `indx`.
    fn remove_node(&mut self, indx: usize) -> u32 {
        let node = self.free_list[indx];
        self.free_list[indx] = self.read_u32(node);
        node
    }

    /// Push `node` onto free list `indx`.
    pub fn insert_node(&mut self, node: u32, indx: usize) {
        self.write_u32(node, self.free_list[indx]);
        self.free_list[indx] = node;
    }

    /// Return the tail of a block of class `old_indx` beyond class `new_indx`
    /// to the free lists.
    fn split_block(&mut self, ptr: u32, old_indx: usize, new_indx: usize) {
        let nu = self.i2u(old_indx) - self.i2u(new_indx);
        let ptr = ptr + self.i2u(new_indx) * UNIT_SIZE;
        self.insert_split(ptr, nu);
    }

    /// File `nu` free units at `ptr` under the closest size classes.
    fn insert_split(&mut self, ptr: u32, nu: u32) {
        let mut i = self.u2i(nu);
        if self.i2u(i) != nu {
            i -= 1;
            let k = self.i2u(i);
            self.insert_node(ptr + k * UNIT_SIZE, (nu - k - 1) as usize);
        }
        self.insert_node(ptr, i);
    }

    /// Merge physically adjacent free blocks and refile them.
    ///
    /// Merge and refill walk the node list in the same order: a block that
    /// was swallowed by a later node is skipped before that node reuses its
    /// memory.
    pub fn glue_free_blocks(&mut self) {
        self.glue_count = 255;

        // Stop merges at the start of the gap.
        if self.lo_unit != self.hi_unit {
            self.write_u16(self.lo_unit + NODE_STAMP, 1);
        }
        // And at the spare unit past the arena.
        self.write_u16(self.size + NODE_STAMP, 1);

        // Collect every free block into one list, stamped with its size.
        let mut n = 0u32;
        for i in 0..N_INDEXES {
            let nu = self.index2units[i] as u16;
            let mut next = self.free_list[i];
            self.free_list[i] = 0;
            while next != 0 {
                let node = next;
                next = self.read_u32(node);
                self.write_u16(node + NODE_STAMP, 0);
                self.write_u16(node + NODE_NU, nu);
                self.write_u32(node + NODE_NEXT, n);
                n = node;
            }
        }
        let mut head = n;

        // Glue.
        let mut prev: Option<u32> = None;
        while n != 0 {
            let node = n;
            let mut nu = u32::from(self.read_u16(node + NODE_NU));
            n = self.read_u32(node + NODE_NEXT);
            if nu == 0 {
                match prev {
                    None => head = n,
                    Some(p) => self.write_u32(p + NODE_NEXT, n),
                }
                continue;
            }
            prev = Some(node);
            loop {
                let node2 = node + nu * UNIT_SIZE;
                if node2 as usize + 4 > self.heap.len() {
                    break;
                }
                nu += u32::from(self.read_u16(node2 + NODE_NU));
                if self.read_u16(node2 + NODE_STAMP) != 0 || nu >= 0x10000 {
                    break;
                }
                self.write_u16(node + NODE_NU, nu as u16);
                self.write_u16(node2 + NODE_NU, 0);
            }
        }

        // Fill lists.
        n = head;
        while n != 0 {
            let mut node = n;
            let mut nu = u32::from(self.read_u16(node + NODE_NU));
            n = self.read_u32(node + NODE_NEXT);
            if nu == 0 {
                continue;
            }
            while nu > 128 {
                self.insert_node(node, N_INDEXES - 1);
                nu -= 128;
                node += 128 * UNIT_SIZE;
            }
            self.insert_split(node, nu);
        }
    }

    /// Grow a state array of `old_nu` units by one unit, moving it when the
    /// size class changes. `None` when the arena is exhausted.
    pub fn expand_units(&mut self, old_ptr: u32, old_nu: u32) -> Option<u32> {
        let i0 = self.u2i(old_nu);
        let i1 = self.u2i(old_nu + 1);
        if i0 == i1 {
            return Some(old_ptr);
        }
        let ptr = self.alloc_units(i1)?;
        self.copy_units(ptr, old_ptr, old_nu);
        self.insert_node(old_ptr, i0);
        Some(ptr)
    }

    /// Shrink a block from `old_nu` to `new_nu` units.
    pub fn shrink_units(&mut self, old_ptr: u32, old_nu: u32, new_nu: u32) -> u32 {
        let i0 = self.u2i(old_nu);
        let i1 = self.u2i(new_nu);
        if i0 == i1 {
            return old_ptr;
        }
        if self.free_list[i1] != 0 {
            let ptr = self.remove_node(i1);
            self.copy_units(ptr, old_ptr, new_nu);
            self.insert_node(old_ptr, i0);
            return ptr;
        }
        self.split_block(old_ptr, i0, i1);
        old_ptr
    }

    /// Release a block of `nu` units.
    pub fn free_units(&mut self, ptr: u32, nu: u32) {
        let indx = self.u2i(nu);
        self.insert_node(ptr, indx);
    }

    fn copy_units(&mut self, dst: u32, src: u32, nu: u32) {
        let src = src as usize;
        let len = (nu * UNIT_SIZE) as usize;
        self.heap.copy_within(src..src + len, dst as usize);
    }

    #[inline]
    pub fn read_byte(&self, offset: u32) -> u8 {
        self.heap[offset as usize]
    }

    #[inline]
    pub fn write_byte(&mut self, offset: u32, val: u8) {
        self.heap[offset as usize] = val;
    }

    #[inline]
    pub fn read_u16(&self, offset: u32) -> u16 {
        let o = offset as usize;
        u16::from_le_bytes([self.heap[o], self.heap[o + 1]])
    }

    #[inline]
    pub fn write_u16(&mut self, offset: u32, val: u16) {
        let o = offset as usize;
        self.heap[o..o + 2].copy_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn read_u32(&self, offset: u32) -> u32 {
        let o = offset as usize;
        u32::from_le_bytes([
            self.heap[o],
            self.heap[o + 1],
            self.heap[o + 2],
            self.heap[o + 3],
        ])
    }

    #[inline]
    pub fn write_u32(&mut self, offset: u32, val: u32) {
        let o = offset as usize;
        self.heap[o..o + 4].copy_from_slice(&val.to_le_bytes());
    }

    /// Copy `len` bytes inside the arena.
    #[inline]
    pub fn copy_bytes(&mut self, dst: u32, src: u32, len: u32) {
        let src = src as usize;
        self.heap
            .copy_within(src..src + len as usize, dst as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_tables() {
        let sa = SubAllocator::new(1 << 16).unwrap();
        assert_eq!(N_INDEXES, 38);
        let units: Vec<u32> = (0..12).map(|i| sa.i2u(i)).collect();
        assert_eq!(units, [1, 2, 3, 4, 6, 8, 10, 12, 15, 18, 21, 24]);
        assert_eq!(sa.i2u(N_INDEXES - 1), 128);
        for nu in 1..=128 {
            assert!(sa.i2u(sa.u2i(nu)) >= nu);
        }
        assert_eq!(sa.u2i(5), 4);
    }

    #[test]
    fn test_layout_after_restart() {
        let sa = SubAllocator::new(2048).unwrap();
        assert_eq!(sa.text(), 0);
        assert_eq!(sa.units_start(), 2048 - 2048 / 8 / 12 * 7 * 12);
        assert_eq!(sa.hi_unit, 2048);
        assert_eq!(sa.lo_unit, sa.units_start());
    }

    #[test]
    fn test_free_then_reuse() {
        let mut sa = SubAllocator::new(1 << 16).unwrap();
        let a = sa.alloc_units(1).unwrap();
        let b = sa.alloc_units(1).unwrap();
        assert_eq!(b, a + 2 * UNIT_SIZE);
        sa.free_units(a, 2);
        assert_eq!(sa.alloc_units(1), Some(a));
    }

    #[test]
    fn test_contexts_come_from_the_top() {
        let mut sa = SubAllocator::new(1 << 16).unwrap();
        let c1 = sa.alloc_context().unwrap();
        let c2 = sa.alloc_context().unwrap();
        assert_eq!(c1, (1 << 16) - UNIT_SIZE);
        assert_eq!(c2, c1 - UNIT_SIZE);
    }

    #[test]
    fn test_split_larger_block() {
        let mut sa = SubAllocator::new(1 << 16).unwrap();
        // Fill the gap so the next small allocation must split.
        let big = sa.alloc_units(N_INDEXES - 1).unwrap();
        sa.lo_unit = sa.hi_unit;
        sa.free_units(big, 128);
        sa.glue_count = 1;
        let small = sa.alloc_units(0).unwrap();
        assert_eq!(small, big);
        // The 127-unit remainder is filed as 124 + 3.
        assert_ne!(sa.free_list[sa.u2i(124)], 0);
        assert_ne!(sa.free_list[2], 0);
    }

    #[test]
    fn test_glue_merges_neighbours() {
        let mut sa = SubAllocator::new(1 << 16).unwrap();
        let a = sa.alloc_units(0).unwrap();
        let b = sa.alloc_units(0).unwrap();
        let c = sa.alloc_units(1).unwrap();
        assert_eq!(b, a + UNIT_SIZE);
        assert_eq!(c, b + UNIT_SIZE);
        sa.free_units(a, 1);
        sa.free_units(b, 1);
        sa.free_units(c, 2);
        sa.glue_free_blocks();
        assert_eq!(sa.free_list[0], 0);
        assert_eq!(sa.free_list[1], 0);
        // 1 + 1 + 2 units become one 4-unit block.
        assert_eq!(sa.free_list[3], a);
    }

    #[test]
    fn test_expand_and_shrink() {
        let mut sa = SubAllocator::new(1 << 16).unwrap();
        let p = sa.alloc_units(1).unwrap();
        sa.write_u32(p, 0xDEAD_BEEF);
        // 2 -> 3 units changes class, so the data moves.
        let q = sa.expand_units(p, 2).unwrap();
        assert_ne!(p, q);
        assert_eq!(sa.read_u32(q), 0xDEAD_BEEF);
        // 3 -> 1 unit splits in place when nothing is free at class 0.
        sa.free_list[0] = 0;
        assert_eq!(sa.shrink_units(q, 3, 1), q);
    }

    #[test]
    fn test_text_tail_allocation() {
        let mut sa = SubAllocator::new(2048).unwrap();
        sa.lo_unit = sa.hi_unit;
        sa.glue_count = 1;
        let start = sa.units_start();
        let p = sa.alloc_units(0).unwrap();
        assert_eq!(p, start - UNIT_SIZE);
        assert_eq!(sa.units_start(), p);
    }
}
