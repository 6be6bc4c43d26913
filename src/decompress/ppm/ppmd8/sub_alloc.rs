//! Sub-allocator for the PPMd var.I model.
//!
//! Same arena layout as var.H (text growing up from 0, state arrays from
//! `lo_unit`, contexts from `hi_unit`), with two additions the model's
//! memory-pressure handling relies on:
//!
//! - every free block carries a full header, and `stamps` counts the blocks
//!   on each free list, so [`SubAllocator::used_memory`] is exact;
//! - free blocks sitting right above the text can be handed back to it
//!   ([`SubAllocator::expand_text_area`]).
//!
//! ```text
//! free block: +--------------+-------------+-------------+
//!             | stamp (!0)   | next        | nu          |
//!             +--------------+-------------+-------------+
//! ```

use std::collections::TryReserveError;

/// Number of unit size classes.
pub const N_INDEXES: usize = 4 + 4 + 4 + (128 + 3 - 4 - 2 * 4 - 3 * 4) / 4;

/// Unit size in bytes.
pub const UNIT_SIZE: u32 = 12;

/// Stamp of a block on a free list.
const EMPTY_NODE: u32 = 0xFFFF_FFFF;

const NODE_STAMP: u32 = 0;
const NODE_NEXT: u32 = 4;
const NODE_NU: u32 = 8;

pub struct SubAllocator {
    /// Arena, one spare unit past `size`.
    heap: Vec<u8>,
    size: u32,
    text: u32,
    units_start: u32,
    lo_unit: u32,
    hi_unit: u32,
    free_list: [u32; N_INDEXES],
    /// Blocks currently on each free list.
    stamps: [u32; N_INDEXES],
    index2units: [u8; N_INDEXES],
    units2index: [u8; 128],
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
            stamps: [0; N_INDEXES],
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
        self.stamps = [0; N_INDEXES];
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

    #[inline]
    pub fn i2u(&self, indx: usize) -> u32 {
        u32::from(self.index2units[indx])
    }

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

    pub fn take_lo_units(&mut self, nu: u32) -> u32 {
        let ptr = self.lo_unit;
        self.lo_unit += nu * UNIT_SIZE;
        ptr
    }

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

    /// Head of free list `indx`, 0 when empty.
    #[inline]
    pub fn free_list_head(&self, indx: usize) -> u32 {
        self.free_list[indx]
    }

    /// Pop the head of free list `indx`.
    pub fn remove_node(&mut self, indx: usize) -> u32 {
        let node = self.free_list[indx];
        self.free_list[indx] = self.read_u32(node + NODE_NEXT);
        self.stamps[indx] = self.stamps[indx].wrapping_sub(1);
        node
    }

    /// Push `node` onto free list `indx`.
    pub fn insert_node(&mut self, node: u32, indx: usize) {
        self.write_u32(node + NODE_STAMP, EMPTY_NODE);
        self.write_u32(node + NODE_NEXT, self.free_list[indx]);
        self.write_u32(node + NODE_NU, self.i2u(indx));
        self.free_list[indx] = node;
        self.stamps[indx] = self.stamps[indx].wrapping_add(1);
    }

    fn split_block(&mut self, ptr: u32, old_indx: usize, new_indx: usize) {
        let nu = self.i2u(old_indx) - self.i2u(new_indx);
        let ptr = ptr + self.i2u(new_indx) * UNIT_SIZE;
        self.insert_split(ptr, nu);
    }

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
    /// A block swallowed by a neighbour gets `nu == 0`. It either precedes
    /// its new owner on the collected list, or is dropped from the list when
    /// reached, so the refill never sees it after its memory is reused.
    pub fn glue_free_blocks(&mut self) {
        self.glue_count = 1 << 13;
        self.stamps = [0; N_INDEXES];

        if self.lo_unit != self.hi_unit {
            self.write_u32(self.lo_unit + NODE_STAMP, 0);
        }

        let mut head = 0u32;
        let mut prev: Option<u32> = None;
        for i in 0..N_INDEXES {
            let mut next = self.free_list[i];
            self.free_list[i] = 0;
            while next != 0 {
                let node = next;
                let mut nu = self.read_u32(node + NODE_NU);
                self.link_after(prev, &mut head, node);
                next = self.read_u32(node + NODE_NEXT);
                if nu == 0 {
                    continue;
                }
                prev = Some(node);
                loop {
                    let node2 = node + nu * UNIT_SIZE;
                    if node2 as usize + UNIT_SIZE as usize > self.heap.len()
                        || self.read_u32(node2 + NODE_STAMP) != EMPTY_NODE
                    {
                        break;
                    }
                    let nu2 = self.read_u32(node2 + NODE_NU);
                    if nu2 == 0 {
                        break;
                    }
                    nu += nu2;
                    self.write_u32(node2 + NODE_NU, 0);
                    self.write_u32(node + NODE_NU, nu);
                }
            }
        }
        self.link_after(prev, &mut head, 0);

        let mut n = head;
        while n != 0 {
            let mut node = n;
            let mut nu = self.read_u32(node + NODE_NU);
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

    /// Point `prev` (or the list head) at `node`.
    fn link_after(&mut self, prev: Option<u32>, head: &mut u32, node: u32) {
        match prev {
            None => *head = node,
            Some(p) => self.write_u32(p + NODE_NEXT, node),
        }
    }

    /// Grow a state array of `old_nu` units by one unit, moving it when the
    /// size class changes.
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

    pub fn free_units(&mut self, ptr: u32, nu: u32) {
        let indx = self.u2i(nu);
        self.insert_node(ptr, indx);
    }

    /// Release one unit, giving it straight back to the text gap when it
    /// sits at `units_start`.
    pub fn special_free_unit(&mut self, ptr: u32) {
        if ptr != self.units_start {
            self.insert_node(ptr, 0);
        } else {
            self.units_start += UNIT_SIZE;
        }
    }

    /// Move an `nu`-unit block into the head of its free list, releasing the
    /// old one. The cut-off pass uses this to pack state arrays downwards.
    pub fn move_units_to_free(&mut self, old_ptr: u32, nu: u32) -> u32 {
        let indx = self.u2i(nu);
        let ptr = self.remove_node(indx);
        self.copy_units(ptr, old_ptr, nu);
        if old_ptr != self.units_start {
            self.insert_node(old_ptr, indx);
        } else {
            self.units_start += self.i2u(indx) * UNIT_SIZE;
        }
        ptr
    }

    /// Pull free blocks directly above the text back into the text area.
    pub fn expand_text_area(&mut self) {
        let mut count = [0u32; N_INDEXES];

        if self.lo_unit != self.hi_unit {
            self.write_u32(self.lo_unit + NODE_STAMP, 0);
        }

        let mut node = self.units_start;
        while (node as usize) + (UNIT_SIZE as usize) <= self.heap.len()
            && self.read_u32(node + NODE_STAMP) == EMPTY_NODE
        {
            let nu = self.read_u32(node + NODE_NU);
            if nu == 0 {
                break;
            }
            self.write_u32(node + NODE_STAMP, 0);
            count[self.u2i(nu)] += 1;
            node += nu * UNIT_SIZE;
        }
        self.units_start = node;

        for (i, &released) in count.iter().enumerate() {
            if released == 0 {
                continue;
            }
            self.stamps[i] = self.stamps[i].wrapping_sub(released);
            let mut left = released;
            let mut prev: Option<u32> = None;
            let mut n = self.free_list[i];
            while n != 0 {
                let node = n;
                n = self.read_u32(node + NODE_NEXT);
                if self.read_u32(node + NODE_STAMP) != 0 {
                    prev = Some(node);
                    continue;
                }
                match prev {
                    None => self.free_list[i] = n,
                    Some(p) => self.write_u32(p + NODE_NEXT, n),
                }
                left -= 1;
                if left == 0 {
                    break;
                }
            }
        }
    }

    /// Force a glue pass on the next allocation miss.
    pub fn reset_glue_count(&mut self) {
        self.glue_count = 0;
    }

    /// Bytes held by live contexts, state arrays and text.
    pub fn used_memory(&self) -> u32 {
        let free_units = self
            .stamps
            .iter()
            .zip(self.index2units.iter())
            .fold(0u32, |acc, (&n, &nu)| acc.wrapping_add(n.wrapping_mul(u32::from(nu))));
        self.size
            .wrapping_sub(self.hi_unit - self.lo_unit)
            .wrapping_sub(self.units_start - self.text)
            .wrapping_sub(free_units.wrapping_mul(UNIT_SIZE))
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
    fn test_stamps_track_free_lists() {
        let mut sa = SubAllocator::new(1 << 16).unwrap();
        let a = sa.alloc_units(0).unwrap();
        let b = sa.alloc_units(2).unwrap();
        sa.free_units(a, 1);
        sa.free_units(b, 3);
        assert_eq!(sa.stamps[0], 1);
        assert_eq!(sa.stamps[2], 1);
        assert_eq!(sa.alloc_units(0), Some(a));
        assert_eq!(sa.stamps[0], 0);
    }

    #[test]
    fn test_used_memory_counts_live_blocks() {
        let mut sa = SubAllocator::new(1 << 16).unwrap();
        assert_eq!(sa.used_memory(), 0);
        let a = sa.alloc_units(1).unwrap();
        let _c = sa.alloc_context().unwrap();
        sa.push_text(b'x');
        assert_eq!(sa.used_memory(), 3 * UNIT_SIZE + 1);
        sa.free_units(a, 2);
        assert_eq!(sa.used_memory(), UNIT_SIZE + 1);
    }

    #[test]
    fn test_glue_merges_neighbours() {
        let mut sa = SubAllocator::new(1 << 16).unwrap();
        let a = sa.alloc_units(0).unwrap();
        let b = sa.alloc_units(0).unwrap();
        let c = sa.alloc_units(1).unwrap();
        sa.free_units(c, 2);
        sa.free_units(b, 1);
        sa.free_units(a, 1);
        sa.glue_free_blocks();
        assert_eq!(sa.free_list[0], 0);
        assert_eq!(sa.free_list[1], 0);
        assert_eq!(sa.free_list[3], a);
        assert_eq!(sa.stamps[3], 1);
        assert_eq!(sa.glue_count, 1 << 13);
    }

    #[test]
    fn test_special_free_unit_at_units_start() {
        let mut sa = SubAllocator::new(2048).unwrap();
        sa.lo_unit = sa.hi_unit;
        sa.glue_count = 1;
        let start = sa.units_start();
        let p = sa.alloc_units(0).unwrap();
        assert_eq!(p, start - UNIT_SIZE);
        sa.special_free_unit(p);
        assert_eq!(sa.units_start(), start);
        assert_eq!(sa.free_list[0], 0);
    }

    #[test]
    fn test_expand_text_area_reclaims_leading_blocks() {
        let mut sa = SubAllocator::new(1 << 16).unwrap();
        let start = sa.units_start();
        let a = sa.alloc_units(0).unwrap();
        let b = sa.alloc_units(1).unwrap();
        let keep = sa.alloc_units(0).unwrap();
        assert_eq!(a, start);
        sa.free_units(a, 1);
        sa.free_units(b, 2);
        sa.expand_text_area();
        assert_eq!(sa.units_start(), keep);
        assert_eq!(sa.free_list[0], 0);
        assert_eq!(sa.free_list[1], 0);
        assert_eq!(sa.stamps[0], 0);
        assert_eq!(sa.stamps[1], 0);
    }
}
