//! A single code cache segment
//!
//! Warm code is carved from the low end and grows upward, cold code from the
//! high end and grows downward. The segment is full when the two cursors
//! meet. Freed blocks are kept on a free list and reused first-fit before
//! either cursor moves.

use jit_core::StartPc;

/// Alignment of every block handed out.
pub const CODE_ALIGNMENT: usize = 16;

fn align_up(size: usize) -> usize {
    size.div_ceil(CODE_ALIGNMENT) * CODE_ALIGNMENT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    offset: usize,
    size: usize,
}

/// Memory handed out for one compiled body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeAllocation {
    pub cache_id: usize,
    pub warm_start: StartPc,
    pub warm_size: usize,
    pub cold_start: Option<StartPc>,
    pub cold_size: usize,
}

impl CodeAllocation {
    pub fn total_size(&self) -> usize {
        self.warm_size + self.cold_size
    }
}

#[derive(Debug)]
pub struct CodeCache {
    id: usize,
    base: u64,
    size: usize,
    warm_cursor: usize,
    cold_cursor: usize,
    free_list: Vec<FreeBlock>,
    used: usize,
    reserved: bool,
}

impl CodeCache {
    pub fn new(id: usize, base: u64, size: usize) -> Self {
        Self {
            id,
            base,
            size,
            warm_cursor: 0,
            cold_cursor: size,
            free_list: Vec::new(),
            used: 0,
            reserved: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Bytes still available, including recycled blocks.
    pub fn free_bytes(&self) -> usize {
        self.size - self.used
    }

    /// Gap between the warm and cold cursors.
    pub fn gap_bytes(&self) -> usize {
        self.cold_cursor - self.warm_cursor
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub(crate) fn set_reserved(&mut self, reserved: bool) {
        self.reserved = reserved;
    }

    pub fn contains(&self, pc: StartPc) -> bool {
        pc.0 >= self.base && pc.0 < self.base + self.size as u64
    }

    fn take_free_block(&mut self, size: usize) -> Option<usize> {
        let index = self.free_list.iter().position(|b| b.size >= size)?;
        let block = self.free_list[index];
        if block.size == size {
            self.free_list.remove(index);
        } else {
            self.free_list[index] = FreeBlock {
                offset: block.offset + size,
                size: block.size - size,
            };
        }
        Some(block.offset)
    }

    fn can_fit(&self, warm: usize, cold: usize) -> bool {
        let mut scratch = self.free_list.clone();
        let mut need_gap = 0;
        for request in [warm, cold] {
            if request == 0 {
                continue;
            }
            if let Some(index) = scratch.iter().position(|b| b.size >= request) {
                scratch[index].size -= request;
                scratch[index].offset += request;
            } else {
                need_gap += request;
            }
        }
        need_gap <= self.gap_bytes()
    }

    /// Allocate a body with `warm` bytes of mainline code and `cold` bytes of
    /// out-of-line code. Nothing is allocated if either part does not fit.
    pub fn allocate(&mut self, warm: usize, cold: usize) -> Option<CodeAllocation> {
        let warm = align_up(warm.max(1));
        let cold = align_up(cold);
        if !self.can_fit(warm, cold) {
            return None;
        }

        let warm_offset = match self.take_free_block(warm) {
            Some(offset) => offset,
            None => {
                let offset = self.warm_cursor;
                self.warm_cursor += warm;
                offset
            }
        };
        let cold_offset = if cold == 0 {
            None
        } else {
            Some(match self.take_free_block(cold) {
                Some(offset) => offset,
                None => {
                    self.cold_cursor -= cold;
                    self.cold_cursor
                }
            })
        };
        self.used += warm + cold;

        Some(CodeAllocation {
            cache_id: self.id,
            warm_start: StartPc(self.base + warm_offset as u64),
            warm_size: warm,
            cold_start: cold_offset.map(|o| StartPc(self.base + o as u64)),
            cold_size: cold,
        })
    }

    /// Return a body's memory to the cache.
    pub fn free(&mut self, allocation: &CodeAllocation) {
        debug_assert_eq!(allocation.cache_id, self.id);
        self.release(allocation.warm_start, allocation.warm_size);
        if let Some(cold) = allocation.cold_start {
            self.release(cold, allocation.cold_size);
        }
        self.used = self.used.saturating_sub(allocation.total_size());
    }

    fn release(&mut self, start: StartPc, size: usize) {
        let offset = (start.0 - self.base) as usize;
        if offset + size == self.warm_cursor {
            self.warm_cursor = offset;
        } else if offset == self.cold_cursor {
            self.cold_cursor += size;
        } else {
            self.free_list.push(FreeBlock { offset, size });
        }
        self.coalesce();
    }

    fn coalesce(&mut self) {
        self.free_list.sort_by_key(|b| b.offset);
        let mut merged: Vec<FreeBlock> = Vec::with_capacity(self.free_list.len());
        for block in self.free_list.drain(..) {
            match merged.last_mut() {
                Some(last) if last.offset + last.size == block.offset => last.size += block.size,
                _ => merged.push(block),
            }
        }
        // Blocks adjacent to a cursor go back to the gap.
        while let Some(last) = merged.last() {
            if last.offset + last.size == self.warm_cursor {
                self.warm_cursor = last.offset;
                merged.pop();
            } else {
                break;
            }
        }
        while let Some(first) = merged.first() {
            if first.offset == self.cold_cursor {
                self.cold_cursor += first.size;
                merged.remove(0);
            } else {
                break;
            }
        }
        self.free_list = merged;
    }
}
