//! # Kernel Heap
//!
//! A fixed region carved into blocks, each preceded by a 16-byte header:
//!
//! ```text
//!   offset  0: magic         (USED or FREE)
//!   offset  4: block size    (header included, multiple of ALIGN)
//!   offset  8: request size  (bytes asked for by the caller)
//!   offset 12: next free     (offset of the next free block, or NIL)
//! ```
//!
//! Blocks tile `[0, top)` with no gaps. Requests are served first-fit from an
//! address-ordered free list, splitting when the remainder can hold a minimal
//! block, and otherwise by bumping `top`. Freeing zeroes the block, merges it
//! with free neighbours and pulls `top` back down when the block touches it,
//! so allocating and then freeing the same block restores the region byte
//! for byte.

use core::ptr::NonNull;

use crate::config::HEAP_SIZE;
use crate::error::{Error, Fault, Result};
use crate::fault;
use crate::sync::GateCell;

/// Alignment of every block and of every pointer handed out.
pub const ALIGN: usize = 8;

/// Bytes of header in front of each block.
pub const HEADER_SIZE: usize = 16;

const MIN_BLOCK: usize = HEADER_SIZE + ALIGN;
const MAGIC_USED: u32 = 0xA110_C8ED;
const MAGIC_FREE: u32 = 0xF4EE_B10C;
const NIL: u32 = u32::MAX;

const OFF_MAGIC: usize = 0;
const OFF_SIZE: usize = 4;
const OFF_REQUEST: usize = 8;
const OFF_NEXT: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The block is inside the region but not currently allocated.
    DoubleFree,
    /// The pointer was never issued by this region.
    Foreign,
}

#[repr(C, align(8))]
struct Region<const N: usize>([u8; N]);

pub struct Allocator<const N: usize> {
    region: Region<N>,
    top: usize,
    free_head: u32,
}

const fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

impl<const N: usize> Allocator<N> {
    pub const fn new() -> Self {
        Allocator {
            region: Region([0; N]),
            top: 0,
            free_head: NIL,
        }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Bytes between the start of the region and the bump pointer.
    pub fn top(&self) -> usize {
        self.top
    }

    /// Every byte of the allocator, for comparing states.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> (Vec<u8>, usize, u32) {
        (self.region.0.to_vec(), self.top, self.free_head)
    }

    fn read(&self, block: usize, field: usize) -> u32 {
        let at = block + field;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.region.0[at..at + 4]);
        u32::from_ne_bytes(word)
    }

    fn write(&mut self, block: usize, field: usize, value: u32) {
        let at = block + field;
        self.region.0[at..at + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn next_free(&self, block: usize) -> Option<usize> {
        match self.read(block, OFF_NEXT) {
            NIL => None,
            next => Some(next as usize),
        }
    }

    fn link(&mut self, prev: Option<usize>, next: Option<usize>) {
        let raw = next.map_or(NIL, |n| n as u32);
        match prev {
            Some(p) => self.write(p, OFF_NEXT, raw),
            None => self.free_head = raw,
        }
    }

    fn block_size_for(size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let need = align_up(size.checked_add(HEADER_SIZE)?);
        (need <= N).then_some(need)
    }

    /// First free block that fits, with its predecessor in the free list.
    fn find_fit(&self, need: usize) -> Option<(Option<usize>, usize)> {
        let mut prev = None;
        let mut cursor = match self.free_head {
            NIL => None,
            head => Some(head as usize),
        };
        while let Some(block) = cursor {
            if self.read(block, OFF_SIZE) as usize >= need {
                return Some((prev, block));
            }
            prev = Some(block);
            cursor = self.next_free(block);
        }
        None
    }

    /// Whether `alloc(size)` would succeed right now.
    pub fn can_alloc(&self, size: usize) -> bool {
        match Self::block_size_for(size) {
            Some(need) => self.find_fit(need).is_some() || self.top + need <= N,
            None => false,
        }
    }

    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let need = Self::block_size_for(size)?;
        let block = match self.find_fit(need) {
            Some((prev, block)) => {
                let have = self.read(block, OFF_SIZE) as usize;
                let next = self.next_free(block);
                if have - need >= MIN_BLOCK {
                    let rest = block + need;
                    self.write(rest, OFF_MAGIC, MAGIC_FREE);
                    self.write(rest, OFF_SIZE, (have - need) as u32);
                    self.write(rest, OFF_REQUEST, 0);
                    self.write(rest, OFF_NEXT, next.map_or(NIL, |n| n as u32));
                    self.link(prev, Some(rest));
                    self.write(block, OFF_SIZE, need as u32);
                } else {
                    self.link(prev, next);
                }
                block
            }
            None => {
                if self.top + need > N {
                    return None;
                }
                let block = self.top;
                self.top += need;
                self.write(block, OFF_SIZE, need as u32);
                block
            }
        };
        self.write(block, OFF_MAGIC, MAGIC_USED);
        self.write(block, OFF_REQUEST, size as u32);
        self.write(block, OFF_NEXT, NIL);
        NonNull::new(self.region.0[block + HEADER_SIZE..].as_mut_ptr())
    }

    fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let base = self.region.0.as_ptr() as usize;
        let addr = ptr as usize;
        if addr < base + HEADER_SIZE || addr >= base + N {
            return None;
        }
        let payload = addr - base;
        (payload % ALIGN == 0).then_some(payload - HEADER_SIZE)
    }

    /// Header offset of the live block whose payload starts at `ptr`.
    fn live_block(&self, ptr: *const u8) -> core::result::Result<usize, AllocError> {
        let target = self.offset_of(ptr).ok_or(AllocError::Foreign)?;
        let mut block = 0;
        while block < self.top {
            let size = self.read(block, OFF_SIZE) as usize;
            if size < MIN_BLOCK {
                break;
            }
            if block == target {
                return match self.read(block, OFF_MAGIC) {
                    MAGIC_USED => Ok(block),
                    _ => Err(AllocError::DoubleFree),
                };
            }
            if block > target {
                break;
            }
            block += size;
        }
        Err(AllocError::DoubleFree)
    }

    pub fn is_alloc(&self, ptr: *const u8) -> bool {
        self.live_block(ptr).is_ok()
    }

    /// Size originally requested for the block at `ptr`.
    pub fn alloc_size(&self, ptr: *const u8) -> Option<usize> {
        let block = self.live_block(ptr).ok()?;
        Some(self.read(block, OFF_REQUEST) as usize)
    }

    pub fn free(&mut self, ptr: NonNull<u8>) -> core::result::Result<(), AllocError> {
        let block = self.live_block(ptr.as_ptr())?;
        let size = self.read(block, OFF_SIZE) as usize;
        self.region.0[block..block + size].fill(0);

        if block + size == self.top {
            self.top = block;
            self.retract();
            return Ok(());
        }

        // Address-ordered insert, merging with the neighbours.
        let mut prev = None;
        let mut cursor = self.free_head_offset();
        while let Some(free) = cursor {
            if free > block {
                break;
            }
            prev = Some(free);
            cursor = self.next_free(free);
        }

        let mut start = block;
        let mut len = size;
        let mut next = cursor;
        if let Some(n) = next {
            if block + size == n {
                let n_len = self.read(n, OFF_SIZE) as usize;
                next = self.next_free(n);
                self.region.0[n..n + HEADER_SIZE].fill(0);
                len += n_len;
            }
        }
        match prev {
            Some(p) if p + self.read(p, OFF_SIZE) as usize == block => {
                start = p;
                len += self.read(p, OFF_SIZE) as usize;
                self.region.0[block..block + HEADER_SIZE].fill(0);
            }
            _ => {
                self.write(start, OFF_MAGIC, MAGIC_FREE);
                self.write(start, OFF_REQUEST, 0);
                self.link(prev, Some(start));
            }
        }
        self.write(start, OFF_SIZE, len as u32);
        self.write(start, OFF_NEXT, next.map_or(NIL, |n| n as u32));
        Ok(())
    }

    fn free_head_offset(&self) -> Option<usize> {
        match self.free_head {
            NIL => None,
            head => Some(head as usize),
        }
    }

    /// Drop free blocks that now end at `top`.
    fn retract(&mut self) {
        loop {
            let mut prev = None;
            let mut cursor = self.free_head_offset();
            let mut last = None;
            while let Some(free) = cursor {
                last = Some((prev, free));
                prev = Some(free);
                cursor = self.next_free(free);
            }
            match last {
                Some((prev, free)) if free + self.read(free, OFF_SIZE) as usize == self.top => {
                    self.link(prev, None);
                    self.region.0[free..free + HEADER_SIZE].fill(0);
                    self.top = free;
                }
                _ => return,
            }
        }
    }
}

impl<const N: usize> Default for Allocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global kernel heap
// ---------------------------------------------------------------------------

/// The heap thread memory comes from when the caller passes none. It is a
/// field of the shared record so both images place it alike.
pub static KERNEL_HEAP: &GateCell<Allocator<HEAP_SIZE>> = &crate::kernel::SHARED.heap;

pub fn alloc(size: usize) -> Option<NonNull<u8>> {
    KERNEL_HEAP.with(|heap| heap.alloc(size))
}

pub fn can_alloc(size: usize) -> bool {
    KERNEL_HEAP.with(|heap| heap.can_alloc(size))
}

pub fn is_alloc(ptr: *const u8) -> bool {
    KERNEL_HEAP.with(|heap| heap.is_alloc(ptr))
}

pub fn alloc_size(ptr: *const u8) -> Option<usize> {
    KERNEL_HEAP.with(|heap| heap.alloc_size(ptr))
}

/// Free a kernel heap block. A block freed twice stops the core.
pub fn free(ptr: NonNull<u8>) -> Result<()> {
    match KERNEL_HEAP.with(|heap| heap.free(ptr)) {
        Ok(()) => Ok(()),
        Err(AllocError::Foreign) => Err(Error::InvalidArg),
        Err(AllocError::DoubleFree) => fault::system_fault(Fault::DoubleFree),
    }
}
