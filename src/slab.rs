// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA slab allocator for request/response buffers.
//!
//! Each request context owns one slab:
//!
//! ```text
//! 0            low                  high          RESP_OFFSET         SLAB_SIZE
//! | request    | free headroom      | slices ...  | response window   |
//! ```
//!
//! Slices are carved top-down from `RESP_OFFSET` towards the end of the
//! request. When a slice does not fit, the caller falls back to a standalone
//! mapping (at most one per context).

use crate::device::Device;
use crate::dma::{DmaRegion, PAGE_SIZE};
use crate::error::{FwError, FwResult};

/// Size of one slab (request page + response page).
pub const SLAB_SIZE: usize = 2 * PAGE_SIZE;
/// Offset of the response window within a slab.
pub const RESP_OFFSET: usize = SLAB_SIZE - RESP_SIZE;
/// Size of the response window.
pub const RESP_SIZE: usize = PAGE_SIZE;
/// Largest inline request.
pub const REQ_MAX_LEN: usize = RESP_OFFSET;
/// Alignment of slices.
pub const DMA_ALIGN: usize = 16;

#[inline]
pub(crate) const fn align_up(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

#[inline]
pub(crate) const fn align_down(v: usize, a: usize) -> usize {
    v & !(a - 1)
}

/// Bump arena over the unused part of a slab's request page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceArena {
    /// First byte past the (aligned) request.
    low: usize,
    /// Lowest byte handed out so far.
    high: usize,
}

impl SliceArena {
    /// Arena for a request of `req_len` bytes.
    pub fn new(req_len: usize) -> Self {
        Self {
            low: align_up(req_len, DMA_ALIGN).min(RESP_OFFSET),
            high: RESP_OFFSET,
        }
    }

    /// Bytes still available (before alignment losses).
    #[inline]
    pub fn headroom(&self) -> usize {
        self.high - self.low
    }

    /// Lowest slab offset handed out to a slice (`RESP_OFFSET` if none).
    #[inline]
    pub fn high(&self) -> usize {
        self.high
    }

    /// Carve `size` bytes; returns the slab offset.
    ///
    /// `None` when the slice would reach into the request.
    pub fn carve(&mut self, size: usize) -> Option<usize> {
        if size == 0 || size > self.headroom() {
            return None;
        }
        let offset = align_down(self.high - size, DMA_ALIGN);
        if offset < self.low {
            return None;
        }
        self.high = offset;
        Some(offset)
    }

    /// Move the request end, e.g. after the payload was replaced.
    ///
    /// Slices already carved stay where they are.
    pub fn set_request_len(&mut self, req_len: usize) {
        self.low = align_up(req_len, DMA_ALIGN).min(self.high);
    }
}

/// Pool of slabs.
///
/// Freed slabs go on a LIFO list, so the next request reuses the most
/// recently released memory.
#[derive(Debug)]
pub struct SlabPool {
    free: Vec<DmaRegion>,
    outstanding: usize,
    limit: usize,
}

impl SlabPool {
    /// Pool handing out at most `limit` slabs at a time.
    pub fn new(limit: usize) -> Self {
        Self {
            free: Vec::new(),
            outstanding: 0,
            limit,
        }
    }

    /// Take a zeroed slab.
    pub fn take<D: Device>(&mut self, dev: &D) -> FwResult<DmaRegion> {
        if self.outstanding >= self.limit {
            log::warn!("slab pool exhausted ({} outstanding)", self.outstanding);
            return Err(FwError::NoMemory(SLAB_SIZE));
        }
        let slab = match self.free.pop() {
            Some(slab) => {
                slab.fill(0, SLAB_SIZE, 0);
                slab
            }
            None => dev.dma_alloc(SLAB_SIZE)?,
        };
        self.outstanding += 1;
        Ok(slab)
    }

    /// Return a slab taken from this pool.
    pub fn give(&mut self, slab: DmaRegion) {
        debug_assert!(self.outstanding > 0);
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.push(slab);
    }

    /// Account for a slab that could not be returned.
    pub fn give_lost(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Slabs currently handed out.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Slabs cached for reuse.
    #[inline]
    pub fn cached(&self) -> usize {
        self.free.len()
    }

    /// Release every cached slab back to the device.
    pub fn release<D: Device>(&mut self, dev: &D) {
        for slab in self.free.drain(..) {
            dev.dma_free(slab);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    #[test]
    fn test_layout_constants() {
        assert_eq!(SLAB_SIZE, 8192);
        assert_eq!(RESP_OFFSET, 4096);
        assert_eq!(REQ_MAX_LEN, 4096);
    }

    #[test]
    fn test_carve_is_aligned_and_disjoint() {
        let mut arena = SliceArena::new(64);
        let sizes = [512usize, 1, 17, 100, 33, 256];
        let mut ranges: Vec<(usize, usize)> = vec![(0, 64), (RESP_OFFSET, SLAB_SIZE)];
        for &size in &sizes {
            let off = arena.carve(size).unwrap();
            assert_eq!(off % DMA_ALIGN, 0);
            for &(s, e) in &ranges {
                assert!(off + size <= s || off >= e, "slice overlaps {}..{}", s, e);
            }
            ranges.push((off, off + size));
        }
    }

    #[test]
    fn test_carve_exhaustion_is_exact() {
        // Request of 16 bytes leaves RESP_OFFSET - 16 bytes of headroom
        let mut arena = SliceArena::new(16);
        assert_eq!(arena.headroom(), RESP_OFFSET - 16);
        assert_eq!(arena.carve(2000), Some(RESP_OFFSET - 2000));
        // 2096 - 16 = 2080 left
        assert_eq!(arena.headroom(), 2080);
        assert_eq!(arena.carve(2080), Some(16));
        assert_eq!(arena.headroom(), 0);
        assert_eq!(arena.carve(1), None);
    }

    #[test]
    fn test_carve_rejects_oversize_without_underflow() {
        let mut arena = SliceArena::new(4000);
        assert_eq!(arena.carve(usize::MAX), None);
        assert_eq!(arena.carve(RESP_OFFSET), None);
        assert_eq!(arena.carve(0), None);
        // Arena unchanged by the failures
        assert_eq!(arena, SliceArena::new(4000));
    }

    #[test]
    fn test_carve_rounds_down_within_headroom() {
        // Both ends are 16-byte aligned, so a slice that fits the headroom
        // always fits after rounding down.
        let mut arena = SliceArena::new(4064);
        assert_eq!(arena.headroom(), 32);
        assert_eq!(arena.carve(8), Some(4080));
        assert_eq!(arena.headroom(), 16);
        assert_eq!(arena.carve(12), Some(4064));
        assert_eq!(arena.carve(1), None);
    }

    #[test]
    fn test_pool_reuses_lifo() {
        let dev = SimDevice::new(0);
        let mut pool = SlabPool::new(4);
        let a = pool.take(&*dev).unwrap();
        let bus = a.bus();
        a.write(0, &[0xAA; 16]);
        pool.give(a);
        assert_eq!(pool.outstanding(), 0);
        let b = pool.take(&*dev).unwrap();
        assert_eq!(b.bus(), bus);
        // Reused slabs come back zeroed
        assert_eq!(b.to_vec(0, 16), vec![0u8; 16]);
        pool.give(b);
        pool.release(&*dev);
        assert_eq!(pool.cached(), 0);
    }

    #[test]
    fn test_pool_limit() {
        let dev = SimDevice::new(0);
        let mut pool = SlabPool::new(1);
        let a = pool.take(&*dev).unwrap();
        assert!(matches!(pool.take(&*dev), Err(FwError::NoMemory(SLAB_SIZE))));
        pool.give(a);
        assert!(pool.take(&*dev).is_ok());
    }
}
