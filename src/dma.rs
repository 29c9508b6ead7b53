// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device-visible memory regions.
//!
//! A [`DmaRegion`] is a page-aligned, zero-initialised block of host memory
//! that is shared with the device. The host side never forms Rust references
//! into it; every access goes through raw pointers so that concurrent writes
//! by the device (or by the [`sim`](crate::sim) firmware model) are sound.
//!
//! The bus address handed to the device is the identity mapping of the host
//! virtual address.

use crate::error::{FwError, FwResult};
use std::ptr::NonNull;

/// Page size used for DMA allocations.
pub const PAGE_SIZE: usize = 4096;

/// A block of memory visible to both host and device.
pub struct DmaRegion {
    /// Host virtual address.
    vaddr: NonNull<u8>,
    /// Length requested by the caller.
    len: usize,
    /// Length actually mapped (page rounded).
    mapped: usize,
}

// SAFETY: DmaRegion can be sent between threads because:
// - The mapping is owned by this value and freed exactly once on drop
// - All accesses go through raw pointers, never through Rust references
unsafe impl Send for DmaRegion {}

// SAFETY: Shared access only performs raw-pointer reads/writes; ownership of
// byte ranges between host users is coordinated by the transport protocol.
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocate a zeroed, page-aligned region of at least `len` bytes.
    pub fn alloc(len: usize) -> FwResult<Self> {
        if len == 0 {
            return Err(FwError::InvalidArgument("zero-length DMA region".into()));
        }
        let mapped = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let vaddr = platform::map(mapped)?;
        Ok(Self { vaddr, len, mapped })
    }

    /// Bus address the device uses to reach this region.
    #[inline]
    pub fn bus(&self) -> u64 {
        self.vaddr.as_ptr() as u64
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if `[bus, bus + len)` lies inside this region.
    pub fn contains(&self, bus: u64, len: usize) -> bool {
        let start = self.bus();
        bus >= start
            && (bus - start)
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.len as u64)
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "DMA access {}+{} out of bounds ({})",
            offset,
            len,
            self.len
        );
    }

    #[inline]
    fn at(&self, offset: usize) -> *mut u8 {
        // SAFETY: callers bounds-check `offset` against `len` first.
        unsafe { self.vaddr.as_ptr().add(offset) }
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        // SAFETY: range checked above; source is a distinct Rust slice.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.at(offset), data.len()) }
    }

    /// Copy bytes out of the region at `offset` into `buf`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        self.check(offset, buf.len());
        // SAFETY: range checked above; destination is a distinct Rust slice.
        unsafe { std::ptr::copy_nonoverlapping(self.at(offset), buf.as_mut_ptr(), buf.len()) }
    }

    /// Copy `len` bytes at `offset` into a new vector.
    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out);
        out
    }

    /// Fill `len` bytes at `offset` with `byte`.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        self.check(offset, len);
        // SAFETY: range checked above.
        unsafe { std::ptr::write_bytes(self.at(offset), byte, len) }
    }

    /// Volatile byte read (for fields the device writes last).
    #[inline]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.check(offset, 1);
        // SAFETY: range checked above.
        unsafe { std::ptr::read_volatile(self.at(offset)) }
    }

    /// Volatile byte write.
    #[inline]
    pub fn write_u8(&self, offset: usize, val: u8) {
        self.check(offset, 1);
        // SAFETY: range checked above.
        unsafe { std::ptr::write_volatile(self.at(offset), val) }
    }

    /// Little-endian volatile 16-bit read.
    pub fn read_u16(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        let p = self.at(offset);
        if p as usize % 2 == 0 {
            // SAFETY: aligned and in bounds.
            u16::from_le(unsafe { std::ptr::read_volatile(p as *const u16) })
        } else {
            u16::from_le_bytes([self.read_u8(offset), self.read_u8(offset + 1)])
        }
    }

    /// Little-endian volatile 16-bit write.
    pub fn write_u16(&self, offset: usize, val: u16) {
        self.check(offset, 2);
        let p = self.at(offset);
        if p as usize % 2 == 0 {
            // SAFETY: aligned and in bounds.
            unsafe { std::ptr::write_volatile(p as *mut u16, val.to_le()) }
        } else {
            self.write(offset, &val.to_le_bytes());
        }
    }

    /// Little-endian volatile 32-bit read.
    ///
    /// Aligned reads are single accesses, so a word the device writes in one
    /// store is never observed torn.
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        let p = self.at(offset);
        if p as usize % 4 == 0 {
            // SAFETY: aligned and in bounds.
            u32::from_le(unsafe { std::ptr::read_volatile(p as *const u32) })
        } else {
            let mut b = [0u8; 4];
            self.read(offset, &mut b);
            u32::from_le_bytes(b)
        }
    }

    /// Little-endian volatile 32-bit write.
    pub fn write_u32(&self, offset: usize, val: u32) {
        self.check(offset, 4);
        let p = self.at(offset);
        if p as usize % 4 == 0 {
            // SAFETY: aligned and in bounds.
            unsafe { std::ptr::write_volatile(p as *mut u32, val.to_le()) }
        } else {
            self.write(offset, &val.to_le_bytes());
        }
    }

    /// Little-endian 64-bit write.
    pub fn write_u64(&self, offset: usize, val: u64) {
        self.write(offset, &val.to_le_bytes());
    }

    /// Little-endian 64-bit read.
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut b = [0u8; 8];
        self.read(offset, &mut b);
        u64::from_le_bytes(b)
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        platform::unmap(self.vaddr, self.mapped);
    }
}

impl std::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("bus", &format_args!("{:#x}", self.bus()))
            .field("len", &self.len)
            .finish()
    }
}

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
mod platform {
    use super::*;

    pub(super) fn map(len: usize) -> FwResult<NonNull<u8>> {
        // Anonymous mappings are page aligned and zero filled.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(FwError::MmapFailed(format!(
                "anonymous mapping of {} bytes: {}",
                len,
                std::io::Error::last_os_error()
            )));
        }

        NonNull::new(addr as *mut u8).ok_or(FwError::NoMemory(len))
    }

    pub(super) fn unmap(vaddr: NonNull<u8>, len: usize) {
        unsafe {
            libc::munmap(vaddr.as_ptr() as *mut libc::c_void, len);
        }
    }
}

// ============================================================================
// Portable Implementation
// ============================================================================

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    fn layout(len: usize) -> FwResult<Layout> {
        Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|e| FwError::InvalidArgument(format!("DMA layout: {}", e)))
    }

    pub(super) fn map(len: usize) -> FwResult<NonNull<u8>> {
        let layout = layout(len)?;
        // SAFETY: layout has non-zero size.
        let p = unsafe { alloc_zeroed(layout) };
        NonNull::new(p).ok_or(FwError::NoMemory(len))
    }

    pub(super) fn unmap(vaddr: NonNull<u8>, len: usize) {
        if let Ok(layout) = layout(len) {
            // SAFETY: allocated in `map` with the same layout.
            unsafe { dealloc(vaddr.as_ptr(), layout) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zeroed_and_aligned() {
        let r = DmaRegion::alloc(100).unwrap();
        assert_eq!(r.len(), 100);
        assert_eq!(r.bus() % PAGE_SIZE as u64, 0);
        assert!(r.to_vec(0, 100).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(
            DmaRegion::alloc(0),
            Err(FwError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_scalar_access() {
        let r = DmaRegion::alloc(64).unwrap();
        r.write_u16(2, 0xBEEF);
        r.write_u32(4, 0xDEAD_BEEF);
        r.write_u64(8, 0x0102_0304_0506_0708);
        r.write_u8(63, 1);
        assert_eq!(r.read_u16(2), 0xBEEF);
        assert_eq!(r.read_u32(4), 0xDEAD_BEEF);
        assert_eq!(r.read_u64(8), 0x0102_0304_0506_0708);
        assert_eq!(r.read_u8(63), 1);
        // Little endian on the wire
        assert_eq!(r.to_vec(4, 4), vec![0xEF, 0xBE, 0xAD, 0xDE]);
        // Unaligned path
        r.write_u32(17, 0x1122_3344);
        assert_eq!(r.read_u32(17), 0x1122_3344);
    }

    #[test]
    fn test_contains() {
        let r = DmaRegion::alloc(128).unwrap();
        assert!(r.contains(r.bus(), 128));
        assert!(r.contains(r.bus() + 64, 64));
        assert!(!r.contains(r.bus() + 64, 65));
        assert!(!r.contains(r.bus().wrapping_sub(1), 1));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_panics() {
        let r = DmaRegion::alloc(16).unwrap();
        r.write(10, &[0u8; 8]);
    }
}
