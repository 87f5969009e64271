// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest RAM blocks as the migration engine sees them.
//!
//! Every guest-physical address belongs to exactly one named block.  Blocks
//! carry their position in the global migration bitmap (assigned in
//! registration order) and a received-page bitmap the postcopy destination
//! maintains as pages are placed.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use bitvec::prelude::*;

use crate::error::{MigrateError, Result};
use crate::proto::TARGET_PAGE_SIZE;

pub fn host_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An owned anonymous mapping.
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory; all access goes through raw pointers with
// explicit bounds checks.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub(crate) fn new_anon(len: usize) -> std::io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { ptr: NonNull::new(ptr as *mut u8).unwrap(), len })
    }

    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// A named region of guest memory.
pub struct RamBlock {
    name: String,
    map: Mapping,
    /// Page index of this block's first page within the global migration
    /// bitmap.
    bitmap_offset: u64,
    received: Mutex<BitBox>,
}

impl RamBlock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn num_pages(&self) -> u64 {
        (self.map.len() / TARGET_PAGE_SIZE) as u64
    }

    pub fn bitmap_offset(&self) -> u64 {
        self.bitmap_offset
    }

    pub(crate) fn host_base(&self) -> *mut u8 {
        self.map.ptr()
    }

    /// Copy bytes into the block at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.map.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.map.ptr().add(offset),
                data.len(),
            );
        }
    }

    /// Copy bytes out of the block at `offset`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.map.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    pub(crate) fn mark_received(&self, page: u64) {
        self.received.lock().unwrap().set(page as usize, true);
    }

    pub fn is_received(&self, page: u64) -> bool {
        self.received.lock().unwrap()[page as usize]
    }

    /// Release the contents of `[start, start + len)` back to the OS; later
    /// reads observe zero-fill.  The range is widened to host-page bounds,
    /// since the discard granularity is allowed to be coarser than the
    /// request.
    pub(crate) fn discard(&self, start: usize, len: usize) -> Result<()> {
        let host_page = host_page_size();
        let lo = start & !(host_page - 1);
        let hi = (start + len + host_page - 1) & !(host_page - 1);
        let hi = hi.min(self.map.len());
        let rv = unsafe {
            libc::madvise(
                self.map.ptr().add(lo) as *mut libc::c_void,
                hi - lo,
                libc::MADV_DONTNEED,
            )
        };
        if rv != 0 {
            return Err(MigrateError::Io(format!(
                "MADV_DONTNEED on block '{}': {}",
                self.name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Toggle the kernel's transparent-huge-page preference for the block.
    /// Atomic page placement requires standard-sized pages; a partially
    /// populated huge page cannot be filled one small page at a time.
    #[cfg(target_os = "linux")]
    pub(crate) fn set_huge_pages(&self, enabled: bool) -> Result<()> {
        let advice = if enabled {
            libc::MADV_HUGEPAGE
        } else {
            libc::MADV_NOHUGEPAGE
        };
        let rv = unsafe {
            libc::madvise(
                self.map.ptr() as *mut libc::c_void,
                self.map.len(),
                advice,
            )
        };
        if rv != 0 {
            return Err(MigrateError::Io(format!(
                "madvise(hugepage={}) on block '{}': {}",
                enabled,
                self.name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn set_huge_pages(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }
}

/// The full set of RAM blocks for one machine.
#[derive(Default)]
pub struct RamMap {
    blocks: Vec<Arc<RamBlock>>,
    next_bitmap_offset: u64,
}

impl RamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate and register a block.  `len` must be a whole number of
    /// target pages.
    pub fn add_block(&mut self, name: &str, len: usize) -> Result<Arc<RamBlock>> {
        assert!(len > 0 && len % TARGET_PAGE_SIZE == 0);
        assert!(
            self.block(name).is_none(),
            "duplicate RAM block name '{name}'"
        );
        let map = Mapping::new_anon(len).map_err(|e| {
            MigrateError::Memory(format!("mapping block '{name}': {e}"))
        })?;
        let pages = len / TARGET_PAGE_SIZE;
        let block = Arc::new(RamBlock {
            name: name.to_string(),
            map,
            bitmap_offset: self.next_bitmap_offset,
            received: Mutex::new(bitvec![0; pages].into_boxed_bitslice()),
        });
        self.next_bitmap_offset += pages as u64;
        self.blocks.push(Arc::clone(&block));
        Ok(block)
    }

    pub fn block(&self, name: &str) -> Option<&Arc<RamBlock>> {
        self.blocks.iter().find(|b| b.name == name)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Arc<RamBlock>> {
        self.blocks.iter()
    }

    /// Resolve a faulting host address to its block and byte offset within
    /// that block.
    pub fn block_from_host(&self, addr: u64) -> Option<(&Arc<RamBlock>, u64)> {
        self.blocks.iter().find_map(|b| {
            let base = b.host_base() as u64;
            if addr >= base && addr < base + b.len() as u64 {
                Some((b, addr - base))
            } else {
                None
            }
        })
    }

    /// Drop the contents of an inclusive page range of the named block.
    pub fn discard_page_range(
        &self,
        name: &str,
        first_page: u64,
        last_page: u64,
    ) -> Result<()> {
        let block = self.block(name).ok_or_else(|| {
            MigrateError::ProtocolViolation(format!(
                "discard for unknown RAM block '{name}'"
            ))
        })?;
        if last_page < first_page || last_page >= block.num_pages() {
            return Err(MigrateError::ProtocolViolation(format!(
                "discard range {first_page}..={last_page} outside block \
                 '{name}' ({} pages)",
                block.num_pages()
            )));
        }
        block.discard(
            first_page as usize * TARGET_PAGE_SIZE,
            (last_page - first_page + 1) as usize * TARGET_PAGE_SIZE,
        )
    }

    /// Ready every block for postcopy: drop existing contents (ROMs and
    /// tables built during init included; the authoritative copy comes from
    /// the source) and force standard-sized pages.
    pub(crate) fn prepare_for_postcopy(&self) -> Result<()> {
        for b in &self.blocks {
            b.discard(0, b.len())?;
            b.set_huge_pages(false)?;
        }
        Ok(())
    }

    /// Undo the effects of [`RamMap::prepare_for_postcopy`].
    pub(crate) fn restore_huge_pages(&self) -> Result<()> {
        for b in &self.blocks {
            b.set_huge_pages(true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discard_zero_fills() {
        let mut ram = RamMap::new();
        let block = ram.add_block("pc.ram", 16 * TARGET_PAGE_SIZE).unwrap();

        block.write_at(3 * TARGET_PAGE_SIZE, &[0xAB; TARGET_PAGE_SIZE]);
        ram.discard_page_range("pc.ram", 3, 3).unwrap();

        let mut buf = [0xFFu8; 16];
        block.read_at(3 * TARGET_PAGE_SIZE, &mut buf);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn discard_bounds_are_validated() {
        let mut ram = RamMap::new();
        ram.add_block("pc.ram", 4 * TARGET_PAGE_SIZE).unwrap();

        assert!(matches!(
            ram.discard_page_range("pc.ram", 2, 4),
            Err(MigrateError::ProtocolViolation(_))
        ));
        assert!(matches!(
            ram.discard_page_range("ghost", 0, 0),
            Err(MigrateError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn host_resolution() {
        let mut ram = RamMap::new();
        let a = ram.add_block("a", 4 * TARGET_PAGE_SIZE).unwrap();
        let b = ram.add_block("b", 4 * TARGET_PAGE_SIZE).unwrap();

        let addr = a.host_base() as u64 + TARGET_PAGE_SIZE as u64;
        let (found, off) = ram.block_from_host(addr).unwrap();
        assert_eq!(found.name(), "a");
        assert_eq!(off, TARGET_PAGE_SIZE as u64);

        let addr = b.host_base() as u64;
        let (found, off) = ram.block_from_host(addr).unwrap();
        assert_eq!(found.name(), "b");
        assert_eq!(off, 0);

        assert!(ram.block_from_host(1).is_none());
    }

    #[test]
    fn bitmap_offsets_accumulate() {
        let mut ram = RamMap::new();
        let a = ram.add_block("a", 4 * TARGET_PAGE_SIZE).unwrap();
        let b = ram.add_block("b", 8 * TARGET_PAGE_SIZE).unwrap();
        assert_eq!(a.bitmap_offset(), 0);
        assert_eq!(b.bitmap_offset(), 4);
    }

    #[test]
    fn received_pages() {
        let mut ram = RamMap::new();
        let a = ram.add_block("a", 4 * TARGET_PAGE_SIZE).unwrap();
        assert!(!a.is_received(2));
        a.mark_received(2);
        assert!(a.is_received(2));
        assert!(!a.is_received(3));
    }
}
