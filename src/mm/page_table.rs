// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: 4-level radix page tables with copy-on-write cloning
//! OWNERS: @kernel-team
//! PUBLIC API: AddressSpace, PteFlags, MapError, is_canonical
//! DEPENDS_ON: frame::FrameAllocator, vma::VmaManager
//! INVARIANTS: Entries pack frame address | flags in one word; every leaf
//! entry holds one frame reference; clone marks BOTH trees COW read-only;
//! the kernel half of the root is copied verbatim and never torn down
//!
//! Table nodes are frames from the same allocator that backs data pages, so
//! `live_frames` accounts for the trees themselves. Recursion over the tree
//! is bounded by `PT_LEVELS`.

use alloc::sync::Arc;

use crate::mm::frame::FrameAllocator;
use crate::mm::vma::VmaManager;
use crate::mm::PAGE_SIZE;
use crate::types::PhysAddr;

pub const PT_LEVELS: usize = 4;
pub const PT_ENTRIES: usize = 512;

const FLAG_MASK: usize = 0xfff;
const ADDR_MASK: usize = !FLAG_MASK;

static_assertions::const_assert_eq!(PT_ENTRIES * core::mem::size_of::<usize>(), PAGE_SIZE);

bitflags::bitflags! {
    /// Page table entry attribute bits (low 12 bits of an entry).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: usize {
        const VALID = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const GLOBAL = 1 << 3;
        /// Large leaf at a non-terminal level; copied verbatim by clone.
        const HUGE = 1 << 4;
        /// Write-protected shared frame; resolved by the fault handler.
        const COW = 1 << 5;
    }
}

/// Errors from page table manipulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    Unaligned,
    OutOfRange,
    Overlap,
    InvalidFlags,
    NoMemory,
}

/// True for 48-bit canonical addresses (bits 63..47 equal to bit 47).
#[inline]
pub const fn is_canonical(addr: usize) -> bool {
    let upper = addr >> 47;
    upper == 0 || upper == (1 << 17) - 1
}

#[inline]
fn level_index(va: usize, level: usize) -> usize {
    (va >> (12 + 9 * (PT_LEVELS - 1 - level))) & (PT_ENTRIES - 1)
}

/// Reads entry `idx` of the table frame at `table`.
///
/// # Safety
/// `table` must be a live page-table frame.
unsafe fn read_entry(table: PhysAddr, idx: usize) -> usize {
    debug_assert!(idx < PT_ENTRIES);
    // SAFETY: caller guarantees a live table frame; idx is in bounds.
    unsafe { core::ptr::read((table.raw() as *const usize).add(idx)) }
}

/// Writes entry `idx` of the table frame at `table`.
///
/// # Safety
/// `table` must be a live page-table frame with exclusive access.
unsafe fn write_entry(table: PhysAddr, idx: usize, entry: usize) {
    debug_assert!(idx < PT_ENTRIES);
    // SAFETY: caller guarantees exclusive access to a live table frame.
    unsafe { core::ptr::write((table.raw() as *mut usize).add(idx), entry) }
}

/// # Safety
/// `table` must be a live page-table frame.
unsafe fn table_is_empty(table: PhysAddr) -> bool {
    for idx in 0..PT_ENTRIES {
        // SAFETY: forwarded from the caller.
        if unsafe { read_entry(table, idx) } != 0 {
            return false;
        }
    }
    true
}

/// One task-visible address space: a page-table tree plus the VMA manager
/// describing its mappings. Frames for data pages and table nodes both come
/// from the shared allocator.
pub struct AddressSpace {
    root: PhysAddr,
    vmas: VmaManager,
    frames: Arc<FrameAllocator>,
}

impl AddressSpace {
    pub fn new(frames: Arc<FrameAllocator>) -> Result<Self, MapError> {
        let root = frames.alloc_zeroed().ok_or(MapError::NoMemory)?;
        Ok(Self { root, vmas: VmaManager::new(), frames })
    }

    #[inline]
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    #[inline]
    pub fn vmas(&self) -> &VmaManager {
        &self.vmas
    }

    #[inline]
    pub fn vmas_mut(&mut self) -> &mut VmaManager {
        &mut self.vmas
    }

    #[inline]
    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    fn check_page(va: usize) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical(va) {
            return Err(MapError::OutOfRange);
        }
        Ok(())
    }

    /// Maps one frame at `va`. The mapping takes a reference on the frame.
    /// `flags` must contain `VALID` and must not pre-set `HUGE` or `COW`.
    pub fn map(&mut self, va: usize, pa: PhysAddr, flags: PteFlags) -> Result<(), MapError> {
        Self::check_page(va)?;
        if !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        if !flags.contains(PteFlags::VALID) || flags.intersects(PteFlags::HUGE | PteFlags::COW) {
            return Err(MapError::InvalidFlags);
        }

        let mut table = self.root;
        for level in 0..PT_LEVELS - 1 {
            let idx = level_index(va, level);
            // SAFETY: `table` is a live node of this tree.
            let entry = unsafe { read_entry(table, idx) };
            if entry & PteFlags::VALID.bits() == 0 {
                let child = self.frames.alloc_zeroed().ok_or(MapError::NoMemory)?;
                // SAFETY: same table frame as above; exclusive via &mut self.
                unsafe { write_entry(table, idx, child.raw() | PteFlags::VALID.bits()) };
                table = child;
            } else if entry & PteFlags::HUGE.bits() != 0 {
                return Err(MapError::Overlap);
            } else {
                table = PhysAddr::from_raw(entry & ADDR_MASK);
            }
        }

        let idx = level_index(va, PT_LEVELS - 1);
        // SAFETY: `table` is the live leaf node for `va`.
        if unsafe { read_entry(table, idx) } & PteFlags::VALID.bits() != 0 {
            return Err(MapError::Overlap);
        }
        self.frames.retain(pa);
        // SAFETY: as above.
        unsafe { write_entry(table, idx, pa.raw() | flags.bits()) };
        Ok(())
    }

    /// Maps `len` bytes of contiguous frames starting at (`va`, `pa`).
    /// Not atomic: pages mapped before a failure stay mapped.
    pub fn map_range(
        &mut self,
        va: usize,
        pa: PhysAddr,
        len: usize,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        va.checked_add(len).ok_or(MapError::OutOfRange)?;
        for off in (0..len).step_by(PAGE_SIZE) {
            let frame = pa.checked_add(off).ok_or(MapError::OutOfRange)?;
            self.map(va + off, frame, flags)?;
        }
        Ok(())
    }

    /// Unmaps the page at `va`, releasing its frame reference and reclaiming
    /// emptied table nodes. Absent mappings are not an error.
    pub fn unmap(&mut self, va: usize) -> Result<Option<PhysAddr>, MapError> {
        Self::check_page(va)?;

        let mut tables = [self.root; PT_LEVELS];
        for level in 0..PT_LEVELS - 1 {
            let idx = level_index(va, level);
            // SAFETY: live node of this tree.
            let entry = unsafe { read_entry(tables[level], idx) };
            if entry & PteFlags::VALID.bits() == 0 || entry & PteFlags::HUGE.bits() != 0 {
                return Ok(None);
            }
            tables[level + 1] = PhysAddr::from_raw(entry & ADDR_MASK);
        }

        let leaf_idx = level_index(va, PT_LEVELS - 1);
        // SAFETY: live leaf node.
        let entry = unsafe { read_entry(tables[PT_LEVELS - 1], leaf_idx) };
        if entry & PteFlags::VALID.bits() == 0 {
            return Ok(None);
        }
        let pa = PhysAddr::from_raw(entry & ADDR_MASK);
        // SAFETY: as above; exclusive via &mut self.
        unsafe { write_entry(tables[PT_LEVELS - 1], leaf_idx, 0) };
        self.frames.release(pa);

        // Reclaim now-empty intermediate nodes bottom-up; the root stays.
        for level in (1..PT_LEVELS).rev() {
            // SAFETY: live node of this tree.
            if !unsafe { table_is_empty(tables[level]) } {
                break;
            }
            // SAFETY: parent is live; exclusive via &mut self.
            unsafe { write_entry(tables[level - 1], level_index(va, level - 1), 0) };
            self.frames.release(tables[level]);
        }
        Ok(Some(pa))
    }

    pub fn unmap_range(&mut self, va: usize, len: usize) -> Result<(), MapError> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        va.checked_add(len).ok_or(MapError::OutOfRange)?;
        for off in (0..len).step_by(PAGE_SIZE) {
            self.unmap(va + off)?;
        }
        Ok(())
    }

    /// Rewrites the attribute bits of the leaf entry at `va`, keeping the
    /// frame. `flags` obeys the same rules as [`map`](Self::map).
    pub fn protect(&mut self, va: usize, flags: PteFlags) -> Result<(), MapError> {
        Self::check_page(va)?;
        if !flags.contains(PteFlags::VALID) || flags.intersects(PteFlags::HUGE | PteFlags::COW) {
            return Err(MapError::InvalidFlags);
        }
        let loc = self.walk_leaf(va).ok_or(MapError::OutOfRange)?;
        let (pa, old) = self.leaf_entry(loc);
        if !old.contains(PteFlags::VALID) {
            return Err(MapError::OutOfRange);
        }
        self.set_leaf_entry(loc, pa, flags);
        Ok(())
    }

    /// Resolves `va` to its backing frame address (with the in-page offset
    /// applied) and the entry flags. Huge entries resolve within their span.
    pub fn translate(&self, va: usize) -> Option<(PhysAddr, PteFlags)> {
        if !is_canonical(va) {
            return None;
        }
        let mut table = self.root;
        for level in 0..PT_LEVELS {
            let idx = level_index(va, level);
            // SAFETY: live node of this tree.
            let entry = unsafe { read_entry(table, idx) };
            if entry & PteFlags::VALID.bits() == 0 {
                return None;
            }
            let flags = PteFlags::from_bits_truncate(entry & FLAG_MASK);
            let base = entry & ADDR_MASK;
            if level == PT_LEVELS - 1 {
                return Some((PhysAddr::from_raw(base + va % PAGE_SIZE), flags));
            }
            if flags.contains(PteFlags::HUGE) {
                let span = 1usize << (12 + 9 * (PT_LEVELS - 1 - level));
                return Some((PhysAddr::from_raw(base + (va & (span - 1))), flags));
            }
            table = PhysAddr::from_raw(base);
        }
        None
    }

    /// Locates the leaf entry for `va` without allocating: returns the leaf
    /// table frame and index. Used by the fault handler to rewrite entries.
    pub(crate) fn walk_leaf(&self, va: usize) -> Option<(PhysAddr, usize)> {
        if !is_canonical(va) {
            return None;
        }
        let mut table = self.root;
        for level in 0..PT_LEVELS - 1 {
            let idx = level_index(va, level);
            // SAFETY: live node of this tree.
            let entry = unsafe { read_entry(table, idx) };
            if entry & PteFlags::VALID.bits() == 0 || entry & PteFlags::HUGE.bits() != 0 {
                return None;
            }
            table = PhysAddr::from_raw(entry & ADDR_MASK);
        }
        Some((table, level_index(va, PT_LEVELS - 1)))
    }

    /// Reads the leaf entry at a location produced by [`walk_leaf`].
    pub(crate) fn leaf_entry(&self, loc: (PhysAddr, usize)) -> (PhysAddr, PteFlags) {
        // SAFETY: `loc` came from walk_leaf on this live tree.
        let entry = unsafe { read_entry(loc.0, loc.1) };
        (PhysAddr::from_raw(entry & ADDR_MASK), PteFlags::from_bits_truncate(entry & FLAG_MASK))
    }

    /// Rewrites the leaf entry at a location produced by [`walk_leaf`].
    pub(crate) fn set_leaf_entry(&mut self, loc: (PhysAddr, usize), pa: PhysAddr, flags: PteFlags) {
        // SAFETY: `loc` came from walk_leaf; exclusive via &mut self.
        unsafe { write_entry(loc.0, loc.1, pa.page_base().raw() | flags.bits()) };
    }

    /// Clones this space copy-on-write. Every user leaf in BOTH trees becomes
    /// write-protected `COW` sharing one refcounted frame; huge entries are
    /// copied verbatim; the kernel half of the root is copied verbatim so the
    /// shared kernel tables appear in the clone. The VMA set is duplicated.
    pub fn clone_cow(&mut self) -> Result<AddressSpace, MapError> {
        let clone = AddressSpace {
            root: self.frames.alloc_zeroed().ok_or(MapError::NoMemory)?,
            vmas: self.vmas.clone(),
            frames: Arc::clone(&self.frames),
        };
        for idx in PT_ENTRIES / 2..PT_ENTRIES {
            // SAFETY: both roots are live table frames.
            unsafe { write_entry(clone.root, idx, read_entry(self.root, idx)) };
        }
        self.clone_level(self.root, clone.root, 0)?;
        Ok(clone)
    }

    fn clone_level(&self, src: PhysAddr, dst: PhysAddr, level: usize) -> Result<(), MapError> {
        let span = if level == 0 { PT_ENTRIES / 2 } else { PT_ENTRIES };
        for idx in 0..span {
            // SAFETY: `src` is a live node of this tree.
            let entry = unsafe { read_entry(src, idx) };
            if entry & PteFlags::VALID.bits() == 0 {
                continue;
            }
            if entry & PteFlags::HUGE.bits() != 0 {
                // SAFETY: `dst` is a live node of the clone under construction.
                unsafe { write_entry(dst, idx, entry) };
                continue;
            }
            if level == PT_LEVELS - 1 {
                let pa = PhysAddr::from_raw(entry & ADDR_MASK);
                let mut flags = PteFlags::from_bits_truncate(entry & FLAG_MASK);
                flags.insert(PteFlags::COW);
                flags.remove(PteFlags::WRITE);
                let cow = pa.raw() | flags.bits();
                self.frames.retain(pa);
                // SAFETY: both nodes are live; the source rewrite is the
                // write-protection half of the COW contract.
                unsafe {
                    write_entry(dst, idx, cow);
                    write_entry(src, idx, cow);
                }
            } else {
                let child = self.frames.alloc_zeroed().ok_or(MapError::NoMemory)?;
                // SAFETY: `dst` is live.
                unsafe { write_entry(dst, idx, child.raw() | PteFlags::VALID.bits()) };
                self.clone_level(PhysAddr::from_raw(entry & ADDR_MASK), child, level + 1)?;
            }
        }
        Ok(())
    }

    fn free_level(&self, table: PhysAddr, level: usize) {
        let span = if level == 0 { PT_ENTRIES / 2 } else { PT_ENTRIES };
        for idx in 0..span {
            // SAFETY: live node of this tree, being torn down exclusively.
            let entry = unsafe { read_entry(table, idx) };
            if entry & PteFlags::VALID.bits() == 0 || entry & PteFlags::HUGE.bits() != 0 {
                continue;
            }
            let pa = PhysAddr::from_raw(entry & ADDR_MASK);
            if level == PT_LEVELS - 1 {
                self.frames.release(pa);
            } else {
                self.free_level(pa, level + 1);
                self.frames.release(pa);
            }
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // The kernel half of the root references shared tables this space
        // does not own; only the user half is torn down.
        self.free_level(self.root, 0);
        self.frames.release(self.root);
    }
}
