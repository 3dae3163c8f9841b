// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-address-space VMA bookkeeping
//! OWNERS: @kernel-team
//! PUBLIC API: VmaManager, Vma, VmaFlags, VmaKind
//! DEPENDS_ON: alloc::BTreeMap
//! INVARIANTS: Regions are page-aligned, non-empty, non-overlapping, keyed by
//! start address; `used` equals the sum of region lengths at all times
//!
//! One ordered map is both the address index and the interval index: because
//! regions never overlap, the greatest start below a query point identifies
//! the only candidate for containment or intersection.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::mm::{PAGE_SIZE, USER_MMAP_END, USER_MMAP_START, USER_SPACE_END};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Writes resolve in place on a COW fault instead of copying.
        const SHARED = 1 << 3;
    }
}

/// What backs a region. File regions carry the byte offset of their first
/// page so split keeps per-page backing stable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmaKind {
    Anonymous,
    File { offset: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vma {
    pub start: usize,
    pub end: usize,
    pub flags: VmaFlags,
    pub kind: VmaKind,
    pub name: Option<String>,
}

impl Vma {
    pub fn anonymous(start: usize, end: usize, flags: VmaFlags) -> Self {
        Self { start, end, flags, kind: VmaKind::Anonymous, name: None }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaError {
    /// Unaligned, empty or inverted range, or no region at the given address.
    InvalidRange,
    Overlap,
    /// Merge operands are not adjacent or differ in flags/backing.
    Incompatible,
    /// No gap large enough in the placement window.
    NoSpace,
}

/// Sorted set of non-overlapping regions plus usage accounting.
#[derive(Clone)]
pub struct VmaManager {
    vmas: BTreeMap<usize, Vma>,
    used: usize,
    total: usize,
}

impl VmaManager {
    pub fn new() -> Self {
        Self { vmas: BTreeMap::new(), used: 0, total: USER_SPACE_END }
    }

    /// Bytes covered by regions.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Configured mappable span in bytes.
    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    /// Regions in ascending start order.
    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.values()
    }

    /// Region containing `addr`, if any.
    pub fn find(&self, addr: usize) -> Option<&Vma> {
        self.vmas
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.end > addr)
    }

    /// First region intersecting `[start, end)`, if any. Non-overlap makes
    /// the greatest-start-below-`end` region the only candidate.
    pub fn find_intersection(&self, start: usize, end: usize) -> Option<&Vma> {
        if start >= end {
            return None;
        }
        self.vmas
            .range(..end)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.end > start)
    }

    fn check_range(start: usize, end: usize) -> Result<(), VmaError> {
        if start >= end || start % PAGE_SIZE != 0 || end % PAGE_SIZE != 0 {
            return Err(VmaError::InvalidRange);
        }
        Ok(())
    }

    /// Inserts a region; rejects any intersection with an existing one.
    pub fn insert(&mut self, vma: Vma) -> Result<(), VmaError> {
        Self::check_range(vma.start, vma.end)?;
        if self.find_intersection(vma.start, vma.end).is_some() {
            return Err(VmaError::Overlap);
        }
        self.used += vma.len();
        self.vmas.insert(vma.start, vma);
        Ok(())
    }

    /// Removes the region starting exactly at `start`.
    pub fn remove(&mut self, start: usize) -> Option<Vma> {
        let vma = self.vmas.remove(&start)?;
        self.used -= vma.len();
        Some(vma)
    }

    /// Splits the region containing `addr` into `[start, addr)` and
    /// `[addr, end)`. A cut at an existing boundary is rejected.
    pub fn split(&mut self, addr: usize) -> Result<(), VmaError> {
        if addr % PAGE_SIZE != 0 {
            return Err(VmaError::InvalidRange);
        }
        let (start, vma) = self
            .vmas
            .range_mut(..addr)
            .next_back()
            .ok_or(VmaError::InvalidRange)?;
        if vma.end <= addr {
            return Err(VmaError::InvalidRange);
        }
        let mut tail = vma.clone();
        vma.end = addr;
        tail.start = addr;
        if let VmaKind::File { offset } = &mut tail.kind {
            *offset += (addr - start) as u64;
        }
        self.vmas.insert(addr, tail);
        Ok(())
    }

    /// Coalesces two adjacent regions with matching flags and contiguous
    /// backing into one. The surviving region keeps `left`'s name, falling
    /// back to `right`'s.
    pub fn merge(&mut self, left: usize, right: usize) -> Result<(), VmaError> {
        {
            let l = self.vmas.get(&left).ok_or(VmaError::InvalidRange)?;
            let r = self.vmas.get(&right).ok_or(VmaError::InvalidRange)?;
            if l.end != r.start || l.flags != r.flags {
                return Err(VmaError::Incompatible);
            }
            match (&l.kind, &r.kind) {
                (VmaKind::Anonymous, VmaKind::Anonymous) => {}
                (VmaKind::File { offset: lo }, VmaKind::File { offset: ro })
                    if lo + l.len() as u64 == *ro => {}
                _ => return Err(VmaError::Incompatible),
            }
        }
        let r = match self.vmas.remove(&right) {
            Some(r) => r,
            None => return Err(VmaError::InvalidRange),
        };
        if let Some(l) = self.vmas.get_mut(&left) {
            l.end = r.end;
            if l.name.is_none() {
                l.name = r.name;
            }
        }
        Ok(())
    }

    /// Removes all coverage of `[start, end)`: contained regions disappear,
    /// straddling regions are split and trimmed.
    pub fn unmap_range(&mut self, start: usize, end: usize) -> Result<(), VmaError> {
        Self::check_range(start, end)?;
        let hits: Vec<usize> = self
            .vmas
            .range(..end)
            .filter(|(_, vma)| vma.end > start)
            .map(|(&k, _)| k)
            .collect();
        for key in hits {
            let (vs, ve) = match self.vmas.get(&key) {
                Some(vma) => (vma.start, vma.end),
                None => continue,
            };
            if vs < start {
                self.split(start)?;
                if ve > end {
                    self.split(end)?;
                }
                self.remove(start);
            } else if ve > end {
                self.split(end)?;
                self.remove(vs);
            } else {
                self.remove(key);
            }
        }
        Ok(())
    }

    /// Picks a free `len`-byte slot in the placement window. A usable `hint`
    /// wins; otherwise gaps are scanned in address order.
    pub fn find_unmapped_area(&self, hint: usize, len: usize) -> Result<usize, VmaError> {
        if len == 0 || len % PAGE_SIZE != 0 || len > USER_MMAP_END - USER_MMAP_START {
            return Err(VmaError::NoSpace);
        }
        if hint != 0 {
            if let Some(hint) = hint
                .checked_add(PAGE_SIZE - 1)
                .map(|h| h & !(PAGE_SIZE - 1))
            {
                if hint >= USER_MMAP_START
                    && hint <= USER_MMAP_END - len
                    && self.find_intersection(hint, hint + len).is_none()
                {
                    return Ok(hint);
                }
            }
        }
        let mut cursor = USER_MMAP_START;
        for vma in self.vmas.values() {
            if vma.end <= cursor {
                continue;
            }
            if vma.start >= USER_MMAP_END {
                break;
            }
            if vma.start > cursor && vma.start - cursor >= len {
                return Ok(cursor);
            }
            cursor = cursor.max(vma.end);
        }
        if cursor + len <= USER_MMAP_END {
            Ok(cursor)
        } else {
            Err(VmaError::NoSpace)
        }
    }
}

impl Default for VmaManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw() -> VmaFlags {
        VmaFlags::READ | VmaFlags::WRITE
    }

    fn anon(start_pages: usize, end_pages: usize) -> Vma {
        Vma::anonymous(
            USER_MMAP_START + start_pages * PAGE_SIZE,
            USER_MMAP_START + end_pages * PAGE_SIZE,
            rw(),
        )
    }

    fn at(pages: usize) -> usize {
        USER_MMAP_START + pages * PAGE_SIZE
    }

    #[test]
    fn insert_rejects_overlap_and_bad_ranges() {
        let mut mgr = VmaManager::new();
        mgr.insert(anon(0, 4)).unwrap();
        assert_eq!(mgr.insert(anon(3, 5)), Err(VmaError::Overlap));
        assert_eq!(mgr.insert(anon(2, 2)), Err(VmaError::InvalidRange));
        assert_eq!(
            mgr.insert(Vma::anonymous(at(8) + 1, at(9), rw())),
            Err(VmaError::InvalidRange)
        );
        assert_eq!(mgr.used(), 4 * PAGE_SIZE);
    }

    #[test]
    fn find_and_intersection() {
        let mut mgr = VmaManager::new();
        mgr.insert(anon(0, 2)).unwrap();
        mgr.insert(anon(4, 6)).unwrap();

        assert_eq!(mgr.find(at(1)).map(|v| v.start), Some(at(0)));
        assert!(mgr.find(at(2)).is_none());
        assert!(mgr.find(at(3)).is_none());
        assert_eq!(mgr.find_intersection(at(1), at(5)).map(|v| v.start), Some(at(4)));
        assert_eq!(mgr.find_intersection(at(2), at(4)), None);
        assert_eq!(mgr.find_intersection(at(5), at(5)), None);
    }

    #[test]
    fn split_adjusts_file_offsets() {
        let mut mgr = VmaManager::new();
        mgr.insert(Vma {
            start: at(0),
            end: at(4),
            flags: rw(),
            kind: VmaKind::File { offset: 0x1000 },
            name: None,
        })
        .unwrap();
        mgr.split(at(1)).unwrap();

        let tail = mgr.find(at(1)).unwrap();
        assert_eq!(tail.start, at(1));
        assert_eq!(tail.kind, VmaKind::File { offset: 0x1000 + PAGE_SIZE as u64 });
        assert_eq!(mgr.used(), 4 * PAGE_SIZE);
        // Cutting at a boundary is not a split.
        assert_eq!(mgr.split(at(0)), Err(VmaError::InvalidRange));
        assert_eq!(mgr.split(at(4)), Err(VmaError::InvalidRange));
    }

    #[test]
    fn merge_requires_adjacency_and_matching_backing() {
        let mut mgr = VmaManager::new();
        mgr.insert(anon(0, 2)).unwrap();
        mgr.insert(anon(2, 3)).unwrap();
        mgr.insert(anon(5, 6)).unwrap();
        mgr.insert(Vma {
            start: at(3),
            end: at(4),
            flags: VmaFlags::READ,
            kind: VmaKind::Anonymous,
            name: None,
        })
        .unwrap();

        assert_eq!(mgr.merge(at(0), at(5)), Err(VmaError::Incompatible));
        assert_eq!(mgr.merge(at(2), at(3)), Err(VmaError::Incompatible));
        mgr.merge(at(0), at(2)).unwrap();
        assert_eq!(mgr.find(at(1)).map(|v| v.end), Some(at(3)));
        assert_eq!(mgr.used(), 5 * PAGE_SIZE);
    }

    #[test]
    fn unmap_range_contained_and_straddling() {
        let mut mgr = VmaManager::new();
        mgr.insert(anon(0, 8)).unwrap();
        // Punch a hole in the middle.
        mgr.unmap_range(at(2), at(5)).unwrap();
        assert_eq!(mgr.len(), 2);
        assert_eq!(mgr.find(at(0)).map(|v| v.end), Some(at(2)));
        assert_eq!(mgr.find(at(5)).map(|v| (v.start, v.end)), Some((at(5), at(8))));
        assert_eq!(mgr.used(), 5 * PAGE_SIZE);

        // Straddle the tail region's head plus the whole gap.
        mgr.unmap_range(at(3), at(6)).unwrap();
        assert_eq!(mgr.find(at(6)).map(|v| v.start), Some(at(6)));
        assert_eq!(mgr.used(), 4 * PAGE_SIZE);

        // Remove everything.
        mgr.unmap_range(at(0), at(8)).unwrap();
        assert!(mgr.is_empty());
        assert_eq!(mgr.used(), 0);
    }

    #[test]
    fn unmapped_area_respects_hint_and_gaps() {
        let mut mgr = VmaManager::new();
        assert_eq!(mgr.find_unmapped_area(0, PAGE_SIZE), Ok(USER_MMAP_START));

        mgr.insert(anon(0, 2)).unwrap();
        mgr.insert(anon(3, 5)).unwrap();
        // First fit lands in the one-page gap.
        assert_eq!(mgr.find_unmapped_area(0, PAGE_SIZE), Ok(at(2)));
        // Two pages skip it and land after the last region.
        assert_eq!(mgr.find_unmapped_area(0, 2 * PAGE_SIZE), Ok(at(5)));
        // A usable hint wins over the scan.
        assert_eq!(mgr.find_unmapped_area(at(100), PAGE_SIZE), Ok(at(100)));
        // An occupied hint falls back to the scan.
        assert_eq!(mgr.find_unmapped_area(at(3), PAGE_SIZE), Ok(at(2)));
        assert_eq!(mgr.find_unmapped_area(0, 0), Err(VmaError::NoSpace));
    }

    #[test]
    fn clone_is_deep() {
        let mut mgr = VmaManager::new();
        mgr.insert(anon(0, 1)).unwrap();
        let copy = mgr.clone();
        mgr.remove(at(0)).unwrap();
        assert_eq!(copy.len(), 1);
        assert_eq!(copy.used(), PAGE_SIZE);
        assert_eq!(mgr.used(), 0);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Insert { start: usize, pages: usize },
            Remove { start: usize },
            Split { addr: usize },
            Unmap { start: usize, pages: usize },
        }

        fn arb_op() -> impl Strategy<Value = Op> {
            let page = 0usize..64;
            prop_oneof![
                (page.clone(), 1usize..8).prop_map(|(p, n)| Op::Insert {
                    start: USER_MMAP_START + p * PAGE_SIZE,
                    pages: n,
                }),
                page.clone().prop_map(|p| Op::Remove { start: USER_MMAP_START + p * PAGE_SIZE }),
                page.clone().prop_map(|p| Op::Split { addr: USER_MMAP_START + p * PAGE_SIZE }),
                (page, 1usize..8).prop_map(|(p, n)| Op::Unmap {
                    start: USER_MMAP_START + p * PAGE_SIZE,
                    pages: n,
                }),
            ]
        }

        proptest! {
            #[test]
            fn regions_stay_sorted_disjoint_and_accounted(ops in proptest::collection::vec(arb_op(), 0..64)) {
                let mut mgr = VmaManager::new();
                for op in ops {
                    match op {
                        Op::Insert { start, pages } => {
                            let _ = mgr.insert(Vma::anonymous(start, start + pages * PAGE_SIZE, VmaFlags::READ));
                        }
                        Op::Remove { start } => {
                            mgr.remove(start);
                        }
                        Op::Split { addr } => {
                            let _ = mgr.split(addr);
                        }
                        Op::Unmap { start, pages } => {
                            let _ = mgr.unmap_range(start, start + pages * PAGE_SIZE);
                        }
                    }

                    let mut prev_end = 0;
                    let mut sum = 0;
                    for vma in mgr.iter() {
                        prop_assert!(vma.start < vma.end);
                        prop_assert!(vma.start >= prev_end);
                        prev_end = vma.end;
                        sum += vma.len();
                    }
                    prop_assert_eq!(sum, mgr.used());
                }
            }
        }
    }
}
