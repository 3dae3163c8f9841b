// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write write-fault resolution
//! OWNERS: @kernel-team
//! PUBLIC API: handle_fault, FaultResolution
//! DEPENDS_ON: page_table walk helpers, vma lookup, frame allocator
//! INVARIANTS: Only COW leaf entries are resolvable; shared regions upgrade
//! in place, private regions get a copied frame and drop one shared reference

use crate::mm::frame::{frame_bytes, frame_bytes_mut};
use crate::mm::page_table::{AddressSpace, PteFlags};
use crate::mm::vma::VmaFlags;

/// Outcome of a write-fault. `SegmentationFault` covers everything that is
/// not a resolvable COW entry: unmapped, huge-backed, or genuinely
/// write-protected addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    Resolved,
    SegmentationFault,
    OutOfMemory,
}

/// Resolves a write fault at `vaddr` against the space's page tables and
/// region set.
pub fn handle_fault(space: &mut AddressSpace, vaddr: usize) -> FaultResolution {
    let Some(loc) = space.walk_leaf(vaddr) else {
        return FaultResolution::SegmentationFault;
    };
    let (pa, flags) = space.leaf_entry(loc);
    if !flags.contains(PteFlags::VALID) || !flags.contains(PteFlags::COW) {
        return FaultResolution::SegmentationFault;
    }

    let shared = match space.vmas().find(vaddr) {
        Some(vma) => vma.flags.contains(VmaFlags::SHARED),
        None => {
            log_warn!(target: "mm", "COW entry at {vaddr:#x} without a region");
            return FaultResolution::SegmentationFault;
        }
    };

    let resolved = (flags - PteFlags::COW) | PteFlags::WRITE;
    if shared {
        // Every space mapping a shared region writes the same frame; the
        // write protection was only ever a clone artifact.
        space.set_leaf_entry(loc, pa, resolved);
        return FaultResolution::Resolved;
    }

    let Some(copy) = space.frames().alloc_zeroed() else {
        return FaultResolution::OutOfMemory;
    };
    // SAFETY: source frame is live (referenced by this entry), destination
    // was just allocated; they are distinct pages.
    unsafe {
        frame_bytes_mut(copy).copy_from_slice(frame_bytes(pa.page_base()));
    }
    space.set_leaf_entry(loc, copy, resolved);
    space.frames().release(pa.page_base());
    FaultResolution::Resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::FrameAllocator;
    use crate::mm::vma::{Vma, VmaFlags};
    use crate::mm::PAGE_SIZE;
    use alloc::sync::Arc;

    const VA: usize = 0x1000_0000_0000;
    const RW: PteFlags = PteFlags::VALID.union(PteFlags::WRITE).union(PteFlags::USER);

    fn cow_pair() -> (Arc<FrameAllocator>, AddressSpace, AddressSpace) {
        let frames = Arc::new(FrameAllocator::new());
        let mut parent = AddressSpace::new(Arc::clone(&frames)).unwrap();
        let pa = frames.alloc_zeroed().unwrap();
        unsafe { frame_bytes_mut(pa) }.fill(0x11);
        parent.map(VA, pa, RW).unwrap();
        frames.release(pa); // mapping keeps its reference
        parent
            .vmas_mut()
            .insert(Vma::anonymous(VA, VA + PAGE_SIZE, VmaFlags::READ | VmaFlags::WRITE))
            .unwrap();
        let child = parent.clone_cow().unwrap();
        (frames, parent, child)
    }

    #[test]
    fn private_fault_copies_the_frame() {
        let (frames, parent, mut child) = cow_pair();
        let (shared_pa, _) = parent.translate(VA).unwrap();

        assert_eq!(handle_fault(&mut child, VA + 8), FaultResolution::Resolved);
        let (child_pa, child_flags) = child.translate(VA).unwrap();
        assert_ne!(child_pa.page_base(), shared_pa.page_base());
        assert!(child_flags.contains(PteFlags::WRITE));
        assert!(!child_flags.contains(PteFlags::COW));
        // The copy preserved the bytes; the parent's view is untouched.
        assert_eq!(unsafe { frame_bytes(child_pa.page_base()) }[8], 0x11);
        assert_eq!(frames.refcount(shared_pa.page_base()), 1);

        (unsafe { frame_bytes_mut(child_pa.page_base()) })[8] = 0x22;
        assert_eq!(unsafe { frame_bytes(shared_pa.page_base()) }[8], 0x11);
    }

    #[test]
    fn shared_fault_upgrades_in_place() {
        let frames = Arc::new(FrameAllocator::new());
        let mut parent = AddressSpace::new(Arc::clone(&frames)).unwrap();
        let pa = frames.alloc_zeroed().unwrap();
        parent.map(VA, pa, RW).unwrap();
        frames.release(pa);
        parent
            .vmas_mut()
            .insert(Vma::anonymous(
                VA,
                VA + PAGE_SIZE,
                VmaFlags::READ | VmaFlags::WRITE | VmaFlags::SHARED,
            ))
            .unwrap();
        let mut child = parent.clone_cow().unwrap();

        assert_eq!(handle_fault(&mut child, VA), FaultResolution::Resolved);
        let (child_pa, child_flags) = child.translate(VA).unwrap();
        assert_eq!(child_pa.page_base(), pa);
        assert!(child_flags.contains(PteFlags::WRITE));
        // Still two mapping references on the one frame.
        assert_eq!(frames.refcount(pa), 2);
    }

    #[test]
    fn unmapped_and_plain_addresses_are_segfaults() {
        let (_frames, mut parent, mut child) = cow_pair();
        assert_eq!(handle_fault(&mut child, VA + PAGE_SIZE), FaultResolution::SegmentationFault);
        // Resolve once, then a second fault on the now-writable page is not ours.
        assert_eq!(handle_fault(&mut parent, VA), FaultResolution::Resolved);
        assert_eq!(handle_fault(&mut parent, VA), FaultResolution::SegmentationFault);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn allocation_failure_reports_out_of_memory() {
        let (frames, _parent, mut child) = cow_pair();
        frames.fail_after(0);
        assert_eq!(handle_fault(&mut child, VA), FaultResolution::OutOfMemory);
    }
}
