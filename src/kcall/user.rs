// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Checked copies between user memory and kernel buffers
//! OWNERS: @kernel-team
//! PUBLIC API: copy_from_user, copy_to_user, read/write integer helpers
//! DEPENDS_ON: mm::AddressSpace::translate, mm::fault::handle_fault
//! INVARIANTS: Every byte goes through translation; no raw user pointer is
//! ever dereferenced; writes to COW pages resolve the fault first
//!
//! Copies walk the caller's page tables one page at a time. A write into a
//! write-protected COW page takes the same resolution path a hardware fault
//! would, so kernel stores and user stores cannot diverge.

use crate::mm::fault::{handle_fault, FaultResolution};
use crate::mm::frame::{frame_bytes, frame_bytes_mut};
use crate::mm::page_table::{AddressSpace, PteFlags};
use crate::mm::{PAGE_SIZE, USER_SPACE_END};

/// An access touched unmapped, non-user, or unwritable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault;

fn check_range(uva: usize, len: usize) -> Result<(), Fault> {
    let end = uva.checked_add(len).ok_or(Fault)?;
    if end > USER_SPACE_END {
        return Err(Fault);
    }
    Ok(())
}

/// Copies `buf.len()` bytes from user address `uva` into `buf`.
pub fn copy_from_user(space: &AddressSpace, uva: usize, buf: &mut [u8]) -> Result<(), Fault> {
    check_range(uva, buf.len())?;
    let mut done = 0;
    while done < buf.len() {
        let (pa, flags) = space.translate(uva + done).ok_or(Fault)?;
        if !flags.contains(PteFlags::USER) {
            return Err(Fault);
        }
        let off = pa.page_offset();
        let n = (PAGE_SIZE - off).min(buf.len() - done);
        // SAFETY: translate returned a live mapped frame; the guard on the
        // address space serializes access to it.
        let page = unsafe { frame_bytes(pa.page_base()) };
        buf[done..done + n].copy_from_slice(&page[off..off + n]);
        done += n;
    }
    Ok(())
}

/// Copies `data` to user address `uva`, resolving COW pages on the way.
pub fn copy_to_user(space: &mut AddressSpace, uva: usize, data: &[u8]) -> Result<(), Fault> {
    check_range(uva, data.len())?;
    let mut done = 0;
    while done < data.len() {
        let va = uva + done;
        let (mut pa, mut flags) = space.translate(va).ok_or(Fault)?;
        if !flags.contains(PteFlags::USER) {
            return Err(Fault);
        }
        if !flags.contains(PteFlags::WRITE) {
            if !flags.contains(PteFlags::COW)
                || handle_fault(space, va) != FaultResolution::Resolved
            {
                return Err(Fault);
            }
            (pa, flags) = space.translate(va).ok_or(Fault)?;
            if !flags.contains(PteFlags::WRITE) {
                return Err(Fault);
            }
        }
        let off = pa.page_offset();
        let n = (PAGE_SIZE - off).min(data.len() - done);
        // SAFETY: translate returned a live writable frame; &mut on the
        // space gives exclusive access.
        let page = unsafe { frame_bytes_mut(pa.page_base()) };
        page[off..off + n].copy_from_slice(&data[done..done + n]);
        done += n;
    }
    Ok(())
}

pub fn read_u32(space: &AddressSpace, uva: usize) -> Result<u32, Fault> {
    let mut raw = [0u8; 4];
    copy_from_user(space, uva, &mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

pub fn read_u64(space: &AddressSpace, uva: usize) -> Result<u64, Fault> {
    let mut raw = [0u8; 8];
    copy_from_user(space, uva, &mut raw)?;
    Ok(u64::from_le_bytes(raw))
}

pub fn write_u64(space: &mut AddressSpace, uva: usize, value: u64) -> Result<(), Fault> {
    copy_to_user(space, uva, &value.to_le_bytes())
}

pub fn write_i64(space: &mut AddressSpace, uva: usize, value: i64) -> Result<(), Fault> {
    copy_to_user(space, uva, &value.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::FrameAllocator;
    use crate::mm::vma::{Vma, VmaFlags};
    use alloc::sync::Arc;

    const VA: usize = 0x1000_0000_0000;
    const RW: PteFlags = PteFlags::VALID.union(PteFlags::WRITE).union(PteFlags::USER);

    fn user_space(pages: usize) -> (Arc<FrameAllocator>, AddressSpace) {
        let frames = Arc::new(FrameAllocator::new());
        let mut space = AddressSpace::new(Arc::clone(&frames)).unwrap();
        let block = frames.alloc_contiguous(pages).unwrap();
        space.map_range(VA, block, pages * PAGE_SIZE, RW).unwrap();
        for page in 0..pages {
            frames.release(crate::types::PhysAddr::from_raw(block.raw() + page * PAGE_SIZE));
        }
        (frames, space)
    }

    #[test]
    fn roundtrip_across_a_page_boundary() {
        let (_frames, mut space) = user_space(2);
        let addr = VA + PAGE_SIZE - 3;
        copy_to_user(&mut space, addr, b"boundary").unwrap();
        let mut buf = [0u8; 8];
        copy_from_user(&space, addr, &mut buf).unwrap();
        assert_eq!(&buf, b"boundary");
    }

    #[test]
    fn unmapped_and_kernel_ranges_fault() {
        let (_frames, mut space) = user_space(1);
        let mut buf = [0u8; 4];
        assert_eq!(copy_from_user(&space, VA + PAGE_SIZE, &mut buf), Err(Fault));
        assert_eq!(copy_to_user(&mut space, USER_SPACE_END - 2, b"spill"), Err(Fault));
        assert_eq!(copy_from_user(&space, usize::MAX - 1, &mut buf), Err(Fault));
        // Straddling out of the mapping faults too.
        assert_eq!(copy_to_user(&mut space, VA + PAGE_SIZE - 2, b"over"), Err(Fault));
    }

    #[test]
    fn write_into_cow_page_resolves_the_fault() {
        let (_frames, mut parent) = user_space(1);
        parent
            .vmas_mut()
            .insert(Vma::anonymous(VA, VA + PAGE_SIZE, VmaFlags::READ | VmaFlags::WRITE))
            .unwrap();
        copy_to_user(&mut parent, VA, b"before").unwrap();
        let mut child = parent.clone_cow().unwrap();

        copy_to_user(&mut child, VA, b"after!").unwrap();
        let mut theirs = [0u8; 6];
        copy_from_user(&child, VA, &mut theirs).unwrap();
        assert_eq!(&theirs, b"after!");
        let mut ours = [0u8; 6];
        copy_from_user(&parent, VA, &mut ours).unwrap();
        assert_eq!(&ours, b"before");
    }

    #[test]
    fn integer_helpers_roundtrip() {
        let (_frames, mut space) = user_space(1);
        write_u64(&mut space, VA + 8, 0xdead_beef_cafe_f00d).unwrap();
        assert_eq!(read_u64(&space, VA + 8), Ok(0xdead_beef_cafe_f00d));
        write_i64(&mut space, VA + 16, -42).unwrap();
        assert_eq!(read_u32(&space, VA + 16), Ok((-42i32) as u32));
    }
}
