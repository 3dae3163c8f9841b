// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory management (frames, VMAs, page tables, COW faults)
//! OWNERS: @kernel-team
//! PUBLIC API: FrameAllocator, VmaManager, AddressSpace, handle_fault
//! DEPENDS_ON: bitflags, spin, alloc
//! INVARIANTS: PAGE_SIZE granularity everywhere; frames freed only at refcount zero

pub mod fault;
pub mod frame;
pub mod page_table;
pub mod vma;

pub use fault::{handle_fault, FaultResolution};
pub use frame::FrameAllocator;
pub use page_table::{AddressSpace, MapError, PteFlags};
pub use vma::{Vma, VmaError, VmaFlags, VmaKind, VmaManager};

/// Base page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Anonymous-mapping placement window (user half, well clear of the ELF load
/// area and the stack).
pub const USER_MMAP_START: usize = 0x0000_1000_0000_0000;
pub const USER_MMAP_END: usize = 0x0000_6000_0000_0000;

/// First address past the user half of the canonical split.
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

bitflags::bitflags! {
    /// Memory-object attributes carried across the kcall boundary.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CACHE_WRITE_THROUGH = 1 << 2;
        const CACHE_WRITE_BACK = 1 << 3;
    }
}
