// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal newtypes for safer kcall decoding
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, PhysAddr, PageLen, Pid, HandleId
//! DEPENDS_ON: mm::page_table::is_canonical, PAGE_SIZE
//! INVARIANTS: Enforce canonical addresses; alignment helpers; prevent type confusion

use crate::mm::{page_table::is_canonical, PAGE_SIZE};
use core::fmt;

/// Canonical user/kernel virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if is_canonical(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        Self::new(addr).and_then(|va| if va.0 % PAGE_SIZE == 0 { Some(va) } else { None })
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn checked_add(self, v: usize) -> Option<usize> {
        self.0.checked_add(v)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Physical frame address. Only the frame allocator mints these; everything
/// else treats them as opaque map/unmap currency.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 % PAGE_SIZE
    }

    #[inline]
    pub fn checked_add(self, v: usize) -> Option<Self> {
        self.0.checked_add(v).map(Self)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Non-zero, page-multiple byte length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageLen(usize);

impl PageLen {
    #[inline]
    pub fn from_bytes_aligned(bytes: usize) -> Option<Self> {
        if bytes == 0 || bytes % PAGE_SIZE != 0 {
            None
        } else {
            Some(Self(bytes))
        }
    }

    /// Rounds up to the next page multiple; `None` on zero or overflow.
    #[inline]
    pub fn from_bytes_round_up(bytes: usize) -> Option<Self> {
        if bytes == 0 {
            return None;
        }
        let rounded = bytes.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1);
        Some(Self(rounded))
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn pages(self) -> usize {
        self.0 / PAGE_SIZE
    }
}

/// Task identifier.
///
/// **Ownership**: only `TaskTable` mints PIDs.
/// **Invariant**: PID 0 is reserved for the kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    /// Kernel PID (reserved, never exposed to userspace).
    pub const KERNEL: Self = Self(0);
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

/// Descriptor id as it crosses the kcall boundary: non-negative values are
/// universe slot indices, negative values are well-known references resolved
/// against the calling task.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HandleId(i64);

impl HandleId {
    /// The calling task's universe.
    pub const THIS_UNIVERSE: Self = Self(-1);
    /// The calling task itself.
    pub const THIS_THREAD: Self = Self(-2);
    /// The calling task's address space.
    pub const THIS_SPACE: Self = Self(-3);

    #[inline]
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn from_slot(slot: usize) -> Self {
        Self(slot as i64)
    }

    #[inline]
    pub const fn as_raw(self) -> i64 {
        self.0
    }

    /// Returns the slot index, or `None` for sentinel references.
    #[inline]
    pub fn slot(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
