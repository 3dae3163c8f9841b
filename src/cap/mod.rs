// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Typed handles and per-task universes (descriptor tables)
//! OWNERS: @kernel-cap-team
//! PUBLIC API: Handle, Object, HandleTag, Universe, MemoryObject, CapError
//! DEPENDS_ON: ipc::lane, mm, initramfs
//! INVARIANTS: A handle lives while any universe slot or lane queue references
//! it (`Arc`); detaching the last reference drops the payload; slot indices
//! are validated at the kcall boundary

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::initramfs::InitramfsFile;
use crate::ipc::lane::LaneEndpoint;
use crate::mm::frame::FrameAllocator;
use crate::mm::page_table::AddressSpace;
use crate::mm::{MemoryFlags, PAGE_SIZE};
use crate::types::{PageLen, PhysAddr, Pid};

/// Errors produced when manipulating a universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    /// Slot is out of range, empty, or holds the wrong object type.
    BadDescriptor,
    /// No free slot available.
    NoSpace,
}

/// Discriminant reported to userspace for descriptor introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HandleTag {
    Universe = 1,
    Memory = 2,
    Thread = 3,
    Space = 4,
    Lane = 5,
    Initramfs = 6,
}

/// A contiguous run of refcounted frames plus its mapping attributes.
/// Allocated objects own their frames; physical windows (device memory)
/// reference ranges the allocator does not track and never free them.
pub struct MemoryObject {
    base: PhysAddr,
    len: usize,
    info: MemoryFlags,
    frames: Option<Arc<FrameAllocator>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    NoMemory,
    /// Physical windows cannot be resized.
    NotOwned,
}

impl MemoryObject {
    pub fn allocate(
        frames: &Arc<FrameAllocator>,
        len: PageLen,
        info: MemoryFlags,
    ) -> Result<Self, MemoryError> {
        let base = frames.alloc_contiguous(len.pages()).ok_or(MemoryError::NoMemory)?;
        Ok(Self { base, len: len.raw(), info, frames: Some(Arc::clone(frames)) })
    }

    pub fn physical(base: PhysAddr, len: PageLen, info: MemoryFlags) -> Self {
        Self { base, len: len.raw(), info, frames: None }
    }

    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn info(&self) -> MemoryFlags {
        self.info
    }

    #[inline]
    pub fn set_info(&mut self, info: MemoryFlags) {
        self.info = info;
    }

    /// Moves the contents into a freshly allocated run of `new_len` bytes,
    /// preserving the common prefix. Existing mappings keep referencing the
    /// old frames until they are unmapped.
    pub fn resize(&mut self, new_len: PageLen) -> Result<(), MemoryError> {
        let Some(frames) = self.frames.clone() else {
            return Err(MemoryError::NotOwned);
        };
        let base = frames.alloc_contiguous(new_len.pages()).ok_or(MemoryError::NoMemory)?;
        let keep = self.len.min(new_len.raw());
        // SAFETY: both runs are live allocator blocks and cannot overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.base.raw() as *const u8,
                base.raw() as *mut u8,
                keep,
            );
        }
        self.release_frames();
        self.base = base;
        self.len = new_len.raw();
        self.frames = Some(frames);
        Ok(())
    }

    fn release_frames(&mut self) {
        if let Some(frames) = &self.frames {
            for off in (0..self.len).step_by(PAGE_SIZE) {
                frames.release(PhysAddr::from_raw(self.base.raw() + off));
            }
        }
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        self.release_frames();
    }
}

/// Payload of a handle. Exhaustive by construction: adding an object type
/// forces every dispatch site to handle it.
pub enum Object {
    Universe(Arc<Mutex<Universe>>),
    Memory(Mutex<MemoryObject>),
    Thread(Pid),
    Space(Arc<Mutex<AddressSpace>>),
    Lane(Arc<LaneEndpoint>),
    Initramfs(InitramfsFile),
}

/// A kernel object reference. Shared ownership is the `Arc` around it;
/// the last clone to drop tears the payload down.
pub struct Handle {
    object: Object,
}

impl Handle {
    pub fn new(object: Object) -> Arc<Self> {
        Arc::new(Self { object })
    }

    #[inline]
    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn tag(&self) -> HandleTag {
        match &self.object {
            Object::Universe(_) => HandleTag::Universe,
            Object::Memory(_) => HandleTag::Memory,
            Object::Thread(_) => HandleTag::Thread,
            Object::Space(_) => HandleTag::Space,
            Object::Lane(_) => HandleTag::Lane,
            Object::Initramfs(_) => HandleTag::Initramfs,
        }
    }

    pub fn as_lane(&self) -> Option<&Arc<LaneEndpoint>> {
        match &self.object {
            Object::Lane(lane) => Some(lane),
            _ => None,
        }
    }

    pub fn as_space(&self) -> Option<&Arc<Mutex<AddressSpace>>> {
        match &self.object {
            Object::Space(space) => Some(space),
            _ => None,
        }
    }

    pub fn as_universe(&self) -> Option<&Arc<Mutex<Universe>>> {
        match &self.object {
            Object::Universe(universe) => Some(universe),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&Mutex<MemoryObject>> {
        match &self.object {
            Object::Memory(memory) => Some(memory),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<Pid> {
        match &self.object {
            Object::Thread(pid) => Some(*pid),
            _ => None,
        }
    }

    pub fn as_initramfs(&self) -> Option<&InitramfsFile> {
        match &self.object {
            Object::Initramfs(file) => Some(file),
            _ => None,
        }
    }
}

/// Per-task descriptor table. Slots hold shared handle references; the table
/// grows by doubling when full, so attach never fails.
pub struct Universe {
    slots: Vec<Option<Arc<Handle>>>,
}

impl Universe {
    pub const DEFAULT_SLOTS: usize = 128;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_SLOTS)
    }

    pub fn with_capacity(slots: usize) -> Self {
        let mut table = Vec::with_capacity(slots.max(1));
        table.resize_with(slots.max(1), || None);
        Self { slots: table }
    }

    /// Stores `handle` in the lowest free slot, growing the table if needed.
    pub fn attach(&mut self, handle: Arc<Handle>) -> usize {
        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(handle);
            return slot;
        }
        let slot = self.slots.len();
        self.slots.resize_with(slot * 2, || None);
        self.slots[slot] = Some(handle);
        slot
    }

    /// Like [`attach`](Self::attach), but refuses to grow past `limit`
    /// slots. Used where a universe is handed to an untrusted holder.
    pub fn attach_bounded(
        &mut self,
        handle: Arc<Handle>,
        limit: usize,
    ) -> Result<usize, CapError> {
        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(handle);
            return Ok(slot);
        }
        let slot = self.slots.len();
        if slot >= limit {
            return Err(CapError::NoSpace);
        }
        self.slots.resize_with((slot * 2).min(limit.max(1)), || None);
        self.slots[slot] = Some(handle);
        Ok(slot)
    }

    /// Removes and returns the handle in `slot`; dropping the return value
    /// releases the table's reference.
    pub fn detach(&mut self, slot: usize) -> Result<Arc<Handle>, CapError> {
        self.slots
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(CapError::BadDescriptor)
    }

    /// Borrows the handle in `slot` without consuming it.
    pub fn get(&self, slot: usize) -> Result<&Arc<Handle>, CapError> {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or(CapError::BadDescriptor)
    }

    pub fn lane(&self, slot: usize) -> Result<Arc<LaneEndpoint>, CapError> {
        self.get(slot)?.as_lane().cloned().ok_or(CapError::BadDescriptor)
    }

    pub fn space(&self, slot: usize) -> Result<Arc<Mutex<AddressSpace>>, CapError> {
        self.get(slot)?.as_space().cloned().ok_or(CapError::BadDescriptor)
    }

    pub fn universe(&self, slot: usize) -> Result<Arc<Mutex<Universe>>, CapError> {
        self.get(slot)?.as_universe().cloned().ok_or(CapError::BadDescriptor)
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Current table size in slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests_prop;
