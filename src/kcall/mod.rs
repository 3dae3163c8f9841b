// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kcall numbering, error taxonomy and dispatch
//! OWNERS: @kernel-team
//! PUBLIC API: KcallTable, Context, Args, KError, kcall numbers
//! DEPENDS_ON: cap, mm, ipc, task, sched, hal
//! INVARIANTS: Kcall numbers live above KCALL_BASE so they can never collide
//! with a foreign syscall ABI; unknown numbers fail closed; results encode
//! as one signed word (negative = error)

pub mod api;
pub mod user;

use alloc::sync::Arc;

use crate::cap::CapError;
use crate::cap::MemoryError;
use crate::hal::Timer;
use crate::initramfs::Initramfs;
use crate::ipc::lane::LaneError;
use crate::mm::frame::FrameAllocator;
use crate::mm::page_table::MapError;
use crate::mm::vma::VmaError;
use crate::sched::Scheduler;
use crate::task::{FutexTable, Task, TaskTable};

/// All kcall numbers live at or above this base.
pub const KCALL_BASE: usize = 0x8000_0000;
/// Table size; numbers are `KCALL_BASE + n` with `n < MAX_KCALL`.
pub const MAX_KCALL: usize = 96;

pub const KCALL_LOG: usize = 1;
pub const KCALL_NOP: usize = 3;
pub const KCALL_GET_CLOCK: usize = 6;
pub const KCALL_CREATE_UNIVERSE: usize = 10;
pub const KCALL_ALLOCATE_MEMORY: usize = 11;
pub const KCALL_RESIZE_MEMORY: usize = 12;
pub const KCALL_MAP_MEMORY: usize = 14;
pub const KCALL_UNMAP_MEMORY: usize = 15;
pub const KCALL_GET_MEMORY_INFO: usize = 16;
pub const KCALL_SET_MEMORY_INFO: usize = 17;
pub const KCALL_CREATE_PHYSICAL_MEMORY: usize = 19;
pub const KCALL_TRANSFER_DESCRIPTOR: usize = 20;
pub const KCALL_GET_DESCRIPTOR_INFO: usize = 21;
pub const KCALL_CLOSE_DESCRIPTOR: usize = 22;
pub const KCALL_FUTEX_WAIT: usize = 40;
pub const KCALL_FUTEX_WAKE: usize = 41;
pub const KCALL_CREATE_THREAD: usize = 50;
pub const KCALL_CREATE_SPACE: usize = 56;
pub const KCALL_CREATE_STREAM: usize = 60;
pub const KCALL_SUBMIT_DESCRIPTOR: usize = 70;
pub const KCALL_LOOKUP_INITRAMFS: usize = 80;
pub const KCALL_READ_INITRAMFS: usize = 81;

static_assertions::const_assert!(KCALL_READ_INITRAMFS < MAX_KCALL);

/// Wire error taxonomy. Every module error folds into one of these before
/// crossing the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum KError {
    BufferTooSmall = 1,
    BadDescriptor = 2,
    Timeout = 3,
    IllegalArgs = 7,
    EndOfLane = 9,
    Fault = 10,
    Cancelled = 12,
    NoMemory = 17,
    UnsupportedOperation = 18,
    OutOfBounds = 19,
    Dismissed = 20,
    AlreadyExists = 22,
}

impl KError {
    #[inline]
    pub const fn code(self) -> i64 {
        self as i64
    }
}

impl From<CapError> for KError {
    fn from(err: CapError) -> Self {
        match err {
            CapError::BadDescriptor => KError::BadDescriptor,
            CapError::NoSpace => KError::OutOfBounds,
        }
    }
}

impl From<VmaError> for KError {
    fn from(err: VmaError) -> Self {
        match err {
            VmaError::InvalidRange | VmaError::Incompatible => KError::IllegalArgs,
            VmaError::Overlap => KError::AlreadyExists,
            VmaError::NoSpace => KError::NoMemory,
        }
    }
}

impl From<MapError> for KError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::Unaligned | MapError::InvalidFlags => KError::IllegalArgs,
            MapError::OutOfRange => KError::OutOfBounds,
            MapError::Overlap => KError::AlreadyExists,
            MapError::NoMemory => KError::NoMemory,
        }
    }
}

impl From<LaneError> for KError {
    fn from(err: LaneError) -> Self {
        match err {
            LaneError::Dismissed => KError::Dismissed,
            LaneError::EndOfLane => KError::EndOfLane,
            LaneError::BufferTooSmall => KError::BufferTooSmall,
            LaneError::BadDescriptor => KError::BadDescriptor,
            LaneError::IllegalArgs => KError::IllegalArgs,
        }
    }
}

impl From<MemoryError> for KError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::NoMemory => KError::NoMemory,
            MemoryError::NotOwned => KError::UnsupportedOperation,
        }
    }
}

impl From<user::Fault> for KError {
    fn from(_: user::Fault) -> Self {
        KError::Fault
    }
}

/// Encodes a handler result as the single signed return word of the ABI:
/// non-negative success value or negated error code.
#[inline]
pub fn encode_result(result: Result<usize, KError>) -> i64 {
    match result {
        Ok(value) => value as i64,
        Err(err) => -err.code(),
    }
}

/// Raw argument registers as captured at the trap boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct Args(pub [usize; 6]);

impl Args {
    #[inline]
    pub fn handle(&self, idx: usize) -> crate::types::HandleId {
        crate::types::HandleId::from_raw(self.0[idx] as i64)
    }
}

/// Everything a handler may touch, passed in per call. No file-scope state.
pub struct Context<'a> {
    /// The calling task.
    pub task: &'a Task,
    pub tasks: &'a mut TaskTable,
    pub frames: &'a Arc<FrameAllocator>,
    pub scheduler: &'a dyn Scheduler,
    pub timer: &'a dyn Timer,
    pub futexes: &'a mut FutexTable,
    pub initramfs: Option<&'a Initramfs<'a>>,
}

/// Handler signature: decode `args`, act through `ctx`, produce the result
/// word.
pub type Handler = fn(&mut Context<'_>, &Args) -> Result<usize, KError>;

/// Fixed-size dispatch table indexed by `number - KCALL_BASE`.
pub struct KcallTable {
    entries: [Option<Handler>; MAX_KCALL],
}

impl KcallTable {
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { entries: [NONE; MAX_KCALL] }
    }

    /// Registers `handler` for `KCALL_BASE + number`.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if let Some(entry) = self.entries.get_mut(number) {
            *entry = Some(handler);
        }
    }

    /// Dispatches an absolute kcall number. Numbers below the base or
    /// without a registered handler fail closed.
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut Context<'_>,
        args: &Args,
    ) -> Result<usize, KError> {
        let index = number.checked_sub(KCALL_BASE).ok_or(KError::UnsupportedOperation)?;
        self.entries
            .get(index)
            .and_then(|entry| *entry)
            .ok_or_else(|| {
                log_debug!(target: "kcall", "unknown kcall {number:#x}");
                KError::UnsupportedOperation
            })
            .and_then(|handler| handler(ctx, args))
    }

    /// Like [`dispatch`](Self::dispatch), but producing the encoded ABI word.
    pub fn dispatch_raw(&self, number: usize, ctx: &mut Context<'_>, args: &Args) -> i64 {
        encode_result(self.dispatch(number, ctx, args))
    }
}

impl Default for KcallTable {
    fn default() -> Self {
        Self::new()
    }
}
