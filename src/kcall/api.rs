// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kcall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), kernel_table(), RawAction
//! DEPENDS_ON: cap, mm, ipc::lane, task, sched, hal, kcall::user
//! INVARIANTS: Stable kcall numbers; decode→check→execute; every user
//! pointer goes through checked copies; a handle attached for an out-param
//! is detached again if reporting its id faults

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::cap::{Handle, MemoryObject, Object, Universe};
use crate::ipc::lane::{
    self, Action, ActionReply, SubmitFlags, LANE_RING_CAPACITY, MAX_ACTIONS_PER_SUBMIT,
};
use crate::log;
use crate::mm::page_table::PteFlags;
use crate::mm::vma::{Vma, VmaFlags, VmaKind};
use crate::mm::MemoryFlags;
use crate::types::{HandleId, PageLen, PhysAddr, VirtAddr};

use super::user::{self, copy_from_user, copy_to_user, write_i64, write_u64};
use super::{Args, Context, KError, KcallTable};
use super::{
    KCALL_ALLOCATE_MEMORY, KCALL_CLOSE_DESCRIPTOR, KCALL_CREATE_PHYSICAL_MEMORY,
    KCALL_CREATE_SPACE, KCALL_CREATE_STREAM, KCALL_CREATE_THREAD, KCALL_CREATE_UNIVERSE,
    KCALL_FUTEX_WAIT, KCALL_FUTEX_WAKE, KCALL_GET_CLOCK, KCALL_GET_DESCRIPTOR_INFO,
    KCALL_GET_MEMORY_INFO, KCALL_LOG, KCALL_LOOKUP_INITRAMFS, KCALL_MAP_MEMORY, KCALL_NOP,
    KCALL_READ_INITRAMFS, KCALL_RESIZE_MEMORY, KCALL_SET_MEMORY_INFO, KCALL_SUBMIT_DESCRIPTOR,
    KCALL_TRANSFER_DESCRIPTOR, KCALL_UNMAP_MEMORY,
};

/// Wire action kinds for SubmitDescriptor batches.
pub const ACTION_DISMISS: u32 = 0;
pub const ACTION_OFFER: u32 = 1;
pub const ACTION_ACCEPT: u32 = 2;
pub const ACTION_SEND: u32 = 3;
pub const ACTION_RECV: u32 = 4;
pub const ACTION_PUSH_DESCRIPTOR: u32 = 5;
pub const ACTION_PULL_DESCRIPTOR: u32 = 6;

/// One submitted action as laid out in user memory (little-endian).
/// `length` is updated in place with transferred byte counts; `handle`
/// receives attached slot ids for Accept/Pull (negative when nothing was
/// pending).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAction {
    pub kind: u32,
    pub flags: u32,
    pub buffer: u64,
    pub length: u64,
    pub handle: i64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<RawAction>(), 32);

impl RawAction {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.kind.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.buffer.to_le_bytes());
        out[16..24].copy_from_slice(&self.length.to_le_bytes());
        out[24..32].copy_from_slice(&self.handle.to_le_bytes());
        out
    }

    pub fn from_le_bytes(raw: &[u8; Self::SIZE]) -> Self {
        let word = |range: core::ops::Range<usize>| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&raw[range]);
            bytes
        };
        let half = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&raw[at..at + 4]);
            bytes
        };
        Self {
            kind: u32::from_le_bytes(half(0)),
            flags: u32::from_le_bytes(half(4)),
            buffer: u64::from_le_bytes(word(8..16)),
            length: u64::from_le_bytes(word(16..24)),
            handle: i64::from_le_bytes(word(24..32)),
        }
    }
}

// ——— Resolution helpers ———

fn slot_of(id: HandleId) -> Result<usize, KError> {
    id.slot().ok_or(KError::BadDescriptor)
}

/// Resolves `id` to a handle: non-negative ids are universe slots, the
/// reserved references resolve against the calling task without touching
/// the table.
fn handle_at(ctx: &Context<'_>, id: HandleId) -> Result<Arc<Handle>, KError> {
    match id {
        HandleId::THIS_UNIVERSE => {
            Ok(Handle::new(Object::Universe(Arc::clone(&ctx.task.universe))))
        }
        HandleId::THIS_THREAD => Ok(Handle::new(Object::Thread(ctx.task.pid))),
        HandleId::THIS_SPACE => Ok(Handle::new(Object::Space(Arc::clone(&ctx.task.space)))),
        _ => {
            let slot = slot_of(id)?;
            Ok(ctx.task.universe.lock().get(slot).cloned()?)
        }
    }
}

fn universe_for(
    ctx: &Context<'_>,
    id: HandleId,
) -> Result<Arc<Mutex<Universe>>, KError> {
    if id == HandleId::THIS_UNIVERSE {
        return Ok(Arc::clone(&ctx.task.universe));
    }
    let slot = slot_of(id)?;
    Ok(ctx.task.universe.lock().universe(slot)?)
}

fn space_for(
    ctx: &Context<'_>,
    id: HandleId,
) -> Result<Arc<Mutex<crate::mm::page_table::AddressSpace>>, KError> {
    if id == HandleId::THIS_SPACE {
        return Ok(Arc::clone(&ctx.task.space));
    }
    let slot = slot_of(id)?;
    Ok(ctx.task.universe.lock().space(slot)?)
}

/// Attaches `handle` to the caller's universe and reports the new id through
/// `out`. A faulting report detaches again so the object is not stranded.
fn attach_and_report(ctx: &Context<'_>, handle: Arc<Handle>, out: usize) -> Result<usize, KError> {
    let slot = ctx.task.universe.lock().attach(handle);
    if let Err(err) = write_i64(&mut ctx.task.space.lock(), out, slot as i64) {
        let _ = ctx.task.universe.lock().detach(slot);
        return Err(err.into());
    }
    Ok(slot)
}

// ——— Trivial handlers ———

fn nop(_ctx: &mut Context<'_>, _args: &Args) -> Result<usize, KError> {
    Ok(0)
}

fn get_clock(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let now = ctx.timer.now();
    write_u64(&mut ctx.task.space.lock(), args.0[0], now)?;
    Ok(0)
}

const LOG_LINE_MAX: usize = 512;

fn log_message(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let (severity, ptr, len) = (args.0[0], args.0[1], args.0[2]);
    if len > LOG_LINE_MAX {
        return Err(KError::IllegalArgs);
    }
    let mut raw = vec![0u8; len];
    copy_from_user(&ctx.task.space.lock(), ptr, &mut raw)?;
    let msg = core::str::from_utf8(&raw).map_err(|_| KError::IllegalArgs)?;
    let level = match severity {
        0..=3 => log::Level::Error,
        4 => log::Level::Warn,
        5 | 6 => log::Level::Info,
        _ => log::Level::Debug,
    };
    log::emit(level, "user", format_args!("{}", msg));
    Ok(0)
}

// ——— Object creation ———

fn create_universe(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let handle = Handle::new(Object::Universe(Arc::new(Mutex::new(Universe::new()))));
    attach_and_report(ctx, handle, args.0[0]).map(|_| 0)
}

fn create_space(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let clone = ctx.task.space.lock().clone_cow()?;
    let handle = Handle::new(Object::Space(Arc::new(Mutex::new(clone))));
    attach_and_report(ctx, handle, args.0[0]).map(|_| 0)
}

#[derive(Copy, Clone)]
struct CreateThreadArgsTyped {
    universe: HandleId,
    space: HandleId,
    entry: usize,
    stack: usize,
    arg: usize,
    out: usize,
}

impl CreateThreadArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self {
            universe: args.handle(0),
            space: args.handle(1),
            entry: args.0[2],
            stack: args.0[3],
            arg: args.0[4],
            out: args.0[5],
        }
    }

    #[inline]
    fn check(&self) -> Result<(), KError> {
        if self.entry == 0 {
            return Err(KError::IllegalArgs);
        }
        Ok(())
    }
}

fn create_thread(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let typed = CreateThreadArgsTyped::decode(args);
    typed.check()?;
    let universe = universe_for(ctx, typed.universe)?;
    let space = space_for(ctx, typed.space)?;
    let pid = ctx.tasks.spawn(universe, space, typed.entry, typed.stack, typed.arg);
    ctx.scheduler.enqueue(pid);
    log_debug!(target: "kcall", "spawned task {pid} entry={:#x}", typed.entry);
    attach_and_report(ctx, Handle::new(Object::Thread(pid)), typed.out).map(|_| 0)
}

fn create_stream(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let (out_a, out_b) = (args.0[0], args.0[1]);
    let (a, b) = lane::LaneEndpoint::pair();
    let slot_a = attach_and_report(ctx, Handle::new(Object::Lane(a)), out_a)?;
    let slot_b = ctx.task.universe.lock().attach(Handle::new(Object::Lane(b)));
    if let Err(err) = write_i64(&mut ctx.task.space.lock(), out_b, slot_b as i64) {
        let mut universe = ctx.task.universe.lock();
        let _ = universe.detach(slot_a);
        let _ = universe.detach(slot_b);
        return Err(err.into());
    }
    Ok(0)
}

// ——— Memory objects ———

#[derive(Copy, Clone)]
struct AllocateArgsTyped {
    len: PageLen,
    info: MemoryFlags,
    restrictions: usize,
    out: usize,
}

impl AllocateArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, KError> {
        let len = PageLen::from_bytes_round_up(args.0[0]).ok_or(KError::IllegalArgs)?;
        let info =
            MemoryFlags::from_bits(args.0[1] as u64).ok_or(KError::IllegalArgs)?;
        Ok(Self { len, info, restrictions: args.0[2], out: args.0[3] })
    }
}

fn allocate_memory(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let typed = AllocateArgsTyped::decode(args)?;
    if typed.restrictions != 0 {
        // One physical pool on this target; the width restriction is only
        // validated.
        let bits = user::read_u32(&ctx.task.space.lock(), typed.restrictions)?;
        if !(1..=64).contains(&bits) {
            return Err(KError::IllegalArgs);
        }
    }
    let memory = MemoryObject::allocate(ctx.frames, typed.len, typed.info)?;
    attach_and_report(ctx, Handle::new(Object::Memory(Mutex::new(memory))), typed.out)
        .map(|_| 0)
}

fn create_physical_memory(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let base = PhysAddr::from_raw(args.0[0]);
    if !base.is_page_aligned() {
        return Err(KError::IllegalArgs);
    }
    let len = PageLen::from_bytes_round_up(args.0[1]).ok_or(KError::IllegalArgs)?;
    let info = MemoryFlags::from_bits(args.0[2] as u64).ok_or(KError::IllegalArgs)?;
    let memory = MemoryObject::physical(base, len, info);
    attach_and_report(ctx, Handle::new(Object::Memory(Mutex::new(memory))), args.0[3])
        .map(|_| 0)
}

fn resize_memory(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let handle = handle_at(ctx, args.handle(0))?;
    let memory = handle.as_memory().ok_or(KError::BadDescriptor)?;
    let len = PageLen::from_bytes_round_up(args.0[1]).ok_or(KError::IllegalArgs)?;
    memory.lock().resize(len)?;
    Ok(0)
}

fn get_memory_info(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let handle = handle_at(ctx, args.handle(0))?;
    let memory = handle.as_memory().ok_or(KError::BadDescriptor)?;
    let (len, info) = {
        let m = memory.lock();
        (m.len(), m.info())
    };
    let mut space = ctx.task.space.lock();
    if args.0[1] != 0 {
        write_u64(&mut space, args.0[1], len as u64)?;
    }
    if args.0[2] != 0 {
        write_u64(&mut space, args.0[2], info.bits())?;
    }
    Ok(0)
}

fn set_memory_info(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let handle = handle_at(ctx, args.handle(0))?;
    let memory = handle.as_memory().ok_or(KError::BadDescriptor)?;
    let info = MemoryFlags::from_bits(args.0[1] as u64).ok_or(KError::IllegalArgs)?;
    memory.lock().set_info(info);
    Ok(0)
}

// ——— Mapping ———

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct MapRequestFlags: u32 {
        const SHARED = 1 << 0;
    }
}

#[derive(Copy, Clone)]
struct MapArgsTyped {
    memory: HandleId,
    space: HandleId,
    hint: usize,
    len: PageLen,
    flags: MapRequestFlags,
    out: usize,
}

impl MapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, KError> {
        Ok(Self {
            memory: args.handle(0),
            space: args.handle(1),
            hint: args.0[2],
            len: PageLen::from_bytes_round_up(args.0[3]).ok_or(KError::IllegalArgs)?,
            flags: MapRequestFlags::from_bits(args.0[4] as u32)
                .ok_or(KError::IllegalArgs)?,
            out: args.0[5],
        })
    }
}

fn map_memory(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let typed = MapArgsTyped::decode(args)?;
    let handle = handle_at(ctx, typed.memory)?;
    let memory = handle.as_memory().ok_or(KError::BadDescriptor)?;
    let (base, info, mem_len) = {
        let m = memory.lock();
        (m.base(), m.info(), m.len())
    };
    if typed.len.raw() > mem_len {
        return Err(KError::OutOfBounds);
    }

    let space_arc = space_for(ctx, typed.space)?;
    let va = {
        let mut space = space_arc.lock();
        let va = space.vmas().find_unmapped_area(typed.hint, typed.len.raw())?;
        let mut vma_flags = VmaFlags::empty();
        if info.contains(MemoryFlags::READ) {
            vma_flags |= VmaFlags::READ;
        }
        if info.contains(MemoryFlags::WRITE) {
            vma_flags |= VmaFlags::WRITE;
        }
        if typed.flags.contains(MapRequestFlags::SHARED) {
            vma_flags |= VmaFlags::SHARED;
        }
        space.vmas_mut().insert(Vma {
            start: va,
            end: va + typed.len.raw(),
            flags: vma_flags,
            kind: VmaKind::Anonymous,
            name: None,
        })?;

        let mut pte = PteFlags::VALID | PteFlags::USER;
        if info.contains(MemoryFlags::WRITE) {
            pte |= PteFlags::WRITE;
        }
        if let Err(err) = space.map_range(va, base, typed.len.raw(), pte) {
            let _ = space.unmap_range(va, typed.len.raw());
            let _ = space.vmas_mut().remove(va);
            return Err(err.into());
        }
        va
    };

    if typed.out != 0 {
        write_u64(&mut ctx.task.space.lock(), typed.out, va as u64)?;
    }
    Ok(va)
}

fn unmap_memory(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let space_arc = space_for(ctx, args.handle(0))?;
    let addr = VirtAddr::page_aligned(args.0[1]).ok_or(KError::IllegalArgs)?;
    let len = PageLen::from_bytes_round_up(args.0[2]).ok_or(KError::IllegalArgs)?;
    let end = addr.checked_add(len.raw()).ok_or(KError::OutOfBounds)?;
    let mut space = space_arc.lock();
    space.vmas_mut().unmap_range(addr.raw(), end)?;
    space.unmap_range(addr.raw(), len.raw())?;
    Ok(0)
}

// ——— Descriptor plumbing ———

fn transfer_descriptor(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let slot = slot_of(args.handle(0))?;
    let other = universe_for(ctx, args.handle(1))?;
    let direction = args.0[2];
    let out = args.0[3];
    let caller = Arc::clone(&ctx.task.universe);
    let (src, dst) = match direction {
        0 => (caller, other),
        1 => (other, caller),
        _ => return Err(KError::IllegalArgs),
    };

    let new_slot = if Arc::ptr_eq(&src, &dst) {
        let mut universe = src.lock();
        let handle = universe.get(slot).cloned()?;
        universe.attach(handle)
    } else {
        let handle = src.lock().get(slot).cloned()?;
        dst.lock().attach(handle)
    };

    if let Err(err) = write_i64(&mut ctx.task.space.lock(), out, new_slot as i64) {
        let _ = dst.lock().detach(new_slot);
        return Err(err.into());
    }
    Ok(new_slot)
}

fn close_descriptor(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let universe = universe_for(ctx, args.handle(0))?;
    let slot = slot_of(args.handle(1))?;
    let handle = universe.lock().detach(slot)?;
    drop(handle);
    Ok(0)
}

fn get_descriptor_info(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let handle = handle_at(ctx, args.handle(0))?;
    let tag = handle.tag() as u32;
    write_u64(&mut ctx.task.space.lock(), args.0[1], tag as u64)?;
    Ok(0)
}

// ——— Lane submission ———

fn submit_descriptor(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let lane = {
        let slot = slot_of(args.handle(0))?;
        ctx.task.universe.lock().lane(slot)?
    };
    let actions_ptr = args.0[1];
    let count = args.0[2];
    let flags = SubmitFlags::from_bits(args.0[3] as u32).ok_or(KError::IllegalArgs)?;
    if count > MAX_ACTIONS_PER_SUBMIT {
        return Err(KError::IllegalArgs);
    }

    let mut raw = vec![0u8; count * RawAction::SIZE];
    copy_from_user(&ctx.task.space.lock(), actions_ptr, &mut raw)?;
    let mut raws: Vec<RawAction> = Vec::with_capacity(count);
    for chunk in raw.chunks_exact(RawAction::SIZE) {
        let bytes: &[u8; RawAction::SIZE] =
            chunk.try_into().map_err(|_| KError::IllegalArgs)?;
        raws.push(RawAction::from_le_bytes(bytes));
    }

    // Stage kernel-side buffers: payloads in for Send, scratch for Recv.
    let mut staged: Vec<Vec<u8>> = Vec::with_capacity(count);
    for action in &raws {
        match action.kind {
            ACTION_SEND | ACTION_RECV => {
                let len = action.length as usize;
                if len > LANE_RING_CAPACITY {
                    return Err(KError::BufferTooSmall);
                }
                let mut buf = vec![0u8; len];
                if action.kind == ACTION_SEND {
                    copy_from_user(&ctx.task.space.lock(), action.buffer as usize, &mut buf)?;
                }
                staged.push(buf);
            }
            _ => staged.push(Vec::new()),
        }
    }

    let mut actions: Vec<Action<'_>> = Vec::with_capacity(count);
    for (action, buf) in raws.iter().zip(staged.iter_mut()) {
        actions.push(match action.kind {
            ACTION_DISMISS => Action::Dismiss,
            ACTION_OFFER => Action::Offer { slot: slot_of(HandleId::from_raw(action.handle))? },
            ACTION_ACCEPT => Action::Accept,
            ACTION_SEND => Action::Send(&buf[..]),
            ACTION_RECV => Action::Recv(&mut buf[..]),
            ACTION_PUSH_DESCRIPTOR => {
                Action::PushDescriptor { slot: slot_of(HandleId::from_raw(action.handle))? }
            }
            ACTION_PULL_DESCRIPTOR => Action::PullDescriptor,
            _ => return Err(KError::IllegalArgs),
        });
    }

    let replies = lane::submit(&lane, &ctx.task.universe, &mut actions, flags, ctx.scheduler)?;
    drop(actions);

    // Report per-action results back into the caller's array.
    for (i, reply) in replies.iter().enumerate() {
        match *reply {
            ActionReply::Received(n) => {
                copy_to_user(
                    &mut ctx.task.space.lock(),
                    raws[i].buffer as usize,
                    &staged[i][..n],
                )?;
                raws[i].length = n as u64;
            }
            ActionReply::Sent(n) => raws[i].length = n as u64,
            ActionReply::Accepted(slot) | ActionReply::Pulled(slot) => {
                raws[i].handle = slot.map_or(-1, |s| s as i64);
            }
            ActionReply::Done => {}
        }
    }
    let mut out = Vec::with_capacity(raw.len());
    for action in &raws {
        out.extend_from_slice(&action.to_le_bytes());
    }
    copy_to_user(&mut ctx.task.space.lock(), actions_ptr, &out)?;
    Ok(0)
}

// ——— Futexes ———

fn futex_wait(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let (addr, expected, deadline) = (args.0[0], args.0[1] as u32, args.0[2]);
    let current = user::read_u32(&ctx.task.space.lock(), addr)?;
    if current != expected {
        return Err(KError::Cancelled);
    }
    let deadline = (deadline != 0).then_some(deadline as u64);
    ctx.futexes.wait(addr, ctx.scheduler.current(), deadline, ctx.scheduler);
    Ok(0)
}

fn futex_wake(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let (addr, count) = (args.0[0], args.0[1]);
    Ok(ctx.futexes.wake(addr, count, ctx.scheduler))
}

// ——— Initramfs ———

const PATH_MAX: usize = 1024;

fn lookup_initramfs(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let (ptr, len, out) = (args.0[0], args.0[1], args.0[2]);
    if len > PATH_MAX {
        return Err(KError::IllegalArgs);
    }
    let fs = ctx.initramfs.ok_or(KError::UnsupportedOperation)?;
    let mut raw = vec![0u8; len];
    copy_from_user(&ctx.task.space.lock(), ptr, &mut raw)?;
    let path = core::str::from_utf8(&raw).map_err(|_| KError::IllegalArgs)?;
    let file = fs.lookup(path).ok_or(KError::BadDescriptor)?;
    attach_and_report(ctx, Handle::new(Object::Initramfs(file)), out).map(|_| 0)
}

fn read_initramfs(ctx: &mut Context<'_>, args: &Args) -> Result<usize, KError> {
    let handle = handle_at(ctx, args.handle(0))?;
    let file = *handle.as_initramfs().ok_or(KError::BadDescriptor)?;
    let (offset, ptr, len) = (args.0[1], args.0[2], args.0[3]);
    let fs = ctx.initramfs.ok_or(KError::UnsupportedOperation)?;
    if offset >= file.len() {
        return Ok(0);
    }
    let mut stage = vec![0u8; len.min(file.len() - offset)];
    let n = fs.read(&file, offset, &mut stage);
    copy_to_user(&mut ctx.task.space.lock(), ptr, &stage[..n])?;
    Ok(n)
}

/// Registers every handler on `table`.
pub fn install_handlers(table: &mut KcallTable) {
    table.register(KCALL_LOG, log_message);
    table.register(KCALL_NOP, nop);
    table.register(KCALL_GET_CLOCK, get_clock);
    table.register(KCALL_CREATE_UNIVERSE, create_universe);
    table.register(KCALL_ALLOCATE_MEMORY, allocate_memory);
    table.register(KCALL_RESIZE_MEMORY, resize_memory);
    table.register(KCALL_MAP_MEMORY, map_memory);
    table.register(KCALL_UNMAP_MEMORY, unmap_memory);
    table.register(KCALL_GET_MEMORY_INFO, get_memory_info);
    table.register(KCALL_SET_MEMORY_INFO, set_memory_info);
    table.register(KCALL_CREATE_PHYSICAL_MEMORY, create_physical_memory);
    table.register(KCALL_TRANSFER_DESCRIPTOR, transfer_descriptor);
    table.register(KCALL_GET_DESCRIPTOR_INFO, get_descriptor_info);
    table.register(KCALL_CLOSE_DESCRIPTOR, close_descriptor);
    table.register(KCALL_FUTEX_WAIT, futex_wait);
    table.register(KCALL_FUTEX_WAKE, futex_wake);
    table.register(KCALL_CREATE_THREAD, create_thread);
    table.register(KCALL_CREATE_SPACE, create_space);
    table.register(KCALL_CREATE_STREAM, create_stream);
    table.register(KCALL_SUBMIT_DESCRIPTOR, submit_descriptor);
    table.register(KCALL_LOOKUP_INITRAMFS, lookup_initramfs);
    table.register(KCALL_READ_INITRAMFS, read_initramfs);
}

/// A fully populated dispatch table.
pub fn kernel_table() -> KcallTable {
    let mut table = KcallTable::new();
    install_handlers(&mut table);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::HandleTag;
    use crate::hal::FixedTimer;
    use crate::mm::frame::FrameAllocator;
    use crate::mm::page_table::AddressSpace;
    use crate::mm::{PAGE_SIZE, USER_MMAP_START};
    use crate::sched::NullScheduler;
    use crate::task::{FutexTable, Task, TaskTable};
    use crate::types::Pid;

    // Below the mmap window, so mapped objects never collide with it.
    const SCRATCH: usize = 0x1000_0000;
    const SCRATCH_PAGES: usize = 4;

    const THIS_SPACE: usize = HandleId::THIS_SPACE.as_raw() as usize;
    const THIS_UNIVERSE: usize = HandleId::THIS_UNIVERSE.as_raw() as usize;

    struct Fixture {
        frames: Arc<FrameAllocator>,
        tasks: TaskTable,
        sched: NullScheduler,
        timer: FixedTimer,
        futexes: FutexTable,
        task: Task,
        table: KcallTable,
    }

    fn fixture() -> Fixture {
        let frames = Arc::new(FrameAllocator::new());
        let mut space = AddressSpace::new(Arc::clone(&frames)).unwrap();
        let block = frames.alloc_contiguous(SCRATCH_PAGES).unwrap();
        let rw = PteFlags::VALID | PteFlags::WRITE | PteFlags::USER;
        space.map_range(SCRATCH, block, SCRATCH_PAGES * PAGE_SIZE, rw).unwrap();
        for page in 0..SCRATCH_PAGES {
            frames.release(PhysAddr::from_raw(block.raw() + page * PAGE_SIZE));
        }
        // The region record makes the scratch pages fault-resolvable after a
        // COW clone.
        space
            .vmas_mut()
            .insert(Vma::anonymous(
                SCRATCH,
                SCRATCH + SCRATCH_PAGES * PAGE_SIZE,
                VmaFlags::READ | VmaFlags::WRITE,
            ))
            .unwrap();
        let task = Task {
            pid: Pid::from_raw(1),
            universe: Arc::new(Mutex::new(Universe::new())),
            space: Arc::new(Mutex::new(space)),
            entry: 0,
            stack: 0,
            arg: 0,
        };
        Fixture {
            frames,
            tasks: TaskTable::new(),
            sched: NullScheduler::new(Pid::from_raw(1)),
            timer: FixedTimer(1234),
            futexes: FutexTable::new(),
            task,
            table: kernel_table(),
        }
    }

    fn call(fix: &mut Fixture, number: usize, args: [usize; 6]) -> Result<usize, KError> {
        let mut ctx = Context {
            task: &fix.task,
            tasks: &mut fix.tasks,
            frames: &fix.frames,
            scheduler: &fix.sched,
            timer: &fix.timer,
            futexes: &mut fix.futexes,
            initramfs: None,
        };
        fix.table.dispatch(super::super::KCALL_BASE + number, &mut ctx, &Args(args))
    }

    fn read_out_id(fix: &Fixture, uva: usize) -> usize {
        let id = user::read_u64(&fix.task.space.lock(), uva).unwrap() as i64;
        assert!(id >= 0, "out-param held error id {id}");
        id as usize
    }

    #[test]
    fn nop_dispatches_and_unknown_numbers_fail_closed() {
        let mut fix = fixture();
        assert_eq!(call(&mut fix, KCALL_NOP, [0; 6]), Ok(0));
        assert_eq!(call(&mut fix, 2, [0; 6]), Err(KError::UnsupportedOperation));
    }

    #[test]
    fn get_clock_reports_timer_time() {
        let mut fix = fixture();
        assert_eq!(call(&mut fix, KCALL_GET_CLOCK, [SCRATCH, 0, 0, 0, 0, 0]), Ok(0));
        assert_eq!(user::read_u64(&fix.task.space.lock(), SCRATCH), Ok(1234));
    }

    #[test]
    fn create_universe_yields_an_introspectable_descriptor() {
        let mut fix = fixture();
        assert_eq!(call(&mut fix, KCALL_CREATE_UNIVERSE, [SCRATCH, 0, 0, 0, 0, 0]), Ok(0));
        let slot = read_out_id(&fix, SCRATCH);

        assert_eq!(
            call(&mut fix, KCALL_GET_DESCRIPTOR_INFO, [slot, SCRATCH + 8, 0, 0, 0, 0]),
            Ok(0)
        );
        let tag = user::read_u64(&fix.task.space.lock(), SCRATCH + 8).unwrap();
        assert_eq!(tag, HandleTag::Universe as u32 as u64);
    }

    #[test]
    fn reserved_references_resolve_to_the_callers_objects() {
        let mut fix = fixture();
        let this_thread = HandleId::THIS_THREAD.as_raw() as usize;
        for (id, tag) in [
            (THIS_UNIVERSE, HandleTag::Universe),
            (this_thread, HandleTag::Thread),
            (THIS_SPACE, HandleTag::Space),
        ] {
            assert_eq!(
                call(&mut fix, KCALL_GET_DESCRIPTOR_INFO, [id, SCRATCH, 0, 0, 0, 0]),
                Ok(0)
            );
            let got = user::read_u64(&fix.task.space.lock(), SCRATCH).unwrap();
            assert_eq!(got, tag as u32 as u64);
        }
        // A reserved reference of the wrong kind is still refused by typed
        // operations.
        assert_eq!(
            call(&mut fix, KCALL_RESIZE_MEMORY, [this_thread, PAGE_SIZE, 0, 0, 0, 0]),
            Err(KError::BadDescriptor)
        );
    }

    #[test]
    fn a_faulting_out_param_rolls_the_attach_back() {
        let mut fix = fixture();
        let before = fix.task.universe.lock().occupied();
        let unmapped = SCRATCH + SCRATCH_PAGES * PAGE_SIZE;
        assert_eq!(
            call(&mut fix, KCALL_CREATE_UNIVERSE, [unmapped, 0, 0, 0, 0, 0]),
            Err(KError::Fault)
        );
        assert_eq!(fix.task.universe.lock().occupied(), before);
    }

    #[test]
    fn memory_objects_map_into_the_window_and_unmap_again() {
        let mut fix = fixture();
        let len = 2 * PAGE_SIZE;
        let info = (MemoryFlags::READ | MemoryFlags::WRITE).bits() as usize;
        assert_eq!(
            call(&mut fix, KCALL_ALLOCATE_MEMORY, [len, info, 0, SCRATCH, 0, 0]),
            Ok(0)
        );
        let memory = read_out_id(&fix, SCRATCH);

        assert_eq!(
            call(&mut fix, KCALL_GET_MEMORY_INFO, [memory, SCRATCH + 8, SCRATCH + 16, 0, 0, 0]),
            Ok(0)
        );
        let space = fix.task.space.lock();
        assert_eq!(user::read_u64(&space, SCRATCH + 8), Ok(len as u64));
        assert_eq!(user::read_u64(&space, SCRATCH + 16), Ok(info as u64));
        drop(space);

        let va = call(
            &mut fix,
            KCALL_MAP_MEMORY,
            [memory, THIS_SPACE, 0, len, 0, SCRATCH + 24],
        )
        .unwrap();
        assert!(va >= USER_MMAP_START);
        assert_eq!(read_out_id(&fix, SCRATCH + 24), va);

        copy_to_user(&mut fix.task.space.lock(), va + 100, b"through the map").unwrap();
        let mut back = [0u8; 15];
        copy_from_user(&fix.task.space.lock(), va + 100, &mut back).unwrap();
        assert_eq!(&back, b"through the map");

        assert_eq!(call(&mut fix, KCALL_UNMAP_MEMORY, [THIS_SPACE, va, len, 0, 0, 0]), Ok(0));
        assert!(copy_from_user(&fix.task.space.lock(), va, &mut back).is_err());
    }

    #[test]
    fn memory_handlers_reject_bad_descriptors() {
        let mut fix = fixture();
        assert_eq!(
            call(&mut fix, KCALL_RESIZE_MEMORY, [7, PAGE_SIZE, 0, 0, 0, 0]),
            Err(KError::BadDescriptor)
        );
        // A thread descriptor is not a memory object.
        let slot = fix
            .task
            .universe
            .lock()
            .attach(Handle::new(Object::Thread(Pid::from_raw(2))));
        assert_eq!(
            call(&mut fix, KCALL_MAP_MEMORY, [slot, THIS_SPACE, 0, PAGE_SIZE, 0, 0]),
            Err(KError::BadDescriptor)
        );
        assert_eq!(
            call(&mut fix, KCALL_ALLOCATE_MEMORY, [0, 0, 0, SCRATCH, 0, 0]),
            Err(KError::IllegalArgs)
        );
        // Unmap addresses must be page-aligned and canonical.
        assert_eq!(
            call(&mut fix, KCALL_UNMAP_MEMORY, [THIS_SPACE, SCRATCH + 1, PAGE_SIZE, 0, 0, 0]),
            Err(KError::IllegalArgs)
        );
        assert_eq!(
            call(
                &mut fix,
                KCALL_UNMAP_MEMORY,
                [THIS_SPACE, 0x0001_0000_0000_0000, PAGE_SIZE, 0, 0, 0]
            ),
            Err(KError::IllegalArgs)
        );
    }

    #[test]
    fn futex_wait_checks_the_word_and_parks() {
        let mut fix = fixture();
        copy_to_user(&mut fix.task.space.lock(), SCRATCH, &7u32.to_le_bytes()).unwrap();

        assert_eq!(
            call(&mut fix, KCALL_FUTEX_WAIT, [SCRATCH, 9, 0, 0, 0, 0]),
            Err(KError::Cancelled)
        );
        assert!(!fix.sched.is_blocked(Pid::from_raw(1)));

        assert_eq!(call(&mut fix, KCALL_FUTEX_WAIT, [SCRATCH, 7, 0, 0, 0, 0]), Ok(0));
        assert!(fix.sched.is_blocked(Pid::from_raw(1)));
        assert_eq!(call(&mut fix, KCALL_FUTEX_WAKE, [SCRATCH, 8, 0, 0, 0, 0]), Ok(1));
        assert!(!fix.sched.is_blocked(Pid::from_raw(1)));
    }

    #[test]
    fn transfer_moves_a_descriptor_between_universes() {
        let mut fix = fixture();
        call(&mut fix, KCALL_CREATE_UNIVERSE, [SCRATCH, 0, 0, 0, 0, 0]).unwrap();
        let child = read_out_id(&fix, SCRATCH);
        call(
            &mut fix,
            KCALL_ALLOCATE_MEMORY,
            [PAGE_SIZE, MemoryFlags::READ.bits() as usize, 0, SCRATCH + 8, 0, 0],
        )
        .unwrap();
        let memory = read_out_id(&fix, SCRATCH + 8);

        let moved =
            call(&mut fix, KCALL_TRANSFER_DESCRIPTOR, [memory, child, 0, SCRATCH + 16, 0, 0])
                .unwrap();
        assert_eq!(read_out_id(&fix, SCRATCH + 16), moved);
        let child_universe = fix.task.universe.lock().universe(child).unwrap();
        assert!(child_universe.lock().get(moved).is_ok());

        assert_eq!(
            call(&mut fix, KCALL_CLOSE_DESCRIPTOR, [THIS_UNIVERSE, memory, 0, 0, 0, 0]),
            Ok(0)
        );
        assert!(fix.task.universe.lock().get(memory).is_err());
        // The transferred copy is unaffected.
        assert!(child_universe.lock().get(moved).is_ok());
    }

    #[test]
    fn create_thread_spawns_and_attaches_a_descriptor() {
        let mut fix = fixture();
        let args = [THIS_UNIVERSE, THIS_SPACE, 0x4000_0000, 0x5000_0000, 42, SCRATCH];
        assert_eq!(call(&mut fix, KCALL_CREATE_THREAD, args), Ok(0));
        let slot = read_out_id(&fix, SCRATCH);
        let pid = fix.task.universe.lock().get(slot).unwrap().as_thread().unwrap();
        assert_eq!(fix.tasks.get(pid).map(|t| t.arg), Some(42));

        let bad = [THIS_UNIVERSE, THIS_SPACE, 0, 0, 0, SCRATCH];
        assert_eq!(call(&mut fix, KCALL_CREATE_THREAD, bad), Err(KError::IllegalArgs));
    }

    #[test]
    fn stream_actions_roundtrip_through_user_memory() {
        let mut fix = fixture();
        call(&mut fix, KCALL_CREATE_STREAM, [SCRATCH, SCRATCH + 8, 0, 0, 0, 0]).unwrap();
        let a = read_out_id(&fix, SCRATCH);
        let b = read_out_id(&fix, SCRATCH + 8);

        let payload = SCRATCH + 0x200;
        copy_to_user(&mut fix.task.space.lock(), payload, b"ping").unwrap();
        let send = RawAction {
            kind: ACTION_SEND,
            flags: 0,
            buffer: payload as u64,
            length: 4,
            handle: 0,
        };
        let actions = SCRATCH + 0x100;
        copy_to_user(&mut fix.task.space.lock(), actions, &send.to_le_bytes()).unwrap();
        let no_recv = SubmitFlags::NO_RECEIVING.bits() as usize;
        assert_eq!(
            call(&mut fix, KCALL_SUBMIT_DESCRIPTOR, [a, actions, 1, no_recv, 0, 0]),
            Ok(0)
        );

        let recv_buf = SCRATCH + 0x300;
        let recv = RawAction {
            kind: ACTION_RECV,
            flags: 0,
            buffer: recv_buf as u64,
            length: 4,
            handle: 0,
        };
        copy_to_user(&mut fix.task.space.lock(), actions, &recv.to_le_bytes()).unwrap();
        assert_eq!(call(&mut fix, KCALL_SUBMIT_DESCRIPTOR, [b, actions, 1, 0, 0, 0]), Ok(0));

        let mut got = [0u8; 4];
        copy_from_user(&fix.task.space.lock(), recv_buf, &mut got).unwrap();
        assert_eq!(&got, b"ping");

        let mut raw = [0u8; RawAction::SIZE];
        copy_from_user(&fix.task.space.lock(), actions, &mut raw).unwrap();
        assert_eq!(RawAction::from_le_bytes(&raw).length, 4);
    }

    #[test]
    fn initramfs_kcalls_need_a_boot_image() {
        let mut fix = fixture();
        copy_to_user(&mut fix.task.space.lock(), SCRATCH, b"bin/init").unwrap();
        assert_eq!(
            call(&mut fix, KCALL_LOOKUP_INITRAMFS, [SCRATCH, 8, SCRATCH + 16, 0, 0, 0]),
            Err(KError::UnsupportedOperation)
        );
    }
}
