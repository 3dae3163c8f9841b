// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Refcounted physical frame allocator
//! OWNERS: @kernel-team
//! PUBLIC API: FrameAllocator::{alloc_contiguous, alloc_zeroed, retain, release}
//! DEPENDS_ON: spin::Mutex, alloc
//! INVARIANTS: Per-page refcounts; a block is returned to the heap only once
//! every page of it has dropped to zero; frames are PAGE_SIZE-aligned
//!
//! Frames are page-aligned heap blocks; their addresses serve as physical
//! addresses for the page-table layer, so COW sharing and teardown can be
//! exercised on the host without a real memory map. Memory objects allocate
//! contiguous multi-page blocks, while COW copies and page-table nodes take
//! single pages; either way the refcount ledger is per page, because a COW
//! fault releases one page of a block at a time.

use alloc::alloc::{alloc_zeroed as heap_alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::mm::PAGE_SIZE;
use crate::types::PhysAddr;

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicUsize, Ordering};

struct PageState {
    refs: usize,
    block: usize,
}

struct BlockState {
    pages: usize,
    dead: usize,
}

#[derive(Default)]
struct Ledger {
    pages: BTreeMap<usize, PageState>,
    blocks: BTreeMap<usize, BlockState>,
}

/// Refcounted page-frame allocator shared by address spaces and memory
/// objects.
pub struct FrameAllocator {
    ledger: Mutex<Ledger>,
    #[cfg(feature = "failpoints")]
    deny_after: AtomicUsize,
}

impl FrameAllocator {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            #[cfg(feature = "failpoints")]
            deny_after: AtomicUsize::new(usize::MAX),
        }
    }

    /// Fails the N-th allocation from now (0 fails the next one). Used by
    /// out-of-memory path tests.
    #[cfg(feature = "failpoints")]
    pub fn fail_after(&self, allocs: usize) {
        self.deny_after.store(allocs, Ordering::SeqCst);
    }

    #[cfg(feature = "failpoints")]
    fn failpoint_hit(&self) -> bool {
        let prev = self.deny_after.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| match v {
            usize::MAX => None,
            0 => Some(usize::MAX), // fire once, then disarm
            n => Some(n - 1),
        });
        matches!(prev, Ok(0))
    }

    #[cfg(not(feature = "failpoints"))]
    fn failpoint_hit(&self) -> bool {
        false
    }

    /// Allocates `pages` zeroed, physically contiguous frames with refcount 1
    /// each. Returns `None` when the backing store is exhausted.
    pub fn alloc_contiguous(&self, pages: usize) -> Option<PhysAddr> {
        if pages == 0 || self.failpoint_hit() {
            return None;
        }
        let bytes = pages.checked_mul(PAGE_SIZE)?;
        let layout = Layout::from_size_align(bytes, PAGE_SIZE).ok()?;
        // SAFETY: layout is non-zero-sized and PAGE_SIZE-aligned.
        let ptr = unsafe { heap_alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        let base = ptr as usize;
        let mut ledger = self.ledger.lock();
        ledger.blocks.insert(base, BlockState { pages, dead: 0 });
        for page in 0..pages {
            ledger
                .pages
                .insert(base + page * PAGE_SIZE, PageState { refs: 1, block: base });
        }
        Some(PhysAddr::from_raw(base))
    }

    /// Allocates a single zeroed frame.
    pub fn alloc_zeroed(&self) -> Option<PhysAddr> {
        self.alloc_contiguous(1)
    }

    /// Takes an additional reference on the frame containing `pa`.
    pub fn retain(&self, pa: PhysAddr) {
        let mut ledger = self.ledger.lock();
        if let Some(page) = ledger.pages.get_mut(&pa.page_base().raw()) {
            page.refs += 1;
        } else {
            log_warn!(target: "mm", "retain of untracked frame {pa}");
        }
    }

    /// Drops one reference on the frame containing `pa`; the owning block is
    /// returned to the heap once all of its pages are dead.
    pub fn release(&self, pa: PhysAddr) {
        let mut ledger = self.ledger.lock();
        let key = pa.page_base().raw();
        let Some(page) = ledger.pages.get_mut(&key) else {
            log_warn!(target: "mm", "release of untracked frame {pa}");
            return;
        };
        page.refs -= 1;
        if page.refs > 0 {
            return;
        }
        let block = page.block;
        ledger.pages.remove(&key);
        let done = {
            let Some(state) = ledger.blocks.get_mut(&block) else {
                return;
            };
            state.dead += 1;
            state.dead == state.pages
        };
        if done {
            let state = match ledger.blocks.remove(&block) {
                Some(state) => state,
                None => return,
            };
            drop(ledger);
            Self::free_block(block, state.pages);
        }
    }

    fn free_block(base: usize, pages: usize) {
        // Blocks are only registered after a successful allocation with this
        // exact layout, so reconstructing it here cannot fail.
        if let Ok(layout) = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE) {
            // SAFETY: `base` came from `heap_alloc_zeroed` with this layout
            // and is freed exactly once (the block entry was just removed).
            unsafe { dealloc(base as *mut u8, layout) };
        }
    }

    /// Current reference count of the frame containing `pa` (0 if untracked).
    pub fn refcount(&self, pa: PhysAddr) -> usize {
        self.ledger
            .lock()
            .pages
            .get(&pa.page_base().raw())
            .map_or(0, |p| p.refs)
    }

    /// Number of live (tracked) frames.
    pub fn live_frames(&self) -> usize {
        self.ledger.lock().pages.len()
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameAllocator {
    fn drop(&mut self) {
        // Leaked frames at teardown indicate a refcount bug somewhere; free
        // the blocks anyway so host tests stay leak-clean.
        let ledger = self.ledger.get_mut();
        if !ledger.pages.is_empty() {
            log_warn!(target: "mm", "{} frame(s) leaked at allocator teardown", ledger.pages.len());
        }
        for (&base, state) in &ledger.blocks {
            Self::free_block(base, state.pages);
        }
        ledger.pages.clear();
        ledger.blocks.clear();
    }
}

/// Views a live frame as a byte page.
///
/// # Safety
/// `pa` must be a page-aligned address of a frame currently tracked by the
/// allocator, with no concurrent mutable access to the same page.
pub(crate) unsafe fn frame_bytes<'a>(pa: PhysAddr) -> &'a [u8; PAGE_SIZE] {
    // SAFETY: caller guarantees the frame is live and unaliased for writes.
    unsafe { &*(pa.raw() as *const [u8; PAGE_SIZE]) }
}

/// Mutable view of a live frame.
///
/// # Safety
/// Same as [`frame_bytes`], plus exclusive access to the page.
pub(crate) unsafe fn frame_bytes_mut<'a>(pa: PhysAddr) -> &'a mut [u8; PAGE_SIZE] {
    // SAFETY: caller guarantees exclusive access to a live frame.
    unsafe { &mut *(pa.raw() as *mut [u8; PAGE_SIZE]) }
}
