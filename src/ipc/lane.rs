// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Lane endpoints and batched action submission
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: LaneEndpoint, Action, ActionReply, SubmitFlags, submit
//! DEPENDS_ON: cap::{Universe, Handle}, sched::Scheduler, spin::Mutex
//! INVARIANTS: Ring holds at most LANE_RING_CAPACITY bytes and a send either
//! fits whole or fails; descriptor/connection queues drop silently when full;
//! the pair dies when the last handle to either endpoint drops (Weak peer)
//!
//! A lane is one half of a bidirectional byte-plus-descriptor conduit.
//! Send-class actions apply to the PEER endpoint (its ring, its queues);
//! receive-class actions drain SELF. Submission is two-phase: sends first,
//! then an optional cooperative wait until a byte is available for the
//! batch's receives, then the drains. No endpoint lock is held while
//! waiting.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use crate::cap::{Handle, Object, Universe};
use crate::sched::Scheduler;

/// Byte capacity of one endpoint's receive ring.
pub const LANE_RING_CAPACITY: usize = 65536;
/// Pending in-flight descriptors per endpoint.
pub const LANE_PENDING_DESCRIPTORS: usize = 64;
/// Pending not-yet-accepted connections per endpoint.
pub const LANE_MAX_CONNECTIONS: usize = 16;
/// Upper bound on one submitted batch.
pub const MAX_ACTIONS_PER_SUBMIT: usize = 128;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SubmitFlags: u32 {
        /// Skip phase 2 entirely: fire-and-forget submission.
        const NO_RECEIVING = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneError {
    /// The peer endpoint no longer exists.
    Dismissed,
    /// Nothing buffered to receive.
    EndOfLane,
    /// Payload does not fit the ring, or more was requested than buffered.
    BufferTooSmall,
    /// A slot id did not resolve to the required object.
    BadDescriptor,
    /// Malformed batch (too many actions).
    IllegalArgs,
}

struct LaneInner {
    ring: VecDeque<u8>,
    pending_descs: VecDeque<Arc<Handle>>,
    connections: VecDeque<Arc<LaneEndpoint>>,
}

/// One endpoint of a lane pair.
pub struct LaneEndpoint {
    inner: Mutex<LaneInner>,
    peer: Mutex<Weak<LaneEndpoint>>,
}

impl LaneEndpoint {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LaneInner {
                ring: VecDeque::new(),
                pending_descs: VecDeque::new(),
                connections: VecDeque::new(),
            }),
            peer: Mutex::new(Weak::new()),
        })
    }

    /// Creates a connected pair.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Self::new();
        let b = Self::new();
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }

    fn peer(&self) -> Option<Arc<Self>> {
        self.peer.lock().upgrade()
    }

    /// True while the peer endpoint is still referenced somewhere.
    pub fn connected(&self) -> bool {
        self.peer().is_some()
    }

    /// Bytes currently buffered for this endpoint to receive.
    pub fn bytes_available(&self) -> usize {
        self.inner.lock().ring.len()
    }

    /// Appends `data` to the peer's ring, whole or not at all.
    pub fn send_bytes(&self, data: &[u8]) -> Result<usize, LaneError> {
        let peer = self.peer().ok_or(LaneError::Dismissed)?;
        let mut inner = peer.inner.lock();
        if inner.ring.len() + data.len() > LANE_RING_CAPACITY {
            return Err(LaneError::BufferTooSmall);
        }
        inner.ring.extend(data.iter().copied());
        Ok(data.len())
    }

    /// Fills `buf` from this endpoint's ring. Empty ring → `EndOfLane`;
    /// request beyond occupancy → `BufferTooSmall`; otherwise exactly
    /// `buf.len()` bytes are consumed from the front.
    pub fn recv_bytes(&self, buf: &mut [u8]) -> Result<usize, LaneError> {
        let mut inner = self.inner.lock();
        if inner.ring.is_empty() {
            return Err(LaneError::EndOfLane);
        }
        let n = buf.len();
        if n > inner.ring.len() {
            return Err(LaneError::BufferTooSmall);
        }
        for (dst, src) in buf.iter_mut().zip(inner.ring.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    /// Queues `endpoint` on the peer's connection queue; a full queue drops
    /// it silently (backpressure is the caller's problem, as with
    /// descriptors).
    pub fn offer(&self, endpoint: Arc<LaneEndpoint>) -> Result<(), LaneError> {
        let peer = self.peer().ok_or(LaneError::Dismissed)?;
        let mut inner = peer.inner.lock();
        if inner.connections.len() < LANE_MAX_CONNECTIONS {
            inner.connections.push_back(endpoint);
        } else {
            log_warn!(target: "ipc", "connection queue full, offer dropped");
        }
        Ok(())
    }

    /// Takes the oldest pending connection, if any.
    pub fn accept(&self) -> Option<Arc<LaneEndpoint>> {
        self.inner.lock().connections.pop_front()
    }

    /// Queues a handle on the peer's descriptor queue; full queue drops it
    /// silently.
    pub fn push_descriptor(&self, handle: Arc<Handle>) -> Result<(), LaneError> {
        let peer = self.peer().ok_or(LaneError::Dismissed)?;
        let mut inner = peer.inner.lock();
        if inner.pending_descs.len() < LANE_PENDING_DESCRIPTORS {
            inner.pending_descs.push_back(handle);
        } else {
            log_warn!(target: "ipc", "descriptor queue full, push dropped");
        }
        Ok(())
    }

    /// Takes the oldest pending descriptor, if any.
    pub fn pull_descriptor(&self) -> Option<Arc<Handle>> {
        self.inner.lock().pending_descs.pop_front()
    }
}

static_assertions::assert_impl_all!(LaneEndpoint: Send, Sync);

/// One element of a submitted batch.
pub enum Action<'a> {
    /// Reserved; completes without effect.
    Dismiss,
    /// Detach the Lane handle in `slot` and offer its endpoint to the peer.
    Offer { slot: usize },
    /// Accept a pending connection into a fresh slot.
    Accept,
    Send(&'a [u8]),
    Recv(&'a mut [u8]),
    /// Share the handle in `slot` with the peer.
    PushDescriptor { slot: usize },
    /// Take a pending descriptor into a fresh slot.
    PullDescriptor,
}

/// Per-action outcome, index-aligned with the submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionReply {
    Done,
    Sent(usize),
    Received(usize),
    /// Slot holding the accepted connection, if one was pending.
    Accepted(Option<usize>),
    /// Slot holding the pulled descriptor, if one was pending.
    Pulled(Option<usize>),
}

/// Runs a batch against `endpoint` on behalf of the universe owning the
/// referenced slots. Phase 1 applies send-class actions; phase 2 (unless
/// `NO_RECEIVING`) waits cooperatively for receive data, then drains.
/// On error the batch stops; earlier effects stand.
pub fn submit(
    endpoint: &Arc<LaneEndpoint>,
    universe: &Arc<Mutex<Universe>>,
    actions: &mut [Action<'_>],
    flags: SubmitFlags,
    scheduler: &dyn Scheduler,
) -> Result<Vec<ActionReply>, LaneError> {
    if actions.len() > MAX_ACTIONS_PER_SUBMIT {
        return Err(LaneError::IllegalArgs);
    }
    let mut replies = alloc::vec![ActionReply::Done; actions.len()];

    for (i, action) in actions.iter().enumerate() {
        match action {
            Action::Send(data) => {
                replies[i] = ActionReply::Sent(endpoint.send_bytes(data)?);
            }
            Action::Offer { slot } => {
                // Type-check before detaching so a failed offer does not
                // eat the caller's handle.
                let lane = universe.lock().lane(*slot).map_err(|_| LaneError::BadDescriptor)?;
                endpoint.offer(lane)?;
                let _ = universe.lock().detach(*slot);
            }
            Action::PushDescriptor { slot } => {
                let handle = universe
                    .lock()
                    .get(*slot)
                    .map(Arc::clone)
                    .map_err(|_| LaneError::BadDescriptor)?;
                endpoint.push_descriptor(handle)?;
            }
            Action::Dismiss | Action::Accept | Action::Recv(_) | Action::PullDescriptor => {}
        }
    }

    if flags.contains(SubmitFlags::NO_RECEIVING) {
        return Ok(replies);
    }

    if actions.iter().any(|a| matches!(a, Action::Recv(_))) {
        // Cooperative wait, no locks held. A dead peer can never satisfy
        // the wait; fall through and let Recv report EndOfLane.
        while endpoint.bytes_available() == 0 && endpoint.connected() {
            scheduler.yield_now();
        }
    }

    for (i, action) in actions.iter_mut().enumerate() {
        match action {
            Action::Recv(buf) => {
                replies[i] = ActionReply::Received(endpoint.recv_bytes(buf)?);
            }
            Action::Accept => {
                let slot = endpoint.accept().map(|lane| {
                    universe.lock().attach(Handle::new(Object::Lane(lane)))
                });
                replies[i] = ActionReply::Accepted(slot);
            }
            Action::PullDescriptor => {
                let slot = endpoint
                    .pull_descriptor()
                    .map(|handle| universe.lock().attach(handle));
                replies[i] = ActionReply::Pulled(slot);
            }
            Action::Dismiss | Action::Offer { .. } | Action::Send(_)
            | Action::PushDescriptor { .. } => {}
        }
    }

    Ok(replies)
}
