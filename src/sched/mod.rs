// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scheduling seam used by blocking kernel paths
//! OWNERS: @kernel-team
//! PUBLIC API: Scheduler trait, NullScheduler
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: Callers never hold object locks across yield/block; policy
//! lives behind the trait, not in this crate
//!
//! Lane submission and futexes suspend cooperatively: they loop on state and
//! call `yield_now`, or park the task with `block` until a matching `unblock`.
//! The embedding kernel supplies the real run-queue; `NullScheduler` is the
//! single-task stand-in that only records what it was asked to do.

use alloc::collections::BTreeSet;

use spin::Mutex;

use crate::types::Pid;

pub trait Scheduler {
    /// PID of the task currently executing a kcall.
    fn current(&self) -> Pid;
    /// Makes `pid` runnable for the first time.
    fn enqueue(&self, pid: Pid);
    /// Gives up the CPU once; the caller re-checks its condition after.
    fn yield_now(&self);
    /// Parks `pid` until `unblock`, or until `deadline` (absolute
    /// nanoseconds) if one is given.
    fn block(&self, pid: Pid, deadline: Option<u64>);
    /// Makes a parked task runnable again.
    fn unblock(&self, pid: Pid);
}

/// Single-task scheduler: yields are no-ops and blocked PIDs are only
/// recorded. Suitable for bring-up and host tests that never actually
/// suspend.
pub struct NullScheduler {
    current: Pid,
    blocked: Mutex<BTreeSet<Pid>>,
}

impl NullScheduler {
    pub fn new(current: Pid) -> Self {
        Self { current, blocked: Mutex::new(BTreeSet::new()) }
    }

    pub fn is_blocked(&self, pid: Pid) -> bool {
        self.blocked.lock().contains(&pid)
    }
}

impl Scheduler for NullScheduler {
    fn current(&self) -> Pid {
        self.current
    }

    fn enqueue(&self, _pid: Pid) {}

    fn yield_now(&self) {}

    fn block(&self, pid: Pid, _deadline: Option<u64>) {
        self.blocked.lock().insert(pid);
    }

    fn unblock(&self, pid: Pid) {
        self.blocked.lock().remove(&pid);
    }
}
