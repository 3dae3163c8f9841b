// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task records and futex wait lists
//! OWNERS: @kernel-team
//! PUBLIC API: Task, TaskTable, FutexTable
//! DEPENDS_ON: cap::Universe, mm::AddressSpace, sched::Scheduler
//! INVARIANTS: PIDs are unique for the table's lifetime; a futex waiter is
//! on at most one address list

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::cap::Universe;
use crate::mm::page_table::AddressSpace;
use crate::sched::Scheduler;
use crate::types::Pid;

/// One schedulable task: its descriptor table, its address space, and the
/// entry context it was spawned with. Register state and kernel stacks stay
/// with the arch layer.
pub struct Task {
    pub pid: Pid,
    pub universe: Arc<Mutex<Universe>>,
    pub space: Arc<Mutex<AddressSpace>>,
    pub entry: usize,
    pub stack: usize,
    pub arg: usize,
}

/// Allocates PIDs and owns the task records.
pub struct TaskTable {
    tasks: Vec<Task>,
    next_pid: u32,
}

impl TaskTable {
    pub fn new() -> Self {
        // PID 0 stays reserved for the kernel.
        Self { tasks: Vec::new(), next_pid: 1 }
    }

    pub fn spawn(
        &mut self,
        universe: Arc<Mutex<Universe>>,
        space: Arc<Mutex<AddressSpace>>,
        entry: usize,
        stack: usize,
        arg: usize,
    ) -> Pid {
        let pid = Pid::from_raw(self.next_pid);
        self.next_pid += 1;
        self.tasks.push(Task { pid, universe, space, entry, stack, arg });
        pid
    }

    pub fn get(&self, pid: Pid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.pid == pid)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Address-keyed futex waiter lists. The user-word comparison happens at the
/// kcall layer (it needs the caller's address space); this table only parks
/// and wakes.
pub struct FutexTable {
    waiters: BTreeMap<usize, VecDeque<Pid>>,
}

impl FutexTable {
    pub fn new() -> Self {
        Self { waiters: BTreeMap::new() }
    }

    /// Parks `pid` on `addr` until a wake or the optional absolute deadline.
    pub fn wait(&mut self, addr: usize, pid: Pid, deadline: Option<u64>, sched: &dyn Scheduler) {
        self.waiters.entry(addr).or_default().push_back(pid);
        sched.block(pid, deadline);
    }

    /// Wakes up to `count` waiters parked on `addr`, FIFO. Returns how many
    /// were woken.
    pub fn wake(&mut self, addr: usize, count: usize, sched: &dyn Scheduler) -> usize {
        let Some(queue) = self.waiters.get_mut(&addr) else {
            return 0;
        };
        let mut woken = 0;
        while woken < count {
            let Some(pid) = queue.pop_front() else {
                break;
            };
            sched.unblock(pid);
            woken += 1;
        }
        if queue.is_empty() {
            self.waiters.remove(&addr);
        }
        woken
    }

    /// Drops `pid` from every list (task teardown).
    pub fn forget(&mut self, pid: Pid) {
        self.waiters.retain(|_, queue| {
            queue.retain(|&p| p != pid);
            !queue.is_empty()
        });
    }
}

impl Default for FutexTable {
    fn default() -> Self {
        Self::new()
    }
}
