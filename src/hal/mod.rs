// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

/// Abstraction for a monotonic timer.
pub trait Timer {
    /// Returns the current time in nanoseconds.
    fn now(&self) -> u64;
    /// Programs the next wake-up time in nanoseconds.
    fn set_wakeup(&self, deadline: u64);
}

/// Fixed-value timer for bring-up and host tests.
pub struct FixedTimer(pub u64);

impl Timer for FixedTimer {
    fn now(&self) -> u64 {
        self.0
    }

    fn set_wakeup(&self, _deadline: u64) {}
}
