// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Inter-task communication over paired lane endpoints
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: lane::{LaneEndpoint, Action, ActionReply, submit, SubmitFlags}
//! DEPENDS_ON: cap::Universe, sched::Scheduler
//! INVARIANTS: Queues are bounded; send-class work lands on the peer,
//! receive-class work drains from self; no lock is held across a yield

pub mod lane;

pub use lane::{
    Action, ActionReply, LaneEndpoint, LaneError, SubmitFlags, LANE_MAX_CONNECTIONS,
    LANE_PENDING_DESCRIPTORS, LANE_RING_CAPACITY, MAX_ACTIONS_PER_SUBMIT,
};
