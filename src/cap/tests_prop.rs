// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for universe slot tables
//! OWNERS: @kernel-cap-team
//! NOTE: Tests only; no kernel logic. Ensures slot allocation and release are sound.
//!
//! TEST_SCOPE:
//!   - Attach always yields the lowest free slot
//!   - Detach frees exactly one slot; double detach fails
//!   - Occupancy bookkeeping survives arbitrary attach/detach interleavings
//!
//! TEST_SCENARIOS:
//!   - attach_returns_lowest_free_slot(): fresh attach lands below every free index
//!   - occupancy_matches_history(): occupied() equals successful attaches minus detaches
//!   - slots_never_alias(): two live slots never return the same handle

use super::{Handle, Object, Universe};
use crate::types::Pid;
use alloc::sync::Arc;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum SlotOp {
    Attach(u32),
    Detach(usize),
}

fn arb_op() -> impl Strategy<Value = SlotOp> {
    prop_oneof![
        any::<u32>().prop_map(SlotOp::Attach),
        (0usize..16).prop_map(SlotOp::Detach),
    ]
}

proptest! {
    #[test]
    fn attach_returns_lowest_free_slot(ops in proptest::collection::vec(arb_op(), 0..48)) {
        let mut universe = Universe::with_capacity(4);
        for op in ops {
            match op {
                SlotOp::Attach(pid) => {
                    let slot = universe.attach(Handle::new(Object::Thread(Pid::from_raw(pid))));
                    for below in 0..slot {
                        prop_assert!(universe.get(below).is_ok(), "free slot {} below new slot {}", below, slot);
                    }
                }
                SlotOp::Detach(slot) => {
                    let _ = universe.detach(slot);
                }
            }
        }
    }

    #[test]
    fn occupancy_matches_history(ops in proptest::collection::vec(arb_op(), 0..48)) {
        let mut universe = Universe::with_capacity(4);
        let mut live = 0usize;
        for op in ops {
            match op {
                SlotOp::Attach(pid) => {
                    universe.attach(Handle::new(Object::Thread(Pid::from_raw(pid))));
                    live += 1;
                }
                SlotOp::Detach(slot) => {
                    if universe.detach(slot).is_ok() {
                        live -= 1;
                    }
                    prop_assert!(universe.detach(slot).is_err());
                }
            }
            prop_assert_eq!(universe.occupied(), live);
        }
    }

    #[test]
    fn slots_never_alias(pids in proptest::collection::vec(any::<u32>(), 1..24)) {
        let mut universe = Universe::with_capacity(2);
        let mut slots = alloc::vec::Vec::new();
        for pid in pids {
            slots.push(universe.attach(Handle::new(Object::Thread(Pid::from_raw(pid)))));
        }
        for (i, &a) in slots.iter().enumerate() {
            for &b in &slots[i + 1..] {
                prop_assert_ne!(a, b);
                let ha = universe.get(a).unwrap();
                let hb = universe.get(b).unwrap();
                prop_assert!(!Arc::ptr_eq(ha, hb));
            }
        }
    }
}
