// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Object-capability kernel core
//! OWNERS: @kernel-team
//! PUBLIC API: cap, mm, ipc, kcall, task, sched, initramfs modules
//! DEPENDS_ON: bitflags, spin, static_assertions
//! INVARIANTS: no_std + alloc outside tests; no globals, all state is passed in
//!
//! Typed, refcounted handles live in per-task slot tables (universes).
//! Address spaces pair a 4-level radix page table with a VMA manager and
//! share frames copy-on-write across `clone`. Lanes are paired byte/descriptor
//! conduits driven by batched action submission. The kcall layer decodes
//! register-file arguments, resolves descriptors and folds every module
//! error into one wire taxonomy.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod cap;
pub mod hal;
pub mod initramfs;
pub mod ipc;
pub mod kcall;
pub mod mm;
pub mod sched;
pub mod task;
pub mod types;
