// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Concurrency primitives shared by the nexus-rpc engine
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - SpinLock: short-held mutual exclusion for the registry
//!   - SpscRing: bounded single-producer/single-consumer queue

mod spin_lock;
mod spsc;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use spsc::SpscRing;
