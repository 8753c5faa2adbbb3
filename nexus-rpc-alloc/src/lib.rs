// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Message-buffer allocation for the nexus-rpc datapath
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - SlabPool: size-classed allocator handing out MsgBuffer handles
//!   - MsgBuffer: typed handle, never a raw pointer
//!   - AllocError: kNoMemory / kTooLarge surfaced to callers

mod arena;
mod slab;

pub use slab::{MsgBuffer, SlabPool};

/// Mirrors the subset of error kinds this crate can raise on its
/// own; the engine maps these onto [`nexus_rpc_abi::ErrorKind`] at the
/// RPC-visible boundary.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("requested length {0} exceeds the pool's largest size class")]
    TooLarge(usize),
    #[error("slab pool exhausted")]
    OutOfMemory,
    #[error("resize to {requested} exceeds the buffer's {capacity}-byte class")]
    ResizeExceedsClass { requested: usize, capacity: usize },
    #[error("stale or unknown buffer handle")]
    InvalidHandle,
}
