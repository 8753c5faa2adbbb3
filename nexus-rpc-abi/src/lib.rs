// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Wire types shared between nexus-rpc datapath and control-plane crates
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - PacketHeader / PacketType: fixed 16-byte packet header
//!   - ErrorKind: application-visible error codes
//!   - SmMessage / SmOp: session-management control messages

#![forbid(unsafe_code)]

mod error_kind;
mod header;
mod sm_wire;

pub use error_kind::ErrorKind;
pub use header::{HeaderError, PacketHeader, PacketType, HEADER_LEN, MAX_MESSAGE_SIZE, MAX_PACKET_NUM};
pub use sm_wire::{SmMessage, SmOp};

/// Default sliding-window size per session: 8 outstanding requests.
pub const DEFAULT_WINDOW_SIZE: usize = 8;
