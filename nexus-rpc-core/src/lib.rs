// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The nexus-rpc datapath engine — sessions, the sliding-window
//! protocol, congestion control, the single-threaded event loop, the
//! background worker pool, and the process-wide instance registry.
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - RpcInstance<T>: a per-thread endpoint, generic over its `Transport`
//!   - Config / CongestionConfig: programmatic tunables
//!   - HandlerTable / HandlerMode: request-type to handler-function mapping
//!   - Session / Slot / SlotState: request-window state
//!   - RpcError / Result: the crate's fallible-operation result type
//!
//! This crate never reads a config file, parses argv, or owns a logging
//! sink; it calls into the `log` facade and leaves subscriber setup to the
//! embedding application (`nexus-rpc`, the façade crate, or a demo binary).

pub mod buffer;
pub mod config;
pub mod congestion;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod registry;
pub mod session;
pub mod timing_wheel;
pub mod window;
pub mod workers;

pub use config::{CongestionConfig, Config};
pub use error::{Result, RpcError};
pub use event_loop::{RpcInstance, SmEvent, SmRequest};
pub use handler::{HandlerMode, HandlerOutcome, HandlerTable};
pub use session::{ConnStatus, Continuation, ContinuationResult, Role, Session, SlotState};
