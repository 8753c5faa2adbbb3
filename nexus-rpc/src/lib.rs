// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Public façade for the nexus-rpc runtime.
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! A process hosts one [`Nexus`]: it owns the handler table, the session-
//! management thread, and the shared channel every [`RpcInstance`] uses to
//! talk to that thread. Everything datapath-shaped (sessions, buffers, the
//! event loop) stays on [`nexus_rpc_core::RpcInstance`], re-exported here so
//! applications depend on a single crate.
//!
//! This crate never reads a config file or parses argv — configuration is a
//! typed [`Config`] struct the caller builds programmatically. The crates it
//! re-exports (`nexus-rpc-core`, `nexus-rpc-sm`) log through the `log`
//! facade; subscriber setup is left to the embedding binary, which this
//! crate has no logging of its own to add to.

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;

use nexus_rpc_core::handler::HandlerTable;
use nexus_rpc_sm::SmThread;
use nexus_rpc_transport::Transport;

pub use nexus_rpc_abi::{ErrorKind, SmMessage, SmOp, DEFAULT_WINDOW_SIZE};
pub use nexus_rpc_alloc::MsgBuffer;
pub use nexus_rpc_core::{
    CongestionConfig, ConnStatus, Config, Continuation, ContinuationResult, HandlerMode, HandlerOutcome, HandlerTable,
    Result, Role, RpcError, RpcInstance, Session, SlotState,
};
pub use nexus_rpc_transport::{loopback_pair, LoopbackTransport, PeerId, TransportError, UdpTransport};

thread_local! {
    /// The calling thread's own RPC instance id, set when that thread
    /// creates its instance via [`Nexus::create_instance`]. An explicit
    /// per-thread slot, deliberately a plain `Cell`, not a process-wide
    /// registry with teardown ordering to get right.
    static CURRENT_RPC_ID: Cell<Option<u8>> = const { Cell::new(None) };
}

/// The calling thread's RPC instance id, if it created one via
/// [`Nexus::create_instance`]. Lets nested-RPC handler code identify "this
/// instance" without threading an id through every call.
pub fn current_rpc_id() -> Option<u8> {
    CURRENT_RPC_ID.with(|cell| cell.get())
}

fn set_current_rpc_id(rpc_id: u8) {
    CURRENT_RPC_ID.with(|cell| cell.set(Some(rpc_id)));
}

/// One per process ("process-wide registry"). Owns the
/// session-management thread and the handler table shared by every RPC
/// instance created from it.
pub struct Nexus {
    handlers: Arc<HandlerTable>,
    sm_tx: mpsc::Sender<nexus_rpc_core::event_loop::SmRequest>,
    _sm_thread: SmThread,
}

impl Nexus {
    /// Binds the session-management socket at `bind_addr` and starts its
    /// thread. `handlers` must already have every handler registered
    /// ("called only before any RPC instance is created").
    pub fn bind(bind_addr: SocketAddr, handlers: HandlerTable) -> io::Result<Self> {
        let handlers = Arc::new(handlers);
        let table_hash = handlers.type_table_hash();
        let (sm_tx, sm_rx) = mpsc::channel();
        let local_uri = bind_addr.to_string();
        let sm_thread = SmThread::spawn(bind_addr, local_uri, table_hash, sm_rx)?;
        Ok(Self { handlers, sm_tx, _sm_thread: sm_thread })
    }

    /// Creates an RPC instance bound to the calling thread ("one
    /// instance per OS thread in practice"). Marks this thread's
    /// [`current_rpc_id`] slot as `rpc_id`.
    pub fn create_instance<T: Transport>(&self, rpc_id: u8, config: Config, transport: T) -> RpcInstance<T> {
        set_current_rpc_id(rpc_id);
        RpcInstance::new(rpc_id, config, transport, self.handlers.clone(), self.sm_tx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_rpc_id_starts_unset() {
        assert_eq!(current_rpc_id(), None);
    }

    #[test]
    fn create_instance_sets_current_rpc_id() {
        let mut handlers = HandlerTable::new();
        handlers.register_handler(1, HandlerMode::Inline, |bytes| HandlerOutcome::Respond(bytes.to_vec()));
        let nexus = Nexus::bind("127.0.0.1:0".parse().unwrap(), handlers).expect("bind sm socket");
        let (transport, _peer) = loopback_pair();
        let _instance = nexus.create_instance(7, Config::default(), transport);
        assert_eq!(current_rpc_id(), Some(7));
    }
}
