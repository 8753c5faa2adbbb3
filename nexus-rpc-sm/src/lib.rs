// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The Nexus-wide session-management thread.
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! One thread per Nexus binds a UDP socket on the management port and
//! speaks [`SmMessage`]/[`SmOp`] with its peers, independent of whatever
//! transport backend each `RpcInstance` uses for its own datapath. It never
//! touches session or slot state directly: requests from an instance arrive
//! over its `SmRequest` sender, and this thread posts results back into the
//! instance's own `SmEvent` queue via [`nexus_rpc_core::registry::route`],
//! drained on the event-loop thread in step 6. Session numbers for inbound
//! connects are allocated here, independent of a peer's own numbering, and
//! handed to the target instance to place in its session table.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nexus_rpc_abi::{SmMessage, SmOp};
use nexus_rpc_core::event_loop::{SmEvent, SmRequest};
use nexus_rpc_core::registry;
use nexus_rpc_transport::PeerId;

const RECV_BUF_LEN: usize = 2048;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to the running session-management thread. Dropping it requests
/// shutdown and joins the thread.
pub struct SmThread {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl SmThread {
    /// Binds `bind_addr` and starts the thread. `local_uri` is this Nexus's
    /// own management address, echoed to peers as the reply-to URI.
    /// `table_hash` is a hash of this Nexus's registered handler types,
    /// compared against a peer's on connect to reject mismatched builds.
    /// `requests` aggregates `SmRequest`s from every `RpcInstance` on this
    /// Nexus; each instance clones the same sender when constructed.
    pub fn spawn(
        bind_addr: SocketAddr,
        local_uri: String,
        table_hash: u64,
        requests: Receiver<SmRequest>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("nexus-rpc-sm".into())
            .spawn(move || run(socket, local_uri, table_hash, requests, shutdown_for_thread))?;
        Ok(Self { handle: Some(handle), shutdown })
    }
}

impl Drop for SmThread {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// State the SM thread owns across ticks. Kept out of `run`'s body so the
/// per-message handlers can stay free functions instead of closures.
struct SmState {
    local_uri: String,
    table_hash: u64,
    /// Next inbound session number to hand out, per target instance. Lives
    /// here rather than on the instance itself: `RpcInstance::sessions` is
    /// event-loop-thread-owned, but a session number must exist before the
    /// event loop ever sees the connect request.
    next_inbound_session: HashMap<u8, u16>,
}

impl SmState {
    fn allocate_inbound_session(&mut self, target_rpc_id: u8) -> u16 {
        let next = self.next_inbound_session.entry(target_rpc_id).or_insert(0);
        let allocated = *next;
        *next += 1;
        allocated
    }
}

fn run(socket: UdpSocket, local_uri: String, table_hash: u64, requests: Receiver<SmRequest>, shutdown: Arc<AtomicBool>) {
    let mut state = SmState { local_uri, table_hash, next_inbound_session: HashMap::new() };
    let mut buf = [0u8; RECV_BUF_LEN];

    while !shutdown.load(Ordering::Acquire) {
        while let Ok(req) = requests.try_recv() {
            handle_local_request(&socket, &state, req);
        }

        match socket.recv_from(&mut buf) {
            Ok((len, from)) => match SmMessage::decode(&buf[..len]) {
                Ok(msg) => handle_peer_message(&socket, &mut state, msg, from),
                Err(err) => log::warn!("nexus-rpc-sm: dropping malformed datagram from {from}: {err}"),
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => log::warn!("nexus-rpc-sm: socket recv failed: {err}"),
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

fn handle_local_request(socket: &UdpSocket, state: &SmState, req: SmRequest) {
    match req {
        SmRequest::Connect { local_rpc_id, local_session_num, remote_host, remote_rpc_id } => {
            let Ok(addr) = remote_host.parse::<SocketAddr>() else {
                log::warn!("nexus-rpc-sm: unparseable remote host {remote_host:?}, rejecting connect locally");
                registry::route(local_rpc_id, SmEvent::ConnectRejected { local_session_num });
                return;
            };
            let msg =
                SmMessage::connect_request(state.local_uri.as_str(), local_rpc_id, remote_rpc_id, local_session_num, state.table_hash);
            send_to(socket, &msg, addr);
        }
        SmRequest::Disconnect { local_rpc_id, session_num, remote_rpc_id, remote_host } => {
            if let Ok(addr) = remote_host.parse::<SocketAddr>() {
                let msg = SmMessage::disconnect_request(state.local_uri.as_str(), local_rpc_id, remote_rpc_id, session_num);
                send_to(socket, &msg, addr);
            }
            registry::route(local_rpc_id, SmEvent::DisconnectAck { session_num });
        }
        SmRequest::AcceptAck { local_rpc_id, local_session_num, remote_rpc_id, remote_session_num, reply_to } => {
            let Ok(addr) = reply_to.parse::<SocketAddr>() else {
                log::warn!("nexus-rpc-sm: unparseable reply-to {reply_to:?}, cannot ack accepted session");
                return;
            };
            let mut reply =
                SmMessage::connect_request(state.local_uri.as_str(), local_rpc_id, remote_rpc_id, remote_session_num, state.table_hash);
            reply.op = SmOp::ConnectResponse;
            reply.remote_session_num = Some(local_session_num);
            send_to(socket, &reply, addr);
        }
    }
}

fn handle_peer_message(socket: &UdpSocket, state: &mut SmState, msg: SmMessage, from: SocketAddr) {
    match msg.op {
        SmOp::ConnectRequest => {
            if msg.request_type_table_hash != state.table_hash {
                log::warn!(
                    "nexus-rpc-sm: rejecting connect from {} (handler table hash mismatch)",
                    msg.sender_uri
                );
                let mut reply = msg.clone();
                reply.op = SmOp::ConnectResponse;
                reply.rejected = true;
                reply.sender_uri = state.local_uri.clone();
                reply.sender_rpc_id = msg.target_rpc_id;
                reply.target_rpc_id = msg.sender_rpc_id;
                send_to(socket, &reply, from);
                return;
            }
            let peer = PeerId::from_hint(&msg.sender_uri);
            let session_num = state.allocate_inbound_session(msg.target_rpc_id);
            registry::route(
                msg.target_rpc_id,
                SmEvent::InboundConnect {
                    session_num,
                    remote_host: msg.sender_uri.clone(),
                    remote_rpc_id: msg.sender_rpc_id,
                    remote_session_num: msg.sender_session_num,
                    peer,
                    reply_to: msg.sender_uri,
                },
            );
        }
        SmOp::ConnectResponse => {
            if msg.rejected {
                registry::route(msg.target_rpc_id, SmEvent::ConnectRejected { local_session_num: msg.sender_session_num });
                return;
            }
            let Some(remote_session_num) = msg.remote_session_num else {
                log::warn!("nexus-rpc-sm: accepted ConnectResponse missing remote session number");
                return;
            };
            registry::route(
                msg.target_rpc_id,
                SmEvent::ConnectAccepted { local_session_num: msg.sender_session_num, remote_session_num },
            );
        }
        SmOp::DisconnectRequest => {
            // Graceful teardown ("marks the session for graceful
            // teardown on both endpoints"), not a reset: this only marks the
            // session disconnected, it does not fail any in-flight
            // continuation the way SmEvent::Reset does.
            registry::route(msg.target_rpc_id, SmEvent::DisconnectAck { session_num: msg.sender_session_num });
            let mut ack = msg;
            ack.op = SmOp::DisconnectAck;
            ack.sender_uri = state.local_uri.clone();
            send_to(socket, &ack, from);
        }
        SmOp::DisconnectAck => {
            registry::route(msg.target_rpc_id, SmEvent::DisconnectAck { session_num: msg.sender_session_num });
        }
        SmOp::Reset => {
            registry::route(msg.target_rpc_id, SmEvent::Reset { session_num: msg.sender_session_num });
        }
    }
}

fn send_to(socket: &UdpSocket, msg: &SmMessage, addr: SocketAddr) {
    match msg.encode() {
        Ok(bytes) => {
            if let Err(err) = socket.send_to(&bytes, addr) {
                log::warn!("nexus-rpc-sm: send to {addr} failed: {err}");
            }
        }
        Err(err) => log::warn!("nexus-rpc-sm: failed to encode {:?} for {addr}: {err}", msg.op),
    }
}
