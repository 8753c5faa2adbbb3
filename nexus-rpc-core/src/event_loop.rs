//! The per-thread RPC instance and its single-threaded event loop.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nexus_rpc_abi::{ErrorKind, PacketType};
use nexus_rpc_alloc::MsgBuffer;
use nexus_rpc_sync::SpinLock;
use nexus_rpc_transport::{PeerId, Transport, TxPacket};

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::error::{Result, RpcError};
use crate::handler::{HandlerMode, HandlerOutcome, HandlerTable};
use crate::session::{
    CompletedResponse, ConnStatus, Continuation, ContinuationResult, InboundRequest, InboundResponse, Role, Session, SlotState,
};
use crate::timing_wheel::TimerWheel;
use crate::window::{control_packet, decode_packet, encode_packet, num_packets, packet_range};
use crate::workers::{WorkItem, WorkerPool};

/// How many retired responses a session keeps around for retransmission,
/// expressed as a multiple of its window size: a sender can have at most
/// that many distinct requests outstanding at once, so it can't possibly be
/// retransmitting anything older than that.
const COMPLETED_RETAIN_FACTOR: usize = 4;

/// One handler's `Forward` outcome resolved into the bytes (or error) to
/// complete the original inbound request with, posted by the downstream
/// request's continuation ("nested RPC"). The
/// continuation closure runs wherever [`Session::reset_all`]/
/// [`RpcInstance::complete_slot`] invoke it — on this same event-loop
/// thread, but inside a call stack that already holds `&mut self` — so it
/// cannot call back into `self` directly; it posts here instead, and
/// [`RpcInstance::step5b_drain_nested_completions`] drains it once that
/// call stack has unwound.
struct NestedCompletion {
    session_num: u16,
    request_num: u64,
    outcome: std::result::Result<Vec<u8>, RpcError>,
}

/// Posted into an instance's SM queue by the session-management thread
///; drained in event-loop step 6.
pub enum SmEvent {
    ConnectAccepted { local_session_num: u16, remote_session_num: u16 },
    ConnectRejected { local_session_num: u16 },
    /// A peer's connect request landed on this instance. The SM thread has
    /// already allocated `session_num` for our side ("allocates
    /// a remote session number"); `remote_session_num` is the requester's
    /// own number, echoed back so it can match the eventual response to its
    /// own session. `reply_to` is the peer's management URI.
    InboundConnect {
        session_num: u16,
        remote_host: String,
        remote_rpc_id: u8,
        remote_session_num: u16,
        peer: PeerId,
        reply_to: String,
    },
    DisconnectAck { session_num: u16 },
    Reset { session_num: u16 },
}

/// Posted by an instance to the session-management thread to start a
/// connect/disconnect handshake, or to acknowledge one, on its behalf.
pub enum SmRequest {
    Connect { local_rpc_id: u8, local_session_num: u16, remote_host: String, remote_rpc_id: u8 },
    Disconnect { local_rpc_id: u8, session_num: u16, remote_rpc_id: u8, remote_host: String },
    /// Confirms a session accepted from [`SmEvent::InboundConnect`] so the SM
    /// thread can send the peer its `ConnectResponse`.
    AcceptAck { local_rpc_id: u8, local_session_num: u16, remote_rpc_id: u8, remote_session_num: u16, reply_to: String },
}

/// A per-thread endpoint. At most one per OS thread in
/// practice, though nothing here enforces that beyond documentation (the
/// thread-local slot lives in the `nexus-rpc` façade crate as an explicit
/// per-thread slot).
pub struct RpcInstance<T: Transport> {
    rpc_id: u8,
    config: Config,
    transport: T,
    pool: BufferPool,
    handlers: Arc<HandlerTable>,
    workers: WorkerPool,
    sessions: Vec<Option<Session>>,
    wheel: TimerWheel,
    sm_tx: Sender<SmRequest>,
    sm_rx: Receiver<SmEvent>,
    nested_completions: Arc<SpinLock<VecDeque<NestedCompletion>>>,
}

impl<T: Transport> RpcInstance<T> {
    /// `sm_tx` is the shared request channel to the Nexus's session-management
    /// thread; every instance on a Nexus clones the same
    /// sender. This constructor creates its own SM event channel and
    /// registers the instance under `rpc_id`, so the SM
    /// thread can route connect/disconnect/reset notifications back to it.
    pub fn new(rpc_id: u8, config: Config, transport: T, handlers: Arc<HandlerTable>, sm_tx: Sender<SmRequest>) -> Self {
        let (sm_evt_tx, sm_rx) = std::sync::mpsc::channel();
        crate::registry::register(rpc_id, sm_evt_tx);
        let now = Instant::now();
        let num_workers = config.background_workers;
        Self {
            pool: BufferPool::new(256 * 1024 * 1024, config.max_message_size as usize),
            wheel: TimerWheel::new(4096, Duration::from_micros(1), now),
            workers: WorkerPool::new(num_workers, handlers.clone()),
            rpc_id,
            config,
            transport,
            handlers,
            sessions: Vec::new(),
            sm_tx,
            sm_rx,
            nested_completions: Arc::new(SpinLock::new(VecDeque::new())),
        }
    }

    pub fn rpc_id(&self) -> u8 {
        self.rpc_id
    }

    // ---- Session lifecycle ----

    pub fn create_session(&mut self, remote_host: String, remote_rpc_id: u8, peer: PeerId) -> Result<u16> {
        if self.sessions.len() >= u16::MAX as usize {
            return Err(RpcError::TooManySessions);
        }
        let session_num = self.sessions.len() as u16;
        let session = Session::new(
            session_num,
            Role::Client,
            remote_host.clone(),
            remote_rpc_id,
            peer,
            self.config.window_size,
            self.config.rto_floor,
            &self.config.congestion,
            Instant::now(),
        );
        self.sessions.push(Some(session));
        let _ = self.sm_tx.send(SmRequest::Connect {
            local_rpc_id: self.rpc_id,
            local_session_num: session_num,
            remote_host,
            remote_rpc_id,
        });
        Ok(session_num)
    }

    /// Accepts an inbound session at a given `session_num`/`peer` without
    /// going through the outbound connect handshake (the session-management
    /// thread calls this once it has assigned a session number to an
    /// incoming connect request). `remote_session_num` is the peer's own
    /// number for this session, used to address any requests we send back.
    pub fn accept_session(
        &mut self,
        session_num: u16,
        remote_host: String,
        remote_rpc_id: u8,
        remote_session_num: u16,
        peer: PeerId,
    ) {
        while self.sessions.len() <= session_num as usize {
            self.sessions.push(None);
        }
        let mut session = Session::new(
            session_num,
            Role::Server,
            remote_host,
            remote_rpc_id,
            peer,
            self.config.window_size,
            self.config.rto_floor,
            &self.config.congestion,
            Instant::now(),
        );
        session.status = ConnStatus::Connected;
        session.remote_session_num = Some(remote_session_num);
        self.sessions[session_num as usize] = Some(session);
    }

    pub fn destroy_session(&mut self, session_num: u16) -> Result<()> {
        let session = self.session_mut(session_num)?;
        let remote_host = session.remote_host.clone();
        let remote_rpc_id = session.remote_rpc_id;
        session.status = ConnStatus::Disconnected;
        session.reset_all(self.config.rto_floor);
        let _ = self.sm_tx.send(SmRequest::Disconnect {
            local_rpc_id: self.rpc_id,
            session_num,
            remote_rpc_id,
            remote_host,
        });
        Ok(())
    }

    pub fn is_connected(&self, session_num: u16) -> bool {
        self.sessions
            .get(session_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.status == ConnStatus::Connected)
            .unwrap_or(false)
    }

    fn session_mut(&mut self, session_num: u16) -> Result<&mut Session> {
        self.sessions
            .get_mut(session_num as usize)
            .and_then(|s| s.as_mut())
            .ok_or(RpcError::UnknownSession)
    }

    // ---- Buffer pool API ----

    pub fn alloc_msg_buffer(&mut self, size: usize) -> Result<MsgBuffer> {
        self.pool.alloc(size, &mut self.transport)
    }

    pub fn free_msg_buffer(&mut self, buf: MsgBuffer) -> Result<()> {
        self.pool.free(buf)
    }

    pub fn resize_msg_buffer(&mut self, buf: MsgBuffer, new_size: usize) -> Result<()> {
        self.pool.resize(buf, new_size)
    }

    /// Same pool-backed buffer as [`Self::free_msg_buffer`]; kept as a
    /// distinct name because it is the one the application calls once a
    /// continuation's borrowed response bytes are no longer needed.
    pub fn release_response(&mut self, buf: MsgBuffer) -> Result<()> {
        self.pool.free(buf)
    }

    /// Mutable view of an allocated buffer's first `len` bytes, for the
    /// application to fill in a request payload before
    /// [`Self::enqueue_request`]: the pool hands out the storage, but only
    /// the application knows what bytes belong in it.
    pub fn msg_buffer_mut(&mut self, buf: MsgBuffer, len: usize) -> Result<&mut [u8]> {
        self.pool.as_mut_slice(buf, len)
    }

    /// Read-only view of an allocated buffer's first `len` bytes.
    pub fn msg_buffer(&self, buf: MsgBuffer, len: usize) -> Result<&[u8]> {
        self.pool.as_slice(buf, len)
    }

    // ---- Request path (steps 1-2) ----

    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_request(
        &mut self,
        session_num: u16,
        req_type: u8,
        req_buf: MsgBuffer,
        req_len: u32,
        resp_buf: MsgBuffer,
        resp_cap: u32,
        continuation: Continuation,
        tag: u64,
    ) -> Result<()> {
        if req_len > self.config.max_message_size {
            return Err(RpcError::TooLarge);
        }
        let mtu = self.transport.mtu();
        let session = self.session_mut(session_num)?;
        if session.status != ConnStatus::Connected {
            return Err(RpcError::Disconnected);
        }
        let slot_idx = session.find_idle_slot().ok_or(RpcError::TooManySessions)?;
        let request_num = session.next_request_num();
        let total_req_packets = num_packets(req_len, mtu);

        {
            let slot = &mut session.slots[slot_idx];
            slot.state = SlotState::InProgress;
            slot.request_num = request_num;
            slot.req_type = req_type;
            slot.req_buf = Some(req_buf);
            slot.req_len = req_len;
            slot.resp_buf = Some(resp_buf);
            slot.resp_cap = resp_cap;
            slot.resp_len = 0;
            slot.tag = tag;
            slot.continuation = Some(continuation);
            slot.total_req_packets = total_req_packets;
            slot.req_sent = vec![false; total_req_packets as usize];
            slot.req_credits = 1; // packet 0 always goes out eagerly
            slot.total_resp_packets = 0;
            slot.resp_received.clear();
            slot.last_send = Some(Instant::now());
        }

        self.send_req_packet(session_num, slot_idx, 0)?;
        let session = self.session_mut(session_num)?;
        let rto = session.slots[slot_idx].current_rto();
        self.wheel.schedule(session_num, slot_idx, rto);
        Ok(())
    }

    fn send_req_packet(&mut self, session_num: u16, slot_idx: usize, packet_num: u16) -> Result<()> {
        let mtu = self.transport.mtu();
        let session = self.session_mut(session_num)?;
        let peer = session.peer;
        let dest = session.remote_session_num.unwrap_or(session_num);
        let slot = &session.slots[slot_idx];
        let (buf, len, request_num, req_type) =
            (slot.req_buf.expect("slot has a request buffer while in progress"), slot.req_len, slot.request_num, slot.req_type);
        let (start, end) = packet_range(packet_num, mtu, len);
        let payload = self.pool.as_slice(buf, len as usize)?[start..end].to_vec();
        let header = nexus_rpc_abi::PacketHeader {
            request_type: req_type,
            message_size: len,
            dest_session_num: dest,
            packet_type: PacketType::Req,
            packet_num,
            request_num,
        };
        let frame = encode_packet(&header, &payload);
        let sent = self.transport.tx_burst(&[TxPacket { peer, bytes: &frame }]);
        if sent == 0 {
            return Err(RpcError::RingExhausted);
        }
        // Sending every request packet isn't the same as the peer having
        // received them: the slot stays kInProgress, retransmitting every
        // already-sent request packet on timeout, until the response itself
        // proves the whole request got there (see apply_resp_payload).
        if let Ok(session) = self.session_mut(session_num) {
            if let Some(slot) = session.slots.get_mut(slot_idx) {
                if slot.state == SlotState::InProgress && slot.request_num == request_num {
                    if let Some(done) = slot.req_sent.get_mut(packet_num as usize) {
                        *done = true;
                    }
                }
            }
        }
        Ok(())
    }

    // ---- Event-loop steps ----

    pub fn run_event_loop_once(&mut self) {
        self.step1_poll_rx();
        self.step3_poll_tx_completions();
        self.step4_advance_timers();
        self.step5_drain_worker_completions();
        self.step5b_drain_nested_completions();
        self.step6_drain_sm_events();
        self.step7_admit_paced();
    }

    pub fn run_event_loop(&mut self, budget: Duration) {
        let deadline = Instant::now() + budget;
        loop {
            self.run_event_loop_once();
            if Instant::now() >= deadline {
                return;
            }
        }
    }

    fn step1_poll_rx(&mut self) {
        let packets = self.transport.rx_burst();
        for pkt in packets {
            let Ok((header, payload)) = decode_packet(&pkt.bytes) else {
                log::warn!(target: "nexus_rpc::event_loop", "dropping malformed packet from {:?}", pkt.peer);
                continue;
            };
            self.handle_packet(pkt.peer, header, payload);
        }
    }

    fn handle_packet(&mut self, peer: PeerId, header: nexus_rpc_abi::PacketHeader, payload: &[u8]) {
        let session_num = header.dest_session_num;
        match header.packet_type {
            PacketType::Req => self.on_req_packet(session_num, peer, header, payload),
            PacketType::Resp => self.on_resp_packet(session_num, header, payload),
            PacketType::ReqForResp => self.on_rfr_packet(session_num, header),
            PacketType::ExplicitCr => self.on_cr_packet(session_num, header),
        }
    }

    fn on_req_packet(&mut self, session_num: u16, peer: PeerId, header: nexus_rpc_abi::PacketHeader, payload: &[u8]) {
        let mtu = self.transport.mtu();
        let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) else {
            log::debug!(target: "nexus_rpc::event_loop", "request for unknown session {session_num}");
            return;
        };
        if session.peer != peer {
            session.peer = peer;
        }

        // A request whose answer already went out once is being retransmitted
        // by a sender that never saw it (or didn't see enough of it to stop
        // asking); resend the cached response instead of re-running the
        // handler ("duplicate packets ... dropped silently" plus at-most-once
        // delivery).
        if session.completed.contains_key(&header.request_num) {
            let _ = self.send_resp_packet(session_num, header.request_num, 0);
            return;
        }

        let total_packets = num_packets(header.message_size, mtu);

        if !session.inbound.contains_key(&header.request_num) {
            let Ok(buf) = self.pool.alloc(header.message_size as usize, &mut self.transport) else {
                log::warn!(target: "nexus_rpc::event_loop", "out of memory reassembling request {}", header.request_num);
                return;
            };
            session.inbound.insert(
                header.request_num,
                InboundRequest {
                    req_type: header.request_type,
                    buf,
                    len: header.message_size,
                    total_packets,
                    received: vec![false; total_packets as usize],
                    response: None,
                    dispatched: false,
                },
            );
        }

        let (start, end) = packet_range(header.packet_num, mtu, header.message_size);
        let inbound = session.inbound.get_mut(&header.request_num).expect("just inserted");
        if !inbound.received[header.packet_num as usize] {
            if let Ok(dest) = self.pool.as_mut_slice(inbound.buf, header.message_size as usize) {
                dest[start..end].copy_from_slice(payload);
            }
            inbound.received[header.packet_num as usize] = true;
        }

        if header.packet_num == 0 && total_packets > 1 {
            self.send_cr(session_num, header.request_num, total_packets);
        }

        let complete = inbound.received.iter().all(|&done| done);
        if complete && !inbound.dispatched {
            inbound.dispatched = true;
            self.dispatch_inbound_request(session_num, header.request_num);
        }
    }

    fn send_cr(&mut self, session_num: u16, request_num: u64, total_packets: u16) {
        let Some(session) = self.sessions.get(session_num as usize).and_then(|s| s.as_ref()) else { return };
        let peer = session.peer;
        let dest = session.remote_session_num.unwrap_or(session_num);
        let mut header = control_packet(0, dest, request_num, PacketType::ExplicitCr, 0);
        header.message_size = total_packets as u32;
        let frame = encode_packet(&header, &[]);
        let _ = self.transport.tx_burst(&[TxPacket { peer, bytes: &frame }]);
    }

    fn dispatch_inbound_request(&mut self, session_num: u16, request_num: u64) {
        let Some(session) = self.sessions.get(session_num as usize).and_then(|s| s.as_ref()) else { return };
        let Some(inbound) = session.inbound.get(&request_num) else { return };
        let req_type = inbound.req_type;
        let buf = inbound.buf;
        let len = inbound.len;
        let Some(mode) = self.handlers.mode_of(req_type) else {
            log::warn!(target: "nexus_rpc::event_loop", "no handler for request type {req_type}");
            return;
        };
        let payload = self.pool.as_slice(buf, len as usize).unwrap_or(&[]).to_vec();
        match mode {
            HandlerMode::Inline => match self.handlers.invoke(req_type, &payload) {
                HandlerOutcome::Respond(bytes) => self.begin_response(session_num, request_num, bytes),
                HandlerOutcome::Forward { session_num: fwd_session, req_type: fwd_type, payload: fwd_payload, transform } => {
                    self.forward_nested_request(session_num, request_num, fwd_session, fwd_type, fwd_payload, transform);
                }
            },
            HandlerMode::Background => {
                let item = WorkItem {
                    session_num,
                    slot_idx: 0,
                    request_num,
                    req_type,
                    payload,
                };
                if self.workers.dispatch(item).is_err() {
                    log::warn!(target: "nexus_rpc::event_loop", "background worker ring exhausted, dropping request {request_num}");
                }
            }
        }
    }

    /// Issues the downstream request a `HandlerOutcome::Forward` asked for,
    /// on behalf of the inbound request it was handling (scenario
    /// 3). The original inbound request stays in `session.inbound` —
    /// unanswered but not abandoned — until the downstream continuation
    /// posts its result to [`Self::nested_completions`].
    fn forward_nested_request(
        &mut self,
        orig_session_num: u16,
        orig_request_num: u64,
        fwd_session_num: u16,
        fwd_req_type: u8,
        fwd_payload: Vec<u8>,
        transform: Option<Box<dyn FnOnce(Vec<u8>) -> Vec<u8> + Send>>,
    ) {
        let len = fwd_payload.len();
        let req_buf = match self.pool.alloc(len.max(1), &mut self.transport) {
            Ok(buf) => buf,
            Err(_) => {
                log::warn!(target: "nexus_rpc::event_loop", "out of memory forwarding nested request for {orig_request_num}");
                self.finish_inbound(orig_session_num, orig_request_num);
                return;
            }
        };
        if let Ok(dest) = self.pool.as_mut_slice(req_buf, len) {
            dest.copy_from_slice(&fwd_payload);
        }
        let resp_buf = match self.pool.alloc(len.max(1), &mut self.transport) {
            Ok(buf) => buf,
            Err(_) => {
                let _ = self.pool.free(req_buf);
                log::warn!(target: "nexus_rpc::event_loop", "out of memory forwarding nested request for {orig_request_num}");
                self.finish_inbound(orig_session_num, orig_request_num);
                return;
            }
        };

        let nested = self.nested_completions.clone();
        let continuation: Continuation = Box::new(move |result| {
            let outcome = match result {
                ContinuationResult::Response { bytes, .. } => {
                    let bytes = bytes.to_vec();
                    Ok(match transform {
                        Some(f) => f(bytes),
                        None => bytes,
                    })
                }
                ContinuationResult::Error { error, .. } => Err(error),
            };
            nested.lock().push_back(NestedCompletion { session_num: orig_session_num, request_num: orig_request_num, outcome });
        });

        if let Err(err) = self.enqueue_request(fwd_session_num, fwd_req_type, req_buf, len as u32, resp_buf, len as u32, continuation, 0)
        {
            log::warn!(target: "nexus_rpc::event_loop", "nested forward to session {fwd_session_num} failed: {err}");
            self.finish_inbound(orig_session_num, orig_request_num);
        }
    }

    /// Step 5b: completes inbound requests whose handler returned
    /// `HandlerOutcome::Forward`, once their downstream request's
    /// continuation has posted a result (scenario 3).
    fn step5b_drain_nested_completions(&mut self) {
        let items: Vec<NestedCompletion> = {
            let mut queue = self.nested_completions.lock();
            queue.drain(..).collect()
        };
        for item in items {
            match item.outcome {
                Ok(bytes) => self.begin_response(item.session_num, item.request_num, bytes),
                Err(error) => {
                    log::warn!(
                        target: "nexus_rpc::event_loop",
                        "nested request for {} failed: {error}", item.request_num
                    );
                    self.finish_inbound(item.session_num, item.request_num);
                }
            }
        }
    }

    fn begin_response(&mut self, session_num: u16, request_num: u64, response: Vec<u8>) {
        let mtu = self.transport.mtu();
        let resp_len = response.len() as u32;
        let Ok(buf) = self.pool.alloc(response.len().max(1), &mut self.transport) else {
            log::warn!(target: "nexus_rpc::event_loop", "out of memory building response for {request_num}");
            return;
        };
        if let Ok(dest) = self.pool.as_mut_slice(buf, response.len()) {
            dest.copy_from_slice(&response);
        }
        let total_packets = num_packets(resp_len, mtu);
        let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) else { return };
        if let Some(inbound) = session.inbound.get_mut(&request_num) {
            inbound.response = Some(InboundResponse { buf, len: resp_len, total_packets, next_to_send: 1 });
        }
        drop(session);
        let _ = self.send_resp_packet(session_num, request_num, 0);
        if total_packets == 1 {
            // Retires the reassembly buffer but keeps the response itself
            // retrievable (see finish_inbound) in case this packet is lost
            // and the sender retransmits the request.
            self.finish_inbound(session_num, request_num);
        }
    }

    fn send_resp_packet(&mut self, session_num: u16, request_num: u64, packet_num: u16) -> Result<()> {
        let mtu = self.transport.mtu();
        let session = self.session_mut(session_num)?;
        let peer = session.peer;
        let dest = session.remote_session_num.unwrap_or(session_num);
        let (req_type, buf, len) = if let Some(inbound) = session.inbound.get(&request_num) {
            let Some(resp) = inbound.response.as_ref() else { return Ok(()) };
            (inbound.req_type, resp.buf, resp.len)
        } else if let Some(completed) = session.completed.get(&request_num) {
            (completed.req_type, completed.buf, completed.len)
        } else {
            return Ok(());
        };
        let (start, end) = packet_range(packet_num, mtu, len);
        let payload = self.pool.as_slice(buf, len as usize)?[start..end].to_vec();
        let header = nexus_rpc_abi::PacketHeader {
            request_type: req_type,
            message_size: len,
            dest_session_num: dest,
            packet_type: PacketType::Resp,
            packet_num,
            request_num,
        };
        let frame = encode_packet(&header, &payload);
        self.transport.tx_burst(&[TxPacket { peer, bytes: &frame }]);
        Ok(())
    }

    /// Retires a fully-answered inbound request: the reassembly buffer is
    /// freed outright, but the response is kept in `session.completed` (see
    /// [`Self::remember_completed`]) so a retransmitted request packet can
    /// still get its answer resent instead of re-running the handler.
    fn finish_inbound(&mut self, session_num: u16, request_num: u64) {
        let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) else { return };
        let Some(inbound) = session.inbound.remove(&request_num) else { return };
        let _ = self.pool.free(inbound.buf);
        if let Some(resp) = inbound.response {
            self.remember_completed(
                session_num,
                request_num,
                CompletedResponse { req_type: inbound.req_type, buf: resp.buf, len: resp.len, total_packets: resp.total_packets },
            );
        }
    }

    /// Records a retired request's response for possible retransmission,
    /// evicting the oldest entry once a session holds more than
    /// `COMPLETED_RETAIN_FACTOR` times its window size worth of them: a
    /// sender can have at most that many distinct requests outstanding, so
    /// anything older can no longer be what's being retransmitted.
    fn remember_completed(&mut self, session_num: u16, request_num: u64, response: CompletedResponse) {
        let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) else { return };
        if let Some(old) = session.completed.insert(request_num, response) {
            let _ = self.pool.free(old.buf);
        } else {
            session.completed_order.push_back(request_num);
        }
        let cap = session.slots.len().max(1) * COMPLETED_RETAIN_FACTOR;
        let mut evicted = Vec::new();
        while session.completed_order.len() > cap {
            let Some(old_num) = session.completed_order.pop_front() else { break };
            if let Some(old) = session.completed.remove(&old_num) {
                evicted.push(old.buf);
            }
        }
        for buf in evicted {
            let _ = self.pool.free(buf);
        }
    }

    fn on_rfr_packet(&mut self, session_num: u16, header: nexus_rpc_abi::PacketHeader) {
        let request_num = header.request_num;
        let packet_num = {
            let Some(session) = self.sessions.get(session_num as usize).and_then(|s| s.as_ref()) else { return };
            session.inbound.get(&request_num).map(|i| i.response.as_ref().map(|r| r.next_to_send))
        };
        let Some(Some(next)) = packet_num else { return };
        let _ = self.send_resp_packet(session_num, request_num, next);
        let done = {
            let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) else { return };
            if let Some(inbound) = session.inbound.get_mut(&request_num) {
                if let Some(resp) = inbound.response.as_mut() {
                    resp.next_to_send += 1;
                    resp.next_to_send >= resp.total_packets
                } else {
                    false
                }
            } else {
                false
            }
        };
        if done {
            self.finish_inbound(session_num, request_num);
        }
    }

    fn on_cr_packet(&mut self, session_num: u16, header: nexus_rpc_abi::PacketHeader) {
        let request_num = header.request_num;
        let granted_packets = header.message_size as u16;
        let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) else { return };
        let Some(slot_idx) = session.slots.iter().position(|s| s.state == SlotState::InProgress && s.request_num == request_num) else {
            return;
        };
        session.slots[slot_idx].req_credits = granted_packets;
        // A CR only proves the peer has packet 0 and is ready for the rest; it
        // is not proof the rest arrived, so the slot stays kInProgress. Only
        // the eventual response proves the whole request got there
        // (apply_resp_payload, which matches kInProgress slots for exactly
        // this reason).
        for packet_num in 1..granted_packets {
            session.pending_tx.push_back((slot_idx, request_num, packet_num));
        }
    }

    fn on_resp_packet(&mut self, session_num: u16, header: nexus_rpc_abi::PacketHeader, payload: &[u8]) {
        self.apply_resp_payload(session_num, header, payload);
    }

    fn apply_resp_payload(&mut self, session_num: u16, header: nexus_rpc_abi::PacketHeader, payload: &[u8]) {
        let mtu = self.transport.mtu();
        let request_num = header.request_num;
        let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) else { return };
        // A response packet is itself proof the whole request got there, so a
        // slot that's still kInProgress (single-packet request, no CR ever
        // sent) matches here too; this is where it first moves to
        // kAwaitingResp.
        let Some(slot_idx) = session
            .slots
            .iter()
            .position(|s| (s.state == SlotState::InProgress || s.state == SlotState::AwaitingResp) && s.request_num == request_num)
        else {
            return;
        };

        let resp_buf = {
            let slot = &mut session.slots[slot_idx];
            slot.state = SlotState::AwaitingResp;
            if slot.total_resp_packets == 0 {
                slot.total_resp_packets = num_packets(header.message_size, mtu);
                slot.resp_received = vec![false; slot.total_resp_packets as usize];
                slot.resp_len = header.message_size;
            }
            if let Some(sent_at) = slot.last_send {
                session.cc.on_rtt_sample(sent_at.elapsed(), &self.config.congestion);
            }
            slot.reset_backoff();
            session.slots[slot_idx].resp_buf
        };

        if let Some(buf) = resp_buf {
            let resp_len = session.slots[slot_idx].resp_len;
            let (start, end) = packet_range(header.packet_num, mtu, resp_len);
            if let Ok(dest) = self.pool.as_mut_slice(buf, resp_len as usize) {
                dest[start..end].copy_from_slice(payload);
            }
        }
        let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) else { return };
        session.slots[slot_idx].resp_received[header.packet_num as usize] = true;

        let total = session.slots[slot_idx].total_resp_packets;
        let received_count = session.slots[slot_idx].resp_received.iter().filter(|&&r| r).count() as u16;
        let all_received = received_count == total;

        if !all_received {
            self.send_rfr(session_num, slot_idx);
            return;
        }

        self.complete_slot(session_num, slot_idx, Ok(()));
    }

    fn send_rfr(&mut self, session_num: u16, slot_idx: usize) {
        let Some(session) = self.sessions.get(session_num as usize).and_then(|s| s.as_ref()) else { return };
        let peer = session.peer;
        let dest = session.remote_session_num.unwrap_or(session_num);
        let slot = &session.slots[slot_idx];
        let header = control_packet(slot.req_type, dest, slot.request_num, PacketType::ReqForResp, 0);
        let frame = encode_packet(&header, &[]);
        let _ = self.transport.tx_burst(&[TxPacket { peer, bytes: &frame }]);
    }

    fn complete_slot(&mut self, session_num: u16, slot_idx: usize, outcome: std::result::Result<(), RpcError>) {
        let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) else { return };
        let slot = &mut session.slots[slot_idx];
        let continuation = slot.continuation.take();
        let tag = slot.tag;
        let resp_buf = slot.resp_buf;
        let resp_len = slot.resp_len;
        slot.reset_to_idle(self.config.rto_floor);

        if let Some(cont) = continuation {
            match outcome {
                Ok(()) => {
                    let bytes = resp_buf
                        .and_then(|buf| self.pool.as_slice(buf, resp_len as usize).ok())
                        .unwrap_or(&[]);
                    cont(ContinuationResult::Response { tag, bytes });
                }
                Err(error) => cont(ContinuationResult::Error { tag, error }),
            }
        }
    }

    fn step3_poll_tx_completions(&mut self) {
        self.transport.poll_send_completions();
    }

    fn step4_advance_timers(&mut self) {
        let now = Instant::now();
        let expired = self.wheel.advance(now);
        for (session_num, slot_idx) in expired {
            self.on_timer_fired(session_num, slot_idx);
        }
    }

    fn on_timer_fired(&mut self, session_num: u16, slot_idx: usize) {
        let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) else { return };
        let state = session.slots[slot_idx].state;
        match state {
            SlotState::InProgress => {
                session.slots[slot_idx].bump_backoff();
                let rto = session.slots[slot_idx].current_rto();
                // No individual request packet beyond 0 gets its own ack (a CR
                // only vouches for packet 0; the response is the only proof
                // the rest arrived), so every packet already handed to the
                // transport is a retransmission candidate here — a packet
                // `req_sent` still marks false is still queued in
                // `pending_tx` awaiting its first send under CC pacing and is
                // left alone.
                let to_resend: Vec<u16> = session.slots[slot_idx]
                    .req_sent
                    .iter()
                    .enumerate()
                    .filter(|&(_, &sent)| sent)
                    .map(|(packet_num, _)| packet_num as u16)
                    .collect();
                drop(session);
                for packet_num in to_resend {
                    let _ = self.send_req_packet(session_num, slot_idx, packet_num);
                }
                self.wheel.schedule(session_num, slot_idx, rto);
            }
            SlotState::AwaitingResp => {
                session.slots[slot_idx].bump_backoff();
                let rto = session.slots[slot_idx].current_rto();
                drop(session);
                self.send_rfr(session_num, slot_idx);
                self.wheel.schedule(session_num, slot_idx, rto);
            }
            SlotState::Idle => {}
        }
    }

    fn step5_drain_worker_completions(&mut self) {
        let results = self.workers.drain_completions();
        for result in results {
            self.begin_response(result.session_num, result.request_num, result.payload);
        }
    }

    fn step6_drain_sm_events(&mut self) {
        if let Ok(event) = self.sm_rx.try_recv() {
            self.handle_sm_event(event);
        }
    }

    /// Step 7: replenishes each session's CC byte budget from
    /// elapsed time, then admits as many pacing-queued request packets as
    /// the budget allows. Packets withheld by an exhausted budget stay
    /// queued for the next tick; unspent budget carries forward.
    fn step7_admit_paced(&mut self) {
        let now = Instant::now();
        let mtu = self.transport.mtu();
        let mut ready = Vec::new();
        for (session_num, slot) in self.sessions.iter_mut().enumerate() {
            let Some(session) = slot.as_mut() else { continue };
            session.cc.refill(now);
            loop {
                let Some(&(slot_idx, request_num, packet_num)) = session.pending_tx.front() else { break };
                let stale = session
                    .slots
                    .get(slot_idx)
                    .map(|s| s.state == SlotState::Idle || s.request_num != request_num)
                    .unwrap_or(true);
                if stale {
                    session.pending_tx.pop_front();
                    continue;
                }
                let req_len = session.slots[slot_idx].req_len;
                let (start, end) = packet_range(packet_num, mtu, req_len);
                if !session.cc.try_spend(end - start) {
                    break;
                }
                session.pending_tx.pop_front();
                ready.push((session_num as u16, slot_idx, packet_num));
            }
        }
        for (session_num, slot_idx, packet_num) in ready {
            let _ = self.send_req_packet(session_num, slot_idx, packet_num);
        }
    }

    fn handle_sm_event(&mut self, event: SmEvent) {
        match event {
            SmEvent::ConnectAccepted { local_session_num, remote_session_num } => {
                if let Some(session) = self.sessions.get_mut(local_session_num as usize).and_then(|s| s.as_mut()) {
                    session.remote_session_num = Some(remote_session_num);
                    session.status = ConnStatus::Connected;
                }
            }
            SmEvent::ConnectRejected { local_session_num } => {
                if let Some(session) = self.sessions.get_mut(local_session_num as usize).and_then(|s| s.as_mut()) {
                    session.status = ConnStatus::Disconnected;
                    session.reset_all(self.config.rto_floor);
                }
            }
            SmEvent::InboundConnect { session_num, remote_host, remote_rpc_id, remote_session_num, peer, reply_to } => {
                self.accept_session(session_num, remote_host, remote_rpc_id, remote_session_num, peer);
                let _ = self.sm_tx.send(SmRequest::AcceptAck {
                    local_rpc_id: self.rpc_id,
                    local_session_num: session_num,
                    remote_rpc_id,
                    remote_session_num,
                    reply_to,
                });
            }
            SmEvent::DisconnectAck { session_num } => {
                if let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) {
                    session.status = ConnStatus::Disconnected;
                }
            }
            SmEvent::Reset { session_num } => {
                if let Some(session) = self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) {
                    session.reset_all(self.config.rto_floor);
                }
            }
        }
    }
}

impl<T: Transport> Drop for RpcInstance<T> {
    fn drop(&mut self) {
        crate::registry::deregister(self.rpc_id);
    }
}

/// Never surfaced to applications: used internally to translate a received
/// `kRingExhausted`-class condition into its error kind for logging.
pub(crate) fn error_kind_for(error: &RpcError) -> ErrorKind {
    match error {
        RpcError::TooLarge => ErrorKind::TooLarge,
        RpcError::OutOfMemory => ErrorKind::OutOfMemory,
        RpcError::TooManySessions => ErrorKind::TooManySessions,
        RpcError::InvalidRemoteRpcId => ErrorKind::InvalidRemoteRpcId,
        RpcError::SessionReset => ErrorKind::SessionReset,
        RpcError::Disconnected => ErrorKind::Disconnected,
        RpcError::RingExhausted => ErrorKind::RingExhausted,
        RpcError::Transport(_) | RpcError::UnknownSession | RpcError::UnknownRequestType(_) => ErrorKind::NoError,
    }
}

