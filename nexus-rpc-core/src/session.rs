//! Session and per-slot request-window state.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use nexus_rpc_alloc::MsgBuffer;
use nexus_rpc_transport::PeerId;

use crate::config::{CongestionConfig, MAX_BACKOFF_MULTIPLIER};
use crate::congestion::CongestionState;
use crate::error::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    InProgress,
    AwaitingResp,
}

/// Invoked exactly once per successful `enqueue_request`, or once more with
/// an error on session reset/disconnection ("exactly-once
/// continuation"). The response bytes are borrowed for the duration of the
/// call only, matching the "response buffer is borrowed during
/// the continuation and released when the continuation returns".
pub type Continuation = Box<dyn for<'a> FnOnce(ContinuationResult<'a>) + Send>;

pub enum ContinuationResult<'a> {
    Response { tag: u64, bytes: &'a [u8] },
    Error { tag: u64, error: RpcError },
}

pub struct Slot {
    pub state: SlotState,
    pub request_num: u64,
    pub req_type: u8,
    pub req_buf: Option<MsgBuffer>,
    pub req_len: u32,
    pub resp_buf: Option<MsgBuffer>,
    pub resp_cap: u32,
    pub resp_len: u32,
    pub tag: u64,
    pub continuation: Option<Continuation>,
    pub total_req_packets: u16,
    pub req_sent: Vec<bool>,
    pub req_credits: u16,
    pub total_resp_packets: u16,
    pub resp_received: Vec<bool>,
    pub rto: Duration,
    pub backoff: u32,
    pub last_send: Option<Instant>,
    pub rfr_next: u16,
}

impl Slot {
    pub fn idle(rto_floor: Duration) -> Self {
        Self {
            state: SlotState::Idle,
            request_num: 0,
            req_type: 0,
            req_buf: None,
            req_len: 0,
            resp_buf: None,
            resp_cap: 0,
            resp_len: 0,
            tag: 0,
            continuation: None,
            total_req_packets: 0,
            req_sent: Vec::new(),
            req_credits: 1,
            total_resp_packets: 0,
            resp_received: Vec::new(),
            rto: rto_floor,
            backoff: 1,
            last_send: None,
            rfr_next: 0,
        }
    }

    pub fn reset_to_idle(&mut self, rto_floor: Duration) {
        self.state = SlotState::Idle;
        self.req_buf = None;
        self.resp_buf = None;
        self.continuation = None;
        self.total_req_packets = 0;
        self.req_sent.clear();
        self.req_credits = 1;
        self.total_resp_packets = 0;
        self.resp_received.clear();
        self.rto = rto_floor;
        self.backoff = 1;
        self.last_send = None;
        self.rfr_next = 0;
    }

    /// Doubles the backoff multiplier up to the configured cap.
    pub fn bump_backoff(&mut self) {
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF_MULTIPLIER);
    }

    pub fn reset_backoff(&mut self) {
        self.backoff = 1;
    }

    pub fn current_rto(&self) -> Duration {
        self.rto * self.backoff
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Disconnected,
    Connecting,
    Connected,
    Reset,
}

/// Request the session is currently reassembling/answering in the
/// responder role ("Response path (server): mirror
/// symmetric"). Keyed by request number rather than a slot, since an
/// instance places no bound on concurrent inbound requests beyond what the
/// sender's own window already enforces.
pub struct InboundRequest {
    pub req_type: u8,
    pub buf: MsgBuffer,
    pub len: u32,
    pub total_packets: u16,
    pub received: Vec<bool>,
    pub response: Option<InboundResponse>,
    /// Set once the handler (or a forwarded nested request) has been
    /// invoked, so a duplicate/retransmitted request packet arriving while
    /// it's still being processed can't trigger a second dispatch.
    pub dispatched: bool,
}

pub struct InboundResponse {
    pub buf: MsgBuffer,
    pub len: u32,
    pub total_packets: u16,
    pub next_to_send: u16,
}

/// A request's response kept around after its `InboundRequest` is retired,
/// so a request packet the sender retransmits (because it never saw this
/// response, or never saw enough of it to stop retransmitting) gets the
/// cached answer resent instead of the handler running again.
pub struct CompletedResponse {
    pub req_type: u8,
    pub buf: MsgBuffer,
    pub len: u32,
    pub total_packets: u16,
}

pub struct Session {
    pub session_num: u16,
    pub role: Role,
    pub remote_host: String,
    pub remote_rpc_id: u8,
    pub remote_session_num: Option<u16>,
    pub peer: PeerId,
    pub status: ConnStatus,
    pub slots: Vec<Slot>,
    pub next_request_num: u64,
    pub cc: CongestionState,
    pub inbound: HashMap<u64, InboundRequest>,
    /// Responses retained after their `InboundRequest` retired, keyed by
    /// request number, for resending to a sender that retransmits a request
    /// it already got an answer for. Bounded by `completed_order` below.
    pub completed: HashMap<u64, CompletedResponse>,
    /// FIFO eviction order for `completed`, capped to a small multiple of the
    /// window size: a sender can have at most that many distinct requests
    /// worth retransmitting at once, so older entries can't be what's being
    /// retried.
    pub completed_order: VecDeque<u64>,
    /// Request packets granted credit but not yet admitted under CC pacing
    /// ("packets are released from the TX queue only while the
    /// budget is positive"; step 7). Entries carry the request
    /// number they were queued for so a slot reused by a later request
    /// before this entry drains is detected and dropped rather than
    /// misdelivering a stale packet under the new request's number.
    pub pending_tx: VecDeque<(usize, u64, u16)>,
}

impl Session {
    pub fn new(
        session_num: u16,
        role: Role,
        remote_host: String,
        remote_rpc_id: u8,
        peer: PeerId,
        window_size: usize,
        rto_floor: Duration,
        cc_cfg: &CongestionConfig,
        now: Instant,
    ) -> Self {
        Self {
            session_num,
            role,
            remote_host,
            remote_rpc_id,
            remote_session_num: None,
            peer,
            status: ConnStatus::Connecting,
            slots: (0..window_size).map(|_| Slot::idle(rto_floor)).collect(),
            next_request_num: 0,
            cc: CongestionState::new(cc_cfg, now),
            inbound: HashMap::new(),
            completed: HashMap::new(),
            completed_order: VecDeque::new(),
            pending_tx: VecDeque::new(),
        }
    }

    /// Lowest-indexed `kIdle` slot, per step 1.
    pub fn find_idle_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.state == SlotState::Idle)
    }

    pub fn next_request_num(&mut self) -> u64 {
        let n = self.next_request_num;
        self.next_request_num += 1;
        n
    }

    /// Fires every in-flight slot's continuation with `kSessionReset`, in
    /// slot-index order, then returns the slots to `kIdle`.
    pub fn reset_all(&mut self, rto_floor: Duration) {
        self.status = ConnStatus::Reset;
        self.pending_tx.clear();
        for slot in self.slots.iter_mut() {
            if slot.state != SlotState::Idle {
                if let Some(cont) = slot.continuation.take() {
                    cont(ContinuationResult::Error { tag: slot.tag, error: RpcError::SessionReset });
                }
                slot.reset_to_idle(rto_floor);
            }
        }
    }
}
