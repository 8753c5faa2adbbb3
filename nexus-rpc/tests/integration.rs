//! End-to-end scenarios from the protocol's testable-properties list:
//! nested RPC, packet loss under retransmission, session reset mid-flight,
//! and background-handler dispatch. The small-request and multi-packet
//! echo scenarios are exercised by `demos/echo` instead of duplicated here.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nexus_rpc::{
    loopback_pair, Config, ContinuationResult, HandlerMode, HandlerOutcome, HandlerTable, LoopbackTransport, PeerId, RpcError,
    RpcInstance,
};
use nexus_rpc_abi::PacketType;
use nexus_rpc_transport::{LKey, RxPacket, Transport, TxPacket, UdpTransport};

const TEST_DEADLINE: Duration = Duration::from_secs(5);

fn drive_until<T: Transport>(instance: &mut RpcInstance<T>, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + TEST_DEADLINE;
    while !done() {
        instance.run_event_loop_once();
        if Instant::now() > deadline {
            panic!("timed out waiting for completion");
        }
        thread::sleep(Duration::from_micros(100));
    }
}

/// Wraps a [`LoopbackTransport`] and silently drops every Nth packet in
/// either direction, simulating the unreliable datagram delivery the
/// sliding-window protocol is specified to recover from on its own.
struct LossyTransport {
    inner: LoopbackTransport,
    sent: u32,
    drop_every: u32,
    dropped: Arc<AtomicU32>,
}

impl LossyTransport {
    fn new(inner: LoopbackTransport, drop_every: u32, dropped: Arc<AtomicU32>) -> Self {
        Self { inner, sent: 0, drop_every, dropped }
    }
}

impl Transport for LossyTransport {
    fn tx_burst(&mut self, pkts: &[TxPacket<'_>]) -> usize {
        let mut accepted = 0;
        for pkt in pkts {
            self.sent += 1;
            if self.drop_every != 0 && self.sent % self.drop_every == 0 {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                accepted += 1; // the wire "accepts" the send; the datagram is simply never delivered
                continue;
            }
            accepted += self.inner.tx_burst(std::slice::from_ref(pkt));
        }
        accepted
    }

    fn rx_burst(&mut self) -> Vec<RxPacket> {
        self.inner.rx_burst()
    }

    fn poll_send_completions(&mut self) -> usize {
        self.inner.poll_send_completions()
    }

    fn register(&mut self, buffer: &[u8]) -> LKey {
        self.inner.register(buffer)
    }

    fn mtu(&self) -> usize {
        self.inner.mtu()
    }

    fn headroom(&self) -> usize {
        self.inner.headroom()
    }

    fn max_burst(&self) -> usize {
        self.inner.max_burst()
    }
}

const ECHO_TYPE: u8 = 1;

fn echo_handlers() -> Arc<HandlerTable> {
    let mut handlers = HandlerTable::new();
    handlers.register_handler(ECHO_TYPE, HandlerMode::Inline, |bytes| HandlerOutcome::Respond(bytes.to_vec()));
    Arc::new(handlers)
}

/// Scenario 4: packet loss. Client issues 33 requests with the default
/// window of 8 over a transport that drops roughly one packet in ten.
/// Expected: all 33 continuations fire, reassembly always succeeds, and
/// more physical sends than 33 are observed (i.e. at least one
/// retransmission happened).
#[test]
fn packet_loss_all_requests_complete_via_retransmission() {
    let (client_loopback, server_loopback) = loopback_pair();
    let dropped = Arc::new(AtomicU32::new(0));
    let client_transport = LossyTransport::new(client_loopback, 10, dropped.clone());
    let server_transport = LossyTransport::new(server_loopback, 10, dropped.clone());

    let handlers = echo_handlers();
    let server_handlers = handlers.clone();
    let (server_sm_tx, _server_sm_rx) = mpsc::channel();
    let server = thread::spawn(move || {
        let mut instance = RpcInstance::new(1, Config::default(), server_transport, server_handlers, server_sm_tx);
        instance.accept_session(0, "client".into(), 0, 0, PeerId(0));
        let deadline = Instant::now() + TEST_DEADLINE;
        while Instant::now() < deadline {
            instance.run_event_loop_once();
            thread::sleep(Duration::from_micros(100));
        }
    });

    let (client_sm_tx, _client_sm_rx) = mpsc::channel();
    let mut client = RpcInstance::new(0, Config::default(), client_transport, handlers, client_sm_tx);
    client.accept_session(0, "server".into(), 1, 0, PeerId(0));

    const TOTAL: usize = 33;
    const WINDOW: usize = 8;
    let (result_tx, result_rx) = mpsc::channel::<Result<usize, RpcError>>();
    let mut next_to_issue = 0usize;
    let mut in_flight = 0usize;
    let mut completed = 0usize;

    let mut issue = |client: &mut RpcInstance<LossyTransport>, idx: usize, result_tx: mpsc::Sender<Result<usize, RpcError>>| {
        let payload = vec![(idx % 256) as u8; 64];
        let req_buf = client.alloc_msg_buffer(payload.len()).expect("alloc request buffer");
        client.msg_buffer_mut(req_buf, payload.len()).unwrap().copy_from_slice(&payload);
        let resp_buf = client.alloc_msg_buffer(payload.len()).expect("alloc response buffer");
        client
            .enqueue_request(
                0,
                ECHO_TYPE,
                req_buf,
                payload.len() as u32,
                resp_buf,
                payload.len() as u32,
                Box::new(move |result| {
                    let outcome = match result {
                        ContinuationResult::Response { bytes, .. } => {
                            if bytes == payload.as_slice() {
                                Ok(idx)
                            } else {
                                Ok(usize::MAX) // signals a corrupted reassembly
                            }
                        }
                        ContinuationResult::Error { error, .. } => Err(error),
                    };
                    let _ = result_tx.send(outcome);
                }),
                idx as u64,
            )
            .expect("enqueue under window");
    };

    while next_to_issue < WINDOW.min(TOTAL) {
        issue(&mut client, next_to_issue, result_tx.clone());
        next_to_issue += 1;
        in_flight += 1;
    }

    let deadline = Instant::now() + TEST_DEADLINE;
    while completed < TOTAL {
        client.run_event_loop_once();
        match result_rx.try_recv() {
            Ok(Ok(idx)) => {
                assert_ne!(idx, usize::MAX, "reassembled payload must be bit-identical");
                completed += 1;
                in_flight -= 1;
                if next_to_issue < TOTAL {
                    issue(&mut client, next_to_issue, result_tx.clone());
                    next_to_issue += 1;
                    in_flight += 1;
                }
            }
            Ok(Err(err)) => panic!("request failed: {err}"),
            Err(_) => {}
        }
        assert!(in_flight <= WINDOW, "in-flight requests must never exceed the session window");
        if Instant::now() > deadline {
            panic!("timed out: {completed}/{TOTAL} completed");
        }
        thread::sleep(Duration::from_micros(100));
    }

    assert_eq!(completed, TOTAL);
    assert!(dropped.load(Ordering::Relaxed) > 0, "test setup should have dropped at least one packet");

    drop(client);
    server.join().expect("server thread panicked");
}

/// Scenario 5: session reset during flight. Eight concurrent requests are
/// in flight; the client destroys the session locally (standing in for
/// "the peer's instance is destroyed", since both sides observe the same
/// `kSessionReset` contract) before any response arrives. Expected: every
/// continuation fires exactly once, with `kSessionReset`.
#[test]
fn session_reset_fires_every_pending_continuation() {
    let (client_loopback, _server_loopback) = loopback_pair();
    let handlers = echo_handlers();
    let (client_sm_tx, _client_sm_rx) = mpsc::channel();
    let mut client = RpcInstance::new(0, Config::default(), client_loopback, handlers, client_sm_tx);
    client.accept_session(0, "server".into(), 1, 0, PeerId(0));

    let (result_tx, result_rx) = mpsc::channel::<Result<Vec<u8>, RpcError>>();
    for tag in 0..8u64 {
        let req_buf = client.alloc_msg_buffer(16).unwrap();
        client.msg_buffer_mut(req_buf, 16).unwrap().fill(tag as u8);
        let resp_buf = client.alloc_msg_buffer(16).unwrap();
        let tx = result_tx.clone();
        client
            .enqueue_request(
                0,
                ECHO_TYPE,
                req_buf,
                16,
                resp_buf,
                16,
                Box::new(move |result| {
                    let outcome = match result {
                        ContinuationResult::Response { bytes, .. } => Ok(bytes.to_vec()),
                        ContinuationResult::Error { error, .. } => Err(error),
                    };
                    let _ = tx.send(outcome);
                }),
                tag,
            )
            .expect("enqueue within window");
    }

    client.run_event_loop_once(); // send packet 0 of each request, no responder exists to answer
    client.destroy_session(0).expect("destroy in-flight session");

    let mut fired = 0;
    while let Ok(result) = result_rx.try_recv() {
        assert_eq!(result, Err(RpcError::SessionReset), "every in-flight continuation must fire with SessionReset");
        fired += 1;
    }
    assert_eq!(fired, 8, "all 8 in-flight continuations must fire exactly once");

    // No further packets should go out for this session once reset.
    client.run_event_loop_once();
    assert!(result_rx.try_recv().is_err(), "no continuation should fire a second time");
}

const BACKGROUND_ECHO_TYPE: u8 = 2;

/// Scenario 6: background handler. A handler registered in `background`
/// mode never runs on the event-loop thread, yet the client's continuation
/// always fires on its own event-loop thread.
#[test]
fn background_handler_runs_off_event_loop_thread() {
    let (client_transport, server_transport) = loopback_pair();
    let (handler_thread_tx, handler_thread_rx) = mpsc::channel::<thread::ThreadId>();
    // `register_handler` requires `Fn + Send + Sync` (several worker threads share
    // the same `Arc<HandlerTable>`); `mpsc::Sender` is `Send` but not `Sync`, so it
    // has to sit behind a mutex to be captured here.
    let handler_thread_tx = std::sync::Mutex::new(handler_thread_tx);

    let mut handlers = HandlerTable::new();
    handlers.register_handler(BACKGROUND_ECHO_TYPE, HandlerMode::Background, move |bytes| {
        let _ = handler_thread_tx.lock().unwrap().send(thread::current().id());
        HandlerOutcome::Respond(bytes.to_vec())
    });
    let handlers = Arc::new(handlers);

    let server_handlers = handlers.clone();
    let (server_sm_tx, _server_sm_rx) = mpsc::channel();
    let mut server_config = Config::default();
    server_config.background_workers = 2;
    let server = thread::spawn(move || {
        let mut instance = RpcInstance::new(1, server_config, server_transport, server_handlers, server_sm_tx);
        let instance_thread = thread::current().id();
        instance.accept_session(0, "client".into(), 0, 0, PeerId(0));
        let deadline = Instant::now() + TEST_DEADLINE;
        while Instant::now() < deadline {
            instance.run_event_loop_once();
            thread::sleep(Duration::from_micros(100));
        }
        instance_thread
    });

    let (client_sm_tx, _client_sm_rx) = mpsc::channel();
    let mut client = RpcInstance::new(0, Config::default(), client_transport, handlers, client_sm_tx);
    client.accept_session(0, "server".into(), 1, 0, PeerId(0));
    let client_thread = thread::current().id();

    let (result_tx, result_rx) = mpsc::channel::<(thread::ThreadId, Vec<u8>)>();
    let payload = vec![0x42u8; 32];
    let req_buf = client.alloc_msg_buffer(payload.len()).unwrap();
    client.msg_buffer_mut(req_buf, payload.len()).unwrap().copy_from_slice(&payload);
    let resp_buf = client.alloc_msg_buffer(payload.len()).unwrap();
    client
        .enqueue_request(
            0,
            BACKGROUND_ECHO_TYPE,
            req_buf,
            payload.len() as u32,
            resp_buf,
            payload.len() as u32,
            Box::new(move |result| {
                let bytes = match result {
                    ContinuationResult::Response { bytes, .. } => bytes.to_vec(),
                    ContinuationResult::Error { error, .. } => panic!("unexpected error: {error}"),
                };
                let _ = result_tx.send((thread::current().id(), bytes));
            }),
            0,
        )
        .expect("enqueue background request");

    let mut seen = None;
    drive_until(&mut client, || {
        if let Ok(result) = result_rx.try_recv() {
            seen = Some(result);
        }
        seen.is_some()
    });

    let (continuation_thread, bytes) = seen.unwrap();
    assert_eq!(bytes, payload);
    assert_eq!(continuation_thread, client_thread, "continuation must run on the issuing event-loop thread");

    let handler_thread = handler_thread_rx.recv_timeout(TEST_DEADLINE).expect("handler must have run");
    let server_thread = server.join().expect("server thread panicked");
    assert_ne!(handler_thread, server_thread, "a background handler must not run on the event-loop thread");
    assert_ne!(handler_thread, client_thread);
}

const PRIMARY_REQ_TYPE: u8 = 11;
const BACKUP_REQ_TYPE: u8 = 12;

/// Scenario 3: nested RPC. The primary receives `req_type = 11`, forwards
/// `req_type = 12` (payload bytes + 1) to a backup, the backup echoes
/// bytes + 1, and the primary replies with bytes + 1 again. Expected: the
/// client observes response bytes = original + 3.
#[test]
fn nested_rpc_chains_primary_and_backup() {
    let client_udp = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let primary_udp = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let backup_udp = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let client_addr = client_udp.local_addr().unwrap();
    let primary_addr = primary_udp.local_addr().unwrap();
    let backup_addr = backup_udp.local_addr().unwrap();

    let mut client_udp = client_udp;
    let mut primary_udp = primary_udp;
    let mut backup_udp = backup_udp;
    client_udp.add_peer(PeerId(1), primary_addr);
    primary_udp.add_peer(PeerId(0), client_addr);
    primary_udp.add_peer(PeerId(2), backup_addr);
    backup_udp.add_peer(PeerId(1), primary_addr);

    let mut backup_handlers = HandlerTable::new();
    backup_handlers.register_handler(BACKUP_REQ_TYPE, HandlerMode::Inline, |bytes| {
        HandlerOutcome::Respond(bytes.iter().map(|b| b.wrapping_add(1)).collect())
    });
    let backup_handlers = Arc::new(backup_handlers);

    let mut primary_handlers = HandlerTable::new();
    // Primary's outbound session to the backup is session_num 1 on its own table.
    primary_handlers.register_handler(PRIMARY_REQ_TYPE, HandlerMode::Inline, |bytes| {
        let forwarded: Vec<u8> = bytes.iter().map(|b| b.wrapping_add(1)).collect();
        HandlerOutcome::Forward {
            session_num: 1,
            req_type: BACKUP_REQ_TYPE,
            payload: forwarded,
            transform: Some(Box::new(|bytes: Vec<u8>| bytes.iter().map(|b| b.wrapping_add(1)).collect())),
        }
    });
    let primary_handlers = Arc::new(primary_handlers);

    let (backup_sm_tx, _backup_sm_rx) = mpsc::channel();
    let backup = thread::spawn(move || {
        let mut instance = RpcInstance::new(2, Config::default(), backup_udp, backup_handlers, backup_sm_tx);
        instance.accept_session(0, "primary".into(), 1, 1, PeerId(1));
        let deadline = Instant::now() + TEST_DEADLINE;
        while Instant::now() < deadline {
            instance.run_event_loop_once();
            thread::sleep(Duration::from_micros(100));
        }
    });

    let (primary_sm_tx, _primary_sm_rx) = mpsc::channel();
    let primary = thread::spawn(move || {
        let mut instance = RpcInstance::new(1, Config::default(), primary_udp, primary_handlers, primary_sm_tx);
        instance.accept_session(0, "client".into(), 0, 0, PeerId(0)); // inbound from client
        instance.accept_session(1, "backup".into(), 2, 0, PeerId(2)); // outbound to backup
        let deadline = Instant::now() + TEST_DEADLINE;
        while Instant::now() < deadline {
            instance.run_event_loop_once();
            thread::sleep(Duration::from_micros(100));
        }
    });

    let (client_sm_tx, _client_sm_rx) = mpsc::channel();
    let mut client_handlers = HandlerTable::new();
    client_handlers.register_handler(PRIMARY_REQ_TYPE, HandlerMode::Inline, |bytes| HandlerOutcome::Respond(bytes.to_vec()));
    let mut client = RpcInstance::new(0, Config::default(), client_udp, Arc::new(client_handlers), client_sm_tx);
    client.accept_session(0, "primary".into(), 1, 0, PeerId(1));

    let payload = vec![10u8; 128];
    let req_buf = client.alloc_msg_buffer(payload.len()).unwrap();
    client.msg_buffer_mut(req_buf, payload.len()).unwrap().copy_from_slice(&payload);
    let resp_buf = client.alloc_msg_buffer(payload.len()).unwrap();
    let (result_tx, result_rx) = mpsc::channel::<Vec<u8>>();
    client
        .enqueue_request(
            0,
            PRIMARY_REQ_TYPE,
            req_buf,
            payload.len() as u32,
            resp_buf,
            payload.len() as u32,
            Box::new(move |result| {
                let bytes = match result {
                    ContinuationResult::Response { bytes, .. } => bytes.to_vec(),
                    ContinuationResult::Error { error, .. } => panic!("unexpected error: {error}"),
                };
                let _ = result_tx.send(bytes);
            }),
            0,
        )
        .expect("enqueue nested-rpc request");

    let mut seen = None;
    drive_until(&mut client, || {
        if let Ok(bytes) = result_rx.try_recv() {
            seen = Some(bytes);
        }
        seen.is_some()
    });

    let response = seen.unwrap();
    let expected: Vec<u8> = payload.iter().map(|b| b.wrapping_add(3)).collect();
    assert_eq!(response, expected, "client must observe original bytes + 3 after the primary/backup chain");

    drop(client);
    primary.join().expect("primary thread panicked");
    backup.join().expect("backup thread panicked");
}

/// Sanity check that the default packet-type dispatch used by the lossy
/// wrapper above actually decodes; guards against a future header-format
/// change silently breaking the test's own instrumentation.
#[test]
fn packet_type_decodes_for_every_variant() {
    for (bits, expected) in [(0u8, PacketType::Req), (1, PacketType::Resp), (2, PacketType::ReqForResp), (3, PacketType::ExplicitCr)]
    {
        let header = nexus_rpc_abi::PacketHeader {
            request_type: 0,
            message_size: 0,
            dest_session_num: 0,
            packet_type: expected,
            packet_num: 0,
            request_num: 0,
        };
        let mut buf = [0u8; nexus_rpc_abi::HEADER_LEN];
        header.encode(&mut buf).unwrap();
        assert_eq!(buf[6] >> 4, bits);
    }
}

/// Wraps a [`LoopbackTransport`] and silently drops the first outbound
/// packet of a given [`PacketType`] it sees, then delivers everything else
/// normally. Used to pin down exactly one response (or request) loss instead
/// of the statistical drops `LossyTransport` does.
struct DropFirst {
    inner: LoopbackTransport,
    target: PacketType,
    dropped: bool,
}

impl DropFirst {
    fn new(inner: LoopbackTransport, target: PacketType) -> Self {
        Self { inner, target, dropped: false }
    }
}

impl Transport for DropFirst {
    fn tx_burst(&mut self, pkts: &[TxPacket<'_>]) -> usize {
        let mut accepted = 0;
        for pkt in pkts {
            if !self.dropped {
                if let Ok(header) = nexus_rpc_abi::PacketHeader::decode(pkt.bytes) {
                    if header.packet_type == self.target {
                        self.dropped = true;
                        accepted += 1;
                        continue;
                    }
                }
            }
            accepted += self.inner.tx_burst(std::slice::from_ref(pkt));
        }
        accepted
    }

    fn rx_burst(&mut self) -> Vec<RxPacket> {
        self.inner.rx_burst()
    }

    fn poll_send_completions(&mut self) -> usize {
        self.inner.poll_send_completions()
    }

    fn register(&mut self, buffer: &[u8]) -> LKey {
        self.inner.register(buffer)
    }

    fn mtu(&self) -> usize {
        self.inner.mtu()
    }

    fn headroom(&self) -> usize {
        self.inner.headroom()
    }

    fn max_burst(&self) -> usize {
        self.inner.max_burst()
    }
}

/// A single-packet response lost once must be recoverable: the client never
/// sees a response, so it keeps retransmitting its (also single-packet)
/// request until the server's cached answer gets through, and the handler
/// must not run a second time for the retransmitted request.
#[test]
fn lost_single_packet_response_recovered_via_request_retransmission() {
    let (client_loopback, server_loopback) = loopback_pair();
    let server_transport = DropFirst::new(server_loopback, PacketType::Resp);

    let invocations = Arc::new(AtomicU32::new(0));
    let counted_invocations = invocations.clone();
    let mut handlers = HandlerTable::new();
    handlers.register_handler(ECHO_TYPE, HandlerMode::Inline, move |bytes| {
        counted_invocations.fetch_add(1, Ordering::Relaxed);
        HandlerOutcome::Respond(bytes.to_vec())
    });
    let handlers = Arc::new(handlers);

    let server_handlers = handlers.clone();
    let (server_sm_tx, _server_sm_rx) = mpsc::channel();
    let server = thread::spawn(move || {
        let mut instance = RpcInstance::new(1, Config::default(), server_transport, server_handlers, server_sm_tx);
        instance.accept_session(0, "client".into(), 0, 0, PeerId(0));
        let deadline = Instant::now() + TEST_DEADLINE;
        while Instant::now() < deadline {
            instance.run_event_loop_once();
            thread::sleep(Duration::from_micros(100));
        }
    });

    let (client_sm_tx, _client_sm_rx) = mpsc::channel();
    let mut client = RpcInstance::new(0, Config::default(), client_loopback, handlers, client_sm_tx);
    client.accept_session(0, "server".into(), 1, 0, PeerId(0));

    let payload = vec![0x7Bu8; 48];
    let req_buf = client.alloc_msg_buffer(payload.len()).unwrap();
    client.msg_buffer_mut(req_buf, payload.len()).unwrap().copy_from_slice(&payload);
    let resp_buf = client.alloc_msg_buffer(payload.len()).unwrap();

    let (result_tx, result_rx) = mpsc::channel::<Result<Vec<u8>, RpcError>>();
    client
        .enqueue_request(
            0,
            ECHO_TYPE,
            req_buf,
            payload.len() as u32,
            resp_buf,
            payload.len() as u32,
            Box::new(move |result| {
                let outcome = match result {
                    ContinuationResult::Response { bytes, .. } => Ok(bytes.to_vec()),
                    ContinuationResult::Error { error, .. } => Err(error),
                };
                let _ = result_tx.send(outcome);
            }),
            0,
        )
        .expect("enqueue request");

    let mut response = None;
    drive_until(&mut client, || {
        if let Ok(result) = result_rx.try_recv() {
            response = Some(result.expect("continuation must not report an error"));
            true
        } else {
            false
        }
    });

    assert_eq!(response.unwrap(), payload, "retransmitted request must still round-trip the original bytes");
    assert_eq!(invocations.load(Ordering::Relaxed), 1, "retransmitted request must not re-run the handler");

    drop(client);
    server.join().expect("server thread panicked");
}
