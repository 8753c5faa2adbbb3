// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-thread echo demo: one nexus-rpc instance as client, one as server,
//! wired directly over a loopback transport. Exercises the small-request and
//! multi-packet scenarios without a real NIC or the session-management side
//! channel (sessions are wired with `accept_session` on both ends instead of
//! the connect handshake).

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nexus_rpc::{
    loopback_pair, Config, ContinuationResult, HandlerMode, HandlerOutcome, HandlerTable, LoopbackTransport, PeerId, RpcError,
    RpcInstance,
};

const ECHO_TYPE: u8 = 1;

fn main() {
    env_logger::init();

    let mut handlers = HandlerTable::new();
    handlers.register_handler(ECHO_TYPE, HandlerMode::Inline, |bytes| HandlerOutcome::Respond(bytes.to_vec()));
    let handlers = Arc::new(handlers);

    let (client_transport, server_transport) = loopback_pair();
    let (client_sm_tx, _client_sm_rx) = mpsc::channel();
    let (server_sm_tx, _server_sm_rx) = mpsc::channel();

    let server_handlers = handlers.clone();
    let server = thread::spawn(move || {
        let mut instance = RpcInstance::new(1, Config::default(), server_transport, server_handlers, server_sm_tx);
        instance.accept_session(0, "client".into(), 0, 0, PeerId(0));
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            instance.run_event_loop_once();
            thread::sleep(Duration::from_micros(100));
        }
    });

    let mut client = RpcInstance::new(0, Config::default(), client_transport, handlers, client_sm_tx);
    client.accept_session(0, "server".into(), 1, 0, PeerId(0));

    run_small_echo(&mut client);
    run_multi_packet_echo(&mut client);

    server.join().expect("server thread panicked");
}

fn run_small_echo(client: &mut RpcInstance<LoopbackTransport>) {
    let payload = vec![0xAAu8; 64];
    let response = echo_round_trip(client, &payload, 0);
    assert_eq!(response, payload, "echo handler must return bytes unchanged");
    println!("small echo: {} bytes round-tripped", response.len());
}

fn run_multi_packet_echo(client: &mut RpcInstance<LoopbackTransport>) {
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
    let response = echo_round_trip(client, &payload, 1);
    assert_eq!(response, payload, "multi-packet reassembly must be bit-identical");
    println!("multi-packet echo: {} bytes round-tripped across several fragments", response.len());
}

fn echo_round_trip(client: &mut RpcInstance<LoopbackTransport>, payload: &[u8], tag: u64) -> Vec<u8> {
    let req_buf = client.alloc_msg_buffer(payload.len()).expect("alloc request buffer");
    client.msg_buffer_mut(req_buf, payload.len()).expect("write request payload").copy_from_slice(payload);
    let resp_buf = client.alloc_msg_buffer(payload.len()).expect("alloc response buffer");

    let (tx, rx) = mpsc::channel::<Result<Vec<u8>, RpcError>>();
    client
        .enqueue_request(
            0,
            ECHO_TYPE,
            req_buf,
            payload.len() as u32,
            resp_buf,
            payload.len() as u32,
            Box::new(move |result| {
                let _ = tx.send(match result {
                    ContinuationResult::Response { bytes, .. } => Ok(bytes.to_vec()),
                    ContinuationResult::Error { error, .. } => Err(error),
                });
            }),
            tag,
        )
        .expect("enqueue echo request");

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        client.run_event_loop_once();
        if let Ok(result) = rx.try_recv() {
            return result.expect("continuation reported an error");
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for response");
        }
        thread::sleep(Duration::from_micros(100));
    }
}
