//! In-process transport for tests and demos, grounded in the loopback
//! client/server channel pair used elsewhere in this codebase for
//! host-based IPC testing: an `mpsc` channel per direction, with the
//! receive side behind a `parking_lot::Mutex` so `&self` callers can share
//! it across threads.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use parking_lot::Mutex;

use crate::{LKey, PeerId, RxPacket, Transport, TxPacket};

const MTU: usize = 1024;
const MAX_BURST: usize = 32;

/// One side of a loopback pair. Always addresses its single peer as
/// `PeerId(0)`.
pub struct LoopbackTransport {
    tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
    completions: usize,
}

/// Builds a connected pair of loopback transports; bytes sent on one side's
/// `tx_burst` appear on the other's `rx_burst`.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    (
        LoopbackTransport { tx: a_tx, rx: Mutex::new(b_rx), completions: 0 },
        LoopbackTransport { tx: b_tx, rx: Mutex::new(a_rx), completions: 0 },
    )
}

impl Transport for LoopbackTransport {
    fn tx_burst(&mut self, pkts: &[TxPacket<'_>]) -> usize {
        let mut sent = 0;
        for pkt in pkts.iter().take(MAX_BURST) {
            if pkt.peer != PeerId(0) {
                continue;
            }
            if self.tx.send(pkt.bytes.to_vec()).is_ok() {
                sent += 1;
            }
        }
        self.completions += sent;
        sent
    }

    fn rx_burst(&mut self) -> Vec<RxPacket> {
        let rx = self.rx.lock();
        let mut out = Vec::new();
        while out.len() < MAX_BURST {
            match rx.try_recv() {
                Ok(bytes) => out.push(RxPacket { peer: PeerId(0), bytes }),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    fn poll_send_completions(&mut self) -> usize {
        let done = self.completions;
        self.completions = 0;
        done
    }

    fn register(&mut self, _buffer: &[u8]) -> LKey {
        LKey(0)
    }

    fn mtu(&self) -> usize {
        MTU
    }

    fn headroom(&self) -> usize {
        0
    }

    fn max_burst(&self) -> usize {
        MAX_BURST
    }
}
