//! Host-socket transport. Stands in for a poll-mode driver when running off
//! the kernel network stack (Non-goals excludes specific NIC
//! backends; this backend exists so the demo and integration tests have a
//! real, runnable `Transport` that talks over an actual socket).

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};

use crate::{LKey, PeerId, RxPacket, Transport, TxPacket};

const MTU: usize = 1472; // 1500 - 20-byte IPv4 header - 8-byte UDP header
const MAX_BURST: usize = 32;

pub struct UdpTransport {
    socket: UdpSocket,
    peers: HashMap<PeerId, SocketAddr>,
    reverse: HashMap<SocketAddr, PeerId>,
    next_peer: u32,
    completions: usize,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peers: HashMap::new(),
            reverse: HashMap::new(),
            next_peer: 0,
            completions: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Registers a known peer address under a caller-chosen `PeerId`, e.g.
    /// once session management has resolved a remote endpoint's address.
    pub fn add_peer(&mut self, peer: PeerId, addr: SocketAddr) {
        self.peers.insert(peer, addr);
        self.reverse.insert(addr, peer);
    }

    fn peer_for(&mut self, addr: SocketAddr) -> PeerId {
        if let Some(peer) = self.reverse.get(&addr) {
            return *peer;
        }
        let peer = PeerId(self.next_peer);
        self.next_peer += 1;
        self.peers.insert(peer, addr);
        self.reverse.insert(addr, peer);
        peer
    }
}

impl Transport for UdpTransport {
    fn tx_burst(&mut self, pkts: &[TxPacket<'_>]) -> usize {
        let mut sent = 0;
        for pkt in pkts.iter().take(MAX_BURST) {
            let Some(addr) = self.peers.get(&pkt.peer).copied() else {
                log::debug!("dropping packet to unknown peer {:?}", pkt.peer);
                continue;
            };
            match self.socket.send_to(pkt.bytes, addr) {
                Ok(_) => sent += 1,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => log::warn!("udp send_to {addr} failed: {err}"),
            }
        }
        self.completions += sent;
        sent
    }

    fn rx_burst(&mut self) -> Vec<RxPacket> {
        let mut out = Vec::new();
        let mut buf = [0u8; MTU];
        while out.len() < MAX_BURST {
            match self.socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    let peer = self.peer_for(addr);
                    out.push(RxPacket { peer, bytes: buf[..len].to_vec() });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("udp recv_from failed: {err}");
                    break;
                }
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
        42 // 14 Ethernet + 20 IPv4 + 8 UDP
    }

    fn max_burst(&self) -> usize {
        MAX_BURST
    }
}
