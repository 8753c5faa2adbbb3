// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Abstract NIC transport interface for the nexus-rpc datapath
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - Transport: the capability interface every NIC backend implements
//!   - LoopbackTransport: in-process backend for tests and demos
//!   - UdpTransport: host-socket backend standing in for a poll-mode driver
//!
//! This crate specifies only the abstract transport interface NIC backends
//! must implement (Non-goals: "specific NIC backends (verbs-based
//! RDMA, raw-Ethernet, poll-mode driver)"). Selection happens once at
//! endpoint construction; `nexus-rpc-core` is generic over `Transport` and
//! never boxes it, so the datapath stays monomorphic per instance.

mod loopback;
mod peer;
mod udp;

pub use loopback::{loopback_pair, LoopbackTransport};
pub use peer::PeerId;
pub use udp::UdpTransport;

/// Opaque registration tag returned by [`Transport::register`]. For backends
/// that don't need NIC-side memory registration (e.g. plain UDP sockets)
/// this is a dummy value; RDMA-class backends would return a real `lkey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LKey(pub u64);

/// A single datagram destined for `peer`, handed to [`Transport::tx_burst`].
pub struct TxPacket<'a> {
    pub peer: PeerId,
    pub bytes: &'a [u8],
}

/// A single datagram received from `peer`, returned by [`Transport::rx_burst`].
pub struct RxPacket {
    pub peer: PeerId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer is not known to this transport")]
    UnknownPeer,
    #[error("underlying transport is disconnected")]
    Disconnected,
}

/// The capability interface every NIC backend implements.
/// The abstraction assumes unreliable, unordered datagram delivery;
/// reliability is layered on top by `nexus-rpc-core`.
pub trait Transport {
    /// Submits up to `pkts.len()` packets for transmission. Never blocks;
    /// returns the number actually accepted. Rejected packets are the
    /// caller's to retry on a later event-loop tick.
    fn tx_burst(&mut self, pkts: &[TxPacket<'_>]) -> usize;

    /// Returns packets received since the last call. Never blocks.
    fn rx_burst(&mut self) -> Vec<RxPacket>;

    /// Reclaims completed transmissions, returning how many completed.
    /// Callers release any inline (transport-owned) buffers freed by this.
    fn poll_send_completions(&mut self) -> usize;

    /// Registers a memory region with the NIC if the backend requires it;
    /// backends without a registration step return an opaque dummy tag.
    fn register(&mut self, buffer: &[u8]) -> LKey;

    /// Maximum packet payload this transport can carry.
    fn mtu(&self) -> usize;

    /// Per-endpoint headroom reserved ahead of the payload (0 for RDMA,
    /// 40 bytes for Ethernet-class headers).
    fn headroom(&self) -> usize;

    /// Maximum number of packets a single `tx_burst`/`rx_burst` call will
    /// move in one go.
    fn max_burst(&self) -> usize;
}
