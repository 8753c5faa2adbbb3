//! Session-management wire messages ("SM wire format").
//!
//! Encoded with `serde` + `bincode` rather than the packet header's manual
//! byte layout: these messages are small, rare (connect/disconnect/reset),
//! and never sit on the datapath's hot path, so the ergonomics of a derived
//! codec win over a hand-rolled one.

use serde::{Deserialize, Serialize};

/// Operation carried by an [`SmMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmOp {
    /// Request to establish a session.
    ConnectRequest,
    /// Reply to a connect request.
    ConnectResponse,
    /// Request graceful teardown of a session.
    DisconnectRequest,
    /// Acknowledge a disconnect.
    DisconnectAck,
    /// Unsolicited notification that a peer reset.
    Reset,
}

/// A message exchanged between session-management threads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmMessage {
    pub op: SmOp,
    /// Sender's management URI (`host:port`), used to route the reply.
    pub sender_uri: String,
    /// Sender's RPC instance ID.
    pub sender_rpc_id: u8,
    /// The RPC instance ID on the receiving Nexus this message is for,
    /// since a single Nexus's management port is shared by every RPC
    /// instance registered in its process-wide registry.
    pub target_rpc_id: u8,
    /// Sender's local session number for this exchange.
    pub sender_session_num: u16,
    /// Hash of the sender's request-type handler table, used to detect
    /// mismatched handler registrations between peers.
    pub request_type_table_hash: u64,
    /// Remote session number, populated in `ConnectResponse`.
    pub remote_session_num: Option<u16>,
    /// Peer memory-region key for RDMA backends, populated on connect.
    /// Transport backends that do not register memory leave this `None`.
    pub memory_region_key: Option<u64>,
    /// Populated on `ConnectResponse` when the peer rejected the request.
    pub rejected: bool,
}

impl SmMessage {
    /// Builds a connect request for `sender_uri`/`sender_rpc_id`, addressed
    /// to `target_rpc_id` on the receiving Nexus.
    pub fn connect_request(
        sender_uri: impl Into<String>,
        sender_rpc_id: u8,
        target_rpc_id: u8,
        sender_session_num: u16,
        request_type_table_hash: u64,
    ) -> Self {
        Self {
            op: SmOp::ConnectRequest,
            sender_uri: sender_uri.into(),
            sender_rpc_id,
            target_rpc_id,
            sender_session_num,
            request_type_table_hash,
            remote_session_num: None,
            memory_region_key: None,
            rejected: false,
        }
    }

    /// Builds a disconnect request tearing down `sender_session_num` on the
    /// receiving side as well.
    pub fn disconnect_request(
        sender_uri: impl Into<String>,
        sender_rpc_id: u8,
        target_rpc_id: u8,
        sender_session_num: u16,
    ) -> Self {
        Self {
            op: SmOp::DisconnectRequest,
            sender_uri: sender_uri.into(),
            sender_rpc_id,
            target_rpc_id,
            sender_session_num,
            request_type_table_hash: 0,
            remote_session_num: None,
            memory_region_key: None,
            rejected: false,
        }
    }

    /// Builds an unsolicited reset notification for `sender_session_num`.
    pub fn reset_notification(
        sender_uri: impl Into<String>,
        sender_rpc_id: u8,
        target_rpc_id: u8,
        sender_session_num: u16,
    ) -> Self {
        Self {
            op: SmOp::Reset,
            sender_uri: sender_uri.into(),
            sender_rpc_id,
            target_rpc_id,
            sender_session_num,
            request_type_table_hash: 0,
            remote_session_num: None,
            memory_region_key: None,
            rejected: false,
        }
    }

    /// Encodes this message for transmission over the management socket.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decodes a message received over the management socket.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
