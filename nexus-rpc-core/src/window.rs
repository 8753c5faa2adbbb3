//! Wire packet assembly and segmentation helpers for the sliding-window
//! protocol ("Wire format").

use nexus_rpc_abi::{HeaderError, PacketHeader, PacketType, HEADER_LEN};

/// `K = ceil(payload / MTU)`, with a minimum of one packet.
pub fn num_packets(payload_len: u32, mtu: usize) -> u16 {
    if payload_len == 0 {
        return 1;
    }
    let mtu = mtu as u32;
    (payload_len.div_ceil(mtu)).max(1) as u16
}

/// Byte range of packet `packet_num` within the logical payload.
pub fn packet_range(packet_num: u16, mtu: usize, total_len: u32) -> (usize, usize) {
    let start = packet_num as usize * mtu;
    let end = (start + mtu).min(total_len as usize);
    (start, end)
}

/// Serializes a header and its payload fragment into one on-wire frame.
pub fn encode_packet(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    let mut header_bytes = [0u8; HEADER_LEN];
    // encode() only fails on values the caller already validated upstream
    // (message size, packet number); a failure here is a programming error.
    header.encode(&mut header_bytes).expect("packet header within protocol limits");
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    out
}

/// Splits a received frame into its header and payload fragment.
pub fn decode_packet(bytes: &[u8]) -> Result<(PacketHeader, &[u8]), HeaderError> {
    let header = PacketHeader::decode(bytes)?;
    Ok((header, &bytes[HEADER_LEN..]))
}

pub fn control_packet(
    request_type: u8,
    dest_session_num: u16,
    request_num: u64,
    packet_type: PacketType,
    packet_num: u16,
) -> PacketHeader {
    PacketHeader { request_type, message_size: 0, dest_session_num, packet_type, packet_num, request_num }
}
