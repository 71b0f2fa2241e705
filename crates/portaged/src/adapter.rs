//! UDP wire adapter — frames engine events into datagrams and decodes
//! inbound datagrams into engine events.
//!
//! The engine stays sans-IO: [`UdpLink`] queues encoded datagrams and the
//! event loop drains them onto the socket after every engine call. Peer
//! liveness is last-heard time with a TTL; hosts we have never heard from
//! are presumed alive (the engine only probes hosts with traffic history).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use zerocopy::byteorder::{I32, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes};

use portage_core::wire::{
    AbortHeader, AckHeader, DataHeader, PacketNumber, RequestHeader, TargetKind, WireError,
    XferId, MAX_TARGET_NAME, MSG_ABORT, MSG_ACK, MSG_DATA, MSG_REQUEST,
    REQUEST_FLAG_LARGE_CHUNKS,
};
use portage_engine::{Link, Target};

const HEADER_LEN: usize = 12;

/// One decoded inbound datagram.
#[derive(Debug)]
pub enum Frame {
    Request {
        id: XferId,
        target: Target,
        large: bool,
    },
    Data {
        id: XferId,
        packet: PacketNumber,
        payload: Vec<u8>,
    },
    Ack {
        id: XferId,
        seq: u32,
    },
    Abort {
        id: XferId,
        code: i32,
    },
}

fn truncated(need: usize, got: usize) -> WireError {
    WireError::Truncated { need, got }
}

/// Decode one datagram.
pub fn decode(buf: &[u8]) -> Result<Frame, WireError> {
    let (&tag, rest) = buf.split_first().ok_or(truncated(1, 0))?;
    match tag {
        MSG_REQUEST => {
            let header =
                RequestHeader::read_from_prefix(rest).ok_or(truncated(HEADER_LEN, rest.len()))?;
            let name_len = header.name_len.get() as usize;
            if name_len > MAX_TARGET_NAME {
                return Err(WireError::NameTooLong(name_len));
            }
            let name_bytes = rest
                .get(HEADER_LEN..HEADER_LEN + name_len)
                .ok_or(truncated(HEADER_LEN + name_len, rest.len()))?;
            let name = std::str::from_utf8(name_bytes).map_err(|_| WireError::NameNotUtf8)?;

            let id = header.id.get();
            let target = match TargetKind::try_from(header.kind)? {
                TargetKind::Registered => Target::Registered { id },
                TargetKind::File => Target::File {
                    name: name.to_string(),
                },
                TargetKind::Store => {
                    let mut key = [0u8; 32];
                    hex::decode_to_slice(name, &mut key).map_err(|_| WireError::BadStoreKey)?;
                    Target::Store { key }
                }
            };
            Ok(Frame::Request {
                id,
                target,
                large: header.flags & REQUEST_FLAG_LARGE_CHUNKS != 0,
            })
        }
        MSG_DATA => {
            let header =
                DataHeader::read_from_prefix(rest).ok_or(truncated(HEADER_LEN, rest.len()))?;
            Ok(Frame::Data {
                id: header.id.get(),
                packet: PacketNumber::decode(header.packet.get()),
                payload: rest[HEADER_LEN..].to_vec(),
            })
        }
        MSG_ACK => {
            let header =
                AckHeader::read_from_prefix(rest).ok_or(truncated(HEADER_LEN, rest.len()))?;
            Ok(Frame::Ack {
                id: header.id.get(),
                seq: header.packet.get(),
            })
        }
        MSG_ABORT => {
            let header =
                AbortHeader::read_from_prefix(rest).ok_or(truncated(HEADER_LEN, rest.len()))?;
            Ok(Frame::Abort {
                id: header.id.get(),
                code: header.result.get(),
            })
        }
        other => Err(WireError::UnknownTag(other)),
    }
}

pub fn encode_request(id: XferId, target: &Target, large: bool) -> Vec<u8> {
    let (kind, name) = match target {
        Target::Registered { .. } => (TargetKind::Registered, String::new()),
        Target::File { name } => (TargetKind::File, name.clone()),
        Target::Store { key } => (TargetKind::Store, hex::encode(key)),
    };
    let header = RequestHeader {
        id: U64::new(id),
        kind: kind as u8,
        flags: if large { REQUEST_FLAG_LARGE_CHUNKS } else { 0 },
        name_len: U16::new(name.len() as u16),
    };
    let mut out = Vec::with_capacity(1 + HEADER_LEN + name.len());
    out.push(MSG_REQUEST);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(name.as_bytes());
    out
}

pub fn encode_data(id: XferId, packet: PacketNumber, data: &[u8]) -> Vec<u8> {
    let header = DataHeader {
        id: U64::new(id),
        packet: U32::new(packet.encode()),
    };
    let mut out = Vec::with_capacity(1 + HEADER_LEN + data.len());
    out.push(MSG_DATA);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    out
}

pub fn encode_ack(id: XferId, seq: u32) -> Vec<u8> {
    let header = AckHeader {
        id: U64::new(id),
        packet: U32::new(seq),
    };
    let mut out = Vec::with_capacity(1 + HEADER_LEN);
    out.push(MSG_ACK);
    out.extend_from_slice(header.as_bytes());
    out
}

pub fn encode_abort(id: XferId, code: i32) -> Vec<u8> {
    let header = AbortHeader {
        id: U64::new(id),
        result: I32::new(code),
    };
    let mut out = Vec::with_capacity(1 + HEADER_LEN);
    out.push(MSG_ABORT);
    out.extend_from_slice(header.as_bytes());
    out
}

/// The engine's outbound boundary, backed by a datagram queue.
pub struct UdpLink {
    outbound: Vec<(SocketAddr, Vec<u8>)>,
    peers: HashMap<SocketAddr, Instant>,
    ttl: Duration,
    now: Instant,
}

impl UdpLink {
    pub fn new(ttl: Duration) -> Self {
        Self {
            outbound: Vec::new(),
            peers: HashMap::new(),
            ttl,
            now: Instant::now(),
        }
    }

    /// Record traffic from a peer and refresh the liveness clock.
    pub fn heard_from(&mut self, peer: SocketAddr, now: Instant) {
        self.peers.insert(peer, now);
        self.now = now;
    }

    /// Refresh the liveness clock ahead of an engine call.
    pub fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    /// Take everything queued for transmission.
    pub fn drain(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.outbound)
    }
}

impl Link for UdpLink {
    fn send_request(&mut self, to: SocketAddr, id: XferId, target: &Target, large_chunks: bool) {
        self.outbound.push((to, encode_request(id, target, large_chunks)));
    }

    fn send_chunk(&mut self, to: SocketAddr, id: XferId, packet: PacketNumber, data: &[u8]) {
        self.outbound.push((to, encode_data(id, packet, data)));
    }

    fn send_ack(&mut self, to: SocketAddr, id: XferId, seq: u32) {
        self.outbound.push((to, encode_ack(id, seq)));
    }

    fn send_abort(&mut self, to: SocketAddr, id: XferId, code: i32) {
        self.outbound.push((to, encode_abort(id, code)));
    }

    fn is_alive(&self, host: SocketAddr) -> bool {
        match self.peers.get(&host) {
            Some(last) => self.now.saturating_duration_since(*last) < self.ttl,
            None => true,
        }
    }
}
