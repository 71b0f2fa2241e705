//! Shared unit-test helpers: an in-memory [`Link`] that records every
//! outbound event.

use std::collections::HashSet;
use std::net::SocketAddr;

use bytes::Bytes;

use portage_core::wire::{PacketNumber, XferId};

use crate::link::{Link, Target};

#[derive(Debug, Clone)]
pub enum Sent {
    Request {
        to: SocketAddr,
        id: XferId,
        target: Target,
        large: bool,
    },
    Chunk {
        to: SocketAddr,
        id: XferId,
        packet: PacketNumber,
        data: Bytes,
    },
    Ack {
        to: SocketAddr,
        id: XferId,
        seq: u32,
    },
    Abort {
        to: SocketAddr,
        id: XferId,
        code: i32,
    },
}

#[derive(Default)]
pub struct RecordingLink {
    pub sent: Vec<Sent>,
    pub dead: HashSet<SocketAddr>,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> Vec<(XferId, PacketNumber, Bytes)> {
        self.sent
            .iter()
            .filter_map(|s| match s {
                Sent::Chunk {
                    id, packet, data, ..
                } => Some((*id, *packet, data.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn acks(&self) -> Vec<(XferId, u32)> {
        self.sent
            .iter()
            .filter_map(|s| match s {
                Sent::Ack { id, seq, .. } => Some((*id, *seq)),
                _ => None,
            })
            .collect()
    }

    pub fn aborts(&self) -> Vec<(XferId, i32)> {
        self.sent
            .iter()
            .filter_map(|s| match s {
                Sent::Abort { id, code, .. } => Some((*id, *code)),
                _ => None,
            })
            .collect()
    }

    pub fn requests(&self) -> Vec<(XferId, Target)> {
        self.sent
            .iter()
            .filter_map(|s| match s {
                Sent::Request { id, target, .. } => Some((*id, target.clone())),
                _ => None,
            })
            .collect()
    }
}

impl Link for RecordingLink {
    fn send_request(&mut self, to: SocketAddr, id: XferId, target: &Target, large_chunks: bool) {
        self.sent.push(Sent::Request {
            to,
            id,
            target: target.clone(),
            large: large_chunks,
        });
    }

    fn send_chunk(&mut self, to: SocketAddr, id: XferId, packet: PacketNumber, data: &[u8]) {
        self.sent.push(Sent::Chunk {
            to,
            id,
            packet,
            data: Bytes::copy_from_slice(data),
        });
    }

    fn send_ack(&mut self, to: SocketAddr, id: XferId, seq: u32) {
        self.sent.push(Sent::Ack { to, id, seq });
    }

    fn send_abort(&mut self, to: SocketAddr, id: XferId, code: i32) {
        self.sent.push(Sent::Abort { to, id, code });
    }

    fn is_alive(&self, host: SocketAddr) -> bool {
        !self.dead.contains(&host)
    }
}
