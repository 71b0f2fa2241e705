//! Boundary trait between the engine and the surrounding transport.
//!
//! The engine never touches a socket. Every outbound protocol event goes
//! through [`Link`]; the daemon implements it by framing datagrams, tests
//! implement it with an in-memory pipe. Implementations must not call back
//! into the engine.

use std::net::SocketAddr;

use portage_core::wire::{PacketNumber, XferId};

/// What a download request names on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A send buffer the remote registered earlier. The id was handed
    /// out at registration time and names both the buffer and the
    /// transfer.
    Registered { id: XferId },
    /// A file on the remote host's filesystem.
    File { name: String },
    /// An entry in the remote host's content store.
    Store { key: [u8; 32] },
}

impl Target {
    /// Stable description used in logs and duplicate-request matching.
    pub fn describe(&self) -> String {
        match self {
            Target::Registered { id } => format!("registered:{id:016x}"),
            Target::File { name } => format!("file:{name}"),
            Target::Store { key } => format!("store:{}", hex::encode(key)),
        }
    }
}

/// Outbound events the engine emits, plus the liveness probe for the
/// retry sweep.
pub trait Link {
    /// Ask `to` to start sending `target` under transfer `id`.
    fn send_request(&mut self, to: SocketAddr, id: XferId, target: &Target, large_chunks: bool);

    /// Emit one chunk of payload. The first chunk's `data` already carries
    /// the total-size prefix.
    fn send_chunk(&mut self, to: SocketAddr, id: XferId, packet: PacketNumber, data: &[u8]);

    /// Confirm receipt of chunk `seq`.
    fn send_ack(&mut self, to: SocketAddr, id: XferId, seq: u32);

    /// Tell the peer the transfer is dead, with a wire result code.
    fn send_abort(&mut self, to: SocketAddr, id: XferId, code: i32);

    /// Whether the connection to `host` is still believed healthy.
    fn is_alive(&self, host: SocketAddr) -> bool;
}
