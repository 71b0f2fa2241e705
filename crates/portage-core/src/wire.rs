//! Portage wire format — on-wire types for the transfer protocol.
//!
//! These types ARE the protocol. Every field, every size, every flag bit
//! is part of the wire format and must not change once peers exist.
//!
//! All headers are #[repr(C, packed)] with network-byte-order integers and
//! use zerocopy derives for safe, allocation-free serialization. There is
//! no unsafe code in this module.
//!
//! A datagram is one tag byte followed by the matching header and, for
//! requests and data packets, a variable-length trailer (target name or
//! chunk payload). The packed packet-number field is decoded into
//! [`PacketNumber`] at this boundary; the raw form never travels further
//! into the engine.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, I32, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// 64-bit transfer identifier, unique per live transfer.
pub type XferId = u64;

/// Reserved "no transfer" id. Never assigned to a live transfer.
pub const XFER_ID_NONE: XferId = 0;

// ── Message tags ──────────────────────────────────────────────────────────────

/// Peer asks us to start sending a target it names (or a registered id).
pub const MSG_REQUEST: u8 = 0x01;
/// One chunk of transfer payload.
pub const MSG_DATA: u8 = 0x02;
/// Acknowledgement of one received chunk.
pub const MSG_ACK: u8 = 0x03;
/// Terminal failure notice carrying a result code.
pub const MSG_ABORT: u8 = 0x04;

// ── Chunk sizing ──────────────────────────────────────────────────────────────

/// Default chunk payload size in bytes.
pub const CHUNK_SIZE_SMALL: usize = 1000;

/// Negotiated "large chunk" payload size, for bulk transfers. Both peers
/// must agree on this constant out-of-band; it is pinned here.
pub const CHUNK_SIZE_LARGE: usize = 7680;

/// The first data chunk of a transfer prefixes its payload with the total
/// transfer size as a network-order u32 of this many bytes.
pub const SIZE_PREFIX_LEN: usize = 4;

/// Longest accepted request target name (file name or hex store key).
pub const MAX_TARGET_NAME: usize = 255;

// ── Packet numbers ────────────────────────────────────────────────────────────

const EOF_FLAG: u32 = 0x8000_0000;
const SEQ_MASK: u32 = 0x7FFF_FFFF;

/// A decoded chunk sequence number.
///
/// On the wire the sequence and the final-chunk marker share one u32: the
/// low 31 bits carry the sequence, the top bit flags the last chunk of the
/// transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketNumber {
    pub seq: u32,
    pub is_final: bool,
}

impl PacketNumber {
    pub fn new(seq: u32, is_final: bool) -> Self {
        debug_assert!(seq <= SEQ_MASK);
        Self { seq, is_final }
    }

    /// Pack into the wire representation.
    pub fn encode(self) -> u32 {
        if self.is_final {
            self.seq | EOF_FLAG
        } else {
            self.seq & SEQ_MASK
        }
    }

    /// Unpack from the wire representation.
    pub fn decode(raw: u32) -> Self {
        Self {
            seq: raw & SEQ_MASK,
            is_final: raw & EOF_FLAG != 0,
        }
    }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// What kind of target a request names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TargetKind {
    /// A send buffer the peer registered earlier; the id alone names it.
    Registered = 0x00,
    /// A file on the sender's filesystem, named in the trailer.
    File = 0x01,
    /// A content-store entry, hex key in the trailer.
    Store = 0x02,
}

impl TryFrom<u8> for TargetKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(TargetKind::Registered),
            0x01 => Ok(TargetKind::File),
            0x02 => Ok(TargetKind::Store),
            other => Err(WireError::UnknownTargetKind(other)),
        }
    }
}

/// Request flag: use [`CHUNK_SIZE_LARGE`] for this transfer.
pub const REQUEST_FLAG_LARGE_CHUNKS: u8 = 0x01;

/// Header of a MSG_REQUEST datagram. Followed by `name_len` bytes of
/// target name (empty for Registered targets).
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RequestHeader {
    /// Transfer id chosen by the requester.
    pub id: U64<NetworkEndian>,
    /// One of the TargetKind discriminants.
    pub kind: u8,
    /// Bit 0: large chunks. Other bits reserved, must be zero.
    pub flags: u8,
    /// Length of the target name trailer.
    pub name_len: U16<NetworkEndian>,
}

assert_eq_size!(RequestHeader, [u8; 12]);

// ── Data / Ack / Abort ────────────────────────────────────────────────────────

/// Header of a MSG_DATA datagram. Followed by the chunk payload; the first
/// chunk's payload starts with the 4-byte total-size prefix.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DataHeader {
    pub id: U64<NetworkEndian>,
    /// Packed packet number — decode with [`PacketNumber::decode`].
    pub packet: U32<NetworkEndian>,
}

assert_eq_size!(DataHeader, [u8; 12]);

/// Header of a MSG_ACK datagram. `packet` is the plain sequence number of
/// the confirmed chunk, no final-chunk flag.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AckHeader {
    pub id: U64<NetworkEndian>,
    pub packet: U32<NetworkEndian>,
}

assert_eq_size!(AckHeader, [u8; 12]);

/// Header of a MSG_ABORT datagram. `result` carries a stable error code
/// from [`crate::error`].
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AbortHeader {
    pub id: U64<NetworkEndian>,
    pub result: I32<NetworkEndian>,
}

assert_eq_size!(AbortHeader, [u8; 12]);

// ── Size prefix helpers ───────────────────────────────────────────────────────

/// Encode the first-chunk total-size prefix.
pub fn encode_size_prefix(total: u32) -> [u8; SIZE_PREFIX_LEN] {
    total.to_be_bytes()
}

/// Decode the first-chunk total-size prefix from the front of `payload`.
pub fn decode_size_prefix(payload: &[u8]) -> Result<u32, WireError> {
    if payload.len() < SIZE_PREFIX_LEN {
        return Err(WireError::Truncated {
            need: SIZE_PREFIX_LEN,
            got: payload.len(),
        });
    }
    let mut raw = [0u8; SIZE_PREFIX_LEN];
    raw.copy_from_slice(&payload[..SIZE_PREFIX_LEN]);
    Ok(u32::from_be_bytes(raw))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("unknown message tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("unknown request target kind: 0x{0:02x}")]
    UnknownTargetKind(u8),

    #[error("target name length {0} exceeds maximum {}", MAX_TARGET_NAME)]
    NameTooLong(usize),

    #[error("target name is not valid UTF-8")]
    NameNotUtf8,

    #[error("store key is not 64 hex characters")]
    BadStoreKey,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
