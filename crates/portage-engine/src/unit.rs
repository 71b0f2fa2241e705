//! Transfer unit — one logical send or receive operation.
//!
//! A unit owns its sequence counter, retry state, payload object, and
//! one-shot completion callback. The registry decides *when* things happen
//! (promotion, retries, removal); the unit decides *what* a chunk or ack
//! does to its own state. The registry is the sole caller of everything
//! here.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use portage_core::wire::{self, PacketNumber, XferId, SIZE_PREFIX_LEN};
use portage_core::XferError;

use crate::link::{Link, Target};
use crate::payload::{CompleteFn, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferStatus {
    /// Outbound buffer waiting for the peer to request it.
    Registered,
    /// Queued locally, waiting for a concurrency slot.
    Pending,
    /// Actively exchanging chunks.
    InProgress,
    /// Terminal failure. Callback has fired.
    Aborted,
    /// Terminal success. Callback has fired.
    Completed,
}

/// What receiving one chunk did to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk accepted; confirm `seq` (throttled path allowed).
    Advanced { seq: u32 },
    /// Final chunk accepted; confirm `seq`, then finalize.
    Final { seq: u32 },
    /// Duplicate of the previous chunk — its ack was probably lost.
    /// Re-confirm `seq`, touch nothing else.
    Reconfirm { seq: u32 },
    /// Out-of-window sequence number; caller logs and drops.
    Mismatch { got: u32, expected: u32 },
    /// First chunk too short to carry the size prefix; drop.
    Malformed,
}

/// What an acknowledgement did to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The final chunk is confirmed; the transfer is done.
    Completed,
    /// The in-flight chunk is confirmed; send the next one.
    MoreToSend,
    /// Stale or unexpected ack; ignore.
    Ignored,
}

pub struct XferUnit {
    pub id: XferId,
    pub direction: Direction,
    pub status: XferStatus,
    pub remote: Option<SocketAddr>,
    pub priority: bool,
    pub use_large_chunks: bool,
    /// What this unit asked the peer for (receive side only).
    pub target: Option<Target>,
    chunk_size: usize,
    next_seq: u32,
    retry_count: u32,
    last_activity: Instant,
    total_size: Option<u64>,
    bytes_moved: u64,
    awaiting_ack: bool,
    eof_sent: bool,
    last_chunk: Option<(PacketNumber, Bytes)>,
    payload: Box<dyn Payload>,
    callback: Option<CompleteFn>,
    dedup_token: Option<u64>,
}

fn chunk_size_for(use_large: bool) -> usize {
    if use_large {
        wire::CHUNK_SIZE_LARGE
    } else {
        wire::CHUNK_SIZE_SMALL
    }
}

impl XferUnit {
    fn base(
        id: XferId,
        direction: Direction,
        status: XferStatus,
        payload: Box<dyn Payload>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            direction,
            status,
            remote: None,
            priority: false,
            use_large_chunks: false,
            target: None,
            chunk_size: chunk_size_for(false),
            next_seq: 0,
            retry_count: 0,
            last_activity: now,
            total_size: None,
            bytes_moved: 0,
            awaiting_ack: false,
            eof_sent: false,
            last_chunk: None,
            payload,
            callback: None,
            dedup_token: None,
        }
    }

    /// Outbound buffer registered ahead of a peer request.
    pub fn new_registered(
        id: XferId,
        payload: Box<dyn Payload>,
        callback: CompleteFn,
        now: Instant,
    ) -> Self {
        let mut unit = Self::base(id, Direction::Send, XferStatus::Registered, payload, now);
        unit.callback = Some(callback);
        unit
    }

    /// Locally requested download, queued until a slot frees up.
    #[allow(clippy::too_many_arguments)]
    pub fn new_download(
        id: XferId,
        remote: SocketAddr,
        target: Target,
        payload: Box<dyn Payload>,
        priority: bool,
        use_large: bool,
        dedup_token: Option<u64>,
        callback: CompleteFn,
        now: Instant,
    ) -> Self {
        let mut unit = Self::base(id, Direction::Receive, XferStatus::Pending, payload, now);
        unit.remote = Some(remote);
        unit.target = Some(target);
        unit.priority = priority;
        unit.use_large_chunks = use_large;
        unit.chunk_size = chunk_size_for(use_large);
        unit.dedup_token = dedup_token;
        unit.callback = Some(callback);
        unit
    }

    /// Send created by an inbound peer request. No local callback.
    pub fn new_peer_send(
        id: XferId,
        remote: SocketAddr,
        payload: Box<dyn Payload>,
        use_large: bool,
        now: Instant,
    ) -> Self {
        let mut unit = Self::base(id, Direction::Send, XferStatus::Pending, payload, now);
        unit.remote = Some(remote);
        unit.use_large_chunks = use_large;
        unit.chunk_size = chunk_size_for(use_large);
        unit
    }

    // ── Send side ────────────────────────────────────────────────────────────

    /// A registered buffer was requested (again): point it at the
    /// requester and queue it for sending from the start.
    pub fn retarget(&mut self, remote: SocketAddr, use_large: bool) {
        self.remote = Some(remote);
        self.use_large_chunks = use_large;
        self.chunk_size = chunk_size_for(use_large);
        self.status = XferStatus::Pending;
    }

    /// Open the payload and send the first chunk.
    pub fn start_send(&mut self, link: &mut dyn Link, now: Instant) -> Result<(), XferError> {
        let total = self.payload.open_send()?;
        self.total_size = Some(total);
        self.next_seq = 0;
        self.bytes_moved = 0;
        self.retry_count = 0;
        self.awaiting_ack = false;
        self.eof_sent = false;
        self.last_chunk = None;
        self.status = XferStatus::InProgress;
        self.send_next_chunk(link, now)
    }

    /// Read and transmit the next chunk. The first chunk carries the
    /// 4-byte total-size prefix ahead of its payload bytes.
    pub fn send_next_chunk(&mut self, link: &mut dyn Link, now: Instant) -> Result<(), XferError> {
        debug_assert!(self.remote.is_some(), "sending without a remote host");
        let Some(remote) = self.remote else {
            return Ok(());
        };

        let total = self.total_size.unwrap_or(0);
        let mut buf = vec![0u8; self.chunk_size];
        let n = self.payload.read_chunk(&mut buf)?;
        self.bytes_moved += n as u64;

        let is_final = self.bytes_moved >= total;
        let packet = PacketNumber::new(self.next_seq, is_final);

        let data = if packet.seq == 0 {
            let mut first = Vec::with_capacity(SIZE_PREFIX_LEN + n);
            first.extend_from_slice(&wire::encode_size_prefix(total as u32));
            first.extend_from_slice(&buf[..n]);
            Bytes::from(first)
        } else {
            Bytes::copy_from_slice(&buf[..n])
        };

        link.send_chunk(remote, self.id, packet, &data);
        self.last_chunk = Some((packet, data));
        self.awaiting_ack = true;
        self.eof_sent = is_final;
        self.next_seq += 1;
        self.last_activity = now;
        Ok(())
    }

    /// Retransmit the in-flight chunk unchanged.
    pub fn resend_last(&mut self, link: &mut dyn Link, now: Instant) {
        let (Some(remote), Some((packet, data))) = (self.remote, self.last_chunk.as_ref()) else {
            return;
        };
        link.send_chunk(remote, self.id, *packet, data);
        self.retry_count += 1;
        self.last_activity = now;
    }

    /// Apply an ack for chunk `seq`.
    pub fn handle_ack(&mut self, seq: u32, now: Instant) -> AckOutcome {
        if !self.awaiting_ack || self.next_seq == 0 || seq != self.next_seq - 1 {
            return AckOutcome::Ignored;
        }
        self.awaiting_ack = false;
        self.retry_count = 0;
        self.last_activity = now;
        if self.eof_sent {
            self.status = XferStatus::Completed;
            AckOutcome::Completed
        } else {
            AckOutcome::MoreToSend
        }
    }

    // ── Receive side ─────────────────────────────────────────────────────────

    /// Promote a pending download: emit the request and start waiting.
    pub fn start_download(&mut self, link: &mut dyn Link, now: Instant) {
        let Some(remote) = self.remote else {
            return;
        };
        let target = self
            .target
            .clone()
            .unwrap_or(Target::Registered { id: self.id });
        link.send_request(remote, self.id, &target, self.use_large_chunks);
        self.status = XferStatus::InProgress;
        self.last_activity = now;
    }

    /// Apply one received chunk. Only the expected sequence advances
    /// state; the previous sequence asks for a re-ack; everything else is
    /// reported back for the caller to drop.
    pub fn receive_chunk(
        &mut self,
        packet: PacketNumber,
        data: &[u8],
        now: Instant,
    ) -> Result<ChunkOutcome, XferError> {
        if packet.seq != self.next_seq {
            if self.next_seq > 0 && packet.seq == self.next_seq - 1 {
                return Ok(ChunkOutcome::Reconfirm { seq: packet.seq });
            }
            return Ok(ChunkOutcome::Mismatch {
                got: packet.seq,
                expected: self.next_seq,
            });
        }

        let body = if packet.seq == 0 {
            let Ok(total) = wire::decode_size_prefix(data) else {
                return Ok(ChunkOutcome::Malformed);
            };
            self.total_size = Some(total as u64);
            self.payload.set_expected_size(total as u64)?;
            &data[SIZE_PREFIX_LEN..]
        } else {
            data
        };

        self.payload.write_chunk(body)?;
        self.bytes_moved += body.len() as u64;
        self.next_seq += 1;
        self.retry_count = 0;
        self.last_activity = now;

        if packet.is_final {
            Ok(ChunkOutcome::Final { seq: packet.seq })
        } else {
            Ok(ChunkOutcome::Advanced { seq: packet.seq })
        }
    }

    /// Commit the completed payload to its destination.
    pub fn finalize(&mut self) -> Result<(), XferError> {
        self.payload.finalize()?;
        self.status = XferStatus::Completed;
        Ok(())
    }

    // ── Completion ───────────────────────────────────────────────────────────

    /// Fire the completion callback. Safe to call more than once — the
    /// callback goes out exactly once, on the first call.
    pub fn fire(&mut self, result: Result<(), XferError>) {
        let failed = result.is_err();
        if let Some(cb) = self.callback.take() {
            match result {
                Ok(()) => cb(Ok(self.payload.take_bytes())),
                Err(e) => cb(Err(e)),
            }
        }
        if failed {
            self.payload.discard();
        }
    }

    // ── Bookkeeping ──────────────────────────────────────────────────────────

    pub fn waiting_for_ack(&self) -> bool {
        self.awaiting_ack
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn progress(&self) -> u64 {
        self.bytes_moved
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn describe_payload(&self) -> String {
        self.payload.describe()
    }

    /// Whether this unit already covers a download request with the same
    /// remote, target, destination, and caller token.
    pub fn matches_request(
        &self,
        remote: SocketAddr,
        target: &Target,
        destination: &str,
        dedup_token: Option<u64>,
    ) -> bool {
        self.direction == Direction::Receive
            && self.remote == Some(remote)
            && self.target.as_ref() == Some(target)
            && self.payload.describe() == destination
            && self.dedup_token == dedup_token
    }
}
