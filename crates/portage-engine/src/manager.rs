//! Transfer registry and retry supervisor.
//!
//! Owns every live transfer in two ordered lists (send and receive),
//! assigns 64-bit ids, enforces the per-host and process-wide concurrency
//! caps, routes inbound protocol events to their units, and runs the
//! periodic retry sweep from a single externally-driven `tick`.
//!
//! Everything here runs on one logical thread. Failures of any single
//! transfer resolve to its own abort path; nothing tears down the
//! registry.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;

use portage_core::config::{PortageConfig, TransferConfig};
use portage_core::error::CODE_NOT_FOUND;
use portage_core::wire::{PacketNumber, XferId, XFER_ID_NONE};
use portage_core::XferError;

use crate::link::{Link, Target};
use crate::path_guard::{is_cache_name, PathGuard};
use crate::payload::{CompleteFn, FilePayload, MemoryPayload, Payload, StorePayload};
use crate::store::ContentStore;
use crate::throttle::{AckThrottle, ACK_COST_BITS};
use crate::unit::{AckOutcome, ChunkOutcome, XferStatus, XferUnit};

/// Local destination of a requested download.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Accumulate in memory; the completion callback receives the bytes.
    Memory,
    /// Write to a local file. The path must be pre-registered via
    /// `expect_file` or be a bare cache name.
    File { path: PathBuf },
    /// Insert into the content store under `key`, verified on completion.
    Store { key: [u8; 32] },
}

/// Everything needed to start a download.
pub struct DownloadRequest {
    pub remote: SocketAddr,
    pub target: Target,
    pub destination: Destination,
    pub priority: bool,
    pub use_large_chunks: bool,
    /// Caller identity token for duplicate-request matching. Requests
    /// that agree on remote, target, destination, and token join the
    /// existing transfer instead of starting another.
    pub dedup_token: Option<u64>,
    pub on_complete: CompleteFn,
}

/// Live-transfer census, for status logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct XferCounts {
    pub send_registered: usize,
    pub send_pending: usize,
    pub send_active: usize,
    pub recv_pending: usize,
    pub recv_active: usize,
}

/// Per-remote-host send census, rebuilt on demand from the send list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostStatus {
    pub host: SocketAddr,
    pub pending: usize,
    pub active: usize,
}

struct PendingAck {
    host: SocketAddr,
    id: XferId,
    seq: u32,
}

fn fmt_id(id: XferId) -> String {
    format!("{id:016x}")
}

pub struct XferManager {
    config: TransferConfig,
    throttle_acks: bool,
    throttle: AckThrottle,
    guard: PathGuard,
    cache_dir: PathBuf,
    store: Option<ContentStore>,
    send_list: Vec<XferUnit>,
    recv_list: Vec<XferUnit>,
    ack_queue: VecDeque<PendingAck>,
}

impl XferManager {
    pub fn new(config: &PortageConfig) -> Self {
        Self {
            config: config.transfer.clone(),
            throttle_acks: config.throttle.enabled,
            throttle: AckThrottle::new(config.effective_ack_rate_bps()),
            guard: PathGuard::new(),
            cache_dir: config.storage.inbox_path.clone(),
            store: None,
            send_list: Vec::new(),
            recv_list: Vec::new(),
            ack_queue: VecDeque::new(),
        }
    }

    /// Attach the content store serving `Target::Store` requests.
    pub fn set_store(&mut self, store: ContentStore) {
        self.store = Some(store);
    }

    /// Switch deferred-ack throttling on or off at runtime.
    pub fn set_ack_throttling(&mut self, enabled: bool) {
        self.throttle_acks = enabled;
    }

    /// Authorize one upcoming transfer for exactly this path.
    pub fn expect_file(&mut self, name: impl Into<String>) {
        self.guard.expect(name);
    }

    // ── Public operations ────────────────────────────────────────────────────

    /// Wrap an in-memory buffer as a send unit waiting for the peer to
    /// request it by id. Aborts with `Timeout` if never requested within
    /// the registration window.
    pub fn register_send_buffer(
        &mut self,
        data: Bytes,
        now: Instant,
        on_complete: CompleteFn,
    ) -> XferId {
        let id = self.next_id();
        let unit = XferUnit::new_registered(
            id,
            Box::new(MemoryPayload::for_send(data)),
            on_complete,
            now,
        );
        self.send_list.insert(0, unit);
        tracing::debug!(id = %fmt_id(id), "send buffer registered");
        id
    }

    /// Create a download. Returns the id of the new transfer — or of an
    /// existing one covering the same request (see `dedup_token`).
    ///
    /// File destinations are validated before any unit exists; a path
    /// that was never authorized is refused outright.
    pub fn request_download(
        &mut self,
        link: &mut dyn Link,
        req: DownloadRequest,
        now: Instant,
    ) -> Result<XferId, XferError> {
        let destination = self.describe_destination(&req.destination)?;

        if let Some(existing) = self
            .recv_list
            .iter()
            .find(|u| u.matches_request(req.remote, &req.target, &destination, req.dedup_token))
        {
            tracing::debug!(
                id = %fmt_id(existing.id),
                destination = %destination,
                "download already in flight, joining existing transfer"
            );
            return Ok(existing.id);
        }

        // A registered buffer is named by the id the sender handed out;
        // everything else gets a fresh id. Either way the id must not
        // collide with a live transfer.
        let id = match &req.target {
            Target::Registered { id } => {
                let id = *id;
                let live = self
                    .send_list
                    .iter()
                    .chain(self.recv_list.iter())
                    .any(|u| u.id == id);
                if live {
                    tracing::info!(
                        id = %fmt_id(id),
                        "transfer id already live, refusing duplicate request"
                    );
                    return Err(XferError::FileNotFound);
                }
                id
            }
            _ => self.next_id(),
        };

        let payload = self.open_destination(&req.destination)?;
        let unit = XferUnit::new_download(
            id,
            req.remote,
            req.target,
            payload,
            req.priority,
            req.use_large_chunks,
            req.dedup_token,
            req.on_complete,
            now,
        );
        let priority = unit.priority;
        Self::add_to_list(&mut self.recv_list, unit, priority);
        tracing::info!(
            id = %fmt_id(id),
            peer = %req.remote,
            destination = %destination,
            "download queued"
        );
        self.start_pending_downloads(link, now);
        Ok(id)
    }

    /// Abort a transfer synchronously: the callback fires and the unit is
    /// gone before this returns.
    pub fn abort(&mut self, link: &mut dyn Link, id: XferId, error: XferError, now: Instant) {
        if let Some(idx) = self.recv_list.iter().position(|u| u.id == id) {
            self.fail_recv(link, idx, error, true, now);
            return;
        }
        if let Some(idx) = self.send_list.iter().position(|u| u.id == id) {
            self.fail_send(link, idx, error, true);
        }
    }

    // ── Inbound events ───────────────────────────────────────────────────────

    /// Peer asks us to start sending.
    pub fn on_request(
        &mut self,
        link: &mut dyn Link,
        from: SocketAddr,
        id: XferId,
        target: Target,
        use_large: bool,
        now: Instant,
    ) {
        tracing::info!(
            id = %fmt_id(id),
            peer = %from,
            target = %target.describe(),
            "transfer requested by peer"
        );

        // An id we already track: either a registered buffer being
        // claimed (possibly again after a lost first chunk), or a
        // duplicate of an active request.
        if let Some(idx) = self.send_list.iter().position(|u| u.id == id) {
            if self.send_list[idx].status == XferStatus::Registered {
                self.send_list[idx].retarget(from, use_large);
                self.try_start_send(link, id, now);
            } else {
                tracing::info!(id = %fmt_id(id), "duplicate request for active transfer, ignoring");
            }
            return;
        }

        let payload: Box<dyn Payload> = match &target {
            Target::Registered { .. } => {
                tracing::info!(id = %fmt_id(id), peer = %from, "requested buffer not found");
                link.send_abort(from, id, CODE_NOT_FOUND);
                return;
            }
            Target::File { name } => match self.resolve_local_path(name) {
                Ok(path) => Box::new(FilePayload::send(path)),
                // Refused paths get no reply at all; the warn has the details.
                Err(_) => return,
            },
            Target::Store { key } => match &self.store {
                Some(store) => Box::new(StorePayload::send(store.clone(), *key)),
                None => {
                    tracing::info!(id = %fmt_id(id), "no content store attached, refusing");
                    link.send_abort(from, id, CODE_NOT_FOUND);
                    return;
                }
            },
        };

        let unit = XferUnit::new_peer_send(id, from, payload, use_large, now);
        self.send_list.insert(0, unit);
        self.try_start_send(link, id, now);
    }

    /// One chunk of transfer payload arrived.
    pub fn on_chunk(
        &mut self,
        link: &mut dyn Link,
        from: SocketAddr,
        id: XferId,
        packet: PacketNumber,
        data: &[u8],
        now: Instant,
    ) {
        let Some(idx) = self.recv_list.iter().position(|u| u.id == id) else {
            tracing::info!(peer = %from, id = %fmt_id(id), "chunk for unknown transfer, dropping");
            return;
        };

        match self.recv_list[idx].receive_chunk(packet, data, now) {
            Err(e) => {
                self.fail_recv(link, idx, e, true, now);
            }
            Ok(ChunkOutcome::Reconfirm { seq }) => {
                tracing::info!(
                    id = %fmt_id(id),
                    seq,
                    peer = %from,
                    "re-confirming chunk, ack was likely lost"
                );
                // Straight out, never queued: the peer is already waiting.
                link.send_ack(from, id, seq);
            }
            Ok(ChunkOutcome::Mismatch { got, expected }) => {
                tracing::info!(id = %fmt_id(id), got, expected, "ignoring out-of-order chunk");
            }
            Ok(ChunkOutcome::Malformed) => {
                tracing::warn!(id = %fmt_id(id), "first chunk too short for size prefix, dropping");
            }
            Ok(ChunkOutcome::Advanced { seq }) => {
                self.queue_or_send_ack(link, from, id, seq);
            }
            Ok(ChunkOutcome::Final { seq }) => {
                self.queue_or_send_ack(link, from, id, seq);
                match self.recv_list[idx].finalize() {
                    Ok(()) => {
                        let mut unit = self.recv_list.remove(idx);
                        tracing::info!(
                            id = %fmt_id(id),
                            peer = %from,
                            bytes = unit.progress(),
                            "download complete"
                        );
                        unit.fire(Ok(()));
                        self.start_pending_downloads(link, now);
                    }
                    Err(e) => {
                        self.fail_recv(link, idx, e, true, now);
                    }
                }
            }
        }
    }

    /// Peer confirmed one of our chunks.
    pub fn on_ack(
        &mut self,
        link: &mut dyn Link,
        from: SocketAddr,
        id: XferId,
        seq: u32,
        now: Instant,
    ) {
        let Some(idx) = self.send_list.iter().position(|u| u.id == id) else {
            return;
        };
        match self.send_list[idx].handle_ack(seq, now) {
            AckOutcome::Ignored => {}
            AckOutcome::Completed => {
                let mut unit = self.send_list.remove(idx);
                tracing::info!(
                    id = %fmt_id(id),
                    peer = %from,
                    bytes = unit.progress(),
                    "send complete"
                );
                unit.fire(Ok(()));
            }
            AckOutcome::MoreToSend => {
                if let Err(e) = self.send_list[idx].send_next_chunk(link, now) {
                    self.fail_send(link, idx, e, true);
                }
            }
        }
    }

    /// Peer gave up on a transfer.
    pub fn on_abort(
        &mut self,
        link: &mut dyn Link,
        from: SocketAddr,
        id: XferId,
        code: i32,
        now: Instant,
    ) {
        let error = XferError::from_wire_code(code);
        if let Some(idx) = self.recv_list.iter().position(|u| u.id == id) {
            tracing::info!(id = %fmt_id(id), peer = %from, code, "peer aborted download");
            self.fail_recv(link, idx, error, false, now);
            return;
        }
        if let Some(idx) = self.send_list.iter().position(|u| u.id == id) {
            tracing::info!(id = %fmt_id(id), peer = %from, code, "peer aborted send");
            self.fail_send(link, idx, error, false);
        }
    }

    // ── Heartbeat ────────────────────────────────────────────────────────────

    /// Periodic retry sweep. The caller drives this from its event loop;
    /// this is the only place retries, registration timeouts, and
    /// deferred acks happen.
    pub fn tick(&mut self, link: &mut dyn Link, now: Instant) {
        // Downloads on dead connections abort immediately, no retry.
        let dead: Vec<XferId> = self
            .recv_list
            .iter()
            .filter(|u| {
                u.status == XferStatus::InProgress
                    && u.remote.map(|h| !link.is_alive(h)).unwrap_or(false)
            })
            .map(|u| u.id)
            .collect();
        for id in dead {
            if let Some(idx) = self.recv_list.iter().position(|u| u.id == id) {
                tracing::info!(id = %fmt_id(id), "connection lost, aborting download");
                self.fail_recv(link, idx, XferError::ConnectionLost, false, now);
            }
        }

        let hosts = self.host_status();
        if !hosts.is_empty() {
            tracing::trace!(?hosts, "outgoing transfer census");
        }

        // Send-side sweep: retries, registration timeouts, stale entries,
        // pending promotion under the per-host cap.
        let ids: Vec<XferId> = self.send_list.iter().map(|u| u.id).collect();
        for id in ids {
            let Some(idx) = self.send_list.iter().position(|u| u.id == id) else {
                continue;
            };
            let unit = &self.send_list[idx];
            let status = unit.status;
            let waiting = unit.waiting_for_ack();
            let idle = unit.idle_for(now);

            if waiting && idle > self.config.packet_timeout() {
                if self.send_list[idx].retry_count() >= self.config.retry_limit {
                    tracing::info!(id = %fmt_id(id), "retransmit limit exceeded, dropping transfer");
                    self.fail_send(link, idx, XferError::Timeout, true);
                } else {
                    tracing::info!(
                        id = %fmt_id(id),
                        idle_ms = idle.as_millis() as u64,
                        retry = self.send_list[idx].retry_count() + 1,
                        "chunk unconfirmed, resending"
                    );
                    self.send_list[idx].resend_last(link, now);
                }
            } else if status == XferStatus::Registered
                && idle > self.config.registration_timeout()
            {
                tracing::info!(id = %fmt_id(id), "registered transfer never requested, dropping");
                self.fail_send(link, idx, XferError::Timeout, false);
            } else if status == XferStatus::Aborted {
                tracing::warn!(id = %fmt_id(id), "removing stale aborted transfer");
                self.send_list.remove(idx);
            } else if status == XferStatus::Pending {
                self.try_start_send(link, id, now);
            }
        }

        self.drain_ack_queue(link, now);
        self.start_pending_downloads(link, now);
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn counts(&self) -> XferCounts {
        let mut counts = XferCounts::default();
        for unit in &self.send_list {
            match unit.status {
                XferStatus::Registered => counts.send_registered += 1,
                XferStatus::Pending => counts.send_pending += 1,
                XferStatus::InProgress => counts.send_active += 1,
                _ => {}
            }
        }
        for unit in &self.recv_list {
            match unit.status {
                XferStatus::Pending => counts.recv_pending += 1,
                XferStatus::InProgress => counts.recv_active += 1,
                _ => {}
            }
        }
        counts
    }

    pub fn status_of(&self, id: XferId) -> Option<XferStatus> {
        self.send_list
            .iter()
            .chain(self.recv_list.iter())
            .find(|u| u.id == id)
            .map(|u| u.status)
    }

    /// Active sends toward one host right now.
    pub fn active_sends_to(&self, host: SocketAddr) -> usize {
        self.send_list
            .iter()
            .filter(|u| u.remote == Some(host) && u.status == XferStatus::InProgress)
            .count()
    }

    /// Rebuild the per-host send census from the send list.
    pub fn host_status(&self) -> Vec<HostStatus> {
        let mut hosts: Vec<HostStatus> = Vec::new();
        for unit in &self.send_list {
            let Some(host) = unit.remote else { continue };
            let pos = match hosts.iter().position(|h| h.host == host) {
                Some(pos) => pos,
                None => {
                    hosts.push(HostStatus {
                        host,
                        pending: 0,
                        active: 0,
                    });
                    hosts.len() - 1
                }
            };
            match unit.status {
                XferStatus::Pending => hosts[pos].pending += 1,
                XferStatus::InProgress => hosts[pos].active += 1,
                _ => {}
            }
        }
        hosts
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Fresh id from 128 random bits folded to 64, skipping the reserved
    /// zero id and anything currently live.
    fn next_id(&self) -> XferId {
        loop {
            let wide: u128 = rand::random();
            let id = (wide as u64) ^ ((wide >> 64) as u64);
            if id == XFER_ID_NONE {
                continue;
            }
            let live = self
                .send_list
                .iter()
                .chain(self.recv_list.iter())
                .any(|u| u.id == id);
            if !live {
                return id;
            }
        }
    }

    /// New units land at the head; priority units go to the tail, where
    /// promotion picks first.
    fn add_to_list(list: &mut Vec<XferUnit>, unit: XferUnit, priority: bool) {
        if priority {
            list.push(unit);
        } else {
            list.insert(0, unit);
        }
    }

    /// Destination description for duplicate matching, validated but not
    /// yet opened or consumed.
    fn describe_destination(&self, dest: &Destination) -> Result<String, XferError> {
        match dest {
            Destination::Memory => Ok("memory".to_string()),
            Destination::File { path } => {
                let name = path.to_string_lossy();
                let resolved = self.peek_local_path(&name)?;
                Ok(format!("file:{}", resolved.display()))
            }
            Destination::Store { key } => Ok(format!("store:{}", hex::encode(key))),
        }
    }

    fn open_destination(&mut self, dest: &Destination) -> Result<Box<dyn Payload>, XferError> {
        match dest {
            Destination::Memory => Ok(Box::new(MemoryPayload::for_receive())),
            Destination::File { path } => {
                let resolved = self.resolve_local_path(&path.to_string_lossy())?;
                Ok(Box::new(FilePayload::receive(resolved)))
            }
            Destination::Store { key } => {
                let store = self.store.clone().ok_or(XferError::FileCannotOpen)?;
                Ok(Box::new(StorePayload::receive(store, *key)))
            }
        }
    }

    /// Non-consuming path check, for duplicate matching.
    fn peek_local_path(&self, name: &str) -> Result<PathBuf, XferError> {
        if self.guard.contains(name) {
            return Ok(PathBuf::from(name));
        }
        if is_cache_name(name) {
            return Ok(self.cache_dir.join(name));
        }
        tracing::warn!(path = name, "rejecting transfer path that was never authorized");
        Err(XferError::SecurityRejected)
    }

    /// Consume one authorization for `name` and resolve it. Bare cache
    /// names land under the cache directory; anything else must have been
    /// pre-registered.
    fn resolve_local_path(&mut self, name: &str) -> Result<PathBuf, XferError> {
        if self.guard.take_expected(name) {
            return Ok(PathBuf::from(name));
        }
        if is_cache_name(name) {
            return Ok(self.cache_dir.join(name));
        }
        tracing::warn!(path = name, "rejecting transfer path that was never authorized");
        Err(XferError::SecurityRejected)
    }

    /// Start a queued send if the per-host cap allows, else leave it
    /// pending for the next sweep.
    fn try_start_send(&mut self, link: &mut dyn Link, id: XferId, now: Instant) {
        let Some(idx) = self.send_list.iter().position(|u| u.id == id) else {
            return;
        };
        let Some(remote) = self.send_list[idx].remote else {
            return;
        };
        if self.active_sends_to(remote) < self.config.max_active_per_host {
            if let Err(e) = self.send_list[idx].start_send(link, now) {
                self.fail_send(link, idx, e, true);
            }
        } else {
            self.send_list[idx].status = XferStatus::Pending;
            tracing::info!(
                id = %fmt_id(id),
                peer = %remote,
                "send queued behind per-host cap"
            );
        }
    }

    /// Promote queued downloads until the incoming cap is filled. The
    /// list is scanned back-to-front so the oldest requests and appended
    /// priority entries start first.
    fn start_pending_downloads(&mut self, link: &mut dyn Link, now: Instant) {
        let active = self
            .recv_list
            .iter()
            .filter(|u| u.status == XferStatus::InProgress)
            .count();
        let mut slots = self.config.max_incoming.saturating_sub(active);
        if slots == 0 {
            return;
        }
        let ids: Vec<XferId> = self
            .recv_list
            .iter()
            .rev()
            .filter(|u| u.status == XferStatus::Pending)
            .map(|u| u.id)
            .collect();
        for id in ids {
            if slots == 0 {
                break;
            }
            if let Some(idx) = self.recv_list.iter().position(|u| u.id == id) {
                self.recv_list[idx].start_download(link, now);
                slots -= 1;
            }
        }
    }

    fn queue_or_send_ack(&mut self, link: &mut dyn Link, to: SocketAddr, id: XferId, seq: u32) {
        if self.throttle_acks {
            self.ack_queue.push_back(PendingAck { host: to, id, seq });
        } else {
            link.send_ack(to, id, seq);
        }
    }

    /// Pop deferred acks while the token bucket permits.
    fn drain_ack_queue(&mut self, link: &mut dyn Link, now: Instant) {
        loop {
            if self.ack_queue.is_empty() {
                return;
            }
            if self.throttle_acks && self.throttle.check_overflow(ACK_COST_BITS, now) {
                return;
            }
            let Some(ack) = self.ack_queue.pop_front() else {
                return;
            };
            link.send_ack(ack.host, ack.id, ack.seq);
            if self.throttle_acks {
                self.throttle.throttle_overflow(ACK_COST_BITS, now);
            }
        }
    }

    /// Terminal failure of a download: notify, fire, remove, refill slots.
    fn fail_recv(
        &mut self,
        link: &mut dyn Link,
        idx: usize,
        error: XferError,
        notify_peer: bool,
        now: Instant,
    ) {
        let mut unit = self.recv_list.remove(idx);
        unit.status = XferStatus::Aborted;
        if notify_peer {
            if let Some(remote) = unit.remote {
                link.send_abort(remote, unit.id, error.wire_code());
            }
        }
        tracing::warn!(id = %fmt_id(unit.id), error = %error, "download aborted");
        unit.fire(Err(error));
        self.start_pending_downloads(link, now);
    }

    /// Terminal failure of a send.
    fn fail_send(&mut self, link: &mut dyn Link, idx: usize, error: XferError, notify_peer: bool) {
        let mut unit = self.send_list.remove(idx);
        unit.status = XferStatus::Aborted;
        if notify_peer {
            if let Some(remote) = unit.remote {
                link.send_abort(remote, unit.id, error.wire_code());
            }
        }
        tracing::warn!(id = %fmt_id(unit.id), error = %error, "send aborted");
        unit.fire(Err(error));
    }
}
