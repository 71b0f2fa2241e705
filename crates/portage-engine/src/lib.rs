//! portage-engine — reliable chunked transfer engine.
//!
//! Moves large payloads between hosts over an unreliable datagram
//! transport: per-transfer sequence numbers, bounded retransmission,
//! acknowledgement throttling, and multi-transfer multiplexing with
//! per-host concurrency caps.
//!
//! The engine is sans-IO and single-threaded: it owns no sockets and no
//! clocks. Outbound traffic goes through the [`Link`] trait, inbound
//! events and the retry heartbeat arrive as method calls carrying an
//! explicit `Instant`. The caller serializes everything on one logical
//! thread.

pub mod link;
pub mod manager;
pub mod path_guard;
pub mod payload;
pub mod store;
pub mod throttle;
pub mod unit;

#[cfg(test)]
pub(crate) mod testutil;

pub use link::{Link, Target};
pub use manager::{Destination, DownloadRequest, HostStatus, XferCounts, XferManager};
pub use payload::{CompleteFn, FilePayload, MemoryPayload, Payload, StorePayload};
pub use store::{store_key, ContentStore};
pub use throttle::AckThrottle;
pub use unit::{Direction, XferStatus};
