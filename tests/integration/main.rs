//! Portage integration test harness.
//!
//! Two engines joined by an in-memory lossy link. The engine is sans-IO
//! and takes explicit `Instant`s, so these tests run the full protocol —
//! requests, chunks, acks, retries, aborts — deterministically with
//! virtual time and scriptable loss. No sockets, no sleeps.


mod properties;
mod scenarios;
