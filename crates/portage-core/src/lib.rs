//! portage-core — wire format, error taxonomy, and configuration.
//! All other Portage crates depend on this one.

pub mod config;
pub mod error;
pub mod wire;

pub use error::XferError;
pub use wire::{PacketNumber, XferId, XFER_ID_NONE};
