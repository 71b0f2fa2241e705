//! Error taxonomy for transfer completion.
//!
//! Every transfer resolves locally: failures become a terminal abort whose
//! error reaches the owner exactly once through the completion callback.
//! Nothing in the engine panics or propagates across the registry boundary.
//!
//! Each variant maps to a stable i32 wire code carried in abort messages,
//! so both sides of a transfer agree on why it died.

/// Why a transfer ended without completing.
#[derive(Debug, thiserror::Error)]
pub enum XferError {
    /// The local destination could not be opened. Fatal, never retried.
    #[error("destination could not be opened")]
    FileCannotOpen,

    /// The requested file, buffer, or store entry is unknown to the sender.
    #[error("requested entry not found")]
    FileNotFound,

    /// No forward progress within the configured window, retries exhausted.
    #[error("transfer timed out")]
    Timeout,

    /// The connection to the remote host died mid-transfer. No retry.
    #[error("connection to remote host lost")]
    ConnectionLost,

    /// The peer sent an explicit abort with the given wire code.
    #[error("peer aborted transfer (code {0})")]
    PeerAborted(i32),

    /// The named path failed validation. Fatal; logged with the path.
    #[error("target path failed validation")]
    SecurityRejected,

    /// Received store content did not hash to its announced key.
    #[error("received content does not match its announced key")]
    IntegrityMismatch,

    /// Payload I/O failed mid-transfer. Fatal.
    #[error("payload i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

// ── Wire result codes ─────────────────────────────────────────────────────────

pub const CODE_OK: i32 = 0;
pub const CODE_CANNOT_OPEN: i32 = -1;
pub const CODE_NOT_FOUND: i32 = -2;
pub const CODE_TIMEOUT: i32 = -3;
pub const CODE_CONNECTION_LOST: i32 = -4;
pub const CODE_PEER_ABORTED: i32 = -5;
pub const CODE_SECURITY: i32 = -6;
pub const CODE_INTEGRITY: i32 = -7;

impl XferError {
    /// The stable code carried in abort messages for this error.
    pub fn wire_code(&self) -> i32 {
        match self {
            XferError::FileCannotOpen => CODE_CANNOT_OPEN,
            XferError::FileNotFound => CODE_NOT_FOUND,
            XferError::Timeout => CODE_TIMEOUT,
            XferError::ConnectionLost => CODE_CONNECTION_LOST,
            XferError::PeerAborted(code) => *code,
            XferError::SecurityRejected => CODE_SECURITY,
            XferError::IntegrityMismatch => CODE_INTEGRITY,
            // I/O details stay local; the peer only learns the open failed.
            XferError::Io(_) => CODE_CANNOT_OPEN,
        }
    }

    /// Interpret a code received in a peer's abort message.
    pub fn from_wire_code(code: i32) -> XferError {
        match code {
            CODE_CANNOT_OPEN => XferError::FileCannotOpen,
            CODE_NOT_FOUND => XferError::FileNotFound,
            CODE_TIMEOUT => XferError::Timeout,
            CODE_CONNECTION_LOST => XferError::ConnectionLost,
            CODE_SECURITY => XferError::SecurityRejected,
            CODE_INTEGRITY => XferError::IntegrityMismatch,
            other => XferError::PeerAborted(other),
        }
    }
}
