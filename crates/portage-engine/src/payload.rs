//! Payload sources and sinks — what a transfer reads from or writes into.
//!
//! A transfer is polymorphic over its payload: an in-memory buffer, a
//! local file, or a content-store entry. All three move data strictly
//! sequentially; the engine never seeks. Failures surface as [`XferError`]
//! and put the owning transfer on the abort path — payload code never
//! panics on I/O.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};

use portage_core::XferError;

use crate::store::{store_key, ContentStore};

/// One-shot completion callback. Memory sinks deliver the received bytes;
/// file and store sinks deliver empty bytes (the data is already at its
/// destination).
pub type CompleteFn = Box<dyn FnOnce(Result<Bytes, XferError>)>;

/// Sequential payload access. One object serves one transfer in one
/// direction; the unused direction's methods are simply never called.
pub trait Payload {
    /// Stable description for logs and duplicate-request matching.
    fn describe(&self) -> String;

    /// Open for sending. Returns the total payload length.
    /// Reopening resets the read position to the start.
    fn open_send(&mut self) -> Result<u64, XferError>;

    /// Read the next stretch of payload into `buf`. Returns bytes read;
    /// 0 means the payload is exhausted.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, XferError>;

    /// Receive side: the total size announced by the first chunk.
    fn set_expected_size(&mut self, total: u64) -> Result<(), XferError>;

    /// Append one received chunk.
    fn write_chunk(&mut self, data: &[u8]) -> Result<(), XferError>;

    /// Receive side: commit the completed payload to its destination.
    fn finalize(&mut self) -> Result<(), XferError>;

    /// Drop partial state after an abort.
    fn discard(&mut self);

    /// Hand over accumulated bytes (memory sinks only).
    fn take_bytes(&mut self) -> Bytes {
        Bytes::new()
    }
}

fn other_io(err: anyhow::Error) -> XferError {
    XferError::Io(std::io::Error::new(ErrorKind::Other, err.to_string()))
}

// ── Memory ────────────────────────────────────────────────────────────────────

/// In-memory payload: a pre-registered send buffer or an accumulating
/// receive buffer handed to the callback on completion.
pub struct MemoryPayload {
    source: Bytes,
    read_pos: usize,
    received: BytesMut,
}

impl MemoryPayload {
    pub fn for_send(data: Bytes) -> Self {
        Self {
            source: data,
            read_pos: 0,
            received: BytesMut::new(),
        }
    }

    pub fn for_receive() -> Self {
        Self::for_send(Bytes::new())
    }
}

impl Payload for MemoryPayload {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn open_send(&mut self) -> Result<u64, XferError> {
        self.read_pos = 0;
        Ok(self.source.len() as u64)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, XferError> {
        let n = buf.len().min(self.source.len() - self.read_pos);
        buf[..n].copy_from_slice(&self.source[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        Ok(n)
    }

    fn set_expected_size(&mut self, total: u64) -> Result<(), XferError> {
        // Capacity hint only, clamped so a hostile announcement cannot
        // force a huge allocation up front. Growth follows actual data.
        self.received.reserve((total as usize).min(1 << 20));
        Ok(())
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<(), XferError> {
        self.received.extend_from_slice(data);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), XferError> {
        Ok(())
    }

    fn discard(&mut self) {
        self.received.clear();
    }

    fn take_bytes(&mut self) -> Bytes {
        self.received.split().freeze()
    }
}

// ── File ──────────────────────────────────────────────────────────────────────

/// Local-file payload. Receives stage into a `.part` neighbor and rename
/// into place on finalize, so a crashed transfer never leaves a
/// half-written file under the final name.
pub struct FilePayload {
    path: PathBuf,
    reader: Option<fs::File>,
    writer: Option<fs::File>,
}

impl FilePayload {
    pub fn send(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            writer: None,
        }
    }

    pub fn receive(path: impl Into<PathBuf>) -> Self {
        Self::send(path)
    }

    fn staging_path(&self) -> PathBuf {
        staging_neighbor(&self.path)
    }
}

impl Payload for FilePayload {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn open_send(&mut self) -> Result<u64, XferError> {
        let file = fs::File::open(&self.path).map_err(|_| XferError::FileCannotOpen)?;
        let len = file
            .metadata()
            .map_err(|_| XferError::FileCannotOpen)?
            .len();
        self.reader = Some(file);
        Ok(len)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, XferError> {
        let file = self.reader.as_mut().ok_or(XferError::FileCannotOpen)?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn set_expected_size(&mut self, _total: u64) -> Result<(), XferError> {
        Ok(())
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<(), XferError> {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => {
                let staging = self.staging_path();
                let file = fs::File::create(&staging).map_err(|_| XferError::FileCannotOpen)?;
                self.writer.insert(file)
            }
        };
        writer.write_all(data)?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), XferError> {
        match self.writer.take() {
            Some(file) => {
                file.sync_all()?;
                drop(file);
                fs::rename(self.staging_path(), &self.path)?;
            }
            // Zero-byte transfer with no write call: land an empty file.
            None => fs::write(&self.path, []).map_err(|_| XferError::FileCannotOpen)?,
        }
        Ok(())
    }

    fn discard(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(self.staging_path());
        }
        self.reader = None;
    }
}

/// Shared helper for callers staging downloads next to a final path.
pub fn staging_neighbor(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

// ── Content store ─────────────────────────────────────────────────────────────

/// Content-store payload. Sends stream an existing entry; receives stage
/// in memory and are verified against the announced key before insertion.
pub struct StorePayload {
    store: ContentStore,
    key: [u8; 32],
    source: Bytes,
    read_pos: usize,
    staged: BytesMut,
}

impl StorePayload {
    pub fn send(store: ContentStore, key: [u8; 32]) -> Self {
        Self {
            store,
            key,
            source: Bytes::new(),
            read_pos: 0,
            staged: BytesMut::new(),
        }
    }

    pub fn receive(store: ContentStore, key: [u8; 32]) -> Self {
        Self::send(store, key)
    }
}

impl Payload for StorePayload {
    fn describe(&self) -> String {
        format!("store:{}", hex::encode(self.key))
    }

    fn open_send(&mut self) -> Result<u64, XferError> {
        match self.store.get(&self.key) {
            Ok(Some(data)) => {
                self.source = data;
                self.read_pos = 0;
                Ok(self.source.len() as u64)
            }
            Ok(None) => Err(XferError::FileNotFound),
            Err(e) => Err(other_io(e)),
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, XferError> {
        let n = buf.len().min(self.source.len() - self.read_pos);
        buf[..n].copy_from_slice(&self.source[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        Ok(n)
    }

    fn set_expected_size(&mut self, total: u64) -> Result<(), XferError> {
        self.staged.reserve((total as usize).min(1 << 20));
        Ok(())
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<(), XferError> {
        self.staged.extend_from_slice(data);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), XferError> {
        if store_key(&self.staged) != self.key {
            return Err(XferError::IntegrityMismatch);
        }
        self.store.put(&self.key, &self.staged).map_err(other_io)
    }

    fn discard(&mut self) {
        self.staged.clear();
    }
}
