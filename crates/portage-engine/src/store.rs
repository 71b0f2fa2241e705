//! Content-addressed store backing store-entry transfers.
//!
//! Entries are keyed by the BLAKE3 hash of their content in a two-level
//! directory layout: `root/{hex[0..2]}/{full_hex}`. Entries are immutable;
//! if the key exists, the content is correct. No TTLs, no eviction.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;

/// Hash `data` into a store key.
pub fn store_key(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Content-addressed entry store.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store root: {}", root.display()))?;
        Ok(Self { root })
    }

    /// Check whether an entry exists.
    pub fn has(&self, key: &[u8; 32]) -> bool {
        self.entry_path(key).exists()
    }

    /// Read an entry. Returns None if absent.
    pub fn get(&self, key: &[u8; 32]) -> Result<Option<Bytes>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)
            .with_context(|| format!("failed to read store entry: {}", path.display()))?;
        Ok(Some(Bytes::from(data)))
    }

    /// Insert an entry. Atomic (temp file + rename) and idempotent: if the
    /// key already exists this is a no-op.
    pub fn put(&self, key: &[u8; 32], data: &[u8]) -> Result<()> {
        let path = self.entry_path(key);
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store dir: {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("part");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp entry: {}", tmp_path.display()))?;
            file.write_all(data).context("failed to write store entry")?;
            file.sync_all().context("failed to sync store entry")?;
        }
        fs::rename(&tmp_path, &path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        tracing::trace!(key = hex::encode(key), "store entry written");
        Ok(())
    }

    /// Number of entries, for tests and status logs.
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir.count();
                }
            }
        }
        total
    }

    fn entry_path(&self, key: &[u8; 32]) -> PathBuf {
        let hex = hex::encode(key);
        self.root.join(&hex[0..2]).join(&hex)
    }
}
