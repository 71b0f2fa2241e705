//! Filesystem path validation for transfer targets.
//!
//! A peer can name a local file to send, and local code can name a file
//! sink for a download. Both paths pass through here: either the exact
//! name was pre-registered via [`PathGuard::expect`], or it matches the
//! restrictive well-known cache-name pattern. Everything else is refused.
//! This is the only defense against a peer steering the process to read
//! or write arbitrary paths.

/// Registered expectations for upcoming transfer paths.
///
/// Multiset semantics: each `expect` call authorizes exactly one matching
/// transfer.
#[derive(Debug, Default)]
pub struct PathGuard {
    expected: Vec<String>,
}

impl PathGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorize one upcoming transfer for exactly this name.
    pub fn expect(&mut self, name: impl Into<String>) {
        self.expected.push(name.into());
    }

    /// Whether an expectation for this name is outstanding.
    pub fn contains(&self, name: &str) -> bool {
        self.expected.iter().any(|n| n == name)
    }

    /// Consume one matching expectation, if any.
    pub fn take_expected(&mut self, name: &str) -> bool {
        if let Some(pos) = self.expected.iter().position(|n| n == name) {
            self.expected.swap_remove(pos);
            return true;
        }
        false
    }

    /// Number of outstanding expectations.
    pub fn pending(&self) -> usize {
        self.expected.len()
    }
}

/// Whether `name` fits the cache-file naming scheme: 5–50 characters,
/// alphanumeric/`_`/`-` body, literal `.tmp` suffix, no path separators.
///
/// Anything accepted here can be read or written under the cache
/// directory by a remote request. Do not broaden this pattern.
pub fn is_cache_name(name: &str) -> bool {
    let len = name.len();
    if !(5..=50).contains(&len) {
        return false;
    }
    let bytes = name.as_bytes();
    let body = &bytes[..len - 4];
    if !body
        .iter()
        .all(|&c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-')
    {
        return false;
    }
    &bytes[len - 4..] == b".tmp"
}
