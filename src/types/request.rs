//! Execution requests.

use std::fmt;
use std::time::Duration;

use sha2::{Digest, Sha256};

/// Timeout applied when the caller does not supply one (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// A snippet of source text and the time budget it may run for.
///
/// Immutable once built; the supervisor only ever borrows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRequest {
    code: String,
    timeout_secs: u64,
}

impl ExecutionRequest {
    /// Create a request with an explicit timeout in seconds
    #[must_use]
    pub fn new(code: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            code: code.into(),
            timeout_secs,
        }
    }

    /// The snippet source
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Time budget in whole seconds, as supplied by the caller
    #[must_use]
    pub const fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// Time budget as a [`Duration`]
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// A zero budget expires before anything can run
    #[must_use]
    pub const fn has_budget(&self) -> bool {
        self.timeout_secs > 0
    }

    /// Digest of the snippet, used to correlate log lines without logging source
    #[must_use]
    pub fn digest(&self) -> CodeDigest {
        CodeDigest::of(&self.code)
    }
}

/// SHA-256 digest of a snippet
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeDigest([u8; 32]);

impl CodeDigest {
    /// Number of hex characters shown in logs
    const SHORT_LEN: usize = 12;

    /// Hash the given source
    #[must_use]
    pub fn of(code: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(code.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Full hex encoding
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated hex encoding for log lines
    #[must_use]
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(Self::SHORT_LEN);
        hex
    }
}

impl fmt::Debug for CodeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeDigest({})", self.short())
    }
}

impl fmt::Display for CodeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}
