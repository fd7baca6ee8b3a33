//! Rolling fingerprints for the commands of one task.
//!
//! Each command's fingerprint is the SHA-256 over the concatenation
//! of its own shell string and every preceding shell string in the
//! same task. Editing any command therefore changes the fingerprints
//! of that command and everything after it, which is what lets the
//! cache invalidate exactly the stale tail of a task.

use sha2::{Digest, Sha256};

/// Fingerprints are 64 lowercase hex characters.
pub const FINGERPRINT_LEN: usize = 64;

/// Streaming hasher over one task's command sequence. One chain per
/// task; never shared.
#[derive(Default)]
pub struct ChecksumChain {
    hasher: Sha256,
}

impl ChecksumChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one command's shell string and return the fingerprint of
    /// the sequence so far. The internal state keeps accumulating, so
    /// later commands chain onto this one.
    pub fn push(&mut self, shell: &str) -> String {
        self.hasher.update(shell.as_bytes());
        format!("{:x}", self.hasher.clone().finalize())
    }
}

/// True if `fingerprint` has the shape the cache layer accepts.
pub fn valid_fingerprint(fingerprint: &str) -> bool {
    fingerprint.len() == FINGERPRINT_LEN
        && fingerprint.bytes().all(|b| b.is_ascii_hexdigit())
}
