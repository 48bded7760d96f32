//! Client fingerprinting and invocation ids
//!
//! Clients are accounted for by a salted hash of their address, never the
//! address itself. The salt lives for one process: fingerprints cannot be
//! correlated across restarts.

use sha2::{Digest, Sha256};

const SALT_SIZE: usize = 32;
const INVOCATION_ID_SIZE: usize = 16;

/// Process-wide fingerprinting salt, generated once at startup.
pub struct IpSalt([u8; SALT_SIZE]);

impl IpSalt {
    /// Draw a fresh salt. Call once; share the result.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Hex sha256 over salt then address.
    #[must_use]
    pub fn fingerprint(&self, address: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(address.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A fresh, unguessable invocation id (hex of 16 random bytes).
#[must_use]
pub fn invocation_id() -> String {
    hex::encode(rand::random::<[u8; INVOCATION_ID_SIZE]>())
}

/// Directory name for an invocation's sandbox paths.
///
/// The id itself is handed to the backend; only its hash appears on the
/// filesystem, so knowing a path does not reveal the id.
#[must_use]
pub fn sandbox_dir_name(invocation_id: &str) -> String {
    hex::encode(Sha256::digest(invocation_id.as_bytes()))
}
