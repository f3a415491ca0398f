//! Shared key authentication for brokers
//!
//! The controller keeps only the SHA-256 digest of `cluster.authKey`.
//! Presented tokens are hashed and compared digest to digest.

use hex::encode;
use sha2::{Digest, Sha256};

/// Hex encoded SHA-256 of `token`
#[must_use]
pub fn digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    encode(hasher.finalize())
}

#[derive(Clone, PartialEq, Eq)]
pub struct ClusterKey {
    digest: String,
}

impl std::fmt::Debug for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterKey").finish_non_exhaustive()
    }
}

impl ClusterKey {
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self {
            digest: digest(key),
        }
    }

    /// The configured key, if any.
    #[must_use]
    pub fn from_config(key: Option<&str>) -> Option<Self> {
        key.filter(|key| !key.is_empty()).map(Self::new)
    }

    #[must_use]
    pub fn verify(&self, token: &str) -> bool {
        let presented = digest(token);
        presented
            .bytes()
            .zip(self.digest.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
            && presented.len() == self.digest.len()
    }
}

/// Fresh, unguessable session identifier
#[must_use]
pub fn new_session() -> String {
    digest(&format!("{}:{}", ulid::Ulid::new(), ulid::Ulid::new()))
}
