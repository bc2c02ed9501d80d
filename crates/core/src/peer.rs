//! Peer identifiers.
//!
//! A peer identity is supplied by the transport layer (a socket address for
//! the local adapter, a product user id for the relay adapter). It is never
//! authenticated here; it only keys per-peer state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier carries no characters after trimming.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn peer_ids_compare_by_string() {
        let a = PeerId::from("0002aabb");
        let b = PeerId::new(String::from("0002aabb"));
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn blank_detection_trims() {
        assert!(PeerId::from("   ").is_blank());
        assert!(PeerId::from("").is_blank());
        assert!(!PeerId::from("127.0.0.1:25565").is_blank());
    }
}
