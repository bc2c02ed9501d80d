//! Host session configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use voxlink_core::PeerId;

/// Settings for a [`crate::HostSession`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    /// Display name of the hosting player (player 0 in the player list).
    pub host_name: String,
    /// Hold unknown peers for manual approval. When `false`, peers that pass
    /// the gate are admitted on their first Hello.
    pub require_approval: bool,
    /// Validate Hello tickets with the online gate.
    pub gate_required: bool,
    /// Upper bound for one ticket validation, in milliseconds.
    pub gate_timeout_ms: u64,
    /// Peer identities admitted without manual approval.
    pub pre_approved: Vec<PeerId>,
    /// Transport events handled per poll.
    pub max_events_per_poll: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_name: "Host".to_string(),
            require_approval: true,
            gate_required: false,
            gate_timeout_ms: 5_000,
            pre_approved: Vec::new(),
            max_events_per_poll: 256,
        }
    }
}

impl HostConfig {
    /// Ticket validation timeout.
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_timeout_ms)
    }
}
