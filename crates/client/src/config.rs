//! Client session configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for a [`crate::ClientSession`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Delay between Hello resends during the handshake, in milliseconds.
    pub hello_interval_ms: u64,
    /// Delay between pumps while waiting for the host, in milliseconds.
    pub poll_interval_ms: u64,
    /// Transport events handled per poll.
    pub max_events_per_poll: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hello_interval_ms: 1_250,
            poll_interval_ms: 50,
            max_events_per_poll: 256,
        }
    }
}

impl ClientConfig {
    /// Hello resend interval.
    pub fn hello_interval(&self) -> Duration {
        Duration::from_millis(self.hello_interval_ms.max(1))
    }

    /// Handshake pump interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
