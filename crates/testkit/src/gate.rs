//! Fixed-answer online gate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use voxlink_core::{GateVerdict, TicketSource, TicketValidator};

/// Validator that accepts a fixed set of tickets.
#[derive(Debug, Default)]
pub struct StaticGate {
    accepted: HashSet<String>,
    calls: AtomicUsize,
}

impl StaticGate {
    /// Gate accepting exactly `tickets`.
    pub fn new<I, S>(tickets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accepted: tickets.into_iter().map(Into::into).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of validations performed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TicketValidator for StaticGate {
    fn validate_peer_ticket(&self, ticket: &str, _timeout: Duration) -> GateVerdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.accepted.contains(ticket) {
            GateVerdict::Allowed
        } else if ticket.is_empty() {
            GateVerdict::Denied("missing online ticket".to_string())
        } else {
            GateVerdict::Denied("online ticket rejected".to_string())
        }
    }
}

/// Ticket source that always hands out the same ticket.
#[derive(Debug, Clone, Default)]
pub struct FixedTicket(pub String);

impl TicketSource for FixedTicket {
    fn issue_ticket(&self) -> String {
        self.0.clone()
    }
}
