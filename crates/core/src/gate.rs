//! Online-gate contracts.
//!
//! The authorization service that issues short-lived tickets is external. The
//! client embeds a ticket from a [`TicketSource`] in its Hello; the host checks
//! it with a [`TicketValidator`] when the gate is required.

use std::time::Duration;

/// Outcome of validating a peer ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    /// Ticket accepted.
    Allowed,
    /// Ticket rejected, with a reason suitable for showing to the peer.
    Denied(String),
}

impl GateVerdict {
    /// Whether the ticket was accepted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateVerdict::Allowed)
    }
}

/// Validates tickets presented by joining peers.
pub trait TicketValidator: Send + Sync {
    /// Validate `ticket`, giving up after `timeout`. A timeout must be reported
    /// as [`GateVerdict::Denied`].
    fn validate_peer_ticket(&self, ticket: &str, timeout: Duration) -> GateVerdict;
}

/// Supplies the ticket a client presents in its Hello.
pub trait TicketSource: Send + Sync {
    /// Current ticket, or an empty string when none is available.
    fn issue_ticket(&self) -> String;
}
