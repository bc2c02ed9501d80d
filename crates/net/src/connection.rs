//! Typed message sending over a [`PeerTransport`].
//!
//! Both session engines go through [`MessageLink`] so that encoding and the
//! choice of delivery tier live in one place.

use crate::codec::{encode_message, EncodeError};
use crate::protocol::Message;
use crate::transport::{PeerTransport, TransportError, TransportEvent};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use voxlink_core::PeerId;

/// Failure to deliver a typed message.
#[derive(Debug, Error)]
pub enum SendError {
    /// The message could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// The transport refused the frame.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Message-level handle on a shared transport.
#[derive(Clone)]
pub struct MessageLink {
    transport: Arc<dyn PeerTransport>,
}

impl MessageLink {
    /// Wrap a transport.
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Encode `msg` and send it on the tier its type requires.
    pub fn send(&self, peer: &PeerId, msg: &Message) -> Result<(), SendError> {
        let frame = encode_message(msg)?;
        self.transport.send(peer, &frame, msg.reliability())?;
        Ok(())
    }

    /// Encode `msg` once and send it to every peer in `peers`.
    ///
    /// A failure for one peer is logged and does not stop delivery to the
    /// rest. Returns the number of peers the frame was queued for.
    pub fn broadcast<'a, I>(&self, peers: I, msg: &Message) -> Result<usize, EncodeError>
    where
        I: IntoIterator<Item = &'a PeerId>,
    {
        let frame = encode_message(msg)?;
        let reliability = msg.reliability();
        let mut delivered = 0;
        for peer in peers {
            match self.transport.send(peer, &frame, reliability) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(%peer, kind = ?msg.message_type(), "Broadcast send failed: {}", e),
            }
        }
        debug!(kind = ?msg.message_type(), delivered, "Broadcast message");
        Ok(delivered)
    }

    /// Send `msg` and then close the connection to `peer`.
    pub fn send_and_close(
        &self,
        peer: &PeerId,
        msg: &Message,
        reason: &str,
    ) -> Result<(), SendError> {
        let sent = self.send(peer, msg);
        self.transport.close(peer, reason)?;
        sent
    }

    /// Drain at most `max_events` transport events.
    pub fn poll(&self, max_events: usize) -> Vec<TransportEvent> {
        self.transport.poll(max_events)
    }
}
