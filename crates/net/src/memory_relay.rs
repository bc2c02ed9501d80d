//! In-process relay backend.
//!
//! A [`MemoryRelay`] hub routes packets between endpoints by identity. The
//! first packet between two endpoints raises a connection request on the
//! receiver; closing a connection notifies the remote side after every packet
//! already sent has been queued. Notifications run synchronously on the
//! sending thread.

use crate::protocol::{Reliability, MAX_PACKET_SIZE};
use crate::relay::{RelayBackend, RelayError, RelayNotify, RelayPacket};
use crate::transport::lock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use voxlink_core::PeerId;

#[derive(Default)]
struct Mailbox {
    inbox: Mutex<VecDeque<RelayPacket>>,
    links: Mutex<HashSet<PeerId>>,
    notify: Mutex<Option<Weak<dyn RelayNotify>>>,
}

impl Mailbox {
    fn notifier(&self) -> Option<Arc<dyn RelayNotify>> {
        lock(&self.notify).as_ref().and_then(Weak::upgrade)
    }
}

/// Hub connecting in-process relay endpoints.
#[derive(Clone)]
pub struct MemoryRelay {
    mailboxes: Arc<Mutex<HashMap<PeerId, Arc<Mailbox>>>>,
    max_packet_size: usize,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    /// Hub with the default relay packet limit.
    pub fn new() -> Self {
        Self::with_max_packet_size(MAX_PACKET_SIZE)
    }

    /// Hub with a custom packet limit.
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            max_packet_size,
        }
    }

    /// Register (or re-register) an endpoint under `id`.
    pub fn endpoint(&self, id: impl Into<PeerId>) -> Arc<MemoryRelayEndpoint> {
        let id = id.into();
        let mailbox = Arc::new(Mailbox::default());
        lock(&self.mailboxes).insert(id.clone(), mailbox.clone());
        Arc::new(MemoryRelayEndpoint {
            id,
            mailbox,
            hub: self.clone(),
        })
    }

    fn mailbox(&self, id: &PeerId) -> Option<Arc<Mailbox>> {
        lock(&self.mailboxes).get(id).cloned()
    }
}

/// One endpoint of a [`MemoryRelay`].
pub struct MemoryRelayEndpoint {
    id: PeerId,
    mailbox: Arc<Mailbox>,
    hub: MemoryRelay,
}

impl MemoryRelayEndpoint {
    /// Number of packets waiting in this endpoint's inbox.
    pub fn pending_packets(&self) -> usize {
        lock(&self.mailbox.inbox).len()
    }
}

impl RelayBackend for MemoryRelayEndpoint {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    fn max_packet_size(&self) -> usize {
        self.hub.max_packet_size
    }

    fn set_notify(&self, notify: Weak<dyn RelayNotify>) {
        *lock(&self.mailbox.notify) = Some(notify);
    }

    fn accept_connection(&self, remote: &PeerId) -> Result<(), RelayError> {
        lock(&self.mailbox.links).insert(remote.clone());
        Ok(())
    }

    fn close_connection(&self, remote: &PeerId) -> Result<(), RelayError> {
        lock(&self.mailbox.links).remove(remote);
        let Some(target) = self.hub.mailbox(remote) else {
            return Ok(());
        };
        let was_linked = lock(&target.links).remove(&self.id);
        if was_linked {
            if let Some(notify) = target.notifier() {
                notify.connection_closed(&self.id, "connection closed by remote peer");
            }
        }
        Ok(())
    }

    fn send_packet(
        &self,
        remote: &PeerId,
        channel: u8,
        _reliability: Reliability,
        data: &[u8],
    ) -> Result<(), RelayError> {
        if data.len() > self.hub.max_packet_size {
            return Err(RelayError::PacketTooLarge {
                len: data.len(),
                max: self.hub.max_packet_size,
            });
        }
        let target = self
            .hub
            .mailbox(remote)
            .ok_or_else(|| RelayError::Unreachable(remote.clone()))?;

        let opened = lock(&self.mailbox.links).insert(remote.clone());
        let known = lock(&target.links).contains(&self.id);
        if opened && !known {
            if let Some(notify) = target.notifier() {
                notify.connection_requested(&self.id);
            }
        }

        lock(&target.inbox).push_back(RelayPacket {
            from: self.id.clone(),
            channel,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn receive_packet(&self) -> Option<RelayPacket> {
        lock(&self.mailbox.inbox).pop_front()
    }
}
