//! Ordered event notifications to the host application.
//!
//! Single producer (the messenger's serial executor), many consumers.
//! Backed by a broadcast ring: emission is totally ordered within one
//! messenger and never blocks on a slow consumer — laggards observe a
//! `Lagged` error and miss events rather than stalling the protocol.

use tokio::sync::broadcast;

use cypher_crypto::identity::Username;
use cypher_proto::DeviceAddress;

use crate::router::ConversationKey;

#[derive(Debug, Clone)]
pub enum MessengerEvent {
    MessageCreated {
        conversation: ConversationKey,
        sender: DeviceAddress,
        remote_id: String,
    },
    MessageChanged {
        conversation: ConversationKey,
        remote_id: String,
    },
    MessageRemoved {
        conversation: ConversationKey,
        remote_id: String,
    },
    ContactCreated {
        user: Username,
    },
    ContactUpdated {
        user: Username,
    },
    ContactRemoved {
        user: Username,
    },
    ConversationCreated {
        conversation: ConversationKey,
    },
    ConversationUpdated {
        conversation: ConversationKey,
    },
    DeviceRegistered {
        address: DeviceAddress,
    },
    /// An envelope arrived from a device absent from its user's validated
    /// config even after a refresh.
    DeviceRegistrationRequested {
        address: DeviceAddress,
    },
    /// Advisory: the session with this device should be re-established.
    Rekey {
        address: DeviceAddress,
    },
    /// A peer's master signing key changed — re-verification required.
    ContactIdentityChanged {
        user: Username,
    },
    /// A device exhausted its send retries and is excluded from fan-out.
    DeviceQuarantined {
        address: DeviceAddress,
    },
    P2pOpen {
        address: DeviceAddress,
    },
    P2pClose {
        address: DeviceAddress,
    },
}

/// Cheap-to-clone handle; all clones feed the same ordered stream.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MessengerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. A bus with no subscribers is fine — the event is
    /// simply dropped.
    pub fn emit(&self, event: MessengerEvent) {
        tracing::trace!(target: "cypher_core", event = ?event, "event emitted");
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_preserves_emission_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(MessengerEvent::ContactCreated { user: Username::new("a") });
        bus.emit(MessengerEvent::ContactRemoved { user: Username::new("a") });

        assert!(matches!(rx.recv().await.unwrap(), MessengerEvent::ContactCreated { .. }));
        assert!(matches!(rx.recv().await.unwrap(), MessengerEvent::ContactRemoved { .. }));
    }

    #[tokio::test]
    async fn emission_never_blocks_without_subscribers() {
        let bus = EventBus::new(2);
        for _ in 0..10 {
            bus.emit(MessengerEvent::ContactCreated { user: Username::new("x") });
        }
    }
}
