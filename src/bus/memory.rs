//! In-process publish/subscribe broker
//!
//! A shared medium through which any number of buses in one process can
//! exchange messages, in the manner of a broker connection but with no
//! network underneath. Used by integration tests and demos; delivery is
//! synchronous and reaches every subscriber of a topic, the publisher's
//! own endpoint included (the bus filters its own traffic by replica id).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::lock;
use super::transport::{MessageHandler, Transport, TransportError};

struct Subscription {
    endpoint: Uuid,
    handler: MessageHandler,
}

/// The shared medium. Create one per simulated network, then one
/// endpoint per bus.
#[derive(Default)]
pub struct MemoryBroker {
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a new endpoint on this broker.
    pub fn create_endpoint(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            broker: Arc::clone(self),
            endpoint: Uuid::new_v4(),
        }
    }

    fn deliver(&self, topic: &str, payload: &[u8]) {
        // Snapshot the handlers before invoking any of them: a handler may
        // re-publish (gossip re-broadcast), which re-enters this broker.
        let handlers: Vec<MessageHandler> = lock(&self.subscriptions)
            .get(topic)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(payload);
        }
    }
}

/// One bus's connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    endpoint: Uuid,
}

impl Transport for MemoryTransport {
    fn advertise(&self, _topic: &str) -> Result<(), TransportError> {
        // The in-process broker needs no advertisement.
        Ok(())
    }

    fn unadvertise(&self, _topic: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError> {
        lock(&self.broker.subscriptions)
            .entry(topic.to_string())
            .or_default()
            .push(Subscription {
                endpoint: self.endpoint,
                handler,
            });
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut subs = lock(&self.broker.subscriptions);
        match subs.get_mut(topic) {
            Some(entries) => {
                entries.retain(|s| s.endpoint != self.endpoint);
                Ok(())
            }
            None => Err(TransportError::NotSubscribed(topic.to_string())),
        }
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.broker.deliver(topic, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_handler() -> (MessageHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let handler: MessageHandler = Arc::new(move |payload: &[u8]| {
            sink.lock().unwrap().push(payload.to_vec());
        });
        (handler, received)
    }

    #[test]
    fn test_publish_reaches_topic_subscribers_only() {
        let broker = MemoryBroker::new();
        let alice = broker.create_endpoint();
        let bob = broker.create_endpoint();

        let (on_wall, wall_messages) = recording_handler();
        let (on_door, door_messages) = recording_handler();
        alice.subscribe("ifc/IfcWall", on_wall).unwrap();
        alice.subscribe("ifc/IfcDoor", on_door).unwrap();

        bob.publish("ifc/IfcWall", b"wall update").unwrap();

        assert_eq!(wall_messages.lock().unwrap().as_slice(), &[b"wall update".to_vec()]);
        assert!(door_messages.lock().unwrap().is_empty());
    }

    #[test]
    fn test_publisher_also_receives_its_own_messages() {
        let broker = MemoryBroker::new();
        let endpoint = broker.create_endpoint();
        let (handler, received) = recording_handler();
        endpoint.subscribe("ifc/IfcWall", handler).unwrap();

        endpoint.publish("ifc/IfcWall", b"self").unwrap();
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        let alice = broker.create_endpoint();
        let bob = broker.create_endpoint();

        let (handler, received) = recording_handler();
        alice.subscribe("ifc/IfcWall", handler).unwrap();
        alice.unsubscribe("ifc/IfcWall").unwrap();

        bob.publish("ifc/IfcWall", b"late").unwrap();
        assert!(received.lock().unwrap().is_empty());

        assert!(matches!(
            alice.unsubscribe("ifc/Unknown"),
            Err(TransportError::NotSubscribed(_))
        ));
    }

    #[test]
    fn test_handlers_may_republish_without_deadlock() {
        let broker = MemoryBroker::new();
        let alice = broker.create_endpoint();
        let bob = broker.create_endpoint();

        let (sink_handler, received) = recording_handler();
        bob.subscribe("ifc/IfcDoor", sink_handler).unwrap();

        let rebroadcaster = broker.create_endpoint();
        let forward: MessageHandler = Arc::new(move |payload: &[u8]| {
            rebroadcaster.publish("ifc/IfcDoor", payload).unwrap();
        });
        alice.subscribe("ifc/IfcWall", forward).unwrap();

        alice.publish("ifc/IfcWall", b"hop").unwrap();
        assert_eq!(received.lock().unwrap().as_slice(), &[b"hop".to_vec()]);
    }
}
