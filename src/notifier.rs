//! Change notifier.
//!
//! One registry of live subscribers, each reached through its own bounded
//! queue. Every subscriber declares a [`Transport`] that decides which
//! notifications it receives and how they are framed on the wire.
//!
//! Delivery is fire-and-forget: a full queue drops the notification for that
//! subscriber only, a closed queue unregisters it. Nothing here ever blocks a
//! publisher or reports failure back to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::ChangeEvent;

pub const RESPONSE_CREATED_EVENT: &str = "response:created";
pub const SOCKET_RESPONSE_EVENT: &str = "server:response";
pub const SOCKET_BROADCAST_EVENT: &str = "server:broadcast";

pub type SubscriberId = Uuid;

/// How a subscriber is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Server-sent events, one-way.
    EventStream,
    /// Bidirectional socket carrying JSON `{event, data}` frames.
    Socket,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A response was stored.
    ResponseCreated(ChangeEvent),
    /// A socket client broadcast a test message to its peers.
    Peer { from: SubscriberId, data: Value },
}

impl Notification {
    fn is_for(&self, id: SubscriberId, transport: Transport) -> bool {
        match self {
            Notification::ResponseCreated(_) => true,
            Notification::Peer { from, .. } => transport == Transport::Socket && *from != id,
        }
    }
}

/// Frame sent over a socket connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl SocketMessage {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

impl Notification {
    /// Socket framing of this notification.
    pub fn to_socket_message(&self) -> SocketMessage {
        match self {
            Notification::ResponseCreated(event) => SocketMessage::new(
                SOCKET_RESPONSE_EVENT,
                serde_json::to_value(event).unwrap_or(Value::Null),
            ),
            Notification::Peer { from, data } => SocketMessage::new(
                SOCKET_BROADCAST_EVENT,
                json!({ "from": from, "data": data }),
            ),
        }
    }

    /// Event-stream framing: event name and JSON payload. `None` for
    /// notifications the event stream does not carry.
    pub fn to_stream_payload(&self) -> Option<(&'static str, Value)> {
        match self {
            Notification::ResponseCreated(event) => Some((
                RESPONSE_CREATED_EVENT,
                json!({
                    "surveyId": event.survey_id,
                    "companyId": event.company_id,
                    "timestamp": event.timestamp,
                    "summary": { "submitted": 1 },
                }),
            )),
            Notification::Peer { .. } => None,
        }
    }
}

struct Subscriber {
    transport: Transport,
    sender: mpsc::Sender<Notification>,
}

/// Registry of live subscribers. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Notifier {
    subscribers: Arc<Mutex<HashMap<SubscriberId, Subscriber>>>,
    buffer: usize,
}

impl Notifier {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, Subscriber>> {
        // the map stays consistent even if a holder panicked
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber. It stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe(&self, transport: Transport) -> Subscription {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.buffer);
        let total = {
            let mut subscribers = self.lock();
            subscribers.insert(id, Subscriber { transport, sender });
            subscribers.len()
        };
        info!(subscriber = %id, ?transport, total, "subscriber connected");

        Subscription {
            id,
            receiver,
            notifier: self.clone(),
        }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            info!(subscriber = %id, "subscriber disconnected");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Fan a notification out to every interested subscriber.
    /// Returns how many subscribers it was queued for.
    pub fn broadcast(&self, notification: Notification) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        let mut subscribers = self.lock();
        for (id, subscriber) in subscribers.iter() {
            if !notification.is_for(*id, subscriber.transport) {
                continue;
            }
            match subscriber.sender.try_send(notification.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = %id, "subscriber queue full, notification dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            subscribers.remove(&id);
            debug!(subscriber = %id, "removed closed subscriber");
        }

        delivered
    }

    pub fn notify(&self, event: ChangeEvent) -> usize {
        self.broadcast(Notification::ResponseCreated(event))
    }
}

/// Handle for one registered subscriber. Dropping it unregisters.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Notification>,
    notifier: Notifier,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(survey: &str) -> ChangeEvent {
        ChangeEvent {
            survey_id: survey.to_string(),
            company_id: "c1".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_transport() {
        let notifier = Notifier::new(8);
        let mut stream = notifier.subscribe(Transport::EventStream);
        let mut socket = notifier.subscribe(Transport::Socket);

        assert_eq!(notifier.notify(event("s1")), 2);

        let got = stream.recv().await.unwrap();
        assert!(matches!(got, Notification::ResponseCreated(e) if e.survey_id == "s1"));
        assert!(matches!(socket.recv().await, Some(Notification::ResponseCreated(_))));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let notifier = Notifier::new(8);
        let sub = notifier.subscribe(Transport::EventStream);
        assert_eq!(notifier.subscriber_count(), 1);

        drop(sub);
        assert_eq!(notifier.subscriber_count(), 0);
        assert_eq!(notifier.notify(event("s1")), 0);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_affect_others() {
        let notifier = Notifier::new(1);
        let mut slow = notifier.subscribe(Transport::EventStream);
        let mut fast = notifier.subscribe(Transport::EventStream);

        assert_eq!(notifier.notify(event("s1")), 2);
        fast.recv().await.unwrap();

        // slow never drained its queue
        assert_eq!(notifier.notify(event("s2")), 1);
        let got = fast.recv().await.unwrap();
        assert!(matches!(got, Notification::ResponseCreated(e) if e.survey_id == "s2"));

        let first = slow.try_recv().unwrap();
        assert!(matches!(first, Notification::ResponseCreated(e) if e.survey_id == "s1"));
        assert!(slow.try_recv().is_none());
        assert_eq!(notifier.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_pruned() {
        let notifier = Notifier::new(4);
        let mut keep = notifier.subscribe(Transport::Socket);

        // simulate a connection whose receiving half went away without
        // its subscription being dropped yet
        let (sender, receiver) = mpsc::channel(4);
        drop(receiver);
        let ghost = Uuid::new_v4();
        notifier.lock().insert(
            ghost,
            Subscriber {
                transport: Transport::Socket,
                sender,
            },
        );
        assert_eq!(notifier.subscriber_count(), 2);

        assert_eq!(notifier.notify(event("s1")), 1);
        assert_eq!(notifier.subscriber_count(), 1);
        assert!(keep.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_peer_broadcast_skips_sender_and_event_streams() {
        let notifier = Notifier::new(4);
        let mut sender = notifier.subscribe(Transport::Socket);
        let mut peer = notifier.subscribe(Transport::Socket);
        let mut stream = notifier.subscribe(Transport::EventStream);

        let delivered = notifier.broadcast(Notification::Peer {
            from: sender.id(),
            data: json!({"hello": "world"}),
        });
        assert_eq!(delivered, 1);

        let got = peer.recv().await.unwrap();
        let frame = got.to_socket_message();
        assert_eq!(frame.event, SOCKET_BROADCAST_EVENT);
        assert_eq!(frame.data["data"], json!({"hello": "world"}));
        assert_eq!(frame.data["from"], json!(sender.id()));

        assert!(sender.try_recv().is_none());
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_stream_payload_shape() {
        let notification = Notification::ResponseCreated(event("s9"));
        let (name, payload) = notification.to_stream_payload().unwrap();

        assert_eq!(name, RESPONSE_CREATED_EVENT);
        assert_eq!(payload["surveyId"], "s9");
        assert_eq!(payload["companyId"], "c1");
        assert_eq!(payload["summary"]["submitted"], 1);
        assert!(payload["timestamp"].is_string());
    }

    #[test]
    fn test_socket_message_shape() {
        let frame = Notification::ResponseCreated(event("s9")).to_socket_message();
        let value: Value = serde_json::from_str(&frame.to_text()).unwrap();

        assert_eq!(value["event"], SOCKET_RESPONSE_EVENT);
        assert_eq!(value["data"]["surveyId"], "s9");
        assert_eq!(value["data"]["companyId"], "c1");
    }
}
