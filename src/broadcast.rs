//! Publish/subscribe fan-out for live status.
//!
//! The core never talks to browsers directly. It hands events to a
//! [`Broadcaster`], which is free to drop them: delivery is fire-and-forget
//! and nothing is published while nobody is subscribed.
//!
//! [`Hub`] is the bundled implementation. It fans messages out on a Tokio
//! broadcast channel and keeps a registry of subscribed users together
//! with the servers each one may watch.

use crate::server::ServerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Identifier of an account on the web layer.
pub type UserId = i64;

/// A page-level channel that several viewers listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Aggregate dashboard of every server.
    Dashboard,
    /// Detail view of one server.
    ServerDetail(ServerId),
    /// Public status page.
    Status,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Dashboard => write!(f, "/panel/dashboard"),
            Topic::ServerDetail(id) => write!(f, "/panel/server_detail?id={}", id),
            Topic::Status => write!(f, "/status"),
        }
    }
}

/// Recipient of a published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Audience {
    Topic(Topic),
    User(UserId),
}

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub audience: Audience,
    pub event: String,
    pub payload: Value,
}

/// A connected viewer and the servers it is allowed to watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub user_id: UserId,
    pub authorized_servers: Vec<ServerId>,
}

/// Publish/subscribe collaborator used by the supervisor, the output
/// parser and the realtime loop.
pub trait Broadcaster: Send + Sync {
    /// Number of currently connected viewers.
    fn subscriber_count(&self) -> usize;

    /// Connected viewers with their authorized servers.
    fn subscribers(&self) -> Vec<Subscriber>;

    /// Users allowed to see the given server.
    fn server_users(&self, server_id: ServerId) -> Vec<UserId>;

    /// Publishes an event to everyone watching a topic.
    fn publish_to_topic(&self, topic: Topic, event: &str, payload: Value);

    /// Publishes an event to a single user.
    fn publish_to_user(&self, user_id: UserId, event: &str, payload: Value);

    /// Publishes an event to every user allowed to see the server.
    fn publish_to_server_users(&self, server_id: ServerId, event: &str, payload: Value) {
        for user in self.server_users(server_id) {
            self.publish_to_user(user, event, payload.clone());
        }
    }
}

/// In-process broadcaster backed by a Tokio broadcast channel.
///
/// # Examples
///
/// ```
/// use game_runner::broadcast::{Broadcaster, Hub, Subscriber, Topic};
/// use serde_json::json;
///
/// let hub = Hub::new(16);
/// let mut rx = hub.register(Subscriber { user_id: 1, authorized_servers: vec![] });
/// hub.publish_to_topic(Topic::Dashboard, "update_host_stats", json!({"cpu_usage": 3.5}));
/// assert_eq!(rx.try_recv().unwrap().event, "update_host_stats");
/// ```
pub struct Hub {
    sender: broadcast::Sender<BroadcastMessage>,
    subscribers: Mutex<HashMap<UserId, Subscriber>>,
}

impl Hub {
    /// Creates a hub whose channel buffers `capacity` messages per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a viewer and returns its message stream.
    ///
    /// Registering an already known user replaces its authorizations.
    pub fn register(&self, subscriber: Subscriber) -> broadcast::Receiver<BroadcastMessage> {
        match self.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers.insert(subscriber.user_id, subscriber);
            }
            Err(_) => tracing::error!("Failed to lock subscriber registry"),
        }
        self.sender.subscribe()
    }

    /// Removes a viewer.
    pub fn unregister(&self, user_id: UserId) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&user_id);
        }
    }

    fn send(&self, message: BroadcastMessage) {
        if self.subscriber_count() == 0 {
            return;
        }
        // No receivers left is not an error for fire-and-forget delivery.
        if self.sender.send(message).is_err() {
            tracing::trace!("Broadcast dropped, no live receivers");
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Broadcaster for Hub {
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn subscribers(&self) -> Vec<Subscriber> {
        self.subscribers
            .lock()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    fn server_users(&self, server_id: ServerId) -> Vec<UserId> {
        self.subscribers
            .lock()
            .map(|s| {
                s.values()
                    .filter(|sub| sub.authorized_servers.contains(&server_id))
                    .map(|sub| sub.user_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn publish_to_topic(&self, topic: Topic, event: &str, payload: Value) {
        tracing::trace!(topic = %topic, event = %event, "Publishing to topic");
        self.send(BroadcastMessage {
            audience: Audience::Topic(topic),
            event: event.to_string(),
            payload,
        });
    }

    fn publish_to_user(&self, user_id: UserId, event: &str, payload: Value) {
        tracing::trace!(user_id, event = %event, "Publishing to user");
        self.send(BroadcastMessage {
            audience: Audience::User(user_id),
            event: event.to_string(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nothing_published_without_subscribers() {
        let hub = Hub::new(8);
        let mut rx = hub.sender.subscribe();

        hub.publish_to_topic(Topic::Status, "update_server_status", json!([]));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_server_users_filters_by_authorization() {
        let hub = Hub::new(8);
        let _a = hub.register(Subscriber { user_id: 1, authorized_servers: vec![ServerId(1)] });
        let _b = hub.register(Subscriber { user_id: 2, authorized_servers: vec![ServerId(2)] });

        assert_eq!(hub.server_users(ServerId(2)), vec![2]);
        hub.unregister(2);
        assert!(hub.server_users(ServerId(2)).is_empty());
        assert_eq!(hub.subscriber_count(), 1);
    }
}
