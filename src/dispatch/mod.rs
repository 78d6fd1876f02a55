//! Notification dispatcher
//!
//! A single task exclusively owns the topic -> subscriber index; every
//! mutation arrives as a message on its control channel, so no locking is
//! needed by construction. Delivery to a subscriber uses a bounded,
//! non-blocking send: a stalled subscriber loses that event (logged), it
//! never stalls delivery to the others.
//!
//! Ordering: events on one topic reach a given subscriber in the order the
//! dispatcher processed them. Nothing is guaranteed across topics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound buffer per streaming subscriber
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Notification that a new video appeared on a topic
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Channel or playlist id the event is keyed on
    pub topic: String,
    #[serde(rename = "videoId")]
    pub video_id: String,
    #[serde(rename = "publishedAt")]
    pub published_at: DateTime<Utc>,
}

/// Point-in-time view of the dispatcher index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    pub topics: usize,
    pub subscribers: usize,
}

enum Command {
    Register {
        id: Uuid,
        topics: Vec<String>,
        tx: mpsc::Sender<ChangeEvent>,
    },
    Unregister {
        id: Uuid,
    },
    Publish(ChangeEvent),
    Stats {
        reply: oneshot::Sender<DispatcherStats>,
    },
}

/// Cloneable handle to the dispatcher task
///
/// The control channel is unbounded so registration and unregistration never
/// block callers (unregister runs inside Drop guards).
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl DispatcherHandle {
    /// Register a subscriber on a set of topics
    pub fn register(&self, id: Uuid, topics: Vec<String>, tx: mpsc::Sender<ChangeEvent>) {
        let _ = self.tx.send(Command::Register { id, topics, tx });
    }

    /// Remove a subscriber from every topic it registered on
    pub fn unregister(&self, id: Uuid) {
        let _ = self.tx.send(Command::Unregister { id });
    }

    /// Deliver an event to every subscriber of its topic
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.tx.send(Command::Publish(event));
    }

    /// Index introspection; resolves after all previously sent commands
    pub async fn stats(&self) -> DispatcherStats {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Stats { reply }).is_err() {
            return DispatcherStats {
                topics: 0,
                subscribers: 0,
            };
        }
        rx.await.unwrap_or(DispatcherStats {
            topics: 0,
            subscribers: 0,
        })
    }
}

/// Spawn the dispatcher task and return its handle
pub fn spawn() -> DispatcherHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(rx));
    DispatcherHandle { tx }
}

struct Index {
    // topic -> subscriber id -> outbound channel
    topics: HashMap<String, HashMap<Uuid, mpsc::Sender<ChangeEvent>>>,
    // subscriber id -> topics it registered on
    memberships: HashMap<Uuid, Vec<String>>,
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut index = Index {
        topics: HashMap::new(),
        memberships: HashMap::new(),
    };

    while let Some(command) = rx.recv().await {
        match command {
            Command::Register { id, topics, tx } => {
                for topic in &topics {
                    index
                        .topics
                        .entry(topic.clone())
                        .or_default()
                        .insert(id, tx.clone());
                }
                debug!(subscriber = %id, topics = topics.len(), "subscriber registered");
                index.memberships.insert(id, topics);
            }
            Command::Unregister { id } => {
                remove(&mut index, id);
                debug!(subscriber = %id, "subscriber unregistered");
            }
            Command::Publish(event) => {
                publish(&mut index, event);
            }
            Command::Stats { reply } => {
                let _ = reply.send(DispatcherStats {
                    topics: index.topics.len(),
                    subscribers: index.memberships.len(),
                });
            }
        }
    }

    debug!("dispatcher stopped");
}

fn publish(index: &mut Index, event: ChangeEvent) {
    let Some(subscribers) = index.topics.get(&event.topic) else {
        debug!(topic = %event.topic, "no subscribers for topic");
        return;
    };

    let mut closed = Vec::new();
    for (id, tx) in subscribers {
        match tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Stalled subscriber: drop this event for it only
                warn!(subscriber = %id, topic = %event.topic, "subscriber buffer full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                closed.push(*id);
            }
        }
    }

    for id in closed {
        remove(index, id);
    }
}

fn remove(index: &mut Index, id: Uuid) {
    if let Some(topics) = index.memberships.remove(&id) {
        for topic in topics {
            if let Some(subscribers) = index.topics.get_mut(&topic) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    index.topics.remove(&topic);
                }
            }
        }
    }
}
