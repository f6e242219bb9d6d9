//! Event Broadcaster: hierarchical topic fan-out with a mandatory
//! persistence subscriber.
//!
//! The teacher has no live pub-sub of this shape (`agent_events` are
//! DB-persisted and read back, never pushed), so this module is new work
//! built in the teacher's idiom: bounded `tokio::sync::mpsc` channels per
//! subscriber (the same channel-based event collection shape as
//! `lifecycle::collect_events`), and an `Arc<RwLock<HashMap<...>>>`
//! subscriber registry with a custom `Debug` impl modeled on
//! [`crate::harness::registry::HarnessRegistry`].

pub mod glob;
pub mod persistence;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::events::{Event, EventType};

/// Bound on each subscriber's queue. Past this, new events are dropped and
/// a single `subscriber_lagging` event is delivered in their place.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

struct Subscriber {
    patterns: Vec<String>,
    sender: mpsc::Sender<Event>,
    /// Set once a lagging notice has been sent, so we don't spam the
    /// subscriber with one per dropped event -- it's cleared the next time
    /// a send succeeds.
    lagging: bool,
}

/// Topic-based fan-out of [`Event`]s to registered subscribers.
///
/// `publish` never blocks the caller: each subscriber send is a `try_send`,
/// and a full queue drops the event rather than applying backpressure to
/// the publisher.
#[derive(Clone)]
pub struct Broadcaster {
    subscribers: Arc<RwLock<HashMap<String, Subscriber>>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a subscriber interested in events matching any of
    /// `topic_patterns`. Returns a receiver the caller polls for events.
    pub async fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        topic_patterns: Vec<String>,
    ) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut subs = self.subscribers.write().await;
        subs.insert(
            subscriber_id.into(),
            Subscriber {
                patterns: topic_patterns,
                sender: tx,
                lagging: false,
            },
        );
        rx
    }

    /// Remove a subscriber. Idempotent: unsubscribing an unknown or
    /// already-removed id is not an error.
    pub async fn unsubscribe(&self, subscriber_id: &str) {
        self.subscribers.write().await.remove(subscriber_id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Publish an event to every subscriber whose patterns match one of the
    /// event's topics. Non-blocking: a subscriber with a full queue is sent
    /// a synthetic `subscriber_lagging` event instead (best-effort; if even
    /// that doesn't fit, the subscriber is simply behind until it drains).
    pub async fn publish(&self, event: Event) {
        let topics = event.topics();
        let mut subs = self.subscribers.write().await;

        for sub in subs.values_mut() {
            let interested = sub
                .patterns
                .iter()
                .any(|pattern| topics.iter().any(|topic| glob::matches(pattern, topic)));
            if !interested {
                continue;
            }

            match sub.sender.try_send(event.clone()) {
                Ok(()) => sub.lagging = false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if !sub.lagging {
                        let lag_event = Event::new(
                            event.workspace_id,
                            EventType::SubscriberLagging,
                            serde_json::json!({ "dropped_event_type": format!("{:?}", event.event_type) }),
                        );
                        let _ = sub.sender.try_send(lag_event);
                        sub.lagging = true;
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}
