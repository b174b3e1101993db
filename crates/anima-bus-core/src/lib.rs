#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **anima-bus-core** – In-process publish/subscribe event bus for Anima.
//!
//! Topics are exact-match strings; payloads are JSON objects. One `publish`
//! call delivers to every handler currently registered for the topic,
//! concurrently, and a handler failure is logged and contained — it never
//! reaches the publisher or the other handlers. Delivery is best-effort,
//! at-most-once per handler per publish, with no persistence: a crash loses
//! in-flight events.
//!
//! Besides registered handlers, observers can attach to a broadcast tap that
//! receives a copy of every published envelope; lagging observers drop
//! events rather than slowing publishers down.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error};

/// Event payload: a JSON object keyed by the topic contract.
pub type Payload = serde_json::Value;

/// Well-known topic names produced or consumed by the core.
pub mod topics {
    /// User message ingested from the inbox. `{text, tick}`
    pub const USER_MESSAGE: &str = "user.message";
    /// Urgent user message (inbox line with the urgent prefix). `{text, tick}`
    pub const USER_URGENT: &str = "user.urgent";
    /// A watched file appeared. `{path}`
    pub const WORLD_FILE_CREATED: &str = "world.file_created";
    /// A watched file changed. `{path}`
    pub const WORLD_FILE_CHANGED: &str = "world.file_changed";
    /// A watched file disappeared. `{path}`
    pub const WORLD_FILE_DELETED: &str = "world.file_deleted";
    /// The world model refreshed its summary. `{summary}`
    pub const WORLD_UPDATED: &str = "world.updated";
    /// The initial world scan finished. `{file_count}`
    pub const WORLD_READY: &str = "world.ready";
    /// A whitelisted config key was mutated. `{key, new_value, old_value}`
    pub const CONFIG_MODIFIED: &str = "config.modified";
    /// A new self-model principle was accepted. `{text, version}`
    pub const SELF_PRINCIPLE_ADDED: &str = "self.principle_added";
    /// Self-model drift between versions. `{past_version, current_version, delta}`
    pub const SELF_DRIFT_DETECTED: &str = "self.drift_detected";
    /// Value scores changed after an action. `{scores, mode, context}`
    pub const VALUE_CHANGED: &str = "value.changed";
    /// The strategy vector was re-weighted. `{vector}`
    pub const STRATEGY_VECTOR_CHANGED: &str = "strategy.vector_changed";
    /// A consolidation pass finished. `{tick, episodes}`
    pub const DREAM_COMPLETED: &str = "dream.completed";
    /// A reflection pass finished. `{tick, contradictions}`
    pub const REFLECTION_COMPLETED: &str = "reflection.completed";
    /// A diary entry was written. `{tick}`
    pub const NARRATIVE_ENTRY_WRITTEN: &str = "narrative.entry_written";
    /// A first-time milestone was reached. `{name, desc, context}`
    pub const MILESTONE_ACHIEVED: &str = "milestone.achieved";
}

/// A published envelope as seen by tap observers.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// The topic it was published under.
    pub topic: String,
    /// The payload, verbatim.
    pub payload: Payload,
}

type HandlerFn = dyn Fn(Payload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

struct Subscriber {
    name: String,
    handler: Arc<HandlerFn>,
}

/// Default capacity of the observer tap ring buffer.
const DEFAULT_TAP_CAPACITY: usize = 256;

/// Async pub/sub bus keyed by exact topic strings.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    tap: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_TAP_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus with the given observer-tap capacity.
    pub fn new(tap_capacity: usize) -> Self {
        let (tap, _rx) = broadcast::channel(tap_capacity);
        Self { subscribers: RwLock::new(HashMap::new()), tap }
    }

    /// Register an async handler for a topic. `name` identifies the handler
    /// in failure logs.
    pub async fn subscribe<F, Fut>(&self, topic: &str, name: &str, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped: Arc<HandlerFn> = Arc::new(move |payload| Box::pin(handler(payload)));
        let mut subs = self.subscribers.write().await;
        subs.entry(topic.to_string()).or_default().push(Subscriber {
            name: name.to_string(),
            handler: wrapped,
        });
        debug!(topic, handler = name, "subscribed");
    }

    /// Deliver a payload to every handler registered for the topic,
    /// concurrently. Handler failures are logged per handler and never
    /// propagate to the publisher.
    pub async fn publish(&self, topic: &str, payload: Payload) {
        let _ = self.tap.send(BusEvent { topic: topic.to_string(), payload: payload.clone() });

        let handlers: Vec<(String, Arc<HandlerFn>)> = {
            let subs = self.subscribers.read().await;
            match subs.get(topic) {
                Some(list) => list
                    .iter()
                    .map(|s| (s.name.clone(), Arc::clone(&s.handler)))
                    .collect(),
                None => {
                    debug!(topic, "published with no subscribers");
                    return;
                }
            }
        };

        debug!(topic, handlers = handlers.len(), "publishing");

        let futures = handlers
            .iter()
            .map(|(_, h)| (h.as_ref())(payload.clone()))
            .collect::<Vec<_>>();
        let results = join_all(futures).await;

        for ((name, _), result) in handlers.iter().zip(results) {
            if let Err(e) = result {
                error!(topic, handler = %name, error = %e, "handler failed");
            }
        }
    }

    /// Attach an observer to the broadcast tap. Observers that fall behind
    /// miss events.
    pub fn tap(&self) -> broadcast::Receiver<BusEvent> {
        self.tap.subscribe()
    }

    /// Number of handlers registered for a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.read().await.get(topic).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn publish_reaches_all_handlers() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let hits = Arc::clone(&hits);
            bus.subscribe("user.message", &format!("h{i}"), move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        }

        bus.publish("user.message", json!({"text": "hi", "tick": 1})).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn handler_failure_does_not_affect_others() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe("t", "failing", |_| async { anyhow::bail!("boom") }).await;
        {
            let hits = Arc::clone(&hits);
            bus.subscribe("t", "ok", move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        }

        // Must not panic or error out.
        bus.publish("t", json!({})).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn topics_are_exact_match() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            bus.subscribe("world.file_created", "h", move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        }

        bus.publish("world.file_changed", json!({"path": "a"})).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.publish("world.file_created", json!({"path": "a"})).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tap_sees_every_publish() {
        let bus = EventBus::default();
        let mut tap = bus.tap();

        bus.publish("value.changed", json!({"mode": "curious"})).await;

        let event = tap.recv().await.unwrap();
        assert_eq!(event.topic, "value.changed");
        assert_eq!(event.payload["mode"], "curious");
    }

    #[tokio::test]
    async fn handler_receives_payload_verbatim() {
        let bus = EventBus::default();
        let (tx, rx) = tokio::sync::oneshot::channel::<Payload>();
        let tx = std::sync::Mutex::new(Some(tx));

        bus.subscribe("user.urgent", "capture", move |payload| {
            let tx = tx.lock().unwrap().take();
            async move {
                if let Some(tx) = tx {
                    let _ = tx.send(payload);
                }
                Ok(())
            }
        })
        .await;

        bus.publish("user.urgent", json!({"text": "help", "tick": 7})).await;
        let got = rx.await.unwrap();
        assert_eq!(got, json!({"text": "help", "tick": 7}));
    }
}
