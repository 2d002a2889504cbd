use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{FlowError, Result};

/// Well-known topics published by the engine and registries.
pub mod topics {
    pub const FLOW_STARTED: &str = "flow.execution.started";
    pub const FLOW_COMPLETED: &str = "flow.execution.completed";
    pub const FLOW_FAILED: &str = "flow.execution.failed";
    pub const FLOW_END_REACHED: &str = "flow.end.reached";
    pub const FLOW_LOG_ENTRY: &str = "flow.execution.log";
    pub const NODE_STARTED: &str = "node.execution.started";
    pub const NODE_COMPLETED: &str = "node.execution.completed";
    pub const NODE_FAILED: &str = "node.execution.failed";
    pub const NODE_LOG: &str = "node.log";
    pub const VARIABLES_REGISTERED: &str = "variables.runtime.registered";
    pub const VARIABLES_INVALIDATED: &str = "variables.runtime.invalidated";
    pub const PLUGIN_REGISTERED: &str = "plugin.registered";
    pub const PLUGIN_UNREGISTERED: &str = "plugin.unregistered";
}

/// An event delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Handlers report failure with an error string; the bus logs it and moves on.
pub type HandlerResult = std::result::Result<(), String>;

type Handler = Arc<dyn Fn(&BusEvent) -> HandlerResult + Send + Sync>;

struct HandlerEntry {
    id: u64,
    handler: Handler,
    once: bool,
}

type HandlerMap = RwLock<HashMap<String, Vec<HandlerEntry>>>;

enum Envelope {
    Event(BusEvent),
    Flush(oneshot::Sender<()>),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Topic-based publish/subscribe bus.
///
/// `emit` only enqueues; a dispatcher task delivers events to handlers after
/// the caller's current unit of work, so emitting never blocks or re-enters
/// the caller. Within one topic handlers run in subscription order. A topic
/// pattern ending in `.*` subscribes to every topic with that prefix.
///
/// Every event is also fanned out on a broadcast channel for consumers that
/// prefer a stream (`subscribe`).
pub struct EventBus {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    handlers: Arc<HandlerMap>,
    broadcast: broadcast::Sender<BusEvent>,
    next_id: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            broadcast,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Queue an event for delivery.
    pub fn emit(&self, topic: &str, payload: Value) {
        if self.is_closed() {
            debug!(topic, "Event bus closed, dropping event");
            return;
        }
        self.ensure_dispatcher();
        let event = BusEvent {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        // Ignore error if the dispatcher is gone
        let _ = self.tx.send(Envelope::Event(event));
    }

    /// Subscribe a handler to a topic (or `prefix.*` pattern).
    pub fn on<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_handler(topic, Arc::new(handler), false)
    }

    /// Subscribe a handler that is removed after its first delivery.
    pub fn once<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_handler(topic, Arc::new(handler), true)
    }

    /// Resolve with the next event on `topic`.
    ///
    /// The subscription is made when this is called, not when the returned
    /// future is first polled, so an event emitted in between is not missed.
    pub fn wait_for(
        &self,
        topic: &str,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<BusEvent>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let subscription = self.once(topic, move |event| {
            if let Some(tx) = lock(&slot).take() {
                let _ = tx.send(event.clone());
            }
            Ok(())
        });
        let topic = topic.to_string();

        async move {
            let received = match timeout {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(received) => received,
                    Err(_) => {
                        subscription.unsubscribe();
                        return Err(FlowError::Timeout {
                            what: format!("waiting for event {}", topic),
                            timeout_ms: limit.as_millis() as u64,
                        });
                    }
                },
                None => rx.await,
            };
            received.map_err(|_| FlowError::EventBusClosed)
        }
    }

    /// Stream of every event, in dispatch order.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.broadcast.subscribe()
    }

    /// Wait until every event emitted before this call has been dispatched.
    pub async fn flush(&self) {
        if self.is_closed() {
            return;
        }
        self.ensure_dispatcher();
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Envelope::Flush(tx)).is_ok() {
            rx.await.ok();
        }
    }

    /// Drain pending events, then close the bus.
    pub async fn shutdown(&self) {
        self.flush().await;
        self.close();
    }

    /// Stop dispatching. Events emitted afterwards are dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of handlers currently subscribed to exactly `topic`.
    pub fn handler_count(&self, topic: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }

    fn add_handler(&self, topic: &str, handler: Handler, once: bool) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(HandlerEntry { id, handler, once });
        self.ensure_dispatcher();
        Subscription {
            id,
            topic: topic.to_string(),
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Start the dispatcher on first use inside a tokio runtime. Without a
    /// runtime, events stay queued until one is available.
    fn ensure_dispatcher(&self) {
        let mut guard = lock(&self.rx);
        if guard.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Some(rx) = guard.take() {
            runtime.spawn(dispatch_loop(
                rx,
                self.handlers.clone(),
                self.broadcast.clone(),
                self.cancel.clone(),
            ));
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle returned by `on`/`once`.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: String,
    handlers: Weak<HandlerMap>,
}

impl Subscription {
    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(handlers) = self.handlers.upgrade() else {
            return false;
        };
        let mut map = handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = map.get_mut(&self.topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != self.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            map.remove(&self.topic);
        }
        removed
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('.') => topic.starts_with(prefix),
        _ => pattern == topic,
    }
}

/// Take the handlers due for `topic`, removing `once` entries up front so a
/// slow handler cannot be delivered twice.
fn handlers_for(handlers: &HandlerMap, topic: &str) -> Vec<(u64, Handler)> {
    let mut map = handlers.write().unwrap_or_else(PoisonError::into_inner);
    let mut due = Vec::new();
    for (pattern, entries) in map.iter_mut() {
        if !topic_matches(pattern, topic) {
            continue;
        }
        for entry in entries.iter() {
            due.push((entry.id, entry.handler.clone()));
        }
        entries.retain(|e| !e.once);
    }
    map.retain(|_, entries| !entries.is_empty());
    due.sort_by_key(|(id, _)| *id);
    due
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    handlers: Arc<HandlerMap>,
    broadcast: broadcast::Sender<BusEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Event dispatcher cancelled");
                break;
            }
            envelope = rx.recv() => {
                match envelope {
                    Some(Envelope::Event(event)) => {
                        deliver(&handlers, &event);
                        // Ignore error if no receivers
                        let _ = broadcast.send(event);
                    }
                    Some(Envelope::Flush(done)) => {
                        let _ = done.send(());
                    }
                    None => break,
                }
            }
        }
    }
}

fn deliver(handlers: &HandlerMap, event: &BusEvent) {
    for (id, handler) in handlers_for(handlers, &event.topic) {
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(topic = %event.topic, handler = id, error = %e, "Event handler failed");
            }
            Err(_) => {
                warn!(topic = %event.topic, handler = id, "Event handler panicked");
            }
        }
    }
}
