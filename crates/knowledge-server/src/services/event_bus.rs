use crate::tenant::TenantKey;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentEventType {
    Created,
    Updated,
    Deleted,
    Promoted,
    Superseded,
    ReferencesResolved,
    Validated,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentEvent {
    pub event_type: DocumentEventType,
    pub file_path: String,
    pub tenant: TenantKey,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub payload: JsonValue,
}

impl DocumentEvent {
    pub fn new(
        event_type: DocumentEventType,
        file_path: &str,
        tenant: &TenantKey,
        correlation_id: Option<Uuid>,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_type,
            file_path: file_path.to_string(),
            tenant: tenant.clone(),
            timestamp: Utc::now(),
            correlation_id,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    OnAny,
    OnType(DocumentEventType),
}

impl EventFilter {
    fn matches(&self, event_type: DocumentEventType) -> bool {
        match self {
            EventFilter::OnAny => true,
            EventFilter::OnType(t) => *t == event_type,
        }
    }
}

#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DocumentEvent) -> anyhow::Result<()>;
}

struct HandlerEntry {
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

type HandlerRegistry = Arc<RwLock<HashMap<u64, HandlerEntry>>>;

/// Removes its handler from the registry when disposed or dropped.
pub struct Subscription {
    id: u64,
    handlers: HandlerRegistry,
    disposed: bool,
}

impl Subscription {
    pub fn dispose(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.disposed {
            self.handlers.write().remove(&self.id);
            self.disposed = true;
            debug!(subscription = self.id, "Event subscription disposed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Document lifecycle event bus: publishers enqueue into an unbounded
/// channel, a single dispatcher task fans each event out to all matching
/// handlers in parallel with error isolation.
pub struct EventBus {
    tx: flume::Sender<DocumentEvent>,
    rx: flume::Receiver<DocumentEvent>,
    handlers: HandlerRegistry,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self, filter: EventFilter, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .write()
            .insert(id, HandlerEntry { filter, handler });
        Subscription {
            id,
            handlers: self.handlers.clone(),
            disposed: false,
        }
    }

    /// Publishing after shutdown is a warning-level no-op.
    pub fn publish(&self, event: DocumentEvent) {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!(
                event_type = ?event.event_type,
                file_path = %event.file_path,
                "Event published after shutdown, dropping"
            );
            return;
        }
        if let Err(e) = self.tx.send(event) {
            warn!("Failed to enqueue event: {}", e);
        }
    }

    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Single background dispatcher. Handler failures are logged and do not
    /// affect other handlers or later events.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            info!("Event dispatcher started");
            loop {
                let event = tokio::select! {
                    received = bus.rx.recv_async() => match received {
                        Ok(event) => event,
                        Err(_) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                bus.dispatch(event).await;
            }
            bus.shutdown();
            info!("Event dispatcher stopped");
        })
    }

    async fn dispatch(&self, event: DocumentEvent) {
        let targets: Vec<(u64, Arc<dyn EventHandler>)> = {
            let handlers = self.handlers.read();
            handlers
                .iter()
                .filter(|(_, entry)| entry.filter.matches(event.event_type))
                .map(|(id, entry)| (*id, entry.handler.clone()))
                .collect()
        };

        if targets.is_empty() {
            return;
        }

        let event = Arc::new(event);
        let tasks: Vec<_> = targets
            .into_iter()
            .map(|(id, handler)| {
                let event = event.clone();
                tokio::spawn(async move {
                    if let Err(err) = handler.handle(&event).await {
                        warn!(
                            handler = id,
                            event_type = ?event.event_type,
                            error = %err,
                            "Event handler failed"
                        );
                    }
                })
            })
            .collect();

        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Event handler panicked");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
