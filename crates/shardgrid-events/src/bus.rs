//! In-process event bus.
//!
//! Events are queued on an unbounded channel and delivered to every handler
//! subscribed to their kind. A handler error schedules a redelivery of the
//! event until `max_deliveries` attempts were made, after which the event is
//! dropped with an error log.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use shardgrid_core::BusSettings;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, error, warn};

use crate::event::{EventKind, FleetEvent};

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Subscriber callback. Must be idempotent.
pub type Handler = Arc<dyn Fn(FleetEvent) -> HandlerFuture + Send + Sync>;

struct Envelope {
    event: FleetEvent,
    attempt: u32,
}

/// Delivery counters since the bus was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct Inner {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
    settings: BusSettings,
    counters: Counters,
}

/// Cloneable handle to the shared event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(settings: BusSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: Mutex::new(rx),
                handlers: RwLock::new(HashMap::new()),
                settings,
                counters: Counters::default(),
            }),
        }
    }

    /// Register a handler for one event kind.
    pub async fn subscribe<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(FleetEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.inner
            .handlers
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(handler);
        debug!(%kind, "handler subscribed");
    }

    pub fn publish(&self, event: FleetEvent) {
        self.enqueue(Envelope { event, attempt: 1 });
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish `event` once `delay` has elapsed. Needs a running tokio runtime.
    pub fn publish_after(&self, delay: Duration, event: FleetEvent) {
        let bus = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.publish(event);
        });
    }

    fn enqueue(&self, envelope: Envelope) {
        let kind = envelope.event.kind();
        if self.inner.tx.send(envelope).is_err() {
            warn!(%kind, "event bus closed, event discarded");
        }
    }

    /// Deliver events until the queue is empty, including events published
    /// by handlers along the way. Returns the number of events processed.
    pub async fn deliver_pending(&self) -> usize {
        let mut rx = self.inner.rx.lock().await;
        let mut processed = 0;
        while let Ok(envelope) = rx.try_recv() {
            self.dispatch(envelope).await;
            processed += 1;
        }
        processed
    }

    /// Deliver events as they arrive until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.inner.rx.lock().await;
        loop {
            tokio::select! {
                envelope = rx.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("event bus shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        let kind = envelope.event.kind();
        let handlers = self
            .inner
            .handlers
            .read()
            .await
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(%kind, "no handler subscribed");
            return;
        }

        let mut failed = false;
        for handler in handlers {
            match handler(envelope.event.clone()).await {
                Ok(()) => {
                    self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    failed = true;
                    self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(%kind, attempt = envelope.attempt, error = %e, "event handler failed");
                }
            }
        }
        if failed {
            self.redeliver(envelope);
        }
    }

    fn redeliver(&self, envelope: Envelope) {
        let kind = envelope.event.kind();
        if envelope.attempt >= self.inner.settings.max_deliveries {
            self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            error!(%kind, attempts = envelope.attempt, "event dropped after max deliveries");
            return;
        }
        let next = Envelope {
            event: envelope.event,
            attempt: envelope.attempt + 1,
        };
        let delay = Duration::from_millis(self.inner.settings.redelivery_delay_ms);
        if delay.is_zero() {
            self.enqueue(next);
            return;
        }
        let bus = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.enqueue(next);
        });
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }
}
