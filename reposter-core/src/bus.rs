//! In-process publish/subscribe event bus.
//!
//! # Guarantees
//!
//! - **Non-blocking publish**: [`EventBus::publish`] enqueues and returns; it never
//!   waits for a handler.
//! - **Ordering**: events are delivered through lanes keyed by event kind and
//!   binding. Within a lane, events are handled one at a time in publish order and
//!   the handlers of the kind are invoked in subscription order. Lanes run
//!   concurrently, so a slow binding never holds up another one.
//! - **Isolation**: a handler that returns an error or panics is logged; the
//!   remaining handlers and later events are still delivered.
//! - **No replay**: the handler set is captured at publish time. Subscribing later
//!   does not deliver earlier events.
//!
//! # Shutdown
//!
//! [`EventBus::drain`] waits until every queued and running delivery has finished,
//! bounded by a grace period, then cancels whatever is left and closes the bus.
//! Events published after that are dropped.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::binding::BindingId;
use crate::event::{Event, EventKind};

/// Something that reacts to events. Each invocation is a failure-isolation boundary.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

type HandlerList = Arc<[Arc<dyn EventHandler>]>;
type LaneKey = (EventKind, Option<BindingId>);

struct Delivery {
    event: Arc<Event>,
    handlers: HandlerList,
}

struct Inner {
    handlers: RwLock<HashMap<EventKind, HandlerList>>,
    lanes: Mutex<HashMap<LaneKey, mpsc::UnboundedSender<Delivery>>>,
    /// Deliveries enqueued but not yet finished.
    outstanding: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Inner {
    fn settle_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheaply cloneable handle to one bus.
///
/// Publishing spawns lane tasks lazily, so it must happen inside a Tokio runtime.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(HashMap::new()),
                lanes: Mutex::new(HashMap::new()),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Registers `handler` for every kind in `kinds`.
    pub fn subscribe(&self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) {
        let mut registry = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut kinds = kinds.to_vec();
        kinds.sort();
        kinds.dedup();
        for kind in kinds {
            let mut list: Vec<Arc<dyn EventHandler>> = registry
                .get(&kind)
                .map(|existing| existing.iter().cloned().collect())
                .unwrap_or_default();
            list.push(Arc::clone(&handler));
            registry.insert(kind, list.into());
        }
        debug!(handler = handler.name(), "[BUS] Handler subscribed");
    }

    /// Enqueues `event` for every handler currently subscribed to its kind.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        if self.inner.closed.load(Ordering::Acquire) {
            debug!(%kind, "[BUS] Bus closed, dropping event");
            return;
        }
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();
        let Some(handlers) = handlers.filter(|list| !list.is_empty()) else {
            trace!(%kind, "[BUS] No subscribers for event");
            return;
        };

        let key: LaneKey = (kind, event.binding_id().cloned());
        let delivery = Delivery {
            event: Arc::new(event),
            handlers,
        };
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        let mut lanes = lock(&self.inner.lanes);
        let sender = lanes
            .entry(key.clone())
            .or_insert_with(|| self.spawn_lane(key));
        if sender.send(delivery).is_err() {
            self.inner.settle_one();
            debug!(%kind, "[BUS] Lane already stopped, dropping event");
        }
    }

    fn spawn_lane(&self, key: LaneKey) -> mpsc::UnboundedSender<Delivery> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let inner = Arc::clone(&self.inner);
        let (kind, binding) = key;
        trace!(%kind, binding = ?binding, "[BUS] Opening lane");
        self.inner.tasks.spawn(async move {
            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = inner.cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };
                let abandoned = tokio::select! {
                    biased;
                    _ = inner.cancel.cancelled() => true,
                    _ = deliver(&delivery) => false,
                };
                inner.settle_one();
                if abandoned {
                    warn!(%kind, binding = ?binding, "[BUS] Delivery abandoned at shutdown");
                    break;
                }
            }
            rx.close();
            let mut dropped = 0usize;
            while rx.try_recv().is_ok() {
                inner.settle_one();
                dropped += 1;
            }
            if dropped > 0 {
                warn!(%kind, binding = ?binding, dropped, "[BUS] Queued deliveries dropped at shutdown");
            }
        });
        tx
    }

    /// Resolves once no delivery is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Waits for in-flight deliveries up to `grace`, then closes the bus.
    ///
    /// Returns `true` when everything settled within the grace period.
    pub async fn drain(&self, grace: Duration) -> bool {
        let drained = tokio::time::timeout(grace, self.wait_idle()).await.is_ok();
        self.inner.closed.store(true, Ordering::Release);
        if drained {
            info!("[BUS] All deliveries settled");
        } else {
            warn!(
                outstanding = self.outstanding(),
                grace_ms = grace.as_millis() as u64,
                "[BUS] Grace period elapsed, abandoning in-flight deliveries"
            );
        }
        self.inner.cancel.cancel();
        lock(&self.inner.lanes).clear();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        drained
    }

    /// Token cancelled once [`drain`](Self::drain) gives up on in-flight work.
    ///
    /// Handlers that wait inside a delivery select on it to stop early.
    pub fn abandon_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of deliveries queued or running.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

async fn deliver(delivery: &Delivery) {
    let kind = delivery.event.kind();
    for handler in delivery.handlers.iter() {
        let outcome = AssertUnwindSafe(handler.handle(&delivery.event))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                handler = handler.name(),
                %kind,
                error = %format!("{e:#}"),
                "[BUS][ERROR] Handler failed"
            ),
            Err(_) => error!(handler = handler.name(), %kind, "[BUS][ERROR] Handler panicked"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}
