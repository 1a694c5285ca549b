//! Front of the pipeline: turning `CheckRequested` into `ItemsDiscovered`.
//!
//! A binding has at most one discovery batch in flight. The batch is opened here,
//! right before `ItemsDiscovered` is published, and closed by the dispatcher once
//! every item of it has settled. Checks arriving in between skip the binding, so an
//! item is never processed twice concurrently.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::binding::{Binding, BindingId};
use crate::bus::{EventBus, EventHandler};
use crate::contract::{FetchError, Fetcher, Item, ItemId};
use crate::event::{CheckOrigin, DiscoveredBatch, Event, EventPayload};
use crate::health::HealthMonitor;
use crate::state::StateStore;

/// What settling one item means for its binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// The watermark may move to this id.
    pub advance_to: Option<ItemId>,
    /// Every item of the batch has settled.
    pub complete: bool,
}

/// Per-binding open batches. `None` marks an item that has not settled yet.
#[derive(Debug, Default)]
pub struct BatchTracker {
    batches: Mutex<HashMap<BindingId, BTreeMap<ItemId, Option<bool>>>>,
}

impl BatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BindingId, BTreeMap<ItemId, Option<bool>>>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a batch for `binding`. An empty batch is not tracked.
    pub fn open(&self, binding: &BindingId, ids: impl IntoIterator<Item = ItemId>) {
        let entries: BTreeMap<ItemId, Option<bool>> = ids.into_iter().map(|id| (id, None)).collect();
        if entries.is_empty() {
            return;
        }
        self.lock().insert(binding.clone(), entries);
    }

    pub fn is_open(&self, binding: &BindingId) -> bool {
        self.lock().contains_key(binding)
    }

    /// Records the outcome of one item.
    ///
    /// The watermark may move across the leading run of succeeded items. A failure
    /// blocks every later item of the batch from moving it. Items outside any open
    /// batch advance on their own success.
    pub fn settle(&self, binding: &BindingId, item_id: ItemId, succeeded: bool) -> Settlement {
        let mut batches = self.lock();
        let Some(entries) = batches
            .get_mut(binding)
            .filter(|entries| entries.contains_key(&item_id))
        else {
            return Settlement {
                advance_to: succeeded.then_some(item_id),
                complete: false,
            };
        };
        entries.insert(item_id, Some(succeeded));

        let run_end = entries
            .iter()
            .take_while(|(_, outcome)| **outcome == Some(true))
            .map(|(id, _)| *id)
            .last();
        let advance_to = match run_end {
            Some(end) if succeeded && end >= item_id => Some(end),
            _ => None,
        };
        Settlement {
            advance_to,
            complete: entries.values().all(Option::is_some),
        }
    }

    /// Closes the batch of `binding`, letting the next check re-discover pending items.
    pub fn release(&self, binding: &BindingId) {
        if self.lock().remove(binding).is_some() {
            debug!(binding = %binding, "[FETCH] Batch released");
        }
    }
}

/// Handler for `CheckRequested`: fetches every eligible binding concurrently.
pub struct FetchStage {
    bindings: Vec<Binding>,
    fetcher: Arc<dyn Fetcher>,
    state: Arc<StateStore>,
    batches: Arc<BatchTracker>,
    health: Arc<HealthMonitor>,
    bus: EventBus,
    shutdown: CancellationToken,
}

impl FetchStage {
    pub fn new(
        bindings: Vec<Binding>,
        fetcher: Arc<dyn Fetcher>,
        state: Arc<StateStore>,
        batches: Arc<BatchTracker>,
        health: Arc<HealthMonitor>,
        bus: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bindings,
            fetcher,
            state,
            batches,
            health,
            bus,
            shutdown,
        }
    }

    /// Runs one check over all bindings.
    pub async fn check(&self, origin: CheckOrigin) {
        if self.shutdown.is_cancelled() {
            info!(?origin, "[FETCH] Shutting down, check ignored");
            return;
        }
        info!(?origin, bindings = self.bindings.len(), "[FETCH] Check started");
        let eligible = self.bindings.iter().filter(|binding| {
            if self.health.is_disabled(binding.id()) {
                debug!(binding = %binding.id(), "[FETCH] Binding disabled, skipped");
                return false;
            }
            if self.batches.is_open(binding.id()) {
                info!(binding = %binding.id(), "[FETCH] Previous batch still in flight, skipped");
                return false;
            }
            true
        });
        join_all(eligible.map(|binding| self.check_binding(binding))).await;
    }

    async fn check_binding(&self, binding: &Binding) {
        let id = binding.id();
        let watermark = self.state.watermark(id);
        debug!(binding = %id, watermark, "[FETCH] Fetching");

        let call = async {
            self.fetcher
                .fetch(binding, watermark, binding.source().max_count)
                .await
        };
        let fetched = AssertUnwindSafe(call)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(FetchError::Transient("fetcher panicked".to_string())));
        let items = match fetched {
            Ok(items) => items,
            Err(FetchError::Transient(reason)) => {
                warn!(binding = %id, %reason, "[FETCH] Transient failure, binding skipped this cycle");
                self.health.record_failure(id, &reason);
                return;
            }
            Err(FetchError::Auth(reason)) => {
                error!(binding = %id, %reason, "[FETCH][ERROR] Source rejected credentials, disabling binding");
                self.health.disable(id, &reason);
                return;
            }
        };

        let items = new_items(items, watermark);
        if items.is_empty() {
            debug!(binding = %id, "[FETCH] No new items");
            self.health.record_success(id);
            return;
        }
        info!(
            binding = %id,
            count = items.len(),
            first = items[0].item_id,
            last = items[items.len() - 1].item_id,
            "[FETCH] New items discovered"
        );
        self.batches.open(id, items.iter().map(|item| item.item_id));
        self.bus
            .publish(Event::new(EventPayload::ItemsDiscovered(DiscoveredBatch {
                binding_id: id.clone(),
                items,
            })));
    }
}

/// Keeps items above the watermark, oldest first, without duplicate ids.
fn new_items(mut items: Vec<Item>, watermark: ItemId) -> Vec<Item> {
    items.retain(|item| item.item_id > watermark);
    items.sort_by_key(|item| item.item_id);
    items.dedup_by_key(|item| item.item_id);
    items
}

#[async_trait]
impl EventHandler for FetchStage {
    fn name(&self) -> &str {
        "fetch"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if let EventPayload::CheckRequested(origin) = event.payload() {
            self.check(*origin).await;
        }
        Ok(())
    }
}
