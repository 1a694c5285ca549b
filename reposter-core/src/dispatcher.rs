//! Fan-out of processed items to their destinations and watermark bookkeeping.
//!
//! Every destination of an item is published to concurrently; a failing destination
//! never stops the others. The item then settles in its binding's batch, and the
//! watermark is persisted before the batch guard is released.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::binding::{Binding, BindingId, Destination};
use crate::bus::{EventBus, EventHandler};
use crate::contract::{discard_all, ItemId, ProcessedItem, Publisher};
use crate::event::{DestinationOutcome, Event, EventPayload, ProcessingAbandoned, PublishReport};
use crate::pipeline::BatchTracker;
use crate::state::{Advance, StateStore};

/// Publisher adapters, one per destination capability.
#[derive(Clone, Default)]
pub struct Publishers {
    channel: Option<Arc<dyn Publisher>>,
    blog: Option<Arc<dyn Publisher>>,
}

impl Publishers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.channel = Some(publisher);
        self
    }

    pub fn with_blog(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.blog = Some(publisher);
        self
    }

    pub fn for_destination(&self, destination: &Destination) -> Option<&Arc<dyn Publisher>> {
        match destination {
            Destination::Channel { .. } => self.channel.as_ref(),
            Destination::Blog { .. } => self.blog.as_ref(),
        }
    }
}

impl std::fmt::Debug for Publishers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publishers")
            .field("channel", &self.channel.is_some())
            .field("blog", &self.blog.is_some())
            .finish()
    }
}

pub struct Dispatcher {
    bindings: HashMap<BindingId, Binding>,
    publishers: Publishers,
    state: Arc<StateStore>,
    batches: Arc<BatchTracker>,
    bus: EventBus,
    cleanup_artifacts: bool,
    /// Settling an item and releasing its batch happen under the binding's lock.
    settle_locks: Mutex<HashMap<BindingId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        bindings: impl IntoIterator<Item = Binding>,
        publishers: Publishers,
        state: Arc<StateStore>,
        batches: Arc<BatchTracker>,
        bus: EventBus,
        cleanup_artifacts: bool,
    ) -> Self {
        Self {
            bindings: bindings
                .into_iter()
                .map(|binding| (binding.id().clone(), binding))
                .collect(),
            publishers,
            state,
            batches,
            bus,
            cleanup_artifacts,
            settle_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Publishes `processed` to every destination of its binding and settles it.
    pub async fn dispatch(&self, processed: &ProcessedItem) -> PublishReport {
        let item = &processed.item;
        let destinations = self
            .bindings
            .get(&item.binding_id)
            .map(Binding::destinations)
            .unwrap_or_default();
        if destinations.is_empty() {
            warn!(binding = %item.binding_id, "[DISPATCH] Item belongs to no configured binding");
        }

        let outcomes = join_all(
            destinations
                .iter()
                .map(|destination| self.publish_one(destination, processed)),
        )
        .await;
        // An item with no destinations never counts as delivered.
        let succeeded = !outcomes.is_empty() && outcomes.iter().all(|o| o.result.is_ok());

        let watermark_advanced = self
            .settle(&item.binding_id, item.item_id, succeeded)
            .await;
        if self.cleanup_artifacts {
            discard_all(&processed.artifacts).await;
        }

        let report = PublishReport {
            binding_id: item.binding_id.clone(),
            item_id: item.item_id,
            outcomes,
            watermark_advanced,
        };
        if succeeded {
            info!(binding = %item.binding_id, item_id = item.item_id, "[DISPATCH] Item published to all destinations");
        } else {
            warn!(
                binding = %item.binding_id,
                item_id = item.item_id,
                failed = report.failures().count(),
                "[DISPATCH] Item will be retried on the next check"
            );
        }
        report
    }

    async fn publish_one(&self, destination: &Destination, processed: &ProcessedItem) -> DestinationOutcome {
        let result = match self.publishers.for_destination(destination) {
            Some(publisher) => {
                let call = async {
                    publisher
                        .publish(destination, &processed.item.text, &processed.artifacts)
                        .await
                };
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => {
                        error!(%destination, item_id = processed.item.item_id, "[DISPATCH][ERROR] Publisher panicked");
                        Err("publisher panicked".to_string())
                    }
                }
            }
            None => Err(format!("no publisher configured for {destination}")),
        };
        match &result {
            Ok(()) => debug!(%destination, item_id = processed.item.item_id, "[DISPATCH] Published"),
            Err(reason) => warn!(%destination, item_id = processed.item.item_id, %reason, "[DISPATCH] Publish failed"),
        }
        DestinationOutcome {
            destination: destination.clone(),
            result,
        }
    }

    /// Records the item's outcome. Returns whether the watermark moved.
    async fn settle(&self, binding: &BindingId, item_id: ItemId, succeeded: bool) -> bool {
        let lock = self.settle_lock(binding);
        let _guard = lock.lock().await;

        let settlement = self.batches.settle(binding, item_id, succeeded);
        let mut advanced = false;
        if let Some(to) = settlement.advance_to {
            match self.state.advance(binding, to).await {
                Ok(Advance::Advanced { .. }) => advanced = true,
                Ok(Advance::Unchanged) => {}
                Err(e) => error!(binding = %binding, item_id, error = %e, "[DISPATCH][ERROR] Watermark not advanced"),
            }
        }
        if settlement.complete {
            self.batches.release(binding);
        }
        advanced
    }

    fn settle_lock(&self, binding: &BindingId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.settle_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(binding.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    async fn abandon(&self, abandoned: &ProcessingAbandoned) {
        let item = &abandoned.item;
        warn!(
            binding = %item.binding_id,
            item_id = item.item_id,
            reason = %abandoned.reason,
            "[DISPATCH] Item abandoned before publishing"
        );
        self.settle(&item.binding_id, item.item_id, false).await;
    }
}

#[async_trait]
impl EventHandler for Dispatcher {
    fn name(&self) -> &str {
        "dispatcher"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match event.payload() {
            EventPayload::ItemProcessed(processed) => {
                let report = self.dispatch(processed).await;
                self.bus
                    .publish(Event::new(EventPayload::PublishCompleted(report)));
            }
            EventPayload::ItemProcessingFailed(abandoned) => self.abandon(abandoned).await,
            _ => {}
        }
        Ok(())
    }
}
