//! Resolves the media references of discovered items into local artifacts.
//!
//! Items already discovered keep processing through shutdown. Only the expiry of
//! the shutdown grace period cuts them off.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, EventHandler};
use crate::config::RetrySection;
use crate::contract::{
    discard_all, AcquireError, Acquirer, Artifact, Item, MediaFailure, MediaRef, ProcessedItem,
};
use crate::event::{Event, EventPayload, ProcessingAbandoned};
use crate::text::normalize_links;

/// Bounded retry settings for one media reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub delay: Duration,
    pub restart_cooldown: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, restart_cooldown: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            restart_cooldown,
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self::new(
            section.count,
            Duration::from_secs(section.delay_seconds),
            Duration::from_secs(section.restart_cooldown_seconds),
        )
    }
}

/// The shutdown grace period ran out before the item was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("processing abandoned when the shutdown grace period expired")]
pub struct Cancelled;

enum Acquisition {
    Acquired(Artifact),
    Failed(MediaFailure),
}

pub struct Processor {
    acquirer: Arc<dyn Acquirer>,
    policy: RetryPolicy,
    bus: EventBus,
    /// Cancelled when in-flight work is given up, see [`EventBus::abandon_token`].
    grace_expired: CancellationToken,
}

impl Processor {
    pub fn new(
        acquirer: Arc<dyn Acquirer>,
        policy: RetryPolicy,
        bus: EventBus,
        grace_expired: CancellationToken,
    ) -> Self {
        Self {
            acquirer,
            policy,
            bus,
            grace_expired,
        }
    }

    /// Acquires every media reference of `item`, in order.
    ///
    /// A reference that cannot be acquired is recorded in `processing_errors` and the
    /// rest still proceed. Only an expired grace period aborts an item. The text has
    /// its VK link markup rewritten.
    pub async fn process_item(&self, item: &Item) -> Result<ProcessedItem, Cancelled> {
        let mut artifacts = Vec::with_capacity(item.media.len());
        let mut processing_errors = Vec::new();
        for media in &item.media {
            match self.acquire_with_retry(media).await {
                Ok(Acquisition::Acquired(artifact)) => artifacts.push(artifact),
                Ok(Acquisition::Failed(failure)) => {
                    warn!(
                        binding = %item.binding_id,
                        item_id = item.item_id,
                        url = %failure.media.url,
                        attempts = failure.attempts,
                        reason = %failure.reason,
                        "[PROCESS] Media could not be acquired"
                    );
                    processing_errors.push(failure);
                }
                Err(Cancelled) => {
                    discard_all(&artifacts).await;
                    return Err(Cancelled);
                }
            }
        }
        Ok(ProcessedItem {
            item: Item {
                text: normalize_links(&item.text),
                ..item.clone()
            },
            artifacts,
            processing_errors,
        })
    }

    async fn acquire_with_retry(&self, media: &MediaRef) -> Result<Acquisition, Cancelled> {
        let max = self.policy.max_attempts;
        let mut reason = String::new();
        for attempt in 1..=max {
            debug!(url = %media.url, attempt, max, "[PROCESS] Acquiring media");
            let attempt_result = AssertUnwindSafe(async { self.acquirer.acquire(media).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(url = %media.url, attempt, "[PROCESS][ERROR] Acquirer panicked");
                    Err(AcquireError::Retryable("acquirer panicked".to_string()))
                });
            let wait = match attempt_result {
                Ok(artifact) => return Ok(Acquisition::Acquired(artifact)),
                Err(e @ AcquireError::Unsupported(_)) => {
                    return Ok(Acquisition::Failed(MediaFailure {
                        media: media.clone(),
                        attempts: attempt,
                        reason: e.to_string(),
                    }));
                }
                Err(e @ AcquireError::RestartRequired(_)) => {
                    reason = e.to_string();
                    warn!(url = %media.url, attempt, error = %e, "[PROCESS] Acquisition tool needs a restart");
                    match AssertUnwindSafe(async { self.acquirer.restart().await })
                        .catch_unwind()
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(restart)) => {
                            error!(error = %restart, "[PROCESS][ERROR] Restarting the acquisition tool failed")
                        }
                        Err(_) => error!("[PROCESS][ERROR] Restarting the acquisition tool panicked"),
                    }
                    self.policy.restart_cooldown
                }
                Err(e @ AcquireError::Retryable(_)) => {
                    reason = e.to_string();
                    warn!(url = %media.url, attempt, max, error = %e, "[PROCESS] Acquisition attempt failed");
                    self.policy.delay
                }
            };
            if attempt < max {
                self.pause(wait).await?;
            }
        }
        Ok(Acquisition::Failed(MediaFailure {
            media: media.clone(),
            attempts: max,
            reason,
        }))
    }

    async fn pause(&self, wait: Duration) -> Result<(), Cancelled> {
        tokio::select! {
            _ = self.grace_expired.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    fn abandon(&self, item: &Item, reason: &str) {
        warn!(binding = %item.binding_id, item_id = item.item_id, %reason, "[PROCESS] Item abandoned");
        self.bus
            .publish(Event::new(EventPayload::ItemProcessingFailed(ProcessingAbandoned {
                item: item.clone(),
                reason: reason.to_string(),
            })));
    }
}

#[async_trait]
impl EventHandler for Processor {
    fn name(&self) -> &str {
        "processor"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let EventPayload::ItemsDiscovered(batch) = event.payload() else {
            return Ok(());
        };
        info!(binding = %batch.binding_id, items = batch.items.len(), "[PROCESS] Processing batch");
        for item in &batch.items {
            if self.grace_expired.is_cancelled() {
                self.abandon(item, &Cancelled.to_string());
                continue;
            }
            match self.process_item(item).await {
                Ok(processed) => {
                    info!(
                        binding = %item.binding_id,
                        item_id = item.item_id,
                        artifacts = processed.artifacts.len(),
                        failures = processed.processing_errors.len(),
                        "[PROCESS] Item processed"
                    );
                    self.bus
                        .publish(Event::new(EventPayload::ItemProcessed(processed)));
                }
                Err(e) => self.abandon(item, &e.to_string()),
            }
        }
        Ok(())
    }
}
