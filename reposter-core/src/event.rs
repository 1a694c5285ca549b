//! Events exchanged over the [`EventBus`](crate::bus::EventBus).

use std::fmt;

use chrono::{DateTime, Utc};

use crate::binding::{BindingId, Destination};
use crate::contract::{Item, ItemId, ProcessedItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    AppStart,
    AppStop,
    CheckRequested,
    ItemsDiscovered,
    ItemProcessed,
    ItemProcessingFailed,
    PublishCompleted,
    HealthCheckRequested,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What caused a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOrigin {
    Periodic,
    Manual,
}

/// New items of one binding, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredBatch {
    pub binding_id: BindingId,
    pub items: Vec<Item>,
}

/// An item whose processing was given up before a result existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingAbandoned {
    pub item: Item,
    pub reason: String,
}

/// Result of publishing one item to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationOutcome {
    pub destination: Destination,
    /// `Err` carries the failure reason.
    pub result: Result<(), String>,
}

/// Per-destination outcomes of one dispatched item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub binding_id: BindingId,
    pub item_id: ItemId,
    pub outcomes: Vec<DestinationOutcome>,
    /// Whether settling this item moved the binding's watermark.
    pub watermark_advanced: bool,
}

impl PublishReport {
    /// `false` when the item reached no destination at all.
    pub fn all_succeeded(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &DestinationOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.result.is_err())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    AppStart,
    AppStop,
    CheckRequested(CheckOrigin),
    ItemsDiscovered(DiscoveredBatch),
    ItemProcessed(ProcessedItem),
    ItemProcessingFailed(ProcessingAbandoned),
    PublishCompleted(PublishReport),
    HealthCheckRequested,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::AppStart => EventKind::AppStart,
            EventPayload::AppStop => EventKind::AppStop,
            EventPayload::CheckRequested(_) => EventKind::CheckRequested,
            EventPayload::ItemsDiscovered(_) => EventKind::ItemsDiscovered,
            EventPayload::ItemProcessed(_) => EventKind::ItemProcessed,
            EventPayload::ItemProcessingFailed(_) => EventKind::ItemProcessingFailed,
            EventPayload::PublishCompleted(_) => EventKind::PublishCompleted,
            EventPayload::HealthCheckRequested => EventKind::HealthCheckRequested,
        }
    }
}

/// An immutable, timestamped event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    payload: EventPayload,
    timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The binding an event belongs to, if it is binding-scoped.
    pub fn binding_id(&self) -> Option<&BindingId> {
        match &self.payload {
            EventPayload::ItemsDiscovered(batch) => Some(&batch.binding_id),
            EventPayload::ItemProcessed(processed) => Some(&processed.item.binding_id),
            EventPayload::ItemProcessingFailed(abandoned) => Some(&abandoned.item.binding_id),
            EventPayload::PublishCompleted(report) => Some(&report.binding_id),
            EventPayload::AppStart
            | EventPayload::AppStop
            | EventPayload::CheckRequested(_)
            | EventPayload::HealthCheckRequested => None,
        }
    }
}
