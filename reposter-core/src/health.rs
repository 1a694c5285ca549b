//! Per-binding health aggregation.
//!
//! A binding is healthy while it keeps completing successful cycles: either a fully
//! successful dispatch or a check that found nothing new. A binding that has gone
//! `missed_cycles` check intervals without one is degraded. A binding whose source
//! rejected its credentials stays disabled until the process is restarted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::binding::BindingId;
use crate::bus::EventHandler;
use crate::event::{Event, EventPayload, PublishReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// No successful cycle yet, still within the allowed window.
    Pending,
    Healthy,
    Degraded,
    Disabled { reason: String },
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Pending => f.write_str("pending"),
            HealthStatus::Healthy => f.write_str("healthy"),
            HealthStatus::Degraded => f.write_str("degraded"),
            HealthStatus::Disabled { reason } => write!(f, "disabled ({reason})"),
        }
    }
}

/// Snapshot of one binding's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingHealth {
    pub binding_id: BindingId,
    pub status: HealthStatus,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct Entry {
    last_success: Option<(Instant, DateTime<Utc>)>,
    last_failure: Option<String>,
    consecutive_failures: u32,
    disabled: Option<String>,
}

#[derive(Debug)]
pub struct HealthMonitor {
    /// Longest allowed gap between successful cycles.
    window: Duration,
    started: Instant,
    entries: Mutex<BTreeMap<BindingId, Entry>>,
}

impl HealthMonitor {
    pub fn new(
        bindings: impl IntoIterator<Item = BindingId>,
        check_interval: Duration,
        missed_cycles: u32,
    ) -> Self {
        Self {
            window: check_interval.saturating_mul(missed_cycles.max(1)),
            started: Instant::now(),
            entries: Mutex::new(bindings.into_iter().map(|id| (id, Entry::default())).collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<BindingId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_success(&self, binding: &BindingId) {
        let mut entries = self.lock();
        let entry = entries.entry(binding.clone()).or_default();
        entry.last_success = Some((Instant::now(), Utc::now()));
        entry.consecutive_failures = 0;
    }

    pub fn record_failure(&self, binding: &BindingId, reason: &str) {
        let mut entries = self.lock();
        let entry = entries.entry(binding.clone()).or_default();
        entry.last_failure = Some(reason.to_string());
        entry.consecutive_failures += 1;
    }

    /// Disables `binding` for the rest of the process lifetime.
    pub fn disable(&self, binding: &BindingId, reason: &str) {
        let mut entries = self.lock();
        let entry = entries.entry(binding.clone()).or_default();
        entry.last_failure = Some(reason.to_string());
        entry.disabled = Some(reason.to_string());
    }

    pub fn is_disabled(&self, binding: &BindingId) -> bool {
        self.lock()
            .get(binding)
            .is_some_and(|entry| entry.disabled.is_some())
    }

    pub fn status(&self, binding: &BindingId) -> HealthStatus {
        let now = Instant::now();
        self.lock()
            .get(binding)
            .map(|entry| self.status_of(entry, now))
            .unwrap_or(HealthStatus::Pending)
    }

    fn status_of(&self, entry: &Entry, now: Instant) -> HealthStatus {
        if let Some(reason) = &entry.disabled {
            return HealthStatus::Disabled {
                reason: reason.clone(),
            };
        }
        let reference = entry.last_success.map(|(at, _)| at);
        let overdue = now.duration_since(reference.unwrap_or(self.started)) > self.window;
        match (reference, overdue) {
            (_, true) => HealthStatus::Degraded,
            (Some(_), false) => HealthStatus::Healthy,
            (None, false) => HealthStatus::Pending,
        }
    }

    /// Current health of every known binding, ordered by binding id.
    pub fn report(&self) -> Vec<BindingHealth> {
        let now = Instant::now();
        self.lock()
            .iter()
            .map(|(id, entry)| BindingHealth {
                binding_id: id.clone(),
                status: self.status_of(entry, now),
                last_success: entry.last_success.map(|(_, at)| at),
                last_failure: entry.last_failure.clone(),
                consecutive_failures: entry.consecutive_failures,
            })
            .collect()
    }

    /// Only a dispatch that moved the watermark counts as progress.
    fn observe(&self, report: &PublishReport) {
        if report.all_succeeded() && report.watermark_advanced {
            self.record_success(&report.binding_id);
            return;
        }
        let reason = if report.outcomes.is_empty() {
            "item reached no destination".to_string()
        } else if report.all_succeeded() {
            format!(
                "item {} published but held behind an earlier failed item",
                report.item_id
            )
        } else {
            report
                .failures()
                .map(|outcome| match &outcome.result {
                    Err(reason) => format!("{}: {reason}", outcome.destination),
                    Ok(()) => outcome.destination.to_string(),
                })
                .collect::<Vec<_>>()
                .join("; ")
        };
        self.record_failure(&report.binding_id, &reason);
    }

    fn log_report(&self) {
        for health in self.report() {
            let last_success = health
                .last_success
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            match health.status {
                HealthStatus::Healthy | HealthStatus::Pending => info!(
                    binding = %health.binding_id,
                    status = %health.status,
                    %last_success,
                    "[HEALTH] Binding status"
                ),
                _ => warn!(
                    binding = %health.binding_id,
                    status = %health.status,
                    %last_success,
                    last_failure = health.last_failure.as_deref().unwrap_or(""),
                    consecutive_failures = health.consecutive_failures,
                    "[HEALTH] Binding needs attention"
                ),
            }
        }
    }
}

#[async_trait]
impl EventHandler for HealthMonitor {
    fn name(&self) -> &str {
        "health"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match event.payload() {
            EventPayload::PublishCompleted(report) => self.observe(report),
            EventPayload::HealthCheckRequested => self.log_report(),
            _ => {}
        }
        Ok(())
    }
}
