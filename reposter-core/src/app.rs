//! Process lifecycle: wiring the stages onto the bus, starting, and draining.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binding::Binding;
use crate::bus::{EventBus, EventHandler};
use crate::config::Settings;
use crate::contract::{Acquirer, Fetcher};
use crate::dispatcher::{Dispatcher, Publishers};
use crate::error::ConfigError;
use crate::event::{CheckOrigin, Event, EventKind, EventPayload};
use crate::health::{BindingHealth, HealthMonitor};
use crate::pipeline::{BatchTracker, FetchStage};
use crate::processor::{Processor, RetryPolicy};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::state::StateStore;

/// The external collaborators the engine drives.
#[derive(Clone)]
pub struct Adapters {
    pub fetcher: Arc<dyn Fetcher>,
    pub acquirer: Arc<dyn Acquirer>,
    pub publishers: Publishers,
}

pub struct AppManager {
    settings: Settings,
    bindings: Vec<Binding>,
    adapters: Adapters,
}

impl AppManager {
    /// Validates `settings` and prepares the engine; nothing runs until started.
    pub fn new(settings: Settings, adapters: Adapters) -> Result<Self, ConfigError> {
        let bindings = settings.bindings()?;
        Ok(Self {
            settings,
            bindings,
            adapters,
        })
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Starts the engine with the periodic scheduler and health ticker.
    ///
    /// The first check fires immediately.
    pub async fn start(self) -> anyhow::Result<RunningApp> {
        let check_interval = self.settings.app.check_interval();
        let health_interval = self.settings.app.health_check_interval();
        let mut app = self.wire().await?;
        app.scheduler = Some(Scheduler::new(check_interval, app.bus.clone()).start());
        app.health_ticker = Some(spawn_health_ticker(
            health_interval,
            app.bus.clone(),
            app.shutdown.clone(),
        ));
        Ok(app)
    }

    /// Starts the engine for a single check, without any timers.
    pub async fn start_once(self) -> anyhow::Result<RunningApp> {
        let app = self.wire().await?;
        app.bus
            .publish(Event::new(EventPayload::CheckRequested(CheckOrigin::Manual)));
        Ok(app)
    }

    async fn wire(self) -> anyhow::Result<RunningApp> {
        let AppManager {
            settings,
            bindings,
            adapters,
        } = self;
        let state = Arc::new(
            StateStore::load(&settings.app.state_file)
                .await
                .context("loading the watermark state")?,
        );
        let bus = EventBus::new();
        let shutdown = CancellationToken::new();
        let batches = Arc::new(BatchTracker::new());
        let health = Arc::new(HealthMonitor::new(
            bindings.iter().map(|binding| binding.id().clone()),
            settings.app.check_interval(),
            settings.app.health_missed_cycles,
        ));

        bus.subscribe(
            &[EventKind::AppStart, EventKind::AppStop],
            Arc::new(LifecycleLogger {
                bindings: bindings.len(),
                state: Arc::clone(&state),
            }),
        );
        bus.subscribe(
            &[EventKind::CheckRequested],
            Arc::new(FetchStage::new(
                bindings.clone(),
                adapters.fetcher,
                Arc::clone(&state),
                Arc::clone(&batches),
                Arc::clone(&health),
                bus.clone(),
                shutdown.clone(),
            )),
        );
        bus.subscribe(
            &[EventKind::ItemsDiscovered],
            Arc::new(Processor::new(
                adapters.acquirer,
                RetryPolicy::from(&settings.retries),
                bus.clone(),
                bus.abandon_token(),
            )),
        );
        bus.subscribe(
            &[EventKind::ItemProcessed, EventKind::ItemProcessingFailed],
            Arc::new(Dispatcher::new(
                bindings,
                adapters.publishers,
                Arc::clone(&state),
                batches,
                bus.clone(),
                settings.app.cleanup_artifacts,
            )),
        );
        bus.subscribe(
            &[EventKind::PublishCompleted, EventKind::HealthCheckRequested],
            Arc::clone(&health) as Arc<dyn EventHandler>,
        );

        bus.publish(Event::new(EventPayload::AppStart));
        Ok(RunningApp {
            bus,
            state,
            health,
            scheduler: None,
            health_ticker: None,
            shutdown,
            grace: settings.app.shutdown_grace(),
        })
    }
}

fn spawn_health_ticker(
    period: Duration,
    bus: EventBus,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("[HEALTH] Periodic health check due");
                    bus.publish(Event::new(EventPayload::HealthCheckRequested));
                }
            }
        }
    })
}

struct LifecycleLogger {
    bindings: usize,
    state: Arc<StateStore>,
}

#[async_trait]
impl EventHandler for LifecycleLogger {
    fn name(&self) -> &str {
        "lifecycle"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match event.payload() {
            EventPayload::AppStart => info!(
                bindings = self.bindings,
                watermarks = ?self.state.snapshot(),
                state_file = %self.state.path().display(),
                "[APP] Started"
            ),
            EventPayload::AppStop => info!("[APP] Stop requested, no new checks are accepted"),
            _ => {}
        }
        Ok(())
    }
}

/// Handle to a started engine.
pub struct RunningApp {
    bus: EventBus,
    state: Arc<StateStore>,
    health: Arc<HealthMonitor>,
    scheduler: Option<SchedulerHandle>,
    health_ticker: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    grace: Duration,
}

impl RunningApp {
    /// Requests an immediate check. Returns `false` once shutdown has begun.
    pub fn trigger_check(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match &self.scheduler {
            Some(scheduler) => scheduler.trigger_now(),
            None => {
                self.bus
                    .publish(Event::new(EventPayload::CheckRequested(CheckOrigin::Manual)));
                true
            }
        }
    }

    pub fn request_health_check(&self) {
        self.bus.publish(Event::new(EventPayload::HealthCheckRequested));
    }

    pub fn health(&self) -> Vec<BindingHealth> {
        self.health.report()
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Waits until every pipeline started so far has settled.
    pub async fn settle(&self) {
        self.bus.wait_idle().await;
    }

    /// Stops accepting checks and drains in-flight work up to the grace period.
    ///
    /// Items already discovered keep being processed and published while the
    /// grace period lasts.
    ///
    /// Returns `true` when nothing had to be abandoned.
    pub async fn shutdown(mut self) -> bool {
        info!(grace_secs = self.grace.as_secs(), "[APP] Shutting down");
        self.bus.publish(Event::new(EventPayload::AppStop));
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.join().await;
        }
        self.shutdown.cancel();
        if let Some(ticker) = self.health_ticker.take() {
            let _ = ticker.await;
        }
        let drained = self.bus.drain(self.grace).await;
        if drained {
            info!("[APP] Stopped");
        } else {
            warn!("[APP] Stopped with abandoned work, it is picked up again on the next run");
        }
        drained
    }

    /// Runs until `signal` resolves, then shuts down.
    pub async fn run_until(self, signal: impl std::future::Future<Output = ()>) -> bool {
        signal.await;
        self.shutdown().await
    }
}
