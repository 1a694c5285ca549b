//! Produces `CheckRequested` events from a fixed-interval timer and from manual triggers.
//!
//! Both paths feed one loop: the timer ticks on a fixed grid (`start + k * period`,
//! the first tick at start), manual triggers arrive over a command channel. A manual
//! trigger publishes immediately and leaves the grid alone, so the next periodic
//! check still happens at its originally scheduled time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::bus::EventBus;
use crate::event::{CheckOrigin, Event, EventPayload};

const MIN_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Command {
    Trigger,
    Stop,
}

#[derive(Debug)]
pub struct Scheduler {
    period: Duration,
    bus: EventBus,
}

impl Scheduler {
    /// Periods shorter than one second are raised to one second.
    pub fn new(period: Duration, bus: EventBus) -> Self {
        Self {
            period: period.max(MIN_PERIOD),
            bus,
        }
    }

    /// Arms the timer and returns the handle used to trigger or stop it.
    pub fn start(self) -> SchedulerHandle {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let Scheduler { period, bus } = self;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_secs = period.as_secs(), "[SCHEDULER] Timer armed");
            loop {
                tokio::select! {
                    biased;
                    command = rx.recv() => match command {
                        Some(Command::Trigger) => {
                            info!("[SCHEDULER] Manual check requested");
                            bus.publish(Event::new(EventPayload::CheckRequested(CheckOrigin::Manual)));
                        }
                        Some(Command::Stop) | None => break,
                    },
                    _ = ticker.tick() => {
                        debug!("[SCHEDULER] Periodic check due");
                        bus.publish(Event::new(EventPayload::CheckRequested(CheckOrigin::Periodic)));
                    }
                }
            }
            info!("[SCHEDULER] Timer disarmed");
        });

        SchedulerHandle {
            commands,
            stopped,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        }
    }
}

/// Cloneable control handle of a running [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    stopped: Arc<AtomicBool>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    /// Requests an immediate check. Returns `false` once the scheduler is stopped.
    pub fn trigger_now(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            debug!("[SCHEDULER] Ignoring manual trigger after stop");
            return false;
        }
        self.commands.send(Command::Trigger).is_ok()
    }

    /// Disarms the timer. Later triggers are refused.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.commands.send(Command::Stop);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops the scheduler and waits for its task to exit.
    pub async fn join(&self) {
        self.stop();
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
