use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use reposter_core::binding::BindingId;
use reposter_core::bus::{EventBus, EventHandler};
use reposter_core::contract::Item;
use reposter_core::event::{DiscoveredBatch, Event, EventKind, EventPayload};

fn discovered(binding: &str, item_id: u64) -> Event {
    let binding_id = BindingId::new(binding);
    Event::new(EventPayload::ItemsDiscovered(DiscoveredBatch {
        binding_id: binding_id.clone(),
        items: vec![Item {
            binding_id,
            item_id,
            text: format!("post {item_id}"),
            media: vec![],
        }],
    }))
}

fn label(event: &Event) -> String {
    match event.payload() {
        EventPayload::ItemsDiscovered(batch) => {
            format!("{}#{}", batch.binding_id, batch.items[0].item_id)
        }
        other => format!("{:?}", other.kind()),
    }
}

/// Records every event it sees as `name:label`.
struct Recorder {
    name: &'static str,
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, label(event)));
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl EventHandler for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
        anyhow::bail!("handler exploded")
    }
}

struct Panicking;

#[async_trait]
impl EventHandler for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
        panic!("handler panicked on purpose");
    }
}

/// Blocks events of one binding until the gate opens, signals the rest.
struct Gated {
    blocked_binding: &'static str,
    gate: Arc<Notify>,
    passed: Arc<Notify>,
}

#[async_trait]
impl EventHandler for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let blocked = event
            .binding_id()
            .is_some_and(|id| id.as_str() == self.blocked_binding);
        if blocked {
            self.gate.notified().await;
        } else {
            self.passed.notify_one();
        }
        Ok(())
    }
}

struct Stuck;

#[async_trait]
impl EventHandler for Stuck {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn handlers_run_in_subscription_order_and_events_in_publish_order() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        bus.subscribe(
            &[EventKind::ItemsDiscovered],
            Arc::new(Recorder {
                name,
                seen: seen.clone(),
            }),
        );
    }

    for id in 1..=4 {
        bus.publish(discovered("club1/wall", id));
    }
    bus.wait_idle().await;

    let expected: Vec<String> = (1..=4)
        .flat_map(|id| {
            [
                format!("first:club1/wall#{id}"),
                format!("second:club1/wall#{id}"),
            ]
        })
        .collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[tokio::test]
async fn failing_and_panicking_handlers_do_not_stop_delivery() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(&[EventKind::ItemsDiscovered], Arc::new(Failing));
    bus.subscribe(&[EventKind::ItemsDiscovered], Arc::new(Panicking));
    bus.subscribe(
        &[EventKind::ItemsDiscovered],
        Arc::new(Recorder {
            name: "after",
            seen: seen.clone(),
        }),
    );

    bus.publish(discovered("club1/wall", 1));
    bus.publish(discovered("club1/wall", 2));
    bus.wait_idle().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["after:club1/wall#1", "after:club1/wall#2"],
        "Handlers after a failing one must still see every event"
    );
}

#[tokio::test]
async fn publish_returns_while_handler_is_still_running() {
    let bus = EventBus::new();
    let gate = Arc::new(Notify::new());
    bus.subscribe(
        &[EventKind::ItemsDiscovered],
        Arc::new(Gated {
            blocked_binding: "slow/wall",
            gate: gate.clone(),
            passed: Arc::new(Notify::new()),
        }),
    );

    bus.publish(discovered("slow/wall", 1));
    assert_eq!(bus.outstanding(), 1, "Delivery should still be pending");

    gate.notify_one();
    tokio::time::timeout(Duration::from_secs(5), bus.wait_idle())
        .await
        .expect("Bus should become idle once the handler finishes");
    assert_eq!(bus.outstanding(), 0);
}

#[tokio::test]
async fn blocked_binding_does_not_hold_up_another_binding() {
    let bus = EventBus::new();
    let gate = Arc::new(Notify::new());
    let passed = Arc::new(Notify::new());
    bus.subscribe(
        &[EventKind::ItemsDiscovered],
        Arc::new(Gated {
            blocked_binding: "slow/wall",
            gate: gate.clone(),
            passed: passed.clone(),
        }),
    );

    bus.publish(discovered("slow/wall", 1));
    bus.publish(discovered("fast/wall", 1));

    tokio::time::timeout(Duration::from_secs(5), passed.notified())
        .await
        .expect("The fast binding must be handled while the slow one is blocked");

    gate.notify_one();
    bus.wait_idle().await;
}

#[tokio::test]
async fn late_subscribers_do_not_see_earlier_events() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(
        &[EventKind::HealthCheckRequested],
        Arc::new(Recorder {
            name: "early",
            seen: seen.clone(),
        }),
    );
    bus.publish(Event::new(EventPayload::HealthCheckRequested));
    bus.wait_idle().await;

    bus.subscribe(
        &[EventKind::HealthCheckRequested],
        Arc::new(Recorder {
            name: "late",
            seen: seen.clone(),
        }),
    );
    bus.publish(Event::new(EventPayload::HealthCheckRequested));
    bus.wait_idle().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            "early:HealthCheckRequested",
            "early:HealthCheckRequested",
            "late:HealthCheckRequested"
        ]
    );
}

#[tokio::test]
async fn events_without_subscribers_are_dropped() {
    let bus = EventBus::new();
    bus.publish(Event::new(EventPayload::AppStart));
    assert_eq!(bus.outstanding(), 0);
    bus.wait_idle().await;
}

#[tokio::test(start_paused = true)]
async fn drain_abandons_deliveries_that_outlive_the_grace_period() {
    let bus = EventBus::new();
    bus.subscribe(&[EventKind::ItemsDiscovered], Arc::new(Stuck));
    bus.publish(discovered("club1/wall", 1));
    bus.publish(discovered("club1/wall", 2));

    let drained = bus.drain(Duration::from_secs(30)).await;

    assert!(!drained, "Stuck deliveries cannot drain");
    assert!(bus.is_closed());
    assert_eq!(bus.outstanding(), 0, "Abandoned deliveries are settled");

    bus.publish(discovered("club1/wall", 3));
    assert_eq!(bus.outstanding(), 0, "A closed bus drops new events");
}

#[tokio::test]
async fn drain_completes_when_everything_settles() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(
        &[EventKind::ItemsDiscovered],
        Arc::new(Recorder {
            name: "rec",
            seen: seen.clone(),
        }),
    );
    bus.publish(discovered("club1/wall", 1));

    assert!(bus.drain(Duration::from_secs(5)).await);
    assert_eq!(seen.lock().unwrap().len(), 1);
}
