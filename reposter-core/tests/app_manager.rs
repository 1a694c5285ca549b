use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::tempdir;
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, Registry};

use reposter_core::app::{Adapters, AppManager};
use reposter_core::binding::SourceDescriptor;
use reposter_core::config::{AppSection, BindingSection, RetrySection, Settings};
use reposter_core::contract::{MockAcquirer, MockFetcher, MockPublisher};
use reposter_core::dispatcher::Publishers;
use reposter_core::error::ConfigError;
use reposter_core::health::HealthStatus;

/// Collects the debug rendering of every emitted tracing event.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.events.lock().unwrap().push(format!("{:?}", event));
    }
}

fn settings(state_file: &Path, bindings: Vec<BindingSection>) -> Settings {
    Settings {
        app: AppSection {
            state_file: state_file.to_path_buf(),
            check_interval_seconds: 600,
            health_check_interval_seconds: 3600,
            ..AppSection::default()
        },
        retries: RetrySection::default(),
        bindings,
    }
}

fn club_section() -> BindingSection {
    BindingSection {
        source: SourceDescriptor {
            domain: "club1".into(),
            feed: "wall".into(),
            max_count: 10,
        },
        channels: vec!["@news".into()],
        blog: None,
    }
}

fn counting_adapters(fetches: Arc<AtomicUsize>) -> Adapters {
    let mut fetcher = MockFetcher::new();
    fetcher.expect_fetch().returning(move |_, _, _| {
        fetches.fetch_add(1, Ordering::SeqCst);
        Ok(vec![])
    });
    Adapters {
        fetcher: Arc::new(fetcher),
        acquirer: Arc::new(MockAcquirer::new()),
        publishers: Publishers::new().with_channel(Arc::new(MockPublisher::new())),
    }
}

#[tokio::test(start_paused = true)]
async fn started_app_checks_immediately_periodically_and_on_demand() {
    let dir = tempdir().unwrap();
    let fetches = Arc::new(AtomicUsize::new(0));
    let app = AppManager::new(
        settings(&dir.path().join("state.yaml"), vec![club_section()]),
        counting_adapters(fetches.clone()),
    )
    .unwrap()
    .start()
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    app.settle().await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1, "Startup check");

    assert!(app.trigger_check());
    tokio::time::sleep(Duration::from_secs(1)).await;
    app.settle().await;
    assert_eq!(fetches.load(Ordering::SeqCst), 2, "Manual check");

    tokio::time::sleep(Duration::from_secs(600)).await;
    app.settle().await;
    assert_eq!(fetches.load(Ordering::SeqCst), 3, "Periodic check at 600s");

    assert!(app.shutdown().await);
}

#[tokio::test]
async fn health_check_request_logs_every_binding() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Registry::default().with(EventCollector {
        events: events.clone(),
    });
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = tempdir().unwrap();
    let app = AppManager::new(
        settings(&dir.path().join("state.yaml"), vec![club_section()]),
        counting_adapters(Arc::new(AtomicUsize::new(0))),
    )
    .unwrap()
    .start_once()
    .await
    .unwrap();
    app.settle().await;

    app.request_health_check();
    app.settle().await;

    let health = app.health();
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].status, HealthStatus::Healthy);
    assert!(app.shutdown().await);

    let events = events.lock().unwrap();
    assert!(
        events.iter().any(|e| e.contains("[HEALTH] Binding status")),
        "Expected a health line per binding, got: {events:?}"
    );
    assert!(events.iter().any(|e| e.contains("[APP] Started")));
}

#[tokio::test]
async fn invalid_settings_are_rejected_before_starting() {
    let dir = tempdir().unwrap();
    let mut section = club_section();
    section.channels = vec!["not a channel".into()];

    let result = AppManager::new(
        settings(&dir.path().join("state.yaml"), vec![section]),
        counting_adapters(Arc::new(AtomicUsize::new(0))),
    );

    assert!(matches!(result, Err(ConfigError::InvalidChannelId { .. })));
}

#[tokio::test]
async fn unreadable_state_file_fails_startup() {
    let dir = tempdir().unwrap();
    let state_file = dir.path().join("state.yaml");
    std::fs::write(&state_file, "[[[").unwrap();

    let result = AppManager::new(
        settings(&state_file, vec![club_section()]),
        counting_adapters(Arc::new(AtomicUsize::new(0))),
    )
    .unwrap()
    .start()
    .await;

    let err = result.err().expect("Startup must fail");
    assert!(format!("{err:#}").contains("loading the watermark state"));
}
