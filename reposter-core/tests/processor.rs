use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use reposter_core::binding::BindingId;
use reposter_core::bus::{EventBus, EventHandler};
use reposter_core::contract::{
    AcquireError, Artifact, Item, MediaKind, MediaRef, MockAcquirer,
};
use reposter_core::event::{DiscoveredBatch, Event, EventKind, EventPayload};
use reposter_core::processor::{Cancelled, Processor, RetryPolicy};

fn policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(30))
}

fn item(item_id: u64, urls: &[&str]) -> Item {
    Item {
        binding_id: BindingId::new("club1/wall"),
        item_id,
        text: format!("post {item_id}"),
        media: urls
            .iter()
            .map(|url| MediaRef::new(MediaKind::Photo, *url))
            .collect(),
    }
}

fn artifact_for(media: &MediaRef) -> Artifact {
    Artifact {
        media: media.clone(),
        path: PathBuf::from("/nonexistent/reposter-test-artifact"),
        filename: "photo.jpg".into(),
    }
}

fn processor(acquirer: MockAcquirer, grace_expired: CancellationToken) -> Processor {
    Processor::new(Arc::new(acquirer), policy(), EventBus::new(), grace_expired)
}

#[tokio::test(start_paused = true)]
async fn acquisition_is_attempted_exactly_retry_count_times() {
    let mut acquirer = MockAcquirer::new();
    acquirer
        .expect_acquire()
        .times(3)
        .returning(|_| Err(AcquireError::Retryable("connection reset".into())));
    acquirer.expect_restart().times(0);

    let started = Instant::now();
    let processed = processor(acquirer, CancellationToken::new())
        .process_item(&item(6, &["https://cdn.example/a.jpg"]))
        .await
        .expect("Retry exhaustion is not a processing abort");

    assert!(processed.artifacts.is_empty());
    assert_eq!(processed.processing_errors.len(), 1);
    assert_eq!(processed.processing_errors[0].attempts, 3);
    assert!(processed.processing_errors[0].reason.contains("connection reset"));
    assert_eq!(
        started.elapsed().as_secs(),
        20,
        "Two delays between three attempts, none after the last"
    );
}

#[tokio::test(start_paused = true)]
async fn unsupported_media_is_not_retried() {
    let mut acquirer = MockAcquirer::new();
    acquirer
        .expect_acquire()
        .times(1)
        .returning(|_| Err(AcquireError::Unsupported("ftp:// is not supported".into())));

    let started = Instant::now();
    let processed = processor(acquirer, CancellationToken::new())
        .process_item(&item(6, &["ftp://example/a.jpg"]))
        .await
        .unwrap();

    assert_eq!(processed.processing_errors[0].attempts, 1);
    assert_eq!(started.elapsed().as_secs(), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_request_restarts_the_tool_and_waits_the_cooldown() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut acquirer = MockAcquirer::new();
    let counter = calls.clone();
    acquirer.expect_acquire().times(2).returning(move |media| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(AcquireError::RestartRequired("browser session expired".into()))
        } else {
            Ok(artifact_for(media))
        }
    });
    acquirer.expect_restart().times(1).returning(|| Ok(()));

    let started = Instant::now();
    let processed = processor(acquirer, CancellationToken::new())
        .process_item(&item(6, &["https://vk.com/video1_2"]))
        .await
        .unwrap();

    assert_eq!(processed.artifacts.len(), 1);
    assert!(processed.processing_errors.is_empty());
    assert_eq!(started.elapsed().as_secs(), 30);
}

#[tokio::test(start_paused = true)]
async fn one_failed_reference_does_not_abort_the_item() {
    let mut acquirer = MockAcquirer::new();
    acquirer.expect_acquire().returning(|media| {
        if media.url.ends_with("broken.jpg") {
            Err(AcquireError::Unsupported("gone".into()))
        } else {
            Ok(artifact_for(media))
        }
    });

    let processed = processor(acquirer, CancellationToken::new())
        .process_item(&item(
            6,
            &[
                "https://cdn.example/first.jpg",
                "https://cdn.example/broken.jpg",
                "https://cdn.example/third.jpg",
            ],
        ))
        .await
        .unwrap();

    let urls: Vec<&str> = processed
        .artifacts
        .iter()
        .map(|a| a.media.url.as_str())
        .collect();
    assert_eq!(
        urls,
        vec!["https://cdn.example/first.jpg", "https://cdn.example/third.jpg"]
    );
    assert_eq!(processed.processing_errors.len(), 1);
    assert_eq!(
        processed.processing_errors[0].media.url,
        "https://cdn.example/broken.jpg"
    );
}

#[tokio::test]
async fn item_without_media_processes_trivially() {
    let mut acquirer = MockAcquirer::new();
    acquirer.expect_acquire().times(0);

    let processed = processor(acquirer, CancellationToken::new())
        .process_item(&item(6, &[]))
        .await
        .unwrap();

    assert!(processed.artifacts.is_empty());
    assert!(processed.processing_errors.is_empty());
    assert_eq!(processed.item.item_id, 6);
}

#[tokio::test(start_paused = true)]
async fn grace_expiry_cancels_an_item_waiting_to_retry() {
    let mut acquirer = MockAcquirer::new();
    acquirer
        .expect_acquire()
        .times(1)
        .returning(|_| Err(AcquireError::Retryable("timeout".into())));
    let grace_expired = CancellationToken::new();
    grace_expired.cancel();

    let result = processor(acquirer, grace_expired)
        .process_item(&item(6, &["https://cdn.example/a.jpg"]))
        .await;

    assert_eq!(result.unwrap_err(), Cancelled);
}

struct Collector {
    seen: Arc<Mutex<Vec<(EventKind, u64)>>>,
}

#[async_trait]
impl EventHandler for Collector {
    fn name(&self) -> &str {
        "collector"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let item_id = match event.payload() {
            EventPayload::ItemProcessed(processed) => processed.item.item_id,
            EventPayload::ItemProcessingFailed(abandoned) => abandoned.item.item_id,
            _ => return Ok(()),
        };
        self.seen.lock().unwrap().push((event.kind(), item_id));
        Ok(())
    }
}

#[tokio::test]
async fn discovered_batch_yields_one_processed_event_per_item_in_order() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut acquirer = MockAcquirer::new();
    acquirer
        .expect_acquire()
        .returning(|media| Ok(artifact_for(media)));

    bus.subscribe(
        &[EventKind::ItemsDiscovered],
        Arc::new(Processor::new(
            Arc::new(acquirer),
            policy(),
            bus.clone(),
            CancellationToken::new(),
        )),
    );
    bus.subscribe(
        &[EventKind::ItemProcessed, EventKind::ItemProcessingFailed],
        Arc::new(Collector { seen: seen.clone() }),
    );

    bus.publish(Event::new(EventPayload::ItemsDiscovered(DiscoveredBatch {
        binding_id: BindingId::new("club1/wall"),
        items: vec![
            item(6, &["https://cdn.example/6.jpg"]),
            item(7, &[]),
            item(8, &["https://cdn.example/8a.jpg", "https://cdn.example/8b.jpg"]),
        ],
    })));
    bus.wait_idle().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (EventKind::ItemProcessed, 6),
            (EventKind::ItemProcessed, 7),
            (EventKind::ItemProcessed, 8),
        ]
    );
}

#[tokio::test]
async fn batch_arriving_after_grace_expiry_is_abandoned() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut acquirer = MockAcquirer::new();
    acquirer.expect_acquire().times(0);
    let grace_expired = CancellationToken::new();
    grace_expired.cancel();

    bus.subscribe(
        &[EventKind::ItemsDiscovered],
        Arc::new(Processor::new(Arc::new(acquirer), policy(), bus.clone(), grace_expired)),
    );
    bus.subscribe(
        &[EventKind::ItemProcessed, EventKind::ItemProcessingFailed],
        Arc::new(Collector { seen: seen.clone() }),
    );

    bus.publish(Event::new(EventPayload::ItemsDiscovered(DiscoveredBatch {
        binding_id: BindingId::new("club1/wall"),
        items: vec![item(6, &["https://cdn.example/6.jpg"]), item(7, &[])],
    })));
    bus.wait_idle().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (EventKind::ItemProcessingFailed, 6),
            (EventKind::ItemProcessingFailed, 7),
        ]
    );
}

/// Panics on its first call, then succeeds.
struct PanicsOnFirstAcquire {
    calls: AtomicU32,
}

#[async_trait]
impl reposter_core::contract::Acquirer for PanicsOnFirstAcquire {
    async fn acquire(&self, media: &MediaRef) -> Result<Artifact, AcquireError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("acquirer bug");
        }
        Ok(artifact_for(media))
    }

    async fn restart(&self) -> Result<(), AcquireError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_acquirer_counts_as_a_retryable_attempt() {
    let acquirer = Arc::new(PanicsOnFirstAcquire {
        calls: AtomicU32::new(0),
    });
    let processor = Processor::new(
        acquirer.clone(),
        policy(),
        EventBus::new(),
        CancellationToken::new(),
    );

    let started = Instant::now();
    let processed = processor
        .process_item(&item(6, &["https://cdn.example/a.jpg"]))
        .await
        .unwrap();

    assert_eq!(processed.artifacts.len(), 1);
    assert!(processed.processing_errors.is_empty());
    assert_eq!(acquirer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(started.elapsed().as_secs(), 10);
}

#[tokio::test]
async fn processed_text_has_vk_markup_rewritten() {
    let mut acquirer = MockAcquirer::new();
    acquirer.expect_acquire().times(0);
    let mut raw = item(6, &[]);
    raw.text = "Concert by [club77|The Band], tickets at https://tickets.example/b?ref=vk".into();

    let processed = processor(acquirer, CancellationToken::new())
        .process_item(&raw)
        .await
        .unwrap();

    assert_eq!(
        processed.item.text,
        "Concert by [The Band](vk.com/club77), tickets at tickets.example/b"
    );
    assert_eq!(processed.item.item_id, 6);
}
