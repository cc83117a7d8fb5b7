//! Integration tests for change detection.
//!
//! These tests verify:
//! - Count sequences produce change events only when the count moves
//! - Growth emits exactly the records past the previous checkpoint
//! - Shrinkage and failed fetches never lose or invent records
//! - Reporter and differ failures stay isolated from each other

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use recwatch::{
    ChannelSink, DifferConfig, SnapshotDiffer, StepOutcome, SummaryReporter, WatchEvent,
    WatchStats,
};
use recwatch_common::{CollectionGateway, MemoryGateway, Record};

fn user(id: u64) -> Record {
    json!({"id": id, "email": format!("user{id}@example.com")})
        .as_object()
        .cloned()
        .unwrap()
}

fn setup(initial: u64) -> (Arc<MemoryGateway>, SnapshotDiffer, UnboundedReceiver<WatchEvent>) {
    let gateway = Arc::new(MemoryGateway::with_records(
        "users",
        (0..initial).map(user).collect(),
    ));
    let (sink, rx) = ChannelSink::new();
    let differ = SnapshotDiffer::new(
        Arc::clone(&gateway) as Arc<dyn CollectionGateway>,
        Arc::new(sink),
        Arc::new(WatchStats::new()),
        DifferConfig::default(),
    )
    .with_checkpoint(initial);
    (gateway, differ, rx)
}

fn drain(rx: &mut UnboundedReceiver<WatchEvent>) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

fn new_ids(events: &[WatchEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            WatchEvent::NewRecord { record, .. } => record["id"].as_u64(),
            _ => None,
        })
        .collect()
}

fn change_events(events: &[WatchEvent]) -> Vec<(u64, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            WatchEvent::CountChanged {
                previous, current, ..
            } => Some((*previous, *current)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_count_sequences() {
    // Append-only growth patterns, including plateaus.
    let sequences: &[&[u64]] = &[
        &[0, 0, 0],
        &[0, 3, 3, 7],
        &[5, 5, 6, 6, 6, 10],
        &[1, 2, 3, 4],
    ];

    for seq in sequences {
        let (gateway, mut differ, mut rx) = setup(seq[0]);
        let cancel = CancellationToken::new();

        for window in seq.windows(2) {
            let (prev, cur) = (window[0], window[1]);
            gateway.extend((prev..cur).map(user));

            let outcome = differ.step(&cancel).await;
            let events = drain(&mut rx);

            if cur == prev {
                assert_eq!(outcome, StepOutcome::Unchanged { count: cur });
                assert!(events.is_empty(), "no events expected for {seq:?}");
            } else {
                assert_eq!(change_events(&events), vec![(prev, cur)]);
                assert_eq!(new_ids(&events), (prev..cur).collect::<Vec<_>>());
            }
            assert_eq!(differ.last_count(), Some(cur));
        }
    }
}

#[tokio::test]
async fn test_shrink_then_grow() {
    let (gateway, mut differ, mut rx) = setup(10);
    let cancel = CancellationToken::new();

    gateway.remove_front(6);
    differ.step(&cancel).await;
    let events = drain(&mut rx);
    assert_eq!(change_events(&events), vec![(10, 4)]);
    assert!(new_ids(&events).is_empty());
    assert_eq!(differ.last_count(), Some(4));

    // Growth after shrinkage is measured from the new checkpoint.
    gateway.extend([user(100), user(101)]);
    differ.step(&cancel).await;
    assert_eq!(new_ids(&drain(&mut rx)), vec![100, 101]);
}

#[tokio::test]
async fn test_repeated_fetch_failures_recover_full_delta() {
    let (gateway, mut differ, mut rx) = setup(2);
    let cancel = CancellationToken::new();

    gateway.extend([user(2), user(3)]);
    gateway.fail_next_fetches(3);
    for _ in 0..3 {
        assert!(matches!(
            differ.step(&cancel).await,
            StepOutcome::FetchFailed {
                previous: 2,
                current: 4
            }
        ));
    }
    assert_eq!(differ.consecutive_failures(), 3);

    // More records arrive while the store was failing.
    gateway.push(user(4));
    differ.step(&cancel).await;

    let events = drain(&mut rx);
    assert_eq!(change_events(&events), vec![(2, 5)]);
    assert_eq!(new_ids(&events), vec![2, 3, 4]);
    assert_eq!(differ.consecutive_failures(), 0);
}

#[tokio::test]
async fn test_reporter_and_differ_failures_are_isolated() {
    let (gateway, mut differ, mut rx) = setup(1);
    let (summary_sink, mut summary_rx) = ChannelSink::new();
    let reporter = SummaryReporter::new(
        Arc::clone(&gateway) as Arc<dyn CollectionGateway>,
        Arc::new(summary_sink),
        Arc::new(WatchStats::new()),
    );
    let cancel = CancellationToken::new();

    gateway.push(user(1));

    // Reporter fails; differ proceeds.
    gateway.fail_next_counts(1);
    let (summary, outcome) = tokio::join!(reporter.report(), differ.step(&cancel));
    assert_eq!(summary, None);
    assert!(matches!(outcome, StepOutcome::Changed { .. }));
    assert_eq!(new_ids(&drain(&mut rx)), vec![1]);

    // Differ fails; reporter proceeds.
    gateway.push(user(2));
    gateway.fail_next_fetches(1);
    let (summary, outcome) = tokio::join!(reporter.report(), differ.step(&cancel));
    assert_eq!(summary, Some(3));
    assert!(matches!(outcome, StepOutcome::FetchFailed { .. }));
    assert!(matches!(
        summary_rx.try_recv().unwrap(),
        WatchEvent::Summary {
            total_records: 3,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_loop_within_wait() {
    let gateway = Arc::new(MemoryGateway::with_records("users", vec![user(0)]));
    let (sink, _rx) = ChannelSink::new();
    let differ = SnapshotDiffer::new(
        Arc::clone(&gateway) as Arc<dyn CollectionGateway>,
        Arc::new(sink),
        Arc::new(WatchStats::new()),
        DifferConfig {
            poll_interval: Duration::from_secs(3600),
            ..Default::default()
        },
    );

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(differ.run(cancel.clone()));
    tokio::time::sleep(Duration::from_secs(1)).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("differ loop should end promptly")
        .unwrap();
    assert_eq!(gateway.count_calls(), 1);
}

#[tokio::test]
async fn test_gateway_is_shared_read_only() {
    let gateway = Arc::new(MemoryGateway::with_records(
        "users",
        (0..3).map(user).collect(),
    ));
    let dyn_gateway: Arc<dyn CollectionGateway> = gateway.clone();

    let (a, b) = tokio::join!(dyn_gateway.count(), dyn_gateway.fetch_all());
    assert_eq!(a.unwrap(), 3);
    assert_eq!(b.unwrap().len(), 3);
    assert_eq!(gateway.len(), 3);
}
