/// End-to-end notification and push-channel scenarios
mod support;

use leadwire_core::events::{ChannelState, SyncEvent};
use leadwire_core::notification_sync::NotificationFeed;
use leadwire_core::SyncSession;
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::MockBackend;
use tokio::sync::broadcast;
use tokio::time::sleep;

fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    out
}

async fn wait_connected(feed: &NotificationFeed) {
    for _ in 0..100 {
        if feed.state().await == ChannelState::Connected {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("push channel never connected");
}

#[tokio::test]
async fn test_pushed_notification_cues_and_toasts_once() {
    let backend = MockBackend::start(1).await;
    let session = SyncSession::new(backend.config(80)).unwrap();
    let mut events = session.subscribe();

    let feed = session.start_notifications();
    wait_connected(&feed).await;

    let n9 = MockBackend::notification(9, "lead", "critical", false);
    backend.push(&n9);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(feed.unread_count().await, 1);

    // Push delivery is not exactly-once
    backend.push(&n9);
    sleep(Duration::from_millis(150)).await;

    // A later fetch returning the same id must not re-fire either
    backend.add_notification(n9.clone());
    feed.refresh().await.unwrap();

    let events = drain(&mut events);
    let arrived = events
        .iter()
        .filter(|e| matches!(e, SyncEvent::NotificationArrived { id: 9, .. }))
        .count();
    let toasts = events
        .iter()
        .filter(|e| matches!(e, SyncEvent::Toast { id: 9, .. }))
        .count();
    assert_eq!(arrived, 1, "exactly one cue per logically new notification");
    assert_eq!(toasts, 1);
    assert_eq!(feed.unread_count().await, 1);
    feed.close();
}

#[tokio::test]
async fn test_channel_reconnect_reconciles_missed_events() {
    let backend = MockBackend::start(1).await;
    let session = SyncSession::new(backend.config(80)).unwrap();
    let mut events = session.subscribe();

    let feed = session.start_notifications();
    wait_connected(&feed).await;

    backend.kick_push_clients();
    // An event lands server-side while the channel is down
    backend.add_notification(MockBackend::notification(6, "lead", "info", false));

    for _ in 0..100 {
        if backend.state.ws_connections.load(Ordering::SeqCst) >= 2
            && feed.state().await == ChannelState::Connected
        {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(backend.state.ws_connections.load(Ordering::SeqCst) >= 2);
    sleep(Duration::from_millis(150)).await;

    // The reconnect refetch reconciled the missed event
    let list = feed.notifications().await;
    assert!(list.iter().any(|n| n.id == 6));

    let states: Vec<ChannelState> = drain(&mut events)
        .iter()
        .filter_map(|e| match e {
            SyncEvent::ChannelStateChanged { state } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        &states[..5],
        &[
            ChannelState::Connecting,
            ChannelState::Connected,
            ChannelState::Disconnected,
            ChannelState::Connecting,
            ChannelState::Connected,
        ]
    );
    feed.close();
}

#[tokio::test]
async fn test_mark_read_is_idempotent() {
    let backend = MockBackend::start(1).await;
    backend.add_notification(MockBackend::notification(1, "lead", "info", false));
    backend.add_notification(MockBackend::notification(2, "lead", "warning", false));

    let session = SyncSession::new(backend.config(80)).unwrap();
    let feed = session.start_notifications();
    wait_connected(&feed).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(feed.unread_count().await, 2);

    feed.mark_as_read(1).await.unwrap();
    feed.mark_as_read(1).await.unwrap();
    feed.mark_as_read(1).await.unwrap();

    assert_eq!(
        backend.state.notification_read_calls.load(Ordering::SeqCst),
        1,
        "already-read targets are a local no-op"
    );
    assert_eq!(feed.unread_count().await, 1);
    feed.close();
}

#[tokio::test]
async fn test_mark_read_reverts_on_failure() {
    let backend = MockBackend::start(1).await;
    backend.add_notification(MockBackend::notification(2, "lead", "info", false));
    backend.state.fail_notification_read.store(true, Ordering::SeqCst);

    let session = SyncSession::new(backend.config(80)).unwrap();
    let feed = session.start_notifications();
    wait_connected(&feed).await;
    sleep(Duration::from_millis(100)).await;

    assert!(feed.mark_as_read(2).await.is_err());

    // The optimistic flip was rolled back; no silent desync
    let list = feed.notifications().await;
    assert!(!list.iter().find(|n| n.id == 2).unwrap().read);
    assert_eq!(feed.unread_count().await, 1);
    feed.close();
}

#[tokio::test]
async fn test_unread_count_is_always_recomputed() {
    let backend = MockBackend::start(1).await;
    backend.add_notification(MockBackend::notification(1, "lead", "info", true));
    backend.add_notification(MockBackend::notification(2, "lead", "info", false));

    let session = SyncSession::new(backend.config(80)).unwrap();
    let feed = session.start_notifications();
    wait_connected(&feed).await;
    sleep(Duration::from_millis(100)).await;

    // Arbitrary interleaving of pushes and fetches, with a duplicate
    backend.push(&MockBackend::notification(3, "lead", "warning", false));
    sleep(Duration::from_millis(100)).await;
    feed.refresh().await.unwrap();
    backend.push(&MockBackend::notification(4, "lead", "critical", false));
    backend.push(&MockBackend::notification(4, "lead", "critical", false));
    sleep(Duration::from_millis(100)).await;
    feed.refresh().await.unwrap();

    let list = feed.notifications().await;
    let mut ids: Vec<i64> = list.iter().map(|n| n.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), list.len(), "no duplicate ids after interleaving");

    let expected = list.iter().filter(|n| !n.read).count();
    assert_eq!(feed.unread_count().await, expected);
    assert_eq!(expected, 3);
    feed.close();
}

#[tokio::test]
async fn test_reconnect_ceiling_surfaces_channel_lost() {
    let backend = MockBackend::start(1).await;
    let mut config = backend.config(80);
    // Nothing listens here; every connect attempt is refused
    config.push_url = "ws://127.0.0.1:9".to_string();
    config.max_reconnect_attempts = Some(2);

    let session = SyncSession::new(config).unwrap();
    let mut events = session.subscribe();
    let feed = session.start_notifications();

    sleep(Duration::from_millis(800)).await;

    let lost = drain(&mut events)
        .iter()
        .filter(|e| matches!(e, SyncEvent::ChannelLost { .. }))
        .count();
    assert_eq!(lost, 1);
    feed.close();
}

#[tokio::test]
async fn test_message_notification_refreshes_thread_without_waiting_for_poll() {
    let backend = MockBackend::start(1).await;
    // Poll interval far beyond the test horizon: any refresh must come
    // from the push-driven invalidation
    let session = SyncSession::new(backend.config(5_000)).unwrap();

    let view = session.open_thread(7, 2);
    sleep(Duration::from_millis(200)).await;
    assert!(view.timeline().await.is_empty());

    let feed = session.start_notifications();
    wait_connected(&feed).await;

    backend.add_message(21, 7, 2, 1, "via push", true);
    backend.push(&serde_json::json!({
        "id": 31,
        "title": "New message",
        "message": "user 2 replied",
        "type": "message",
        "severity": "info",
        "metadata": { "lead_id": 7, "counterparty_id": 2 },
        "read": false,
        "created_at": chrono::Utc::now().to_rfc3339(),
    }));

    sleep(Duration::from_millis(400)).await;
    let timeline = view.timeline().await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].body, "via push");
    feed.close();
    drop(view);
}
