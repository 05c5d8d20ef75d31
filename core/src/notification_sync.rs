/// Global notification synchronizer: owns the push channel lifecycle,
/// merges push-delivered events with on-demand fetches, drives the bell
/// badge and toast presentation, and exposes mark-as-read.
use crate::cache::{CacheKey, CacheStore, CacheValue};
use crate::error::{Result, SyncError};
use crate::events::{AuthLatch, ChannelState, EventBus, SyncEvent};
use crate::transport::Transport;
use crate::types::Notification;
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Merge a fetched notification list into the current one.
///
/// The server list is authoritative for read state, except for flips whose
/// PATCH is still in flight (an interleaved refetch must not momentarily
/// un-read an optimistically read notification). Pushed entries the server
/// list does not carry yet are kept. Result is newest-first, unique by id.
pub fn merge_notifications(
    server: Vec<Notification>,
    previous: &[Notification],
    pending_reads: &HashSet<i64>,
) -> Vec<Notification> {
    let mut seen = HashSet::new();
    let mut merged: Vec<Notification> = Vec::new();

    for mut n in server {
        if !seen.insert(n.id) {
            continue;
        }
        if pending_reads.contains(&n.id) {
            n.read = true;
        }
        merged.push(n);
    }

    for n in previous {
        if seen.insert(n.id) {
            merged.push(n.clone());
        }
    }

    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    merged
}

/// State machine: Disconnected → Connecting → Connected, back to
/// Disconnected on channel close, reconnecting with capped exponential
/// backoff. While Disconnected the full list is refetched on a slow
/// interval so missed events still arrive (push-first, poll-fallback).
#[derive(Clone)]
pub struct NotificationSynchronizer {
    transport: Arc<Transport>,
    cache: CacheStore,
    events: EventBus,
    auth: AuthLatch,
    state: Arc<RwLock<ChannelState>>,
    pending_reads: Arc<Mutex<HashSet<i64>>>,
    reconnect_base: Duration,
    reconnect_ceiling: Duration,
    max_reconnect_attempts: Option<u32>,
    poll_interval: Duration,
    live_tx: Arc<watch::Sender<bool>>,
    live_rx: watch::Receiver<bool>,
}

impl NotificationSynchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<Transport>,
        cache: CacheStore,
        events: EventBus,
        auth: AuthLatch,
        reconnect_base: Duration,
        reconnect_ceiling: Duration,
        max_reconnect_attempts: Option<u32>,
        poll_interval: Duration,
    ) -> Self {
        let (live_tx, live_rx) = watch::channel(true);
        Self {
            transport,
            cache,
            events,
            auth,
            state: Arc::new(RwLock::new(ChannelState::Disconnected)),
            pending_reads: Arc::new(Mutex::new(HashSet::new())),
            reconnect_base,
            reconnect_ceiling,
            max_reconnect_attempts,
            poll_interval,
            live_tx: Arc::new(live_tx),
            live_rx,
        }
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    pub fn close(&self) {
        let _ = self.live_tx.send(false);
    }

    pub fn start(&self) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move { sync.run().await })
    }

    async fn set_state(&self, next: ChannelState) {
        let mut state = self.state.write().await;
        if *state != next {
            *state = next;
            info!("push channel {:?}", next);
            self.events
                .emit(SyncEvent::ChannelStateChanged { state: next });
        }
    }

    async fn run(&self) {
        let mut attempts: u32 = 0;
        let mut backoff = self.reconnect_base;
        let mut last_refresh: Option<Instant> = None;
        let mut live = self.live_rx.clone();

        while *live.borrow() {
            self.set_state(ChannelState::Connecting).await;

            match self.transport.open_push_channel().await {
                Ok(mut channel) => {
                    if !*live.borrow() {
                        break;
                    }
                    attempts = 0;
                    backoff = self.reconnect_base;
                    self.set_state(ChannelState::Connected).await;

                    // Full refetch reconciles events missed while down
                    match self.refresh().await {
                        Ok(()) => last_refresh = Some(Instant::now()),
                        Err(e) => {
                            self.auth.observe(&e);
                            if matches!(e, SyncError::AuthExpired) {
                                break;
                            }
                            warn!("notification refetch failed: {}", e);
                        }
                    }

                    loop {
                        tokio::select! {
                            frame = channel.next_frame() => match frame {
                                Ok(Some(text)) => self.handle_push(&text).await,
                                Ok(None) => {
                                    info!("push channel closed by server");
                                    break;
                                }
                                Err(e) => {
                                    warn!("push channel dropped: {}", e);
                                    break;
                                }
                            },
                            changed = live.changed() => {
                                if changed.is_err() || !*live.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    self.set_state(ChannelState::Disconnected).await;
                }
                Err(e) => {
                    self.auth.observe(&e);
                    if matches!(e, SyncError::AuthExpired) {
                        break;
                    }
                    attempts += 1;
                    warn!("push connect failed (attempt {}): {}", attempts, e);
                    self.set_state(ChannelState::Disconnected).await;

                    if let Some(max) = self.max_reconnect_attempts {
                        if attempts >= max {
                            error!("push reconnect ceiling reached after {} attempts", attempts);
                            self.events.emit(SyncEvent::ChannelLost {
                                reason: e.to_string(),
                            });
                            break;
                        }
                    }

                    // Poll fallback while disconnected
                    let due = last_refresh
                        .map(|t| t.elapsed() >= self.poll_interval)
                        .unwrap_or(true);
                    if due {
                        match self.refresh().await {
                            Ok(()) => last_refresh = Some(Instant::now()),
                            Err(fetch_err) => {
                                self.auth.observe(&fetch_err);
                                if matches!(fetch_err, SyncError::AuthExpired) {
                                    break;
                                }
                                warn!("fallback refetch failed: {}", fetch_err);
                            }
                        }
                    }

                    self.wait_reconnect(backoff).await;
                    backoff = (backoff * 2).min(self.reconnect_ceiling);
                }
            }
        }

        self.set_state(ChannelState::Disconnected).await;
        debug!("notification feed stopped");
    }

    async fn wait_reconnect(&self, delay: Duration) {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        let mut live = self.live_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay + jitter) => {}
            _ = live.changed() => {}
        }
    }

    /// One pushed frame. Push delivery is not exactly-once: only an unseen
    /// id is a new event; duplicates are ignored without a cue, and a later
    /// fetch returning the same id never re-fires it either.
    async fn handle_push(&self, frame: &str) {
        let notification: Notification = match serde_json::from_str(frame) {
            Ok(n) => n,
            Err(e) => {
                warn!("unparseable push frame: {}", e);
                return;
            }
        };

        let incoming = notification.clone();
        let mut inserted = false;
        self.cache
            .optimistic_set(CacheKey::Notifications, |prev| {
                let mut list = prev
                    .as_ref()
                    .and_then(|v| v.as_notifications())
                    .cloned()
                    .unwrap_or_default();
                if !list.iter().any(|n| n.id == incoming.id) {
                    inserted = true;
                    list.push(incoming);
                    list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
                }
                CacheValue::Notifications(list)
            })
            .await;

        if !inserted {
            debug!("duplicate push for notification {}", notification.id);
            return;
        }

        self.events.emit(SyncEvent::NotificationArrived {
            id: notification.id,
            severity: notification.severity,
        });
        self.events.emit(SyncEvent::Toast {
            id: notification.id,
            title: notification.title.clone(),
            message: notification.message.clone(),
            severity: notification.severity,
        });

        // A pushed message notification refreshes the messaging side
        // immediately; the thread poll loop picks the invalidation up
        if notification.kind == "message" {
            if let Some(thread) = notification.thread_key() {
                let key = CacheKey::ThreadMessages(thread);
                self.cache.invalidate(&key).await;
                self.events.emit(SyncEvent::CacheInvalidated { key });
            }
            self.cache.invalidate(&CacheKey::ThreadSummaries).await;
            self.events.emit(SyncEvent::CacheInvalidated {
                key: CacheKey::ThreadSummaries,
            });
        }
    }

    /// Refetch the full list and reconcile it into the cache. Callable
    /// from the outside for on-focus refreshes; concurrent calls coalesce
    /// into one request.
    pub async fn refresh(&self) -> Result<()> {
        let transport = self.transport.clone();
        let pending_reads = self.pending_reads.clone();

        self.cache
            .refresh(
                CacheKey::Notifications,
                || async move {
                    let server: Vec<Notification> = transport.get_json("/notifications").await?;
                    Ok(CacheValue::Notifications(server))
                },
                |fetched, current| {
                    let server = match fetched {
                        CacheValue::Notifications(s) => s,
                        other => return other,
                    };
                    let previous = current
                        .and_then(|v| v.as_notifications())
                        .cloned()
                        .unwrap_or_default();
                    let pending = pending_reads.lock().unwrap().clone();
                    CacheValue::Notifications(merge_notifications(server, &previous, &pending))
                },
            )
            .await?;
        Ok(())
    }

    /// Current merged list, newest first
    pub async fn notifications(&self) -> Vec<Notification> {
        self.cache
            .get(&CacheKey::Notifications)
            .await
            .and_then(|v| v.as_notifications().cloned())
            .unwrap_or_default()
    }

    /// Always recomputed from the merged list, never tracked imperatively
    pub async fn unread_count(&self) -> usize {
        self.notifications()
            .await
            .iter()
            .filter(|n| !n.read)
            .count()
    }

    /// Optimistic mark-as-read. Already-read targets are a no-op, never an
    /// error; on request failure the local flip is reverted so read state
    /// cannot silently desync from server truth.
    pub async fn mark_as_read(&self, id: i64) -> Result<()> {
        let already_read = self
            .notifications()
            .await
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.read)
            .unwrap_or(false);
        if already_read {
            return Ok(());
        }

        self.pending_reads.lock().unwrap().insert(id);
        self.flip_read(id, true).await;

        let path = format!("/notifications/{}/read", id);
        match self.transport.patch_empty(&path).await {
            Ok(()) => {
                self.pending_reads.lock().unwrap().remove(&id);
                Ok(())
            }
            Err(e) => {
                self.auth.observe(&e);
                self.pending_reads.lock().unwrap().remove(&id);
                self.flip_read(id, false).await;
                warn!("mark-as-read failed for notification {}: {}", id, e);
                Err(e)
            }
        }
    }

    async fn flip_read(&self, id: i64, read: bool) {
        self.cache
            .optimistic_set(CacheKey::Notifications, |prev| {
                let mut list = prev
                    .as_ref()
                    .and_then(|v| v.as_notifications())
                    .cloned()
                    .unwrap_or_default();
                if let Some(n) = list.iter_mut().find(|n| n.id == id) {
                    n.read = read;
                }
                CacheValue::Notifications(list)
            })
            .await;
    }
}

/// Owned resource for the notification surface (bell menu). Dropping it
/// (or calling close) tears the channel down and stops reconnecting.
pub struct NotificationFeed {
    sync: NotificationSynchronizer,
    _task: JoinHandle<()>,
}

impl NotificationFeed {
    pub(crate) fn open(sync: NotificationSynchronizer) -> Self {
        let task = sync.start();
        Self { sync, _task: task }
    }

    pub async fn state(&self) -> ChannelState {
        self.sync.state().await
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.sync.notifications().await
    }

    pub async fn unread_count(&self) -> usize {
        self.sync.unread_count().await
    }

    pub async fn mark_as_read(&self, id: i64) -> Result<()> {
        self.sync.mark_as_read(id).await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.sync.refresh().await
    }

    pub fn close(&self) {
        self.sync.close();
    }
}

impl Drop for NotificationFeed {
    fn drop(&mut self) {
        self.sync.close();
    }
}
