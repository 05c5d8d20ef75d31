/// Per-thread synchronizer: merges polled message pages, optimistic sends,
/// and read-state transitions into one ordered, deduplicated timeline;
/// decides when to play a receive/send cue and when to fire the
/// read-receipt call.
use crate::cache::{CacheKey, CacheStore, CacheValue};
use crate::error::{Result, SyncError};
use crate::events::{AuthLatch, EventBus, SyncEvent};
use crate::transport::Transport;
use crate::types::{Delivery, Message, ThreadKey, TimelineEntry};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of one open conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Closed,
    Loading,
    Live,
    Refreshing,
}

/// Last point up to which batch read-marking has been applied, per thread.
/// Lives at session scope so a close-and-reopen within one poll interval
/// still issues zero additional read calls even when the server's read
/// flags lag behind the mark request.
pub type ReadWatermarks = Arc<RwLock<HashMap<ThreadKey, DateTime<Utc>>>>;

/// Merge one poll result into the rendered timeline.
///
/// Server messages are deduplicated by id and take the confirmed positions;
/// a still-unconfirmed optimistic entry is dropped once a server message
/// matches it (correlation tag first, content+window as fallback) and stays
/// pinned at the tail otherwise. The confirmed part is ordered by
/// created_at with id as the tiebreak, and a read flag that was already
/// true locally never reverses.
pub fn merge_timeline(
    server: Vec<Message>,
    previous: &[TimelineEntry],
    match_window: chrono::Duration,
) -> Vec<TimelineEntry> {
    let locally_read: HashSet<i64> = previous
        .iter()
        .filter(|e| e.read)
        .filter_map(|e| e.id)
        .collect();

    let mut seen = HashSet::new();
    let mut confirmed: Vec<TimelineEntry> = Vec::new();
    for msg in server {
        if !seen.insert(msg.id) {
            continue;
        }
        let mut entry = TimelineEntry::confirmed(msg);
        if let Some(id) = entry.id {
            if locally_read.contains(&id) {
                entry.read = true;
            }
        }
        confirmed.push(entry);
    }

    let mut pending: Vec<TimelineEntry> = previous
        .iter()
        .filter(|e| e.delivery != Delivery::Confirmed)
        .filter(|e| {
            !confirmed
                .iter()
                .any(|c| matches_optimistic(c, e, match_window))
        })
        .cloned()
        .collect();

    confirmed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    pending.sort_by_key(|e| e.created_at);
    confirmed.extend(pending);
    confirmed
}

fn matches_optimistic(
    confirmed: &TimelineEntry,
    optimistic: &TimelineEntry,
    match_window: chrono::Duration,
) -> bool {
    // When both sides carry a tag the lookup is keyed, full stop; content
    // matching there would let one echo consume two rapid identical sends
    match (confirmed.client_tag, optimistic.client_tag) {
        (Some(ct), Some(ot)) => ct == ot,
        _ => {
            confirmed.sender_id == optimistic.sender_id
                && confirmed.body == optimistic.body
                && (confirmed.created_at - optimistic.created_at).abs() <= match_window
        }
    }
}

/// State machine per open thread: Closed → Loading → Live ⇄ Refreshing,
/// terminal Closed when the view is dismissed.
#[derive(Clone)]
pub struct ThreadSynchronizer {
    key: ThreadKey,
    current_user: i64,
    poll_interval: Duration,
    match_window: chrono::Duration,
    transport: Arc<Transport>,
    cache: CacheStore,
    events: EventBus,
    auth: AuthLatch,
    watermarks: ReadWatermarks,
    state: Arc<RwLock<ThreadState>>,
    live_tx: Arc<watch::Sender<bool>>,
    live_rx: watch::Receiver<bool>,
}

impl ThreadSynchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: ThreadKey,
        current_user: i64,
        poll_interval: Duration,
        match_window: Duration,
        transport: Arc<Transport>,
        cache: CacheStore,
        events: EventBus,
        auth: AuthLatch,
        watermarks: ReadWatermarks,
    ) -> Self {
        let (live_tx, live_rx) = watch::channel(true);
        Self {
            key,
            current_user,
            poll_interval,
            match_window: chrono::Duration::milliseconds(match_window.as_millis() as i64),
            transport,
            cache,
            events,
            auth,
            watermarks,
            state: Arc::new(RwLock::new(ThreadState::Closed)),
            live_tx: Arc::new(live_tx),
            live_rx,
        }
    }

    pub fn key(&self) -> ThreadKey {
        self.key
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::ThreadMessages(self.key)
    }

    pub async fn state(&self) -> ThreadState {
        *self.state.read().await
    }

    fn is_live(&self) -> bool {
        *self.live_rx.borrow()
    }

    /// Stop the poll timer immediately. In-flight requests complete but
    /// their results are discarded against the flag captured at issue time.
    pub fn close(&self) {
        let _ = self.live_tx.send(false);
    }

    pub fn start(&self) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move { sync.run().await })
    }

    async fn run(&self) {
        *self.state.write().await = ThreadState::Loading;
        info!(
            "thread {}:{} opened",
            self.key.lead_id, self.key.counterparty_id
        );

        let mut expired = false;
        if let Err(e) = self.poll_once().await {
            self.auth.observe(&e);
            expired = matches!(e, SyncError::AuthExpired);
            warn!("thread {} initial load failed: {}", self.key.lead_id, e);
        }
        if expired {
            *self.state.write().await = ThreadState::Closed;
            return;
        }
        *self.state.write().await = ThreadState::Live;
        self.mark_read_if_needed().await;

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; the initial load covered it
        ticker.tick().await;

        let mut invalidations = self.cache.subscribe_invalidations();
        let mut live = self.live_rx.clone();

        loop {
            if !*live.borrow() {
                break;
            }

            // Poll on the timer, wake early when a push invalidates this
            // thread's key (push-first, poll-fallback)
            let refresh_now = tokio::select! {
                _ = ticker.tick() => true,
                changed = live.changed() => {
                    if changed.is_err() || !*live.borrow() {
                        break;
                    }
                    false
                }
                key = invalidations.recv() => match key {
                    Ok(k) => k == self.cache_key(),
                    Err(broadcast::error::RecvError::Lagged(_)) => true,
                    // The cache outlives every view; the channel cannot close
                    Err(broadcast::error::RecvError::Closed) => false,
                },
            };
            if !refresh_now {
                continue;
            }

            *self.state.write().await = ThreadState::Refreshing;
            if let Err(e) = self.poll_once().await {
                self.auth.observe(&e);
                warn!("thread {} poll failed: {}", self.key.lead_id, e);
                // An expired credential means redirect, not a retry loop
                if matches!(e, SyncError::AuthExpired) {
                    break;
                }
            }
            if !*live.borrow() {
                break;
            }
            *self.state.write().await = ThreadState::Live;
        }

        *self.state.write().await = ThreadState::Closed;
        debug!(
            "thread {}:{} closed",
            self.key.lead_id, self.key.counterparty_id
        );
    }

    /// One poll cycle: fetch, merge under the cache's write lock, fire the
    /// receive cue when the merge surfaced a new foreign message.
    async fn poll_once(&self) -> Result<()> {
        let path = format!("/threads/{}/messages", self.key.lead_id);
        let server: Vec<Message> = self.transport.get_json(&path).await?;

        if !self.is_live() {
            debug!("discarding poll result for closed thread {}", self.key.lead_id);
            return Ok(());
        }

        let match_window = self.match_window;
        let mut grew = false;
        let mut newest_sender: Option<i64> = None;
        self.cache
            .optimistic_set(self.cache_key(), |prev| {
                let previous = prev
                    .as_ref()
                    .and_then(|v| v.as_messages())
                    .cloned()
                    .unwrap_or_default();
                let merged = merge_timeline(server, &previous, match_window);
                grew = merged.len() > previous.len();
                newest_sender = merged.last().map(|e| e.sender_id);
                CacheValue::Messages(merged)
            })
            .await;

        if grew && newest_sender.map(|s| s != self.current_user).unwrap_or(false) {
            self.events
                .emit(SyncEvent::MessageReceived { thread: self.key });
        }

        Ok(())
    }

    /// Batch read-marking, fired once on the transition into Live. The
    /// watermark prevents a later poll that returns the same unread flags
    /// from re-triggering the call.
    async fn mark_read_if_needed(&self) {
        let entries = match self.cache.get(&self.cache_key()).await {
            Some(v) => v.as_messages().cloned().unwrap_or_default(),
            None => return,
        };

        let watermark = self.watermarks.read().await.get(&self.key).copied();
        let unread_foreign: Vec<DateTime<Utc>> = entries
            .iter()
            .filter(|e| e.sender_id != self.current_user && !e.read)
            .filter(|e| watermark.map(|w| e.created_at > w).unwrap_or(true))
            .map(|e| e.created_at)
            .collect();

        let Some(newest) = unread_foreign.iter().max().copied() else {
            return;
        };

        let path = format!("/threads/{}/messages/read", self.key.lead_id);
        match self.transport.post_empty(&path).await {
            Ok(()) => {
                self.watermarks.write().await.insert(self.key, newest);
                let me = self.current_user;
                self.cache
                    .optimistic_set(self.cache_key(), |prev| {
                        let mut entries = prev
                            .as_ref()
                            .and_then(|v| v.as_messages())
                            .cloned()
                            .unwrap_or_default();
                        for entry in entries.iter_mut().filter(|e| e.sender_id != me) {
                            entry.read = true;
                        }
                        CacheValue::Messages(entries)
                    })
                    .await;
                // Parent list badges depend on unread state
                self.cache.invalidate(&CacheKey::ThreadSummaries).await;
                self.events
                    .emit(SyncEvent::CacheInvalidated { key: CacheKey::ThreadSummaries });
                info!(
                    "thread {} marked read ({} messages)",
                    self.key.lead_id,
                    unread_foreign.len()
                );
            }
            Err(e) => {
                self.auth.observe(&e);
                warn!("thread {} mark-read failed: {}", self.key.lead_id, e);
            }
        }
    }

    /// Optimistic send: the entry is rendered immediately and the send cue
    /// fires here, once — never again at poll confirmation.
    pub async fn send(&self, body: String) -> Result<()> {
        let entry = TimelineEntry::pending(self.current_user, self.key.counterparty_id, body.clone());
        let tag = entry.client_tag.unwrap_or_else(Uuid::new_v4);

        self.cache
            .optimistic_set(self.cache_key(), |prev| {
                let mut entries = prev
                    .as_ref()
                    .and_then(|v| v.as_messages())
                    .cloned()
                    .unwrap_or_default();
                entries.push(entry);
                CacheValue::Messages(entries)
            })
            .await;
        self.events.emit(SyncEvent::MessageSent { thread: self.key });

        self.dispatch(tag, body).await
    }

    /// Manual retry of a failed send; re-dispatches under the same tag
    pub async fn retry_send(&self, client_tag: Uuid) -> Result<()> {
        let mut body: Option<String> = None;
        self.cache
            .optimistic_set(self.cache_key(), |prev| {
                let mut entries = prev
                    .as_ref()
                    .and_then(|v| v.as_messages())
                    .cloned()
                    .unwrap_or_default();
                if let Some(entry) = entries
                    .iter_mut()
                    .find(|e| e.client_tag == Some(client_tag) && e.delivery == Delivery::Failed)
                {
                    entry.delivery = Delivery::Pending;
                    body = Some(entry.body.clone());
                }
                CacheValue::Messages(entries)
            })
            .await;

        let Some(body) = body else {
            return Err(SyncError::ReconciliationConflict(format!(
                "no failed entry with tag {} in thread {}",
                client_tag, self.key.lead_id
            )));
        };
        self.dispatch(client_tag, body).await
    }

    async fn dispatch(&self, tag: Uuid, body: String) -> Result<()> {
        let path = format!("/threads/{}/messages", self.key.lead_id);
        let request = serde_json::json!({
            "receiver_id": self.key.counterparty_id,
            "content": body,
            "client_tag": tag,
        });

        match self.transport.post_json::<_, Message>(&path, &request).await {
            Ok(confirmed) => {
                self.confirm_entry(tag, confirmed).await;
                Ok(())
            }
            Err(e) => {
                self.auth.observe(&e);
                self.cache
                    .optimistic_set(self.cache_key(), |prev| {
                        let mut entries = prev
                            .as_ref()
                            .and_then(|v| v.as_messages())
                            .cloned()
                            .unwrap_or_default();
                        if let Some(entry) = entries
                            .iter_mut()
                            .find(|e| e.client_tag == Some(tag) && e.delivery == Delivery::Pending)
                        {
                            entry.delivery = Delivery::Failed;
                        }
                        CacheValue::Messages(entries)
                    })
                    .await;
                self.events.emit(SyncEvent::SendFailed {
                    thread: self.key,
                    client_tag: tag,
                });
                warn!("thread {} send failed: {}", self.key.lead_id, e);
                Err(e)
            }
        }
    }

    /// Replace the optimistic entry in place with the server record —
    /// never a second copy. A tag that no longer resolves is a
    /// reconciliation conflict: logged, and the confirmed record is merged
    /// in by id so the timeline stays consistent.
    async fn confirm_entry(&self, tag: Uuid, confirmed: Message) {
        let mut conflict = false;
        self.cache
            .optimistic_set(self.cache_key(), |prev| {
                let mut entries = prev
                    .as_ref()
                    .and_then(|v| v.as_messages())
                    .cloned()
                    .unwrap_or_default();
                match entries.iter().position(|e| e.client_tag == Some(tag)) {
                    Some(i) => entries[i] = TimelineEntry::confirmed(confirmed),
                    None => {
                        conflict = true;
                        if !entries.iter().any(|e| e.id == Some(confirmed.id)) {
                            entries.push(TimelineEntry::confirmed(confirmed));
                        }
                    }
                }
                // Re-establish total order after the in-place swap
                let (mut done, mut rest): (Vec<TimelineEntry>, Vec<TimelineEntry>) = entries
                    .into_iter()
                    .partition(|e| e.delivery == Delivery::Confirmed);
                done.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                rest.sort_by_key(|e| e.created_at);
                done.extend(rest);
                CacheValue::Messages(done)
            })
            .await;

        if conflict {
            error!(
                "reconciliation conflict: send tag {} vanished from thread {}",
                tag, self.key.lead_id
            );
        }
    }
}

/// Owned resource handed to a presentation surface while a conversation
/// dialog is open. Dropping it (or calling close) stops the poll loop.
pub struct ThreadView {
    sync: ThreadSynchronizer,
    _task: JoinHandle<()>,
}

impl ThreadView {
    pub(crate) fn open(sync: ThreadSynchronizer) -> Self {
        let task = sync.start();
        Self { sync, _task: task }
    }

    pub fn key(&self) -> ThreadKey {
        self.sync.key()
    }

    pub async fn state(&self) -> ThreadState {
        self.sync.state().await
    }

    /// Current rendered timeline (last-known-good during refreshes)
    pub async fn timeline(&self) -> Vec<TimelineEntry> {
        self.sync
            .cache
            .get(&self.sync.cache_key())
            .await
            .and_then(|v| v.as_messages().cloned())
            .unwrap_or_default()
    }

    pub async fn send(&self, body: String) -> Result<()> {
        self.sync.send(body).await
    }

    pub async fn retry_send(&self, client_tag: Uuid) -> Result<()> {
        self.sync.retry_send(client_tag).await
    }

    pub fn close(&self) {
        self.sync.close();
    }
}

impl Drop for ThreadView {
    fn drop(&mut self) {
        self.sync.close();
    }
}
