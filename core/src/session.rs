/// Session façade: owns the wiring between config, transport, cache, and
/// events, and hands out the scoped resources surfaces hold while a view
/// is active. Everything here is session-lifetime; nothing persists.
use crate::cache::{CacheKey, CacheStore, CacheValue};
use crate::config::Config;
use crate::error::Result;
use crate::events::{AuthLatch, EventBus, SyncEvent};
use crate::notification_sync::{NotificationFeed, NotificationSynchronizer};
use crate::thread_sync::{ReadWatermarks, ThreadSynchronizer, ThreadView};
use crate::transport::Transport;
use crate::types::{Notification, ThreadKey, ThreadSummary};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

pub struct SyncSession {
    config: Config,
    transport: Arc<Transport>,
    cache: CacheStore,
    events: EventBus,
    auth: AuthLatch,
    watermarks: ReadWatermarks,
}

impl SyncSession {
    pub fn new(config: Config) -> Result<Self> {
        let transport = Arc::new(Transport::new(&config)?);
        let cache = CacheStore::new();
        let events = EventBus::new();
        let auth = AuthLatch::new(events.clone());

        info!("session created for user {}", config.current_user);

        Ok(Self {
            config,
            transport,
            cache,
            events,
            auth,
            watermarks: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Event stream for presentation surfaces (cues, toasts, redirects)
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Cache-invalidation hook for the CRUD surfaces outside this crate
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<CacheKey> {
        self.cache.subscribe_invalidations()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Open a conversation: begins polling, marks unread messages read
    /// once, stops when the returned view is closed or dropped
    pub fn open_thread(&self, lead_id: i64, counterparty_id: i64) -> ThreadView {
        let sync = ThreadSynchronizer::new(
            ThreadKey::new(lead_id, counterparty_id),
            self.config.current_user,
            self.config.poll_interval,
            self.config.match_window,
            self.transport.clone(),
            self.cache.clone(),
            self.events.clone(),
            self.auth.clone(),
            self.watermarks.clone(),
        );
        ThreadView::open(sync)
    }

    /// Start the notification feed: push channel with reconnect, poll
    /// fallback, toasts and badge state
    pub fn start_notifications(&self) -> NotificationFeed {
        NotificationFeed::open(self.notification_sync())
    }

    fn notification_sync(&self) -> NotificationSynchronizer {
        NotificationSynchronizer::new(
            self.transport.clone(),
            self.cache.clone(),
            self.events.clone(),
            self.auth.clone(),
            self.config.reconnect_base,
            self.config.reconnect_ceiling,
            self.config.max_reconnect_attempts,
            self.config.notification_poll_interval,
        )
    }

    /// Thread list with unread badges, through the summaries cache
    pub async fn thread_summaries(&self) -> Result<Vec<ThreadSummary>> {
        let transport = self.transport.clone();
        let result = self
            .cache
            .refresh(
                CacheKey::ThreadSummaries,
                || async move {
                    let list: Vec<ThreadSummary> = transport.get_json("/threads").await?;
                    Ok(CacheValue::Summaries(list))
                },
                |fetched, _| fetched,
            )
            .await;

        match result {
            Ok(value) => Ok(value.as_summaries().cloned().unwrap_or_default()),
            Err(e) => {
                self.auth.observe(&e);
                Err(e)
            }
        }
    }

    /// One-shot notification fetch (no feed running)
    pub async fn fetch_notifications(&self) -> Result<Vec<Notification>> {
        let sync = self.notification_sync();
        if let Err(e) = sync.refresh().await {
            self.auth.observe(&e);
            return Err(e);
        }
        Ok(sync.notifications().await)
    }

    /// One-shot idempotent mark-as-read
    pub async fn mark_notification_read(&self, id: i64) -> Result<()> {
        self.notification_sync().mark_as_read(id).await
    }
}

impl Clone for SyncSession {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            transport: self.transport.clone(),
            cache: self.cache.clone(),
            events: self.events.clone(),
            auth: self.auth.clone(),
            watermarks: self.watermarks.clone(),
        }
    }
}
