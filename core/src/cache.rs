/// Session-lifetime cache of server-derived entities.
/// Single mutation point for all entity state: synchronizers read and write
/// only through this API, so every surface observing a key sees one value.
use crate::error::{Result, SyncError};
use crate::types::{Notification, ThreadKey, ThreadSummary, TimelineEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, warn};

const INVALIDATION_CHANNEL_CAPACITY: usize = 64;

/// Structured cache keys; invalidating one thread cannot touch another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "key", rename_all = "snake_case")]
pub enum CacheKey {
    ThreadMessages(ThreadKey),
    ThreadSummaries,
    Notifications,
}

#[derive(Debug, Clone)]
pub enum CacheValue {
    Messages(Vec<TimelineEntry>),
    Summaries(Vec<ThreadSummary>),
    Notifications(Vec<Notification>),
}

impl CacheValue {
    pub fn as_messages(&self) -> Option<&Vec<TimelineEntry>> {
        match self {
            CacheValue::Messages(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_summaries(&self) -> Option<&Vec<ThreadSummary>> {
        match self {
            CacheValue::Summaries(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_notifications(&self) -> Option<&Vec<Notification>> {
        match self {
            CacheValue::Notifications(n) => Some(n),
            _ => None,
        }
    }
}

struct Entry {
    value: CacheValue,
    stale: bool,
}

/// Keyed store with stale-while-revalidate semantics and at most one
/// in-flight refetch per key
#[derive(Clone)]
pub struct CacheStore {
    entries: Arc<RwLock<HashMap<CacheKey, Entry>>>,
    in_flight: Arc<Mutex<HashMap<CacheKey, watch::Receiver<bool>>>>,
    invalidations: broadcast::Sender<CacheKey>,
}

impl CacheStore {
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CHANNEL_CAPACITY);
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            invalidations,
        }
    }

    /// Last-known value for a key, stale or not
    pub async fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        self.entries.read().await.get(key).map(|e| e.value.clone())
    }

    /// Store a fresh value
    pub async fn set(&self, key: CacheKey, value: CacheValue) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            Entry {
                value,
                stale: false,
            },
        );
    }

    /// Flag a key stale and notify subscribers. The value is NOT cleared:
    /// the last-known-good stays readable while a refetch is in flight, so
    /// surfaces never flicker to an empty state.
    pub async fn invalidate(&self, key: &CacheKey) {
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(key) {
                entry.stale = true;
            }
        }
        debug!("cache invalidated: {:?}", key);
        let _ = self.invalidations.send(*key);
    }

    /// A missing key counts as stale
    pub async fn is_stale(&self, key: &CacheKey) -> bool {
        self.entries
            .read()
            .await
            .get(key)
            .map(|e| e.stale)
            .unwrap_or(true)
    }

    /// Apply a local write now, subject to later reconciliation by the next
    /// refetch. The updater runs under the write lock, which serializes it
    /// against every other writer of the same key.
    pub async fn optimistic_set<F>(&self, key: CacheKey, updater: F)
    where
        F: FnOnce(Option<CacheValue>) -> CacheValue,
    {
        let mut entries = self.entries.write().await;
        let previous = entries.get(&key).map(|e| e.value.clone());
        let stale = entries.get(&key).map(|e| e.stale).unwrap_or(false);
        entries.insert(
            key,
            Entry {
                value: updater(previous),
                stale,
            },
        );
    }

    /// Refetch a key, coalescing concurrent calls: if a refetch for this
    /// key is already in flight, the call waits for that one's completion
    /// and returns the refreshed value instead of issuing a duplicate
    /// request. A failed refetch keeps the stale value in place.
    ///
    /// The reconcile step folds the fetched value into whatever the key
    /// holds by then, and runs under the write lock so a concurrent
    /// optimistic write cannot fall between fetch and store. Callers that
    /// want plain replacement pass `|fetched, _| fetched`.
    pub async fn refresh<F, Fut, M>(
        &self,
        key: CacheKey,
        fetch: F,
        reconcile: M,
    ) -> Result<CacheValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue>>,
        M: FnOnce(CacheValue, Option<&CacheValue>) -> CacheValue,
    {
        enum Role {
            Leader(watch::Sender<bool>),
            Follower(watch::Receiver<bool>),
        }

        let role = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(false);
                    in_flight.insert(key, rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                debug!("refresh coalesced into in-flight refetch: {:?}", key);
                let _ = rx.wait_for(|done| *done).await;
                self.get(&key)
                    .await
                    .ok_or_else(|| SyncError::RequestFailed(format!("refetch failed for {:?}", key)))
            }
            Role::Leader(tx) => {
                let result = match fetch().await {
                    Ok(fetched) => {
                        let mut entries = self.entries.write().await;
                        let merged = reconcile(fetched, entries.get(&key).map(|e| &e.value));
                        entries.insert(
                            key,
                            Entry {
                                value: merged.clone(),
                                stale: false,
                            },
                        );
                        Ok(merged)
                    }
                    Err(e) => {
                        warn!("refetch failed for {:?}: {}", key, e);
                        Err(e)
                    }
                };

                self.in_flight.lock().await.remove(&key);
                let _ = tx.send(true);

                result
            }
        }
    }

    /// Subscribe to invalidation notifications (push-first refresh hooks)
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<CacheKey> {
        self.invalidations.subscribe()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}
