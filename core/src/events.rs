/// Event fan-out to presentation surfaces (dialogs, bell menu, CLI)
use crate::cache::CacheKey;
use crate::error::SyncError;
use crate::types::{Severity, ThreadKey};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Push channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events streamed to subscribers. Cue events fire at most once per
/// logically new occurrence; surfaces play sounds / render toasts off
/// these without consulting the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A message from the counterparty landed in an open thread ("receive" cue)
    MessageReceived { thread: ThreadKey },
    /// The current user's send was accepted locally ("send" cue)
    MessageSent { thread: ThreadKey },
    /// A send request failed; the entry is kept visible as failed
    SendFailed { thread: ThreadKey, client_tag: Uuid },
    /// A previously unseen notification arrived over the push channel
    NotificationArrived { id: i64, severity: Severity },
    /// Transient toast presentation for a pushed notification
    Toast {
        id: i64,
        title: String,
        message: String,
        severity: Severity,
    },
    /// Push channel lifecycle transition
    ChannelStateChanged { state: ChannelState },
    /// Reconnect attempts exhausted the configured ceiling
    ChannelLost { reason: String },
    /// A cache key went stale and should be re-read by subscribers
    CacheInvalidated { key: CacheKey },
    /// Credential expired; redirect to login, fired at most once per session
    AuthExpired,
}

/// Broadcast bus carrying SyncEvents. Cloneable handle; subscribers that
/// lag simply miss events (cues are transient by nature).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; a send with no live subscribers is fine
    pub fn emit(&self, event: SyncEvent) {
        tracing::debug!("event: {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One-time latch for credential expiry. The first AuthExpired anywhere in
/// the session emits the global redirect event; later ones are swallowed so
/// a burst of failing calls cannot trigger a redirect storm.
#[derive(Clone)]
pub struct AuthLatch {
    fired: Arc<AtomicBool>,
    events: EventBus,
}

impl AuthLatch {
    pub fn new(events: EventBus) -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Inspect an operation's error; trips the latch on AuthExpired
    pub fn observe(&self, err: &SyncError) {
        if matches!(err, SyncError::AuthExpired) {
            self.trip();
        }
    }

    pub fn trip(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            tracing::warn!("credential expired, signaling redirect");
            self.events.emit(SyncEvent::AuthExpired);
        }
    }
}
