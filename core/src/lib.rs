/// Leadwire - real-time sync engine for the leadwire marketplace
///
/// Reconciles per-thread messaging and platform notifications from three
/// uncoordinated sources (polling reads, push events, optimistic local
/// writes) into one cache-backed, duplicate-free, ordered view, with
/// exactly-once cues and idempotent read-marking.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod notification_sync;
pub mod session;
pub mod thread_sync;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Result, SyncError};
pub use session::SyncSession;
