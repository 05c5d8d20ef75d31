/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_MS: u64 = 4_000;
const DEFAULT_NOTIFICATION_POLL_INTERVAL_MS: u64 = 30_000;

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST API, e.g. "https://api.example.com"
    pub api_base: String,

    /// Base URL of the push channel, e.g. "wss://api.example.com"
    pub push_url: String,

    /// Bearer credential (header on REST calls, query parameter on the
    /// push channel, which cannot carry custom headers)
    pub token: String,

    /// Id of the signed-in user; used for cue and read-marking decisions
    pub current_user: i64,

    /// Thread message poll interval
    pub poll_interval: Duration,

    /// Notification refetch interval while the push channel is down
    pub notification_poll_interval: Duration,

    /// Per-request timeout for REST calls
    pub request_timeout: Duration,

    /// Push channel connect timeout; exceeding it takes the reconnect path
    pub connect_timeout: Duration,

    /// First reconnect delay after a channel drop
    pub reconnect_base: Duration,

    /// Cap for the exponential reconnect backoff
    pub reconnect_ceiling: Duration,

    /// Consecutive failed reconnects before the feed gives up and surfaces
    /// the failure; None retries forever
    pub max_reconnect_attempts: Option<u32>,

    /// Tolerance window for matching an optimistic send against a server
    /// message when the server did not echo the correlation tag
    pub match_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8080".to_string(),
            push_url: "ws://127.0.0.1:8080".to_string(),
            token: String::new(),
            current_user: 0,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            notification_poll_interval: Duration::from_millis(DEFAULT_NOTIFICATION_POLL_INTERVAL_MS),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_ceiling: Duration::from_secs(30),
            max_reconnect_attempts: None,
            match_window: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <api_base> [command...] [--token <t>] [--user <id>] [--push-url <url>] [--poll-ms <n>]",
                args.first().unwrap_or(&"leadwire".to_string())
            )));
        }

        let api_base = args[1].trim_end_matches('/').to_string();

        let mut token = String::new();
        let mut current_user: Option<i64> = None;
        let mut push_url: Option<String> = None;
        let mut poll_ms: Option<u64> = None;
        let mut command = Vec::new();

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--token" => {
                    let t = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--token requires a value".to_string())
                    })?;
                    token = t.clone();
                    i += 2;
                }
                "--user" => {
                    let u = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--user requires an id argument".to_string())
                    })?;
                    current_user = Some(u.parse::<i64>().map_err(|_| {
                        SyncError::Config("--user must be a numeric id".to_string())
                    })?);
                    i += 2;
                }
                "--push-url" => {
                    let u = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--push-url requires a url argument".to_string())
                    })?;
                    push_url = Some(u.trim_end_matches('/').to_string());
                    i += 2;
                }
                "--poll-ms" => {
                    let p = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--poll-ms requires a value".to_string())
                    })?;
                    poll_ms = Some(p.parse::<u64>().map_err(|_| {
                        SyncError::Config("--poll-ms must be a number of milliseconds".to_string())
                    })?);
                    i += 2;
                }
                other => {
                    command.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(t) = std::env::var("LEADWIRE_TOKEN") {
            token = t;
        }
        if let Some(u) = std::env::var("LEADWIRE_USER")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
        {
            current_user = Some(u);
        }
        if let Ok(u) = std::env::var("LEADWIRE_PUSH_URL") {
            push_url = Some(u.trim_end_matches('/').to_string());
        }

        let current_user = current_user.ok_or_else(|| {
            SyncError::Config("current user id required (--user or LEADWIRE_USER)".to_string())
        })?;

        // Derive the push URL from the API base when not given explicitly:
        // http(s) -> ws(s) on the same host
        let push_url = match push_url {
            Some(u) => u,
            None => {
                if let Some(rest) = api_base.strip_prefix("https://") {
                    format!("wss://{}", rest)
                } else if let Some(rest) = api_base.strip_prefix("http://") {
                    format!("ws://{}", rest)
                } else {
                    return Err(SyncError::Config(
                        "api_base must start with http:// or https://".to_string(),
                    ));
                }
            }
        };

        let config = Self {
            api_base,
            push_url,
            token,
            current_user,
            poll_interval: poll_ms
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)),
            ..Default::default()
        };

        Ok((config, command))
    }
}
