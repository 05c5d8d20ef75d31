/// Transport adapter: REST request/response plus the push channel.
/// Purely a translation layer — normalizes HTTP and socket failures into
/// the SyncError taxonomy and does nothing else. Reconnecting a dropped
/// push channel is the notification synchronizer's job, not this layer's.
use crate::config::Config;
use crate::error::{Result, SyncError};
use futures_util::StreamExt;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// Structured error body the API returns on failures
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct Transport {
    http: reqwest::Client,
    api_base: String,
    push_url: String,
    token: String,
    connect_timeout: Duration,
}

impl Transport {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            api_base: config.api_base.clone(),
            push_url: config.push_url.clone(),
            token: config.token.clone(),
            connect_timeout: config.connect_timeout,
        })
    }

    /// Issue one REST call. 401 maps to AuthExpired so callers can redirect
    /// without retry storms; other non-2xx statuses surface the structured
    /// error body when one is present, the raw text otherwise.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.api_base, path);
        debug!("{} {}", method, path);

        let mut req = self.http.request(method, &url).bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::RequestFailed(format!("{}: {}", path, e)))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::AuthExpired);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            return Err(SyncError::RequestFailed(format!(
                "{} {}: {}",
                status.as_u16(),
                path,
                message
            )));
        }

        Ok(resp)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.request(Method::GET, path, None).await?;
        resp.json::<T>()
            .await
            .map_err(|e| SyncError::RequestFailed(format!("decode {}: {}", path, e)))
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        let resp = self.request(Method::POST, path, Some(body)).await?;
        resp.json::<T>()
            .await
            .map_err(|e| SyncError::RequestFailed(format!("decode {}: {}", path, e)))
    }

    pub async fn post_empty(&self, path: &str) -> Result<()> {
        self.request(Method::POST, path, None).await?;
        Ok(())
    }

    pub async fn patch_empty(&self, path: &str) -> Result<()> {
        self.request(Method::PATCH, path, None).await?;
        Ok(())
    }

    /// Open the push channel. The credential travels as a query parameter
    /// because the upgrade-based protocol cannot carry custom headers. A
    /// connect that does not complete within the bounded window is a failed
    /// attempt, not a hang.
    pub async fn open_push_channel(&self) -> Result<PushChannel> {
        let url = format!(
            "{}/notifications?token={}",
            self.push_url,
            urlencoding::encode(&self.token)
        );

        match timeout(self.connect_timeout, connect_async(url)).await {
            Ok(Ok((stream, _))) => {
                info!("push channel open");
                Ok(PushChannel { inner: stream })
            }
            Ok(Err(e)) => Err(SyncError::ChannelClosed(format!("connect: {}", e))),
            Err(_) => Err(SyncError::Timeout("push channel connect".to_string())),
        }
    }
}

/// Long-lived receive-only event stream from the server
pub struct PushChannel {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl PushChannel {
    /// Next text frame, or None when the server closed the channel cleanly.
    /// Transport-level drops come back as ChannelClosed.
    pub async fn next_frame(&mut self) -> Result<Option<String>> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                // Ping/pong is answered by the protocol layer
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(SyncError::ChannelClosed(e.to_string())),
            }
        }
    }
}
