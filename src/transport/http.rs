use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{InboundMessage, Liveness, MessageKind, Transport};
use crate::config::TransportConfig;

/// Transport binding that talks to the browser-automation sidecar over its
/// REST surface. The sidecar owns the actual page session; this client only
/// drives it and caches the last known connectivity state.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    connected: AtomicBool,
}

#[derive(Deserialize)]
struct StatusResponse {
    logged_in: bool,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    text: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    file_name: Option<String>,
}

#[derive(Deserialize)]
struct LivenessResponse {
    status: String,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build transport HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            connected: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn check_connectivity(&self, poll: bool) -> Result<bool> {
        let resp: StatusResponse = self
            .client
            .get(self.url("/status"))
            .query(&[("poll", poll)])
            .send()
            .await
            .context("Connectivity check request failed")?
            .json()
            .await
            .context("Connectivity check returned malformed body")?;

        self.connected.store(resp.logged_in, Ordering::Relaxed);
        Ok(resp.logged_in)
    }

    async fn fetch_latest_messages(&self, limit: usize) -> Result<Vec<InboundMessage>> {
        let resp: MessagesResponse = self
            .client
            .get(self.url("/messages"))
            .query(&[("limit", limit)])
            .send()
            .await
            .context("Message fetch request failed")?
            .json()
            .await
            .context("Message fetch returned malformed body")?;

        Ok(resp
            .messages
            .into_iter()
            .map(|m| InboundMessage {
                id: m.id,
                text: m.text,
                kind: MessageKind::parse(&m.kind),
                file_name: m.file_name,
            })
            .collect())
    }

    async fn send_text(&self, text: &str) -> Result<bool> {
        let resp = self
            .client
            .post(self.url("/send"))
            .json(&serde_json::json!({ "content": text }))
            .send()
            .await
            .context("Send request failed")?;

        if !resp.status().is_success() {
            warn!("Transport refused send: HTTP {}", resp.status());
            return Ok(false);
        }
        Ok(true)
    }

    async fn download_attachment(&self, message_id: &str, dest: &Path) -> Result<bool> {
        let resp = self
            .client
            .get(self.url(&format!("/attachments/{}", message_id)))
            .send()
            .await
            .context("Attachment download request failed")?;

        if !resp.status().is_success() {
            debug!(
                "Attachment {} not available: HTTP {}",
                message_id,
                resp.status()
            );
            return Ok(false);
        }

        let bytes = resp
            .bytes()
            .await
            .context("Failed to read attachment body")?;
        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("Failed to write attachment to {}", dest.display()))?;
        Ok(true)
    }

    async fn save_session(&self) -> Result<bool> {
        let resp = self
            .client
            .post(self.url("/save_session"))
            .send()
            .await
            .context("Session save request failed")?;
        Ok(resp.status().is_success())
    }

    async fn restore_session(&self) -> Result<()> {
        self.client
            .post(self.url("/restore_session"))
            .send()
            .await
            .context("Session restore request failed")?;
        Ok(())
    }

    async fn liveness_probe(&self) -> Result<Liveness> {
        let resp: LivenessResponse = self
            .client
            .get(self.url("/liveness"))
            .send()
            .await
            .context("Liveness probe request failed")?
            .json()
            .await
            .context("Liveness probe returned malformed body")?;

        if resp.status == "logged_out" {
            // The cached state goes stale the moment the session drops.
            self.connected.store(false, Ordering::Relaxed);
            return Ok(Liveness::LoggedOut);
        }
        Ok(Liveness::Ok)
    }
}
