pub mod http;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

/// Kind of an inbound message as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image,
    File,
    Other,
}

impl MessageKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "text" | "" => MessageKind::Text,
            "image" => MessageKind::Image,
            "file" => MessageKind::File,
            _ => MessageKind::Other,
        }
    }
}

/// A message scraped from the peer channel during one poll.
///
/// Ephemeral: produced per poll by the transport and dropped after dispatch;
/// the orchestration core never persists it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub text: String,
    pub kind: MessageKind,
    pub file_name: Option<String>,
}

impl InboundMessage {
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            kind: MessageKind::Text,
            file_name: None,
        }
    }

    /// Key used to recognize an already-seen message: the id when present,
    /// the text otherwise. `None` means the message carries nothing to key on
    /// and must be dropped without processing.
    pub fn dedup_key(&self) -> Option<&str> {
        let id = self.id.trim();
        if !id.is_empty() {
            return Some(id);
        }
        let text = self.text.trim();
        if !text.is_empty() {
            return Some(text);
        }
        None
    }

    pub fn is_attachment(&self) -> bool {
        matches!(self.kind, MessageKind::Image | MessageKind::File)
    }
}

/// Result of a lightweight session-liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Ok,
    LoggedOut,
}

/// The external messaging transport, consumed by the orchestration core.
///
/// Implementations own login/session mechanics; the core only drives these
/// operations. `is_connected` returns cached state and must not block.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Actively verify connectivity. With `poll = true` the transport may
    /// take its slower polling path; the cached state is refreshed either way.
    async fn check_connectivity(&self, poll: bool) -> Result<bool>;

    /// Fetch up to `limit` most recent messages, newest first.
    async fn fetch_latest_messages(&self, limit: usize) -> Result<Vec<InboundMessage>>;

    /// Send a text reply. Returns false when the transport refused the send
    /// without a hard error.
    async fn send_text(&self, text: &str) -> Result<bool>;

    /// Download the attachment of a message to `dest`.
    async fn download_attachment(&self, message_id: &str, dest: &Path) -> Result<bool>;

    async fn save_session(&self) -> Result<bool>;

    /// Attempt to restore a previously saved session.
    async fn restore_session(&self) -> Result<()>;

    async fn liveness_probe(&self) -> Result<Liveness>;
}
