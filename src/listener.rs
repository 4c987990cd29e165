use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatch::Services;
use crate::stability::record_error;
use crate::storage::FileMetadata;
use crate::transport::{InboundMessage, MessageKind};

const POLL_INITIAL_SECS: f64 = 1.0;
const POLL_MIN_SECS: f64 = 0.5;
const POLL_MAX_SECS: f64 = 3.0;
const POLL_BACKOFF_FACTOR: f64 = 1.2;

/// FIFO bound on remembered message keys.
const PROCESSED_CAP: usize = 5000;
/// Recent outgoing texts held for echo suppression.
const SENT_BUFFER_CAP: usize = 40;
/// The dedup set may drift ahead of the FIFO by this much before it is
/// rebuilt from the FIFO's contents.
const RESYNC_SLACK: usize = 100;

/// The polling listener: scrapes recent messages, filters already-seen ones
/// and its own echoes, and feeds the rest through the dispatch pipeline.
pub struct Listener {
    services: Arc<Services>,
    processed_order: VecDeque<String>,
    processed_set: HashSet<String>,
    sent_buffer: VecDeque<String>,
    poll_secs: f64,
}

impl Listener {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            processed_order: VecDeque::new(),
            processed_set: HashSet::new(),
            sent_buffer: VecDeque::new(),
            poll_secs: POLL_INITIAL_SECS,
        }
    }

    /// One poll cycle. Returns whether any fresh (non-echo) message was
    /// processed, which drives the backoff.
    pub async fn cycle(&mut self) -> Result<bool> {
        if !self.services.transport.is_connected() {
            let restored = self
                .services
                .transport
                .check_connectivity(true)
                .await
                .context("Connectivity check failed")?;
            if !restored {
                return Ok(false);
            }
            info!("Connection restored, resuming message polling");
            self.services.stability.lock().await.reconnect_attempts = 0;
        }

        let limit = self.services.config.listener.fetch_limit;
        let mut messages = self
            .services
            .transport
            .fetch_latest_messages(limit)
            .await
            .context("Message fetch failed")?;
        // The transport reports newest first; process in arrival order.
        messages.reverse();

        let mut had_messages = false;
        for msg in messages {
            let Some(key) = msg.dedup_key() else {
                debug!("Dropping keyless message");
                continue;
            };
            if self.processed_set.contains(key) {
                continue;
            }
            self.record_processed(key.to_string());

            // Our own replies come back on the next poll; swallow them.
            if self.sent_buffer.iter().any(|s| s == msg.text.trim()) {
                debug!("Suppressing echoed reply");
                continue;
            }

            had_messages = true;
            self.services.stability.lock().await.note_message();

            if msg.is_attachment() && self.services.config.listener.auto_download {
                self.download(&msg).await;
            }

            if let Some(reply) = self.services.dispatch(&msg).await {
                match self.services.send_text(&reply).await {
                    Ok(true) => self.record_sent(reply),
                    Ok(false) => warn!("Transport refused reply"),
                    // The rest of the batch is abandoned; everything seen so
                    // far stays deduplicated and the unseen tail comes back
                    // on the next fetch.
                    Err(e) => return Err(e.context("Reply send failed")),
                }
            }
        }

        self.resync_if_needed();
        Ok(had_messages)
    }

    /// Remember a processed key. The FIFO is bounded; eviction does not touch
    /// the set, which catches up on the next resync.
    fn record_processed(&mut self, key: String) {
        self.processed_set.insert(key.clone());
        self.processed_order.push_back(key);
        if self.processed_order.len() > PROCESSED_CAP {
            self.processed_order.pop_front();
        }
    }

    fn record_sent(&mut self, text: String) {
        self.sent_buffer.push_back(text);
        if self.sent_buffer.len() > SENT_BUFFER_CAP {
            self.sent_buffer.pop_front();
        }
    }

    fn resync_if_needed(&mut self) {
        if self.processed_set.len() > self.processed_order.len() + RESYNC_SLACK {
            debug!(
                "Resyncing dedup set ({} keys, {} in order)",
                self.processed_set.len(),
                self.processed_order.len()
            );
            self.processed_set = self.processed_order.iter().cloned().collect();
        }
    }

    fn apply_backoff(&mut self, had_messages: bool) {
        self.poll_secs = if had_messages {
            POLL_MIN_SECS
        } else {
            (self.poll_secs * POLL_BACKOFF_FACTOR).min(POLL_MAX_SECS)
        };
    }

    /// Download a message's attachment and record its metadata.
    ///
    /// Failures are logged and swallowed; a broken download must not stall
    /// the poll cycle.
    async fn download(&self, msg: &InboundMessage) {
        let id = msg.id.trim();
        if id.is_empty() {
            warn!("Attachment message without id, cannot download");
            return;
        }

        let mut name = match &msg.file_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("download_{}", id.chars().take(8).collect::<String>()),
        };
        if msg.kind == MessageKind::Image && !name.contains('.') {
            name.push_str(".jpg");
        }

        let mut dir: PathBuf = self.services.config.listener.download_dir.clone();
        if self.services.config.listener.file_date_subdir {
            dir = dir.join(Local::now().format("%Y-%m-%d").to_string());
        }
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!("Failed to create download directory {}: {}", dir.display(), e);
            return;
        }
        let dest = dir.join(&name);

        match self.services.transport.download_attachment(id, &dest).await {
            Ok(true) => {
                let file_size = tokio::fs::metadata(&dest)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                let mime_type = mime_guess::from_path(&dest)
                    .first()
                    .map(|m| m.essence_str().to_string());
                let meta = FileMetadata {
                    msg_id: id.to_string(),
                    file_name: name,
                    file_path: dest.display().to_string(),
                    file_size,
                    mime_type,
                };
                if let Err(e) = self.services.storage.save_file_metadata(&meta).await {
                    warn!("Failed to record file metadata: {:#}", e);
                    record_error(
                        &self.services.stability,
                        format!("File metadata save failed: {:#}", e),
                    )
                    .await;
                } else {
                    info!("Downloaded attachment to {}", dest.display());
                }
            }
            Ok(false) => warn!("Transport could not download attachment {}", id),
            Err(e) => {
                warn!("Attachment download failed: {:#}", e);
                record_error(
                    &self.services.stability,
                    format!("Attachment download failed: {:#}", e),
                )
                .await;
            }
        }
    }

    /// Fault boundary around one cycle: a failure is recorded into the error
    /// ring and forces the slowest poll interval instead of tearing the loop
    /// down.
    async fn cycle_guarded(&mut self) {
        match self.cycle().await {
            Ok(had_messages) => self.apply_backoff(had_messages),
            Err(e) => {
                warn!("Listener cycle failed: {:#}", e);
                record_error(&self.services.stability, format!("{:#}", e)).await;
                self.poll_secs = POLL_MAX_SECS;
            }
        }
    }

    /// Poll until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Message listener started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs_f64(self.poll_secs)) => {}
            }
            self.cycle_guarded().await;
        }
        info!("Message listener stopped");
    }
}
