use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::dispatch::plugins::{PluginManifest, PluginUnit};
use crate::dispatch::{Command, Services};
use crate::storage::SqliteStorage;
use crate::transport::{InboundMessage, Liveness, Transport};

/// Transport double driven by pre-scripted responses.
pub struct ScriptedTransport {
    connected: AtomicBool,
    /// Each fetch pops one batch; an empty queue yields no messages.
    batches: Mutex<VecDeque<Vec<InboundMessage>>>,
    sent: Mutex<Vec<String>>,
    send_ok: AtomicBool,
    fail_send: AtomicBool,
    fail_fetch: AtomicBool,
    fail_download: AtomicBool,
    /// Each probe pops one scripted result; empty defaults to `Ok`.
    liveness: Mutex<VecDeque<Liveness>>,
    /// Each connectivity check pops one scripted result; empty keeps the
    /// current connected flag.
    connectivity: Mutex<VecDeque<bool>>,
    restore_calls: AtomicUsize,
    save_calls: AtomicUsize,
    download_ok: AtomicBool,
    downloads: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub fn connected() -> Self {
        Self {
            connected: AtomicBool::new(true),
            batches: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            send_ok: AtomicBool::new(true),
            fail_send: AtomicBool::new(false),
            fail_fetch: AtomicBool::new(false),
            fail_download: AtomicBool::new(false),
            liveness: Mutex::new(VecDeque::new()),
            connectivity: Mutex::new(VecDeque::new()),
            restore_calls: AtomicUsize::new(0),
            save_calls: AtomicUsize::new(0),
            download_ok: AtomicBool::new(true),
            downloads: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnected() -> Self {
        let transport = Self::connected();
        transport.connected.store(false, Ordering::SeqCst);
        transport
    }

    pub fn push_batch(&self, batch: Vec<InboundMessage>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    pub fn push_liveness(&self, result: Liveness) {
        self.liveness.lock().unwrap().push_back(result);
    }

    pub fn push_connectivity(&self, connected: bool) {
        self.connectivity.lock().unwrap().push_back(connected);
    }

    pub fn set_send_ok(&self, ok: bool) {
        self.send_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_download(&self, fail: bool) {
        self.fail_download.store(fail, Ordering::SeqCst);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn restore_calls(&self) -> usize {
        self.restore_calls.load(Ordering::SeqCst)
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> Vec<(String, String)> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn check_connectivity(&self, _poll: bool) -> Result<bool> {
        if let Some(result) = self.connectivity.lock().unwrap().pop_front() {
            self.connected.store(result, Ordering::SeqCst);
        }
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn fetch_latest_messages(&self, _limit: usize) -> Result<Vec<InboundMessage>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            anyhow::bail!("scripted fetch failure");
        }
        Ok(self
            .batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn send_text(&self, text: &str) -> Result<bool> {
        if self.fail_send.load(Ordering::SeqCst) {
            anyhow::bail!("scripted send failure");
        }
        if !self.send_ok.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(true)
    }

    async fn download_attachment(&self, message_id: &str, dest: &Path) -> Result<bool> {
        if self.fail_download.load(Ordering::SeqCst) {
            anyhow::bail!("scripted download failure");
        }
        if !self.download_ok.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.downloads
            .lock()
            .unwrap()
            .push((message_id.to_string(), dest.display().to_string()));
        Ok(true)
    }

    async fn save_session(&self) -> Result<bool> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn restore_session(&self) -> Result<()> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn liveness_probe(&self) -> Result<Liveness> {
        let result = self
            .liveness
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Liveness::Ok);
        if matches!(result, Liveness::LoggedOut) {
            self.connected.store(false, Ordering::SeqCst);
        }
        Ok(result)
    }
}

/// Services wired against a scripted transport and an in-memory database,
/// with plugins already loaded.
pub async fn scripted_services(
    transport: Arc<ScriptedTransport>,
    units: Vec<PluginUnit>,
) -> Arc<Services> {
    let mut config = Config::default();
    config.listener.auto_download = false;
    scripted_services_with(config, transport, units).await
}

/// Like [`scripted_services`] with an explicit configuration.
pub async fn scripted_services_with(
    config: Config,
    transport: Arc<ScriptedTransport>,
    units: Vec<PluginUnit>,
) -> Arc<Services> {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let services = Services::new(config, transport, storage, units);
    services.plugins.reload().await;
    services
}

/// Minimal unit registering a `/ping` command.
pub fn ping_unit() -> PluginUnit {
    PluginUnit {
        name: "ping",
        register: || {
            let mut manifest = PluginManifest::default();
            manifest.commands.push(Command::new("ping", |_ctx| {
                Box::pin(async { Ok("pong".to_string()) })
            }));
            Ok(manifest)
        },
    }
}
