use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::dispatch::Services;
use crate::stability::record_error;
use crate::transport::Liveness;

/// Periodic session supervisor: probes liveness and drives reconnection when
/// the session drops.
pub struct Heartbeat {
    services: Arc<Services>,
    interval: Duration,
    reconnect_delay: Duration,
    max_attempts: u32,
}

impl Heartbeat {
    pub fn new(services: Arc<Services>) -> Self {
        let cfg = &services.config.stability;
        let interval = Duration::from_secs(cfg.heartbeat_interval_secs);
        let reconnect_delay = Duration::from_secs(cfg.reconnect_delay_secs);
        let max_attempts = cfg.max_reconnect_attempts;
        Self {
            services,
            interval,
            reconnect_delay,
            max_attempts,
        }
    }

    /// One heartbeat. Probes only while the transport believes it is
    /// connected; a dropped session is picked up again once the listener's
    /// reconnect path restores connectivity.
    pub async fn tick(&self) {
        self.services.stability.lock().await.note_heartbeat();

        if !self.services.transport.is_connected() {
            return;
        }

        match self.services.transport.liveness_probe().await {
            Ok(Liveness::Ok) => {}
            Ok(Liveness::LoggedOut) => self.handle_logout().await,
            Err(e) => {
                warn!("Liveness probe failed: {:#}", e);
                record_error(&self.services.stability, format!("Liveness probe failed: {:#}", e))
                    .await;
            }
        }
    }

    /// The session is gone. Attempt a restore, up to the configured cap; the
    /// attempt past the cap records a single fatal entry and gives up.
    async fn handle_logout(&self) {
        let attempts = {
            let mut stability = self.services.stability.lock().await;
            stability.reconnect_attempts += 1;
            stability.reconnect_attempts
        };

        if attempts <= self.max_attempts {
            warn!(
                "Session lost, reconnect attempt {}/{}",
                attempts, self.max_attempts
            );
            tokio::time::sleep(self.reconnect_delay).await;
            if let Err(e) = self.services.transport.restore_session().await {
                warn!("Session restore failed: {:#}", e);
                record_error(&self.services.stability, format!("Session restore failed: {:#}", e))
                    .await;
                return;
            }
            match self.services.transport.check_connectivity(true).await {
                Ok(true) => info!("Session restored after {} attempts", attempts),
                Ok(false) => warn!("Session restore did not reconnect"),
                Err(e) => warn!("Connectivity check after restore failed: {:#}", e),
            }
        } else if attempts == self.max_attempts + 1 {
            error!(
                "Max reconnect attempts ({}) reached, giving up on automatic recovery",
                self.max_attempts
            );
            record_error(
                &self.services.stability,
                format!("Max reconnect attempts ({}) reached", self.max_attempts),
            )
            .await;
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Heartbeat supervisor started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.tick().await;
        }
        info!("Heartbeat supervisor stopped");
    }
}
