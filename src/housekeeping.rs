use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatch::Services;
use crate::stability::record_error;

const SESSION_SAVE_INTERVAL: Duration = Duration::from_secs(60);
const FILE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

async fn save_once(services: &Arc<Services>) {
    if !services.transport.is_connected() {
        return;
    }
    match services.transport.save_session().await {
        Ok(true) => debug!("Session saved"),
        Ok(false) => debug!("Transport had no session to save"),
        Err(e) => {
            warn!("Session save failed: {:#}", e);
            record_error(&services.stability, format!("Session save failed: {:#}", e)).await;
        }
    }
}

async fn sweep_once(services: &Arc<Services>, retention_days: u32) {
    match services.storage.cleanup_old_files(retention_days, true).await {
        Ok(0) => debug!("File sweep found nothing to remove"),
        Ok(removed) => info!("File sweep removed {} expired files", removed),
        Err(e) => {
            warn!("File sweep failed: {:#}", e);
            record_error(&services.stability, format!("File sweep failed: {:#}", e)).await;
        }
    }
}

/// Periodically persist the transport session so a restart can resume it.
pub async fn session_saver(services: Arc<Services>, mut shutdown: watch::Receiver<bool>) {
    info!("Session saver started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(SESSION_SAVE_INTERVAL) => {}
        }
        save_once(&services).await;
    }
    info!("Session saver stopped");
}

/// Hourly sweep removing downloaded files past the retention window.
pub async fn file_sweeper(services: Arc<Services>, mut shutdown: watch::Receiver<bool>) {
    let retention_days = services.config.files.retention_days;
    info!("File sweeper started, retention {} days", retention_days);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(FILE_SWEEP_INTERVAL) => {}
        }
        sweep_once(&services, retention_days).await;
    }
    info!("File sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{ping_unit, scripted_services, ScriptedTransport};

    #[tokio::test]
    async fn session_is_saved_while_connected() {
        let transport = Arc::new(ScriptedTransport::connected());
        let services = scripted_services(Arc::clone(&transport), vec![ping_unit()]).await;

        save_once(&services).await;
        save_once(&services).await;
        assert_eq!(transport.save_calls(), 2);
    }

    #[tokio::test]
    async fn disconnected_transport_is_not_saved() {
        let transport = Arc::new(ScriptedTransport::disconnected());
        let services = scripted_services(Arc::clone(&transport), vec![ping_unit()]).await;

        save_once(&services).await;
        assert_eq!(transport.save_calls(), 0);
    }

    #[tokio::test]
    async fn sweep_runs_against_empty_store() {
        let transport = Arc::new(ScriptedTransport::connected());
        let services = scripted_services(Arc::clone(&transport), vec![ping_unit()]).await;

        sweep_once(&services, 7).await;
        let errors = services.stability.lock().await.recent_errors();
        assert!(errors.is_empty());
    }
}
