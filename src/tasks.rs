use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatch::Services;
use crate::stability::record_error;

/// How often the clock loop checks for due tasks. Shorter than a minute so a
/// matching minute is never skipped; the per-task fired marker keeps a task
/// from firing twice within it.
const CLOCK_TICK: Duration = Duration::from_secs(20);

/// A time-of-day triggered command.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    pub id: String,
    pub time_hm: String,
    pub command_text: String,
    pub enabled: bool,
    pub description: String,
    /// Minute ("YYYY-MM-DD HH:MM") this task last auto-fired in.
    #[serde(skip)]
    last_fired: Option<String>,
}

/// In-memory table of scheduled tasks with management operations.
pub struct TaskTable {
    tasks: RwLock<HashMap<String, ScheduledTask>>,
}

/// `HH:MM` with 00-23 hours and 00-59 minutes, zero-padded.
fn valid_time_hm(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return false;
    }
    let digits = [bytes[0], bytes[1], bytes[3], bytes[4]];
    if !digits.iter().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let hh = (bytes[0] - b'0') * 10 + (bytes[1] - b'0');
    let mm = (bytes[3] - b'0') * 10 + (bytes[4] - b'0');
    hh < 24 && mm < 60
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Create a task; rejects a malformed time or empty command.
    pub async fn add(
        &self,
        time_hm: &str,
        command_text: &str,
        description: &str,
    ) -> Result<ScheduledTask> {
        if !valid_time_hm(time_hm) {
            anyhow::bail!("invalid time '{}', expected HH:MM", time_hm);
        }
        let command_text = command_text.trim();
        if command_text.is_empty() {
            anyhow::bail!("command text must not be empty");
        }

        let task = ScheduledTask {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            time_hm: time_hm.to_string(),
            command_text: command_text.to_string(),
            enabled: true,
            description: description.to_string(),
            last_fired: None,
        };

        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.clone(), task.clone());
        info!("Scheduled task {} at {}: {}", task.id, task.time_hm, task.command_text);
        Ok(task)
    }

    /// Returns false when the id is unknown.
    pub async fn delete(&self, task_id: &str) -> bool {
        self.tasks.write().await.remove(task_id).is_some()
    }

    /// Returns false when the id is unknown.
    pub async fn set_enabled(&self, task_id: &str, enabled: bool) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(task) => {
                task.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<ScheduledTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// All tasks sorted by (time, id).
    pub async fn list(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| (a.time_hm.as_str(), a.id.as_str()).cmp(&(b.time_hm.as_str(), b.id.as_str())));
        tasks
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Enabled tasks matching the given minute that have not fired in it yet.
    /// Marks them as fired, so calling twice within the same minute returns
    /// them only once.
    pub async fn claim_due(&self, now: DateTime<Local>) -> Vec<ScheduledTask> {
        let time_hm = now.format("%H:%M").to_string();
        let minute = now.format("%Y-%m-%d %H:%M").to_string();

        let mut tasks = self.tasks.write().await;
        let mut due = Vec::new();
        for task in tasks.values_mut() {
            if task.enabled
                && task.time_hm == time_hm
                && task.last_fired.as_deref() != Some(minute.as_str())
            {
                task.last_fired = Some(minute.clone());
                due.push(task.clone());
            }
        }
        due.sort_by(|a, b| a.id.cmp(&b.id));
        due
    }
}

/// Fire every due task through the dispatch pipeline, sending any reply.
pub async fn fire_due(services: &Arc<Services>, now: DateTime<Local>) {
    for task in services.tasks.claim_due(now).await {
        info!("Firing scheduled task {} ({})", task.id, task.command_text);
        if let Some(reply) = services.execute_command_text(&task.command_text).await {
            match services.send_text(&reply).await {
                Ok(true) => {}
                Ok(false) => warn!("Transport refused reply for task {}", task.id),
                Err(e) => {
                    warn!("Failed to send reply for task {}: {:#}", task.id, e);
                    record_error(
                        &services.stability,
                        format!("Task {} reply send failed: {:#}", task.id, e),
                    )
                    .await;
                }
            }
        }
    }
}

/// Clock-tick loop driving autonomous task firing.
pub async fn run_clock_loop(services: Arc<Services>, mut shutdown: watch::Receiver<bool>) {
    info!("Scheduled-task clock started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(CLOCK_TICK) => {}
        }
        fire_due(&services, Local::now()).await;
    }
    info!("Scheduled-task clock stopped");
}
