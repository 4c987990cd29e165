use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// The error ring keeps a forgetful history of the most recent failures.
pub const ERROR_RING_CAP: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub time: DateTime<Utc>,
    pub error: String,
}

/// Process-wide health record shared by the background loops.
///
/// Created once at startup, mutated by the listener and the heartbeat
/// supervisor, read by the health/status endpoints. Never persisted.
#[derive(Debug, Default)]
pub struct StabilityState {
    pub reconnect_attempts: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub total_messages: u64,
    errors: VecDeque<ErrorEntry>,
}

pub type SharedStability = Arc<Mutex<StabilityState>>;

impl StabilityState {
    pub fn shared() -> SharedStability {
        Arc::new(Mutex::new(StabilityState::default()))
    }

    /// Append to the bounded error ring, evicting the oldest entry when full.
    pub fn record_error(&mut self, error: impl Into<String>) {
        if self.errors.len() == ERROR_RING_CAP {
            self.errors.pop_front();
        }
        self.errors.push_back(ErrorEntry {
            time: Utc::now(),
            error: error.into(),
        });
    }

    pub fn note_heartbeat(&mut self) {
        self.last_heartbeat = Some(Utc::now());
    }

    /// Called once per processed, non-echoed inbound message.
    pub fn note_message(&mut self) {
        self.last_message_time = Some(Utc::now());
        self.total_messages += 1;
    }

    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.errors.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> StabilitySnapshot {
        StabilitySnapshot {
            reconnect_attempts: self.reconnect_attempts,
            last_heartbeat: self.last_heartbeat,
            last_message_time: self.last_message_time,
            total_messages: self.total_messages,
            recent_errors: self.recent_errors(),
        }
    }
}

/// Point-in-time copy of the stability record, exposed by the management API.
#[derive(Debug, Clone, Serialize)]
pub struct StabilitySnapshot {
    pub reconnect_attempts: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub total_messages: u64,
    pub recent_errors: Vec<ErrorEntry>,
}

/// Fault-boundary helper: record an error from a background loop.
pub async fn record_error(stability: &SharedStability, error: impl Into<String>) {
    stability.lock().await.record_error(error);
}
