//! Fire-and-forget notification contract for terminal backup events.
//!
//! Transports (mail, Telegram, webhooks, dashboards) live outside the
//! engine; the coordinator only assembles a payload and hands it to
//! whatever [`BackupNotifier`] was wired in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupOutcome {
    Success,
    CompletedWithErrors,
    Failed,
}

/// Payload delivered on every terminal backup state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEventData {
    pub backup_id: uuid::Uuid,
    pub connection_id: uuid::Uuid,
    pub database_name: String,
    pub engine: String,
    pub outcome: BackupOutcome,
    /// Human-readable size, e.g. "12.41 MB". Empty for failed runs.
    pub size: String,
    /// Wall-clock duration in seconds.
    pub duration_secs: i64,
    /// Truncated error summary, present for failed and partial runs.
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BackupEventData {
    pub fn title(&self) -> String {
        match self.outcome {
            BackupOutcome::Success => format!("Backup succeeded: {}", self.database_name),
            BackupOutcome::CompletedWithErrors => {
                format!("Backup completed with errors: {}", self.database_name)
            }
            BackupOutcome::Failed => format!("Backup failed: {}", self.database_name),
        }
    }
}

#[async_trait]
pub trait BackupNotifier: Send + Sync {
    async fn notify(&self, event: BackupEventData) -> Result<(), NotificationError>;
}

/// Formats bytes into a human-readable string
pub fn format_bytes(bytes: i64) -> String {
    if bytes <= 0 {
        return "0 B".to_string();
    }
    const UNIT: f64 = 1024.0;
    let sizes = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut i = 0;
    while size >= UNIT && i < sizes.len() - 1 {
        size /= UNIT;
        i += 1;
    }
    format!("{:.2} {}", size, sizes[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn titles_by_outcome() {
        let mut event = BackupEventData {
            backup_id: uuid::Uuid::new_v4(),
            connection_id: uuid::Uuid::new_v4(),
            database_name: "shop".to_string(),
            engine: "postgresql".to_string(),
            outcome: BackupOutcome::Success,
            size: "1.00 MB".to_string(),
            duration_secs: 3,
            error: None,
            timestamp: Utc::now(),
        };
        assert_eq!(event.title(), "Backup succeeded: shop");

        event.outcome = BackupOutcome::CompletedWithErrors;
        assert!(event.title().starts_with("Backup completed with errors"));

        event.outcome = BackupOutcome::Failed;
        assert_eq!(event.title(), "Backup failed: shop");
    }
}
