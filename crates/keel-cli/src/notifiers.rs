//! Notification transports wired into the backup engine.
//!
//! Both are fire-and-forget: a failing delivery is logged and never
//! affects the backup outcome.

use std::time::Duration;

use async_trait::async_trait;
use keel_core::notifications::{BackupEventData, BackupNotifier, NotificationError};
use tracing::info;

/// Default notifier: terminal events land in the server log.
pub struct LoggingNotifier;

#[async_trait]
impl BackupNotifier for LoggingNotifier {
    async fn notify(&self, event: BackupEventData) -> Result<(), NotificationError> {
        info!(
            backup_id = %event.backup_id,
            database = %event.database_name,
            size = %event.size,
            duration_secs = event.duration_secs,
            "{}",
            event.title()
        );
        Ok(())
    }
}

/// Posts the event payload to a configured webhook.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl BackupNotifier for WebhookNotifier {
    async fn notify(&self, event: BackupEventData) -> Result<(), NotificationError> {
        let payload = serde_json::json!({
            "title": event.title(),
            "backup_id": event.backup_id,
            "connection_id": event.connection_id,
            "database_name": event.database_name,
            "database_type": event.engine,
            "status": event.outcome,
            "size": event.size,
            "duration_seconds": event.duration_secs,
            "error": event.error,
            "timestamp": event.timestamp.to_rfc3339(),
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotificationError::Transport(format!(
                "webhook returned status {}",
                response.status()
            )));
        }

        Ok(())
    }
}
