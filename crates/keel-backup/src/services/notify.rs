//! Terminal-event notification dispatch.
//!
//! Builds the payload for a finished backup and hands it to the wired
//! notifier. Dispatch is fire-and-forget; a failing transport never
//! affects the backup outcome.

use std::sync::Arc;

use chrono::Utc;
use keel_core::notifications::{format_bytes, BackupEventData, BackupNotifier, BackupOutcome};
use keel_entities::{backups, backups::Model as Backup};
use tracing::warn;

use crate::services::registry::ResolvedConnection;

const MAX_ERROR_LEN: usize = 512;

pub fn outcome_for_status(status: &str) -> Option<BackupOutcome> {
    match status {
        backups::STATUS_SUCCESS => Some(BackupOutcome::Success),
        backups::STATUS_COMPLETED_WITH_ERRORS => Some(BackupOutcome::CompletedWithErrors),
        backups::STATUS_FAILED => Some(BackupOutcome::Failed),
        _ => None,
    }
}

/// Assembles the event payload for a terminal backup state.
pub fn build_event(
    backup: &Backup,
    conn: &ResolvedConnection,
    error: Option<&str>,
) -> Option<BackupEventData> {
    let outcome = outcome_for_status(&backup.status)?;

    let duration_secs = backup
        .completed_time
        .map(|end| (end - backup.started_time).num_seconds())
        .unwrap_or(0);

    let size = if matches!(outcome, BackupOutcome::Failed) {
        String::new()
    } else {
        format_bytes(backup.size)
    };

    Some(BackupEventData {
        backup_id: backup.id,
        connection_id: conn.id,
        database_name: conn.database_name.clone(),
        engine: conn.engine.clone(),
        outcome,
        size,
        duration_secs,
        error: error.map(truncate_error),
        timestamp: Utc::now(),
    })
}

/// Dispatches without blocking the coordinator's terminal path.
pub fn dispatch(notifier: Arc<dyn BackupNotifier>, event: BackupEventData) {
    tokio::spawn(async move {
        let backup_id = event.backup_id;
        if let Err(e) = notifier.notify(event).await {
            warn!("failed to send notification for backup {}: {}", backup_id, e);
        }
    });
}

fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut cut = MAX_ERROR_LEN;
    while !error.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &error[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn sample_backup(status: &str) -> Backup {
        let started = Utc::now() - Duration::seconds(42);
        Backup {
            id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            schedule_id: None,
            status: status.to_string(),
            path: "/tmp/shop.sql".to_string(),
            s3_object_key: None,
            s3_provider_id: None,
            size: 2048,
            md5_hash: None,
            sha256_hash: None,
            logs: None,
            started_time: started,
            completed_time: Some(started + Duration::seconds(42)),
            created_at: started,
            updated_at: started,
        }
    }

    fn sample_connection() -> ResolvedConnection {
        ResolvedConnection {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "pg prod".to_string(),
            engine: "postgresql".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            username: "app".to_string(),
            password: "pw".to_string(),
            database_name: "shop".to_string(),
            ssh_enabled: false,
            ssh_host: None,
            ssh_port: None,
            ssh_username: None,
            ssh_password: None,
            ssh_private_key: None,
        }
    }

    #[test]
    fn event_carries_size_duration_and_truncated_error() {
        let backup = sample_backup(backups::STATUS_COMPLETED_WITH_ERRORS);
        let conn = sample_connection();
        let long_error = "x".repeat(2000);

        let event = build_event(&backup, &conn, Some(&long_error)).unwrap();
        assert_eq!(event.database_name, "shop");
        assert_eq!(event.duration_secs, 42);
        assert_eq!(event.size, "2.00 KB");
        let error = event.error.unwrap();
        assert!(error.chars().count() <= MAX_ERROR_LEN + 1);
        assert!(error.ends_with('…'));
    }

    #[test]
    fn failed_events_omit_size() {
        let backup = sample_backup(backups::STATUS_FAILED);
        let conn = sample_connection();
        let event = build_event(&backup, &conn, Some("boom")).unwrap();
        assert!(matches!(event.outcome, BackupOutcome::Failed));
        assert!(event.size.is_empty());
        assert_eq!(event.error.as_deref(), Some("boom"));
    }

    #[test]
    fn in_progress_produces_no_event() {
        let backup = sample_backup(backups::STATUS_IN_PROGRESS);
        let conn = sample_connection();
        assert!(build_event(&backup, &conn, None).is_none());
    }
}
