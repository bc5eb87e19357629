//! Cron-driven backup schedules with missed-run recovery.
//!
//! On process start every enabled schedule is re-registered and any whose
//! next run time already passed gets one immediate run. The tick loop
//! sleeps until the earliest due schedule, fires it, advances its next
//! run time and applies retention afterwards.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use keel_entities::backup_schedules;
use keel_storage::ObjectStore;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::services::backup::BackupService;
use crate::services::error::BackupError;
use crate::services::providers::to_s3_config;

/// Upper bound on how long the tick loop sleeps without re-checking the
/// schedule table.
const IDLE_TICK: Duration = Duration::from_secs(30);

pub struct ScheduleManager {
    backup_service: Arc<BackupService>,
    wakeup: Notify,
}

impl ScheduleManager {
    pub fn new(backup_service: Arc<BackupService>) -> Arc<Self> {
        Arc::new(Self {
            backup_service,
            wakeup: Notify::new(),
        })
    }

    /// Recovery sweep plus the tick loop. Call once at process start.
    pub async fn start(self: Arc<Self>) {
        if let Err(e) = self.recover_schedules().await {
            error!("error recovering schedules: {}", e);
        }

        let manager = Arc::clone(&self);
        tokio::spawn(async move {
            manager.run_loop().await;
        });
    }

    /// Re-registers enabled schedules and dispatches one immediate run
    /// for each whose next run time is already past.
    async fn recover_schedules(&self) -> Result<(), BackupError> {
        let schedules = self.backup_service.repo().get_enabled_schedules().await?;
        let now = Utc::now();

        for schedule in schedules {
            if let Some(next_run) = schedule.next_run_time {
                if next_run < now {
                    info!(
                        "schedule {} missed its run at {}, dispatching now",
                        schedule.id, next_run
                    );
                    self.fire(schedule.clone()).await;
                    continue;
                }
            }

            // No recorded next run: compute one so the loop can pick it up
            if schedule.next_run_time.is_none() {
                match next_occurrence(&schedule.cron_schedule) {
                    Ok(next) => {
                        if let Err(e) = self
                            .backup_service
                            .repo()
                            .update_schedule_times(schedule.id, Some(next), None)
                            .await
                        {
                            warn!("failed to seed next run for schedule {}: {}", schedule.id, e);
                        }
                    }
                    Err(e) => warn!(
                        "schedule {} has an invalid cron expression: {}",
                        schedule.id, e
                    ),
                }
            }
        }

        Ok(())
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let sleep_for = match self.earliest_next_run().await {
                Some(next) => {
                    let now = Utc::now();
                    if next <= now {
                        Duration::ZERO
                    } else {
                        (next - now).to_std().unwrap_or(IDLE_TICK).min(IDLE_TICK)
                    }
                }
                None => IDLE_TICK,
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wakeup.notified() => {}
            }

            if let Err(e) = self.fire_due_schedules().await {
                error!("error firing due schedules: {}", e);
            }
        }
    }

    async fn earliest_next_run(&self) -> Option<DateTime<Utc>> {
        let schedules = self
            .backup_service
            .repo()
            .get_enabled_schedules()
            .await
            .ok()?;
        schedules.into_iter().filter_map(|s| s.next_run_time).min()
    }

    async fn fire_due_schedules(&self) -> Result<(), BackupError> {
        let now = Utc::now();
        let schedules = self.backup_service.repo().get_enabled_schedules().await?;

        for schedule in schedules {
            let due = schedule.next_run_time.map(|t| t <= now).unwrap_or(false);
            if due {
                self.fire(schedule).await;
            }
        }

        Ok(())
    }

    /// Dispatches one run and advances the schedule's bookkeeping. The
    /// dispatch returns as soon as the coordinator accepted the run.
    async fn fire(&self, schedule: backup_schedules::Model) {
        let repo = self.backup_service.repo();
        let now = Utc::now();

        let next = match next_occurrence(&schedule.cron_schedule) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(
                    "schedule {} has an invalid cron expression, not rescheduling: {}",
                    schedule.id, e
                );
                None
            }
        };
        if let Err(e) = repo
            .update_schedule_times(schedule.id, next, Some(now))
            .await
        {
            warn!("failed to update schedule {} run times: {}", schedule.id, e);
        }

        // Restart storms are absorbed here: a connection with a run still
        // in progress is not dispatched again.
        match repo.has_in_progress_backup(schedule.connection_id).await {
            Ok(true) => {
                info!(
                    "skipping scheduled backup for {}: a run is already in progress",
                    schedule.connection_id
                );
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("failed to check in-progress runs: {}", e);
            }
        }

        match Arc::clone(&self.backup_service)
            .start_backup(schedule.connection_id, Vec::new(), Some(schedule.id))
            .await
        {
            Ok(backup) => {
                debug!(
                    "scheduled backup {} dispatched for connection {}",
                    backup.id, schedule.connection_id
                );
            }
            Err(e) => {
                error!(
                    "failed to start scheduled backup for {}: {}",
                    schedule.connection_id, e
                );
            }
        }

        // Retention is applied at run end; the dispatch above returns
        // immediately, so prune on the previous runs' state.
        if let Err(e) = self
            .apply_retention(schedule.connection_id, schedule.retention_days)
            .await
        {
            warn!(
                "retention cleanup failed for connection {}: {}",
                schedule.connection_id, e
            );
        }
    }

    /// Creates or replaces the schedule for a connection.
    pub async fn schedule_backup(
        &self,
        connection_id: Uuid,
        cron_schedule: &str,
        retention_days: i32,
    ) -> Result<backup_schedules::Model, BackupError> {
        if retention_days <= 0 {
            return Err(BackupError::Validation(
                "retention_days must be greater than 0".to_string(),
            ));
        }
        let next = next_occurrence(cron_schedule)?;

        // The connection must exist before a schedule can reference it
        self.backup_service
            .connection_registry()
            .get_connection(connection_id)
            .await?;

        let schedule = self
            .backup_service
            .repo()
            .upsert_schedule(connection_id, cron_schedule, retention_days, Some(next))
            .await?;

        self.wakeup.notify_one();
        Ok(schedule)
    }

    /// Reparses the cron expression and re-registers the schedule.
    pub async fn update_schedule(
        &self,
        connection_id: Uuid,
        cron_schedule: &str,
        retention_days: i32,
    ) -> Result<backup_schedules::Model, BackupError> {
        if retention_days <= 0 {
            return Err(BackupError::Validation(
                "retention_days must be greater than 0".to_string(),
            ));
        }
        let next = next_occurrence(cron_schedule)?;

        self.backup_service
            .repo()
            .get_schedule(connection_id)
            .await?
            .ok_or_else(|| BackupError::NotFound("No active schedule found".to_string()))?;

        let schedule = self
            .backup_service
            .repo()
            .upsert_schedule(connection_id, cron_schedule, retention_days, Some(next))
            .await?;

        self.wakeup.notify_one();
        Ok(schedule)
    }

    pub async fn disable_schedule(&self, connection_id: Uuid) -> Result<(), BackupError> {
        self.backup_service
            .repo()
            .disable_schedule(connection_id)
            .await?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// Deletes terminal backups older than the retention window and
    /// best-effort removes their objects from every recorded binding.
    pub async fn apply_retention(
        &self,
        connection_id: Uuid,
        retention_days: i32,
    ) -> Result<(), BackupError> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
        let repo = self.backup_service.repo();
        let stale = repo.backups_older_than(connection_id, cutoff).await?;

        for backup in stale {
            let bindings = repo.get_backup_providers(backup.id).await?;
            let conn = self
                .backup_service
                .connection_registry()
                .get_connection(connection_id)
                .await;

            if let Ok(conn) = conn {
                for binding in bindings {
                    let provider = self
                        .backup_service
                        .provider_service()
                        .provider_for_upload(binding.s3_provider_id, conn.user_id)
                        .await;
                    let Ok(provider) = provider else { continue };

                    match ObjectStore::connect(to_s3_config(&provider)).await {
                        Ok(store) => {
                            if let Err(e) = store.remove_object(&binding.s3_object_key).await {
                                warn!(
                                    "failed to remove expired object {}: {}",
                                    binding.s3_object_key, e
                                );
                            }
                        }
                        Err(e) => warn!("failed to reach provider {}: {}", provider.name, e),
                    }
                }
            }

            info!("removing expired backup {}", backup.id);
            repo.delete_backup(backup.id).await?;
        }

        Ok(())
    }
}

/// Validates a six-field cron expression and returns its next occurrence.
pub fn next_occurrence(cron_schedule: &str) -> Result<DateTime<Utc>, BackupError> {
    let schedule = Schedule::from_str(cron_schedule)
        .map_err(|e| BackupError::Schedule(format!("invalid cron expression: {}", e)))?;
    schedule
        .upcoming(Utc)
        .next()
        .ok_or_else(|| BackupError::Schedule("no upcoming execution time".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::log_bus::LogBus;
    use crate::services::providers::S3ProviderService;
    use crate::services::registry::ConnectionRegistry;
    use crate::services::repository::{tests::seed_connection, BackupRepository};
    use keel_core::notifications::{BackupEventData, BackupNotifier, NotificationError};
    use keel_database::test_utils::TestDatabase;
    use keel_entities::backups;
    use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter};

    struct NoopNotifier;

    #[async_trait::async_trait]
    impl BackupNotifier for NoopNotifier {
        async fn notify(&self, _event: BackupEventData) -> Result<(), NotificationError> {
            Ok(())
        }
    }

    async fn manager_for_test() -> (
        Arc<ScheduleManager>,
        Arc<keel_database::DbConnection>,
        tempfile::TempDir,
    ) {
        let test_db = TestDatabase::with_migrations().await.unwrap();
        let db = test_db.connection_arc();
        let encryption = Arc::new(keel_core::EncryptionService::new_from_password("test"));
        let registry = Arc::new(ConnectionRegistry::new(db.clone(), encryption.clone()));
        let repo = Arc::new(BackupRepository::new(db.clone()));
        let providers = Arc::new(S3ProviderService::new(db.clone(), encryption));
        let log_bus = LogBus::new(Arc::clone(&repo));
        let root = tempfile::tempdir().unwrap();
        let backup_service = crate::services::backup::BackupService::new(
            registry,
            root.path().to_path_buf(),
            repo,
            providers,
            log_bus,
            Arc::new(NoopNotifier),
        );
        (ScheduleManager::new(backup_service), db, root)
    }

    async fn seed_runnable_connection(db: &Arc<keel_database::DbConnection>) -> Uuid {
        let encryption = keel_core::EncryptionService::new_from_password("test");
        let connection_id = seed_connection(db, Uuid::new_v4()).await;
        let stored = keel_entities::connections::Entity::find_by_id(connection_id)
            .one(db.as_ref())
            .await
            .unwrap()
            .unwrap();
        let mut active: keel_entities::connections::ActiveModel = stored.into();
        active.password = Set(encryption.encrypt_string("pw").unwrap());
        active.update(db.as_ref()).await.unwrap();
        connection_id
    }

    #[tokio::test]
    async fn recovery_sweep_dispatches_missed_schedules_once() {
        let (manager, db, _root) = manager_for_test().await;
        let repo = manager.backup_service.repo();

        let missed_conn = seed_runnable_connection(&db).await;
        let future_conn = seed_runnable_connection(&db).await;

        repo.upsert_schedule(
            missed_conn,
            "0 0 3 * * *",
            7,
            Some(Utc::now() - ChronoDuration::hours(1)),
        )
        .await
        .unwrap();
        repo.upsert_schedule(
            future_conn,
            "0 0 3 * * *",
            7,
            Some(Utc::now() + ChronoDuration::hours(1)),
        )
        .await
        .unwrap();

        manager.recover_schedules().await.unwrap();

        // Exactly one immediate run, for the missed schedule
        let missed_runs = backups::Entity::find()
            .filter(backups::Column::ConnectionId.eq(missed_conn))
            .all(db.as_ref())
            .await
            .unwrap();
        assert_eq!(missed_runs.len(), 1);
        assert!(missed_runs[0].schedule_id.is_some());

        let future_runs = backups::Entity::find()
            .filter(backups::Column::ConnectionId.eq(future_conn))
            .all(db.as_ref())
            .await
            .unwrap();
        assert!(future_runs.is_empty());

        // Both schedules stay registered with a future next run
        let schedules = repo.get_enabled_schedules().await.unwrap();
        assert_eq!(schedules.len(), 2);
        for schedule in schedules {
            assert!(schedule.next_run_time.unwrap() > Utc::now());
        }
    }

    #[tokio::test]
    async fn fire_skips_connections_with_a_run_in_progress() {
        let (manager, db, _root) = manager_for_test().await;
        let repo = manager.backup_service.repo();

        let connection_id = seed_runnable_connection(&db).await;
        crate::services::repository::tests::seed_backup_for_connection(&db, connection_id).await;

        let schedule = repo
            .upsert_schedule(
                connection_id,
                "0 0 3 * * *",
                7,
                Some(Utc::now() - ChronoDuration::minutes(5)),
            )
            .await
            .unwrap();

        manager.fire(schedule).await;

        // Only the pre-existing in_progress run remains
        let runs = backups::Entity::find()
            .filter(backups::Column::ConnectionId.eq(connection_id))
            .all(db.as_ref())
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[test]
    fn next_occurrence_parses_six_field_expressions() {
        // Every day at 03:00:00
        let next = next_occurrence("0 0 3 * * *").unwrap();
        assert!(next > Utc::now());

        // Seconds precision
        assert!(next_occurrence("*/5 * * * * *").is_ok());
    }

    #[test]
    fn next_occurrence_rejects_garbage() {
        assert!(matches!(
            next_occurrence("not a cron"),
            Err(BackupError::Schedule(_))
        ));
        assert!(matches!(
            next_occurrence("61 * * * * *"),
            Err(BackupError::Schedule(_))
        ));
    }
}
