//! Durable store for backups, line-addressed logs, bindings, schedules
//! and share links.
//!
//! Log appends are serialized by a process-wide mutex so line numbers can
//! never race; this is the only global lock in the engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_database::DbConnection;
use keel_entities::{
    backup_logs, backup_s3_providers, backup_schedules, backups, connections, shareable_links,
};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::services::error::BackupError;

const APPEND_MAX_RETRIES: u32 = 5;
const APPEND_BASE_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct BackupListOptions {
    pub user_id: Uuid,
    pub limit: u64,
    pub offset: u64,
    pub search: String,
}

/// Backup row joined with its connection for list views.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackupListItem {
    #[serde(flatten)]
    pub backup: backups::Model,
    pub database_name: String,
    pub engine: String,
}

pub struct BackupRepository {
    db: Arc<DbConnection>,
    append_log_mutex: Mutex<()>,
}

impl BackupRepository {
    pub fn new(db: Arc<DbConnection>) -> Self {
        Self {
            db,
            append_log_mutex: Mutex::new(()),
        }
    }

    pub fn db(&self) -> &Arc<DbConnection> {
        &self.db
    }

    // ----- backups -----

    pub async fn create_backup(&self, backup: backups::Model) -> Result<(), BackupError> {
        let active = backups::ActiveModel {
            id: Set(backup.id),
            connection_id: Set(backup.connection_id),
            schedule_id: Set(backup.schedule_id),
            status: Set(backup.status),
            path: Set(backup.path),
            s3_object_key: Set(backup.s3_object_key),
            s3_provider_id: Set(backup.s3_provider_id),
            size: Set(backup.size),
            md5_hash: Set(backup.md5_hash),
            sha256_hash: Set(backup.sha256_hash),
            logs: Set(backup.logs),
            started_time: Set(backup.started_time),
            completed_time: Set(backup.completed_time),
            created_at: Set(backup.created_at),
            updated_at: Set(backup.updated_at),
        };
        active.insert(self.db.as_ref()).await?;
        Ok(())
    }

    /// Persists a backup's mutable fields. The legacy `logs` column is
    /// intentionally absent here: it may only change through append_log.
    pub async fn update_backup(&self, backup: &backups::Model) -> Result<(), BackupError> {
        let active = backups::ActiveModel {
            id: Set(backup.id),
            status: Set(backup.status.clone()),
            path: Set(backup.path.clone()),
            s3_object_key: Set(backup.s3_object_key.clone()),
            s3_provider_id: Set(backup.s3_provider_id),
            size: Set(backup.size),
            md5_hash: Set(backup.md5_hash.clone()),
            sha256_hash: Set(backup.sha256_hash.clone()),
            started_time: Set(backup.started_time),
            completed_time: Set(backup.completed_time),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        active.update(self.db.as_ref()).await?;
        Ok(())
    }

    pub async fn get_backup(&self, id: Uuid) -> Result<backups::Model, BackupError> {
        backups::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("Backup {} not found", id)))
    }

    pub async fn list_backups(
        &self,
        opts: BackupListOptions,
    ) -> Result<(Vec<BackupListItem>, u64), BackupError> {
        let mut query = backups::Entity::find()
            .find_also_related(connections::Entity)
            .filter(connections::Column::UserId.eq(opts.user_id));

        if !opts.search.is_empty() {
            query = query.filter(
                Condition::any()
                    .add(backups::Column::Path.contains(&opts.search))
                    .add(backups::Column::Status.contains(&opts.search)),
            );
        }

        let total = query.clone().count(self.db.as_ref()).await?;

        let rows = query
            .order_by_desc(backups::Column::CreatedAt)
            .offset(opts.offset)
            .limit(opts.limit)
            .all(self.db.as_ref())
            .await?;

        let items = rows
            .into_iter()
            .filter_map(|(backup, conn)| {
                conn.map(|c| BackupListItem {
                    backup,
                    database_name: c.database_name,
                    engine: c.engine,
                })
            })
            .collect();

        Ok((items, total))
    }

    pub async fn get_active_backups(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<BackupListItem>, BackupError> {
        let rows = backups::Entity::find()
            .find_also_related(connections::Entity)
            .filter(connections::Column::UserId.eq(user_id))
            .filter(backups::Column::Status.eq(backups::STATUS_IN_PROGRESS))
            .order_by_desc(backups::Column::StartedTime)
            .all(self.db.as_ref())
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(backup, conn)| {
                conn.map(|c| BackupListItem {
                    backup,
                    database_name: c.database_name,
                    engine: c.engine,
                })
            })
            .collect())
    }

    pub async fn has_in_progress_backup(&self, connection_id: Uuid) -> Result<bool, BackupError> {
        let count = backups::Entity::find()
            .filter(backups::Column::ConnectionId.eq(connection_id))
            .filter(backups::Column::Status.eq(backups::STATUS_IN_PROGRESS))
            .count(self.db.as_ref())
            .await?;
        Ok(count > 0)
    }

    pub async fn backups_older_than(
        &self,
        connection_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<backups::Model>, BackupError> {
        let rows = backups::Entity::find()
            .filter(backups::Column::ConnectionId.eq(connection_id))
            .filter(backups::Column::CreatedAt.lt(cutoff))
            .filter(backups::Column::Status.ne(backups::STATUS_IN_PROGRESS))
            .all(self.db.as_ref())
            .await?;
        Ok(rows)
    }

    /// Removes a backup together with its logs, bindings and share links.
    pub async fn delete_backup(&self, id: Uuid) -> Result<(), BackupError> {
        let txn = self.db.begin().await?;

        backup_logs::Entity::delete_many()
            .filter(backup_logs::Column::BackupId.eq(id))
            .exec(&txn)
            .await?;
        backup_s3_providers::Entity::delete_many()
            .filter(backup_s3_providers::Column::BackupId.eq(id))
            .exec(&txn)
            .await?;
        shareable_links::Entity::delete_many()
            .filter(shareable_links::Column::BackupId.eq(id))
            .exec(&txn)
            .await?;
        backups::Entity::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;
        Ok(())
    }

    // ----- log append (single-writer) -----

    /// Appends log lines with contiguous line numbers.
    ///
    /// Serialized process-wide; retried on SQLite busy errors with
    /// exponential backoff. Falls back to the legacy backups.logs column
    /// when the line table does not exist yet.
    pub async fn append_log(&self, backup_id: Uuid, lines: &[String]) -> Result<(), BackupError> {
        let flat: Vec<String> = lines
            .iter()
            .flat_map(|l| l.split('\n'))
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if flat.is_empty() {
            return Ok(());
        }

        let _guard = self.append_log_mutex.lock().await;

        for attempt in 0..APPEND_MAX_RETRIES {
            match self.try_append(backup_id, &flat).await {
                Ok(()) => return Ok(()),
                Err(e) if is_missing_log_table(&e) => {
                    return self.append_log_legacy(backup_id, &flat).await;
                }
                Err(e) if is_busy_error(&e) && attempt < APPEND_MAX_RETRIES - 1 => {
                    tokio::time::sleep(APPEND_BASE_DELAY * (1 << attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(BackupError::Internal(format!(
            "failed to append log after {} retries",
            APPEND_MAX_RETRIES
        )))
    }

    async fn try_append(&self, backup_id: Uuid, lines: &[String]) -> Result<(), BackupError> {
        let txn = self.db.begin().await?;

        let max_line: Option<i64> = backup_logs::Entity::find()
            .filter(backup_logs::Column::BackupId.eq(backup_id))
            .select_only()
            .column_as(backup_logs::Column::LineNumber.max(), "max_line")
            .into_tuple()
            .one(&txn)
            .await?
            .flatten();

        let start = max_line.unwrap_or(0) + 1;
        let now = Utc::now();

        let rows: Vec<backup_logs::ActiveModel> = lines
            .iter()
            .enumerate()
            .map(|(i, line)| backup_logs::ActiveModel {
                id: Set(Uuid::new_v4()),
                backup_id: Set(backup_id),
                log_line: Set(line.clone()),
                line_number: Set(start + i as i64),
                created_at: Set(now),
            })
            .collect();

        backup_logs::Entity::insert_many(rows).exec(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn append_log_legacy(
        &self,
        backup_id: Uuid,
        lines: &[String],
    ) -> Result<(), BackupError> {
        for attempt in 0..APPEND_MAX_RETRIES {
            match self.try_append_legacy(backup_id, lines).await {
                Ok(()) => return Ok(()),
                Err(e) if is_busy_error(&e) && attempt < APPEND_MAX_RETRIES - 1 => {
                    tokio::time::sleep(APPEND_BASE_DELAY * (1 << attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(BackupError::Internal(format!(
            "failed to append log after {} retries",
            APPEND_MAX_RETRIES
        )))
    }

    async fn try_append_legacy(
        &self,
        backup_id: Uuid,
        lines: &[String],
    ) -> Result<(), BackupError> {
        let txn = self.db.begin().await?;

        let backup = backups::Entity::find_by_id(backup_id)
            .one(&txn)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("Backup {} not found", backup_id)))?;

        let appended = lines.join("\n");
        let new_logs = match backup.logs.as_deref() {
            Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, appended),
            _ => appended,
        };

        let active = backups::ActiveModel {
            id: Set(backup_id),
            logs: Set(Some(new_logs)),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        active.update(&txn).await?;

        txn.commit().await?;
        Ok(())
    }

    /// Reads the full log text, preferring the line-addressed table and
    /// falling back to the legacy column.
    pub async fn get_backup_logs(&self, backup_id: Uuid) -> Result<String, BackupError> {
        let lines: Result<Vec<String>, _> = backup_logs::Entity::find()
            .filter(backup_logs::Column::BackupId.eq(backup_id))
            .order_by_asc(backup_logs::Column::LineNumber)
            .all(self.db.as_ref())
            .await
            .map(|rows| rows.into_iter().map(|r| r.log_line).collect());

        match lines {
            Ok(lines) if !lines.is_empty() => return Ok(lines.join("\n")),
            Ok(_) => {}
            // Missing table on pre-migration stores: fall through to legacy
            Err(_) => {}
        }

        let backup = backups::Entity::find_by_id(backup_id)
            .one(self.db.as_ref())
            .await?;
        Ok(backup.and_then(|b| b.logs).unwrap_or_default())
    }

    // ----- provider bindings -----

    pub async fn add_backup_provider(
        &self,
        backup_id: Uuid,
        provider_id: Uuid,
        object_key: &str,
    ) -> Result<(), BackupError> {
        let active = backup_s3_providers::ActiveModel {
            id: Set(Uuid::new_v4()),
            backup_id: Set(backup_id),
            s3_provider_id: Set(provider_id),
            s3_object_key: Set(object_key.to_string()),
            created_at: Set(Utc::now()),
        };

        backup_s3_providers::Entity::insert(active)
            .on_conflict(
                OnConflict::columns([
                    backup_s3_providers::Column::BackupId,
                    backup_s3_providers::Column::S3ProviderId,
                ])
                .update_columns([
                    backup_s3_providers::Column::S3ObjectKey,
                    backup_s3_providers::Column::CreatedAt,
                ])
                .to_owned(),
            )
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    pub async fn get_backup_providers(
        &self,
        backup_id: Uuid,
    ) -> Result<Vec<backup_s3_providers::Model>, BackupError> {
        let rows = backup_s3_providers::Entity::find()
            .filter(backup_s3_providers::Column::BackupId.eq(backup_id))
            .order_by_asc(backup_s3_providers::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        Ok(rows)
    }

    // ----- share links -----

    pub async fn create_shareable_link(
        &self,
        backup_id: Uuid,
        provider_id: Option<Uuid>,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), BackupError> {
        let active = shareable_links::ActiveModel {
            id: Set(Uuid::new_v4()),
            backup_id: Set(backup_id),
            s3_provider_id: Set(provider_id),
            token: Set(token.to_string()),
            expires_at: Set(expires_at),
            access_count: Set(0),
            created_at: Set(Utc::now()),
        };
        active.insert(self.db.as_ref()).await?;
        Ok(())
    }

    /// Resolves a share token, rejecting unknown and expired ones, and
    /// counts the access.
    pub async fn resolve_shareable_link(
        &self,
        token: &str,
    ) -> Result<(Uuid, Option<Uuid>), BackupError> {
        let link = shareable_links::Entity::find()
            .filter(shareable_links::Column::Token.eq(token))
            .one(self.db.as_ref())
            .await?
            .ok_or(BackupError::ShareInvalid)?;

        if Utc::now() > link.expires_at {
            return Err(BackupError::ShareInvalid);
        }

        let backup_id = link.backup_id;
        let provider_id = link.s3_provider_id;
        let access_count = link.access_count;

        let mut active: shareable_links::ActiveModel = link.into();
        active.access_count = Set(access_count + 1);
        active.update(self.db.as_ref()).await?;

        Ok((backup_id, provider_id))
    }

    // ----- schedules -----

    pub async fn get_schedule(
        &self,
        connection_id: Uuid,
    ) -> Result<Option<backup_schedules::Model>, BackupError> {
        let row = backup_schedules::Entity::find()
            .filter(backup_schedules::Column::ConnectionId.eq(connection_id))
            .order_by_desc(backup_schedules::Column::CreatedAt)
            .one(self.db.as_ref())
            .await?;
        Ok(row)
    }

    pub async fn get_enabled_schedules(
        &self,
    ) -> Result<Vec<backup_schedules::Model>, BackupError> {
        let rows = backup_schedules::Entity::find()
            .filter(backup_schedules::Column::Enabled.eq(true))
            .order_by_desc(backup_schedules::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        Ok(rows)
    }

    /// Creates or updates the schedule for a connection.
    pub async fn upsert_schedule(
        &self,
        connection_id: Uuid,
        cron_schedule: &str,
        retention_days: i32,
        next_run_time: Option<DateTime<Utc>>,
    ) -> Result<backup_schedules::Model, BackupError> {
        match self.get_schedule(connection_id).await? {
            Some(existing) => {
                let mut active: backup_schedules::ActiveModel = existing.into();
                active.enabled = Set(true);
                active.cron_schedule = Set(cron_schedule.to_string());
                active.retention_days = Set(retention_days);
                active.next_run_time = Set(next_run_time);
                Ok(active.update(self.db.as_ref()).await?)
            }
            None => {
                let now = Utc::now();
                let active = backup_schedules::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    connection_id: Set(connection_id),
                    enabled: Set(true),
                    cron_schedule: Set(cron_schedule.to_string()),
                    retention_days: Set(retention_days),
                    next_run_time: Set(next_run_time),
                    last_backup_time: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                Ok(active.insert(self.db.as_ref()).await?)
            }
        }
    }

    pub async fn disable_schedule(&self, connection_id: Uuid) -> Result<(), BackupError> {
        let schedule = self
            .get_schedule(connection_id)
            .await?
            .ok_or_else(|| BackupError::NotFound("No active schedule found".to_string()))?;

        let mut active: backup_schedules::ActiveModel = schedule.into();
        active.enabled = Set(false);
        active.next_run_time = Set(None);
        active.update(self.db.as_ref()).await?;
        Ok(())
    }

    pub async fn update_schedule_times(
        &self,
        schedule_id: Uuid,
        next_run_time: Option<DateTime<Utc>>,
        last_backup_time: Option<DateTime<Utc>>,
    ) -> Result<(), BackupError> {
        let mut active = backup_schedules::ActiveModel {
            id: Set(schedule_id),
            next_run_time: Set(next_run_time),
            ..Default::default()
        };
        if last_backup_time.is_some() {
            active.last_backup_time = Set(last_backup_time);
        }
        active.update(self.db.as_ref()).await?;
        Ok(())
    }
}

fn is_busy_error(err: &BackupError) -> bool {
    let text = err.to_string();
    text.contains("database is locked") || text.contains("database is busy")
}

fn is_missing_log_table(err: &BackupError) -> bool {
    err.to_string().contains("no such table: backup_logs")
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use keel_database::test_utils::TestDatabase;

    /// Inserts a connection and an in_progress backup, returning the
    /// backup id. Shared with the log bus tests.
    pub async fn seed_backup(db: &Arc<DbConnection>) -> Uuid {
        seed_backup_for_user(db, Uuid::new_v4()).await
    }

    pub async fn seed_backup_for_user(db: &Arc<DbConnection>, user_id: Uuid) -> Uuid {
        let connection_id = seed_connection(db, user_id).await;
        seed_backup_for_connection(db, connection_id).await
    }

    pub async fn seed_connection(db: &Arc<DbConnection>, user_id: Uuid) -> Uuid {
        let now = Utc::now();
        let connection_id = Uuid::new_v4();
        let conn = connections::ActiveModel {
            id: Set(connection_id),
            user_id: Set(user_id),
            name: Set("pg prod".to_string()),
            engine: Set("postgresql".to_string()),
            host: Set("localhost".to_string()),
            port: Set(5432),
            username: Set("postgres".to_string()),
            password: Set("encrypted".to_string()),
            database_name: Set("shop".to_string()),
            ssh_enabled: Set(false),
            ssh_host: Set(None),
            ssh_port: Set(None),
            ssh_username: Set(None),
            ssh_password: Set(None),
            ssh_private_key: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        conn.insert(db.as_ref()).await.unwrap();
        connection_id
    }

    pub async fn seed_backup_for_connection(db: &Arc<DbConnection>, connection_id: Uuid) -> Uuid {
        let now = Utc::now();
        let backup_id = Uuid::new_v4();
        let backup = backups::ActiveModel {
            id: Set(backup_id),
            connection_id: Set(connection_id),
            schedule_id: Set(None),
            status: Set(backups::STATUS_IN_PROGRESS.to_string()),
            path: Set("/tmp/pg_prod/shop_20250102_030405.sql".to_string()),
            s3_object_key: Set(None),
            s3_provider_id: Set(None),
            size: Set(0),
            md5_hash: Set(None),
            sha256_hash: Set(None),
            logs: Set(None),
            started_time: Set(now),
            completed_time: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        backup.insert(db.as_ref()).await.unwrap();
        backup_id
    }

    async fn repo() -> (BackupRepository, Arc<DbConnection>) {
        let test_db = TestDatabase::with_migrations().await.unwrap();
        let db = test_db.connection_arc();
        (BackupRepository::new(db.clone()), db)
    }

    #[tokio::test]
    async fn append_log_assigns_contiguous_line_numbers_from_one() {
        let (repo, db) = repo().await;
        let backup_id = seed_backup(&db).await;

        repo.append_log(backup_id, &["first".into(), "second".into()])
            .await
            .unwrap();
        repo.append_log(backup_id, &["third\nfourth".into()])
            .await
            .unwrap();

        let rows = backup_logs::Entity::find()
            .filter(backup_logs::Column::BackupId.eq(backup_id))
            .order_by_asc(backup_logs::Column::LineNumber)
            .all(db.as_ref())
            .await
            .unwrap();

        let numbers: Vec<i64> = rows.iter().map(|r| r.line_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        let lines: Vec<&str> = rows.iter().map(|r| r.log_line.as_str()).collect();
        assert_eq!(lines, vec!["first", "second", "third", "fourth"]);
    }

    #[tokio::test]
    async fn append_log_skips_empty_lines() {
        let (repo, db) = repo().await;
        let backup_id = seed_backup(&db).await;

        repo.append_log(backup_id, &["a\n\nb".into(), "".into()])
            .await
            .unwrap();

        let logs = repo.get_backup_logs(backup_id).await.unwrap();
        assert_eq!(logs, "a\nb");
    }

    #[tokio::test]
    async fn get_backup_logs_falls_back_to_legacy_column() {
        let (repo, db) = repo().await;
        let backup_id = seed_backup(&db).await;

        // Simulate a pre-migration store
        let test_db = TestDatabase { db: db.clone() };
        test_db.execute_sql("DROP TABLE backup_logs").await.unwrap();

        repo.append_log(backup_id, &["legacy one".into(), "legacy two".into()])
            .await
            .unwrap();

        let logs = repo.get_backup_logs(backup_id).await.unwrap();
        assert_eq!(logs, "legacy one\nlegacy two");

        // Appends accumulate in the legacy column
        repo.append_log(backup_id, &["legacy three".into()])
            .await
            .unwrap();
        let logs = repo.get_backup_logs(backup_id).await.unwrap();
        assert_eq!(logs, "legacy one\nlegacy two\nlegacy three");
    }

    #[tokio::test]
    async fn update_backup_preserves_legacy_logs_column() {
        let (repo, db) = repo().await;
        let backup_id = seed_backup(&db).await;

        // Legacy logs already present
        let active = backups::ActiveModel {
            id: Set(backup_id),
            logs: Set(Some("kept line".to_string())),
            ..Default::default()
        };
        active.update(db.as_ref()).await.unwrap();

        let mut backup = repo.get_backup(backup_id).await.unwrap();
        backup.status = backups::STATUS_SUCCESS.to_string();
        backup.completed_time = Some(Utc::now());
        repo.update_backup(&backup).await.unwrap();

        let reread = repo.get_backup(backup_id).await.unwrap();
        assert_eq!(reread.status, backups::STATUS_SUCCESS);
        assert_eq!(reread.logs.as_deref(), Some("kept line"));
    }

    #[tokio::test]
    async fn binding_upsert_keeps_pair_unique() {
        let (repo, db) = repo().await;
        let backup_id = seed_backup(&db).await;
        let provider_id = Uuid::new_v4();

        repo.add_backup_provider(backup_id, provider_id, "key-1")
            .await
            .unwrap();
        repo.add_backup_provider(backup_id, provider_id, "key-2")
            .await
            .unwrap();

        let bindings = repo.get_backup_providers(backup_id).await.unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].s3_object_key, "key-2");
    }

    #[tokio::test]
    async fn share_link_expiry_and_access_count() {
        let (repo, db) = repo().await;
        let backup_id = seed_backup(&db).await;

        repo.create_shareable_link(backup_id, None, "fresh-token", Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();
        repo.create_shareable_link(backup_id, None, "stale-token", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();

        let (resolved, provider) = repo.resolve_shareable_link("fresh-token").await.unwrap();
        assert_eq!(resolved, backup_id);
        assert!(provider.is_none());
        repo.resolve_shareable_link("fresh-token").await.unwrap();

        let link = shareable_links::Entity::find()
            .filter(shareable_links::Column::Token.eq("fresh-token"))
            .one(db.as_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.access_count, 2);

        assert!(matches!(
            repo.resolve_shareable_link("stale-token").await,
            Err(BackupError::ShareInvalid)
        ));
        assert!(matches!(
            repo.resolve_shareable_link("unknown-token").await,
            Err(BackupError::ShareInvalid)
        ));
    }

    #[tokio::test]
    async fn list_backups_filters_by_user_and_search() {
        let (repo, db) = repo().await;
        let user_a = Uuid::new_v4();
        let backup_id = seed_backup_for_user(&db, user_a).await;
        seed_backup(&db).await; // other user

        let (items, total) = repo
            .list_backups(BackupListOptions {
                user_id: user_a,
                limit: 10,
                offset: 0,
                search: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].backup.id, backup_id);
        assert_eq!(items[0].database_name, "shop");

        let (_, none) = repo
            .list_backups(BackupListOptions {
                user_id: user_a,
                limit: 10,
                offset: 0,
                search: "nomatch".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(none, 0);
    }

    #[tokio::test]
    async fn active_backups_and_in_progress_guard() {
        let (repo, db) = repo().await;
        let user = Uuid::new_v4();
        let backup_id = seed_backup_for_user(&db, user).await;

        let active = repo.get_active_backups(user).await.unwrap();
        assert_eq!(active.len(), 1);

        let mut backup = repo.get_backup(backup_id).await.unwrap();
        assert!(repo
            .has_in_progress_backup(backup.connection_id)
            .await
            .unwrap());

        backup.status = backups::STATUS_FAILED.to_string();
        backup.completed_time = Some(Utc::now());
        repo.update_backup(&backup).await.unwrap();

        assert!(!repo
            .has_in_progress_backup(backup.connection_id)
            .await
            .unwrap());
        assert!(repo.get_active_backups(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schedule_upsert_and_disable() {
        let (repo, db) = repo().await;
        let connection_id = seed_connection(&db, Uuid::new_v4()).await;

        let next = Utc::now() + chrono::Duration::hours(1);
        let created = repo
            .upsert_schedule(connection_id, "0 0 3 * * *", 14, Some(next))
            .await
            .unwrap();
        assert!(created.enabled);
        assert_eq!(created.retention_days, 14);

        let updated = repo
            .upsert_schedule(connection_id, "0 30 2 * * *", 7, Some(next))
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.cron_schedule, "0 30 2 * * *");

        assert_eq!(repo.get_enabled_schedules().await.unwrap().len(), 1);

        repo.disable_schedule(connection_id).await.unwrap();
        assert!(repo.get_enabled_schedules().await.unwrap().is_empty());
        let schedule = repo.get_schedule(connection_id).await.unwrap().unwrap();
        assert!(!schedule.enabled);
        assert!(schedule.next_run_time.is_none());
    }

    #[tokio::test]
    async fn delete_backup_removes_dependents() {
        let (repo, db) = repo().await;
        let backup_id = seed_backup(&db).await;

        repo.append_log(backup_id, &["line".into()]).await.unwrap();
        repo.add_backup_provider(backup_id, Uuid::new_v4(), "key")
            .await
            .unwrap();
        repo.create_shareable_link(backup_id, None, "tok", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        repo.delete_backup(backup_id).await.unwrap();

        assert!(matches!(
            repo.get_backup(backup_id).await,
            Err(BackupError::NotFound(_))
        ));
        assert!(repo.get_backup_providers(backup_id).await.unwrap().is_empty());
        assert_eq!(repo.get_backup_logs(backup_id).await.unwrap(), "");
    }
}
