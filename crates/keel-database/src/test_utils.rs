//! Test utilities for database-backed tests
//!
//! Every test gets its own in-memory SQLite database with the full schema
//! applied, so tests stay isolated without any external service.

use crate::DbConnection;
use keel_migrations::Migrator;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseBackend, Statement};
use sea_orm_migration::MigratorTrait;
use std::sync::Arc;

/// Per-test database handle.
pub struct TestDatabase {
    pub db: Arc<DbConnection>,
}

impl TestDatabase {
    /// Creates a fresh in-memory database without running migrations.
    pub async fn new() -> anyhow::Result<Self> {
        // A single connection keeps the in-memory database alive and shared.
        let mut opt = ConnectOptions::new("sqlite::memory:");
        opt.max_connections(1).sqlx_logging(false);

        let db = Database::connect(opt).await?;
        Ok(TestDatabase { db: Arc::new(db) })
    }

    /// Creates a fresh in-memory database with all migrations applied.
    pub async fn with_migrations() -> anyhow::Result<Self> {
        let test_db = Self::new().await?;
        Migrator::up(test_db.db.as_ref(), None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
        Ok(test_db)
    }

    /// Execute raw SQL for test setup/teardown.
    pub async fn execute_sql(&self, sql: &str) -> anyhow::Result<()> {
        self.db
            .execute(Statement::from_string(
                DatabaseBackend::Sqlite,
                sql.to_owned(),
            ))
            .await?;
        Ok(())
    }

    /// Get the database connection
    pub fn connection(&self) -> &DbConnection {
        &self.db
    }

    /// Get the database connection as Arc
    pub fn connection_arc(&self) -> Arc<DbConnection> {
        Arc::clone(&self.db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_migrations_creates_schema() -> anyhow::Result<()> {
        let test_db = TestDatabase::with_migrations().await?;

        // All core tables should exist
        for table in [
            "connections",
            "s3_providers",
            "backups",
            "backup_s3_providers",
            "backup_logs",
            "backup_schedules",
            "shareable_links",
        ] {
            test_db
                .execute_sql(&format!("SELECT COUNT(*) FROM {}", table))
                .await?;
        }

        Ok(())
    }

    async fn count_connections(db: &TestDatabase) -> anyhow::Result<i64> {
        let row = db
            .db
            .query_one(Statement::from_string(
                DatabaseBackend::Sqlite,
                "SELECT COUNT(*) AS n FROM connections".to_owned(),
            ))
            .await?
            .ok_or_else(|| anyhow::anyhow!("no row"))?;
        Ok(row.try_get::<i64>("", "n")?)
    }

    #[tokio::test]
    async fn test_databases_are_isolated() -> anyhow::Result<()> {
        let a = TestDatabase::with_migrations().await?;
        let b = TestDatabase::with_migrations().await?;

        a.execute_sql(
            "INSERT INTO connections (id, user_id, name, engine, host, port, username, password, database_name, ssh_enabled, created_at, updated_at) \
             VALUES ('00000000-0000-0000-0000-000000000001', '00000000-0000-0000-0000-000000000002', 'a', 'postgresql', 'localhost', 5432, 'u', 'p', 'db', 0, '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
        )
        .await?;

        assert_eq!(count_connections(&a).await?, 1);
        assert_eq!(count_connections(&b).await?, 0);

        Ok(())
    }
}
