//! Database connection management

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Statement};
use std::sync::Arc;

use keel_core::{ServiceError, ServiceResult};
use keel_migrations::{Migrator, MigratorTrait};

pub type DbConnection = DatabaseConnection;

/// Connects to the backing store, applies the SQLite concurrency pragmas
/// and runs pending migrations.
///
/// WAL allows concurrent readers alongside the single writer; the busy
/// timeout keeps short write collisions out of the retry ladder.
pub async fn establish_connection(database_url: &str) -> ServiceResult<Arc<DbConnection>> {
    let mut opt = ConnectOptions::new(database_url);
    opt.max_connections(25).min_connections(2).sqlx_logging(false);

    let db = Database::connect(opt)
        .await
        .map_err(|e| ServiceError::Database(e.to_string()))?;

    if db.get_database_backend() == DatabaseBackend::Sqlite {
        for pragma in [
            "PRAGMA journal_mode = WAL",
            "PRAGMA busy_timeout = 5000",
            "PRAGMA synchronous = NORMAL",
        ] {
            db.execute(Statement::from_string(
                DatabaseBackend::Sqlite,
                pragma.to_string(),
            ))
            .await
            .map_err(|e| ServiceError::Database(e.to_string()))?;
        }
    }

    // Run migrations
    Migrator::up(&db, None)
        .await
        .map_err(|e| ServiceError::Database(e.to_string()))?;

    Ok(Arc::new(db))
}
