//! Read-only access to registered database connections.
//!
//! Connection CRUD lives outside the engine; the coordinator only ever
//! loads a connection and decrypts its secret for the dump subprocess.

use std::sync::Arc;

use keel_core::EncryptionService;
use keel_database::DbConnection;
use keel_entities::connections;
use sea_orm::EntityTrait;
use uuid::Uuid;

use crate::services::error::BackupError;

/// A connection with its password decrypted, ready to hand to a dump tool.
#[derive(Debug, Clone)]
pub struct ResolvedConnection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub engine: String,
    pub host: String,
    pub port: i32,
    pub username: String,
    pub password: String,
    pub database_name: String,
    pub ssh_enabled: bool,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<i32>,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_private_key: Option<String>,
}

pub struct ConnectionRegistry {
    db: Arc<DbConnection>,
    encryption: Arc<EncryptionService>,
}

impl ConnectionRegistry {
    pub fn new(db: Arc<DbConnection>, encryption: Arc<EncryptionService>) -> Self {
        Self { db, encryption }
    }

    pub async fn get_connection(&self, id: Uuid) -> Result<ResolvedConnection, BackupError> {
        let model = connections::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("Connection {} not found", id)))?;

        let password = self
            .encryption
            .decrypt_string(&model.password)
            .map_err(|e| BackupError::Internal(format!("Failed to decrypt password: {}", e)))?;

        let ssh_password = match &model.ssh_password {
            Some(encrypted) => Some(
                self.encryption
                    .decrypt_string(encrypted)
                    .map_err(|e| {
                        BackupError::Internal(format!("Failed to decrypt SSH password: {}", e))
                    })?,
            ),
            None => None,
        };

        Ok(ResolvedConnection {
            id: model.id,
            user_id: model.user_id,
            name: model.name,
            engine: model.engine,
            host: model.host,
            port: model.port,
            username: model.username,
            password,
            database_name: model.database_name,
            ssh_enabled: model.ssh_enabled,
            ssh_host: model.ssh_host,
            ssh_port: model.ssh_port,
            ssh_username: model.ssh_username,
            ssh_password,
            ssh_private_key: model.ssh_private_key,
        })
    }
}
