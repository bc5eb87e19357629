use keel_core::DBDateTime;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_COMPLETED_WITH_ERRORS: &str = "completed_with_errors";
pub const STATUS_FAILED: &str = "failed";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "backups")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub connection_id: Uuid,
    pub schedule_id: Option<Uuid>,
    /// in_progress, success, completed_with_errors or failed
    pub status: String,
    /// Local staging path. Streaming backups keep it for the filename only.
    pub path: String,
    pub s3_object_key: Option<String>,
    pub s3_provider_id: Option<Uuid>,
    pub size: i64,
    pub md5_hash: Option<String>,
    pub sha256_hash: Option<String>,
    /// Legacy single-column log storage, superseded by backup_logs.
    /// Never overwritten by status updates.
    #[sea_orm(column_type = "Text", nullable)]
    pub logs: Option<String>,
    pub started_time: DBDateTime,
    pub completed_time: Option<DBDateTime>,
    pub created_at: DBDateTime,
    pub updated_at: DBDateTime,
}

impl Model {
    pub fn is_terminal(&self) -> bool {
        self.status != STATUS_IN_PROGRESS
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::connections::Entity",
        from = "Column::ConnectionId",
        to = "super::connections::Column::Id"
    )]
    Connection,
    #[sea_orm(has_many = "super::backup_s3_providers::Entity")]
    BackupS3Providers,
    #[sea_orm(has_many = "super::backup_logs::Entity")]
    BackupLogs,
    #[sea_orm(has_many = "super::shareable_links::Entity")]
    ShareableLinks,
}

impl Related<super::connections::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl Related<super::backup_s3_providers::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BackupS3Providers.def()
    }
}

impl Related<super::backup_logs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BackupLogs.def()
    }
}

impl Related<super::shareable_links::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ShareableLinks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
