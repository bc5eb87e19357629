use keel_core::DBDateTime;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per sink that successfully received a backup.
/// (backup_id, s3_provider_id) is unique.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "backup_s3_providers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub backup_id: Uuid,
    pub s3_provider_id: Uuid,
    pub s3_object_key: String,
    pub created_at: DBDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::backups::Entity",
        from = "Column::BackupId",
        to = "super::backups::Column::Id"
    )]
    Backup,
    #[sea_orm(
        belongs_to = "super::s3_providers::Entity",
        from = "Column::S3ProviderId",
        to = "super::s3_providers::Column::Id"
    )]
    S3Provider,
}

impl Related<super::backups::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Backup.def()
    }
}

impl Related<super::s3_providers::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::S3Provider.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
