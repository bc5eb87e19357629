use sea_orm_migration::prelude::*;

/// Moves backup logs out of the backups.logs text column into a
/// line-addressed table. The old column stays for already-written rows;
/// the repository reads it as a fallback.
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("backup_logs"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Alias::new("backup_id")).uuid().not_null())
                    .col(ColumnDef::new(Alias::new("log_line")).text().not_null())
                    .col(
                        ColumnDef::new(Alias::new("line_number"))
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("created_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_backup_logs_backup")
                            .from(Alias::new("backup_logs"), Alias::new("backup_id"))
                            .to(Alias::new("backups"), Alias::new("id")),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_backup_logs_backup_line")
                    .table(Alias::new("backup_logs"))
                    .col(Alias::new("backup_id"))
                    .col(Alias::new("line_number"))
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(Alias::new("backup_logs"))
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}
