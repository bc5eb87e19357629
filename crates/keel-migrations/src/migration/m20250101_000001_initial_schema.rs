use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create connections table
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("connections"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Alias::new("user_id")).uuid().not_null())
                    .col(ColumnDef::new(Alias::new("name")).string().not_null())
                    .col(ColumnDef::new(Alias::new("engine")).string().not_null())
                    .col(ColumnDef::new(Alias::new("host")).string().not_null())
                    .col(ColumnDef::new(Alias::new("port")).integer().not_null())
                    .col(ColumnDef::new(Alias::new("username")).string().not_null())
                    .col(ColumnDef::new(Alias::new("password")).string().not_null())
                    .col(
                        ColumnDef::new(Alias::new("database_name"))
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("ssh_enabled"))
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Alias::new("ssh_host")).string().null())
                    .col(ColumnDef::new(Alias::new("ssh_port")).integer().null())
                    .col(ColumnDef::new(Alias::new("ssh_username")).string().null())
                    .col(ColumnDef::new(Alias::new("ssh_password")).string().null())
                    .col(
                        ColumnDef::new(Alias::new("ssh_private_key"))
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("created_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("updated_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Create s3_providers table
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("s3_providers"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Alias::new("user_id")).uuid().not_null())
                    .col(ColumnDef::new(Alias::new("name")).string().not_null())
                    .col(ColumnDef::new(Alias::new("endpoint")).string().not_null())
                    .col(ColumnDef::new(Alias::new("region")).string().null())
                    .col(ColumnDef::new(Alias::new("bucket")).string().not_null())
                    .col(ColumnDef::new(Alias::new("access_key")).string().not_null())
                    .col(ColumnDef::new(Alias::new("secret_key")).string().not_null())
                    .col(
                        ColumnDef::new(Alias::new("use_ssl"))
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(Alias::new("path_prefix")).string().null())
                    .col(
                        ColumnDef::new(Alias::new("is_default"))
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Alias::new("created_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("updated_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Create backups table
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("backups"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).uuid().not_null().primary_key())
                    .col(
                        ColumnDef::new(Alias::new("connection_id"))
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Alias::new("schedule_id")).uuid().null())
                    .col(ColumnDef::new(Alias::new("status")).string().not_null())
                    .col(ColumnDef::new(Alias::new("path")).string().not_null())
                    .col(ColumnDef::new(Alias::new("s3_object_key")).string().null())
                    .col(ColumnDef::new(Alias::new("s3_provider_id")).uuid().null())
                    .col(
                        ColumnDef::new(Alias::new("size"))
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Alias::new("md5_hash")).string().null())
                    .col(ColumnDef::new(Alias::new("sha256_hash")).string().null())
                    .col(ColumnDef::new(Alias::new("logs")).text().null())
                    .col(
                        ColumnDef::new(Alias::new("started_time"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("completed_time"))
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("created_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("updated_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_backups_connection")
                            .from(Alias::new("backups"), Alias::new("connection_id"))
                            .to(Alias::new("connections"), Alias::new("id")),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_backups_connection_status")
                    .table(Alias::new("backups"))
                    .col(Alias::new("connection_id"))
                    .col(Alias::new("status"))
                    .to_owned(),
            )
            .await?;

        // Create backup_s3_providers table
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("backup_s3_providers"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Alias::new("backup_id")).uuid().not_null())
                    .col(
                        ColumnDef::new(Alias::new("s3_provider_id"))
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("s3_object_key"))
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("created_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_backup_s3_providers_backup")
                            .from(Alias::new("backup_s3_providers"), Alias::new("backup_id"))
                            .to(Alias::new("backups"), Alias::new("id")),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_backup_s3_providers_unique_pair")
                    .table(Alias::new("backup_s3_providers"))
                    .col(Alias::new("backup_id"))
                    .col(Alias::new("s3_provider_id"))
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create backup_schedules table
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("backup_schedules"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).uuid().not_null().primary_key())
                    .col(
                        ColumnDef::new(Alias::new("connection_id"))
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("enabled"))
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Alias::new("cron_schedule"))
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("retention_days"))
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("next_run_time"))
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("last_backup_time"))
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("created_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("updated_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_backup_schedules_connection")
                            .from(Alias::new("backup_schedules"), Alias::new("connection_id"))
                            .to(Alias::new("connections"), Alias::new("id")),
                    )
                    .to_owned(),
            )
            .await?;

        // Create shareable_links table
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("shareable_links"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Alias::new("backup_id")).uuid().not_null())
                    .col(ColumnDef::new(Alias::new("s3_provider_id")).uuid().null())
                    .col(ColumnDef::new(Alias::new("token")).string().not_null())
                    .col(
                        ColumnDef::new(Alias::new("expires_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alias::new("access_count"))
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Alias::new("created_at"))
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_shareable_links_backup")
                            .from(Alias::new("shareable_links"), Alias::new("backup_id"))
                            .to(Alias::new("backups"), Alias::new("id")),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_shareable_links_token_unique")
                    .table(Alias::new("shareable_links"))
                    .col(Alias::new("token"))
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for table in [
            "shareable_links",
            "backup_schedules",
            "backup_s3_providers",
            "backups",
            "s3_providers",
            "connections",
        ] {
            manager
                .drop_table(Table::drop().table(Alias::new(table)).if_exists().to_owned())
                .await?;
        }
        Ok(())
    }
}
