//! Database entities shared across keel crates.

pub mod backup_logs;
pub mod backup_s3_providers;
pub mod backup_schedules;
pub mod backups;
pub mod connections;
pub mod s3_providers;
pub mod shareable_links;
