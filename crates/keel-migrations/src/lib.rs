//! Database migrations for keel

pub use sea_orm_migration::prelude::*;

mod migration;
pub use migration::Migrator;
