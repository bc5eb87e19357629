//! Shared type aliases for datetime columns.

use chrono::{DateTime as ChronoDateTime, Utc};

/// Datetime type used by entity columns.
///
/// ```ignore
/// use keel_core::DBDateTime;
///
/// pub struct Model {
///     pub created_at: DBDateTime,
/// }
/// ```
pub type DBDateTime = ChronoDateTime<Utc>;

/// Datetime type for values passed around in service code.
pub type UtcDateTime = ChronoDateTime<Utc>;
