//! Database connection management and test helpers.

mod connection;
pub mod test_utils;

pub use connection::{establish_connection, DbConnection};
