//! S3-compatible object storage for backup bodies.
//!
//! One [`ObjectStore`] handle wraps a single provider configuration
//! (endpoint + bucket + optional key prefix). Every configured sink of a
//! backup gets its own handle.

mod client;
mod error;

pub use client::{
    derive_object_key, LogFn, ObjectStore, S3Config, MULTIPART_PART_SIZE, MULTIPART_THRESHOLD,
};
pub use error::StorageError;
