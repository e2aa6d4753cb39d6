//! Core data types: resource addressing, metadata records, and the
//! persisted wire encoding.

pub mod metadata;
pub mod resource;
pub mod wire;

pub use metadata::{BucketEntry, BucketMetadata, Credential, ObjectMetadata};
pub use resource::Resource;
