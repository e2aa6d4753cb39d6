//! Storage engine and the operations composed on top of it.

pub mod blob_store;
pub mod bucket_service;
pub mod meta_store;
pub mod object_service;
