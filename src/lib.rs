//! s3d, a single-node object-storage daemon speaking an S3-compatible
//! HTTP protocol: signed requests (AWS SigV2/SigV4), sqlite-backed
//! metadata, filesystem-backed blobs.

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod responses;
pub mod services;
