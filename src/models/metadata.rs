//! Persisted metadata records for buckets and objects.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Metadata stored once per bucket, under the reserved in-bucket key.
///
/// Immutable after the bucket is created; re-creating an existing bucket
/// leaves it untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketMetadata {
    /// When this bucket was created.
    pub creation_date: DateTime<Utc>,
}

/// A named bucket together with its metadata, as returned by listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketEntry {
    pub name: String,
    pub metadata: BucketMetadata,
}

/// Metadata stored per object key.
///
/// `content_md5` is the lowercase hex MD5 of the backing blob and doubles
/// as the ETag; `size` mirrors the blob's byte length. Both may drift
/// after a torn write and are reconciled by the listing self-heal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_md5: String,
    pub size: i64,
    pub cache_control: String,
    pub last_modified: DateTime<Utc>,
    pub content_type: String,
    pub version_id: String,
    /// `x-amz-meta-*` headers captured on put, keyed without the prefix.
    pub user_defined: BTreeMap<String, String>,
}

impl Default for ObjectMetadata {
    fn default() -> Self {
        Self {
            content_md5: String::new(),
            size: 0,
            cache_control: String::new(),
            last_modified: DateTime::UNIX_EPOCH,
            content_type: String::new(),
            version_id: String::new(),
            user_defined: BTreeMap::new(),
        }
    }
}

/// One credential known to the daemon, loaded at startup and read-only
/// afterwards.
#[derive(Clone, Debug)]
pub struct Credential {
    pub access_key_id: String,
    pub secret_key: String,
    pub display_name: String,
}
