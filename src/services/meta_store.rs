//! Embedded metadata store.
//!
//! One sqlite file holds every bucket's keyspace as rows of
//! `(bucket, key, encoded record)`. Bucket metadata sits inside its own
//! keyspace under a reserved key that no iteration surface exposes.
//! Mutations are single statements or transactions, so each call commits
//! fully or leaves the store untouched; reads see a consistent snapshot.

use futures::TryStreamExt as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};
use std::path::Path;
use thiserror::Error;

use crate::models::wire::{self, WireError};
use crate::models::{BucketEntry, BucketMetadata, ObjectMetadata, Resource};

/// Reserved in-bucket key storing the bucket's own metadata.
pub const BUCKET_METADATA_KEY: &str = "%%%%meta%%%%";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    key TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (bucket, key)
)";

#[derive(Debug, Error)]
pub enum MetaStoreError {
    #[error("metadata bucket not found")]
    BucketNotFound,
    #[error("metadata key not found")]
    KeyNotFound,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Decodes an object record on demand during iteration.
pub struct LazyObject {
    data: Vec<u8>,
}

impl LazyObject {
    pub fn get(&self) -> Result<ObjectMetadata, WireError> {
        wire::decode_object(&self.data)
    }
}

#[derive(Clone, Debug)]
pub struct MetaStore {
    pool: SqlitePool,
}

impl MetaStore {
    /// Open (creating if missing) the store file and its schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MetaStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests; one connection so every query sees the
    /// same database.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, MetaStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Release the underlying file locks.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get(&self, target: &Resource) -> Result<ObjectMetadata, MetaStoreError> {
        let row = sqlx::query("SELECT data FROM entries WHERE bucket = ? AND key = ?")
            .bind(target.bucket())
            .bind(target.key())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: Vec<u8> = row.try_get(0)?;
                Ok(wire::decode_object(&data)?)
            }
            None => {
                if self.bucket_exists(target.bucket()).await? {
                    Err(MetaStoreError::KeyNotFound)
                } else {
                    Err(MetaStoreError::BucketNotFound)
                }
            }
        }
    }

    pub async fn put(
        &self,
        target: &Resource,
        data: &ObjectMetadata,
    ) -> Result<(), MetaStoreError> {
        let encoded = wire::encode_object(data)?;
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM entries WHERE bucket = ? AND key = ?")
            .bind(target.bucket())
            .bind(BUCKET_METADATA_KEY)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(MetaStoreError::BucketNotFound);
        }
        sqlx::query("INSERT OR REPLACE INTO entries (bucket, key, data) VALUES (?, ?, ?)")
            .bind(target.bucket())
            .bind(target.key())
            .bind(&encoded)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove a key; a missing key is not an error, a missing bucket is.
    pub async fn delete(&self, target: &Resource) -> Result<(), MetaStoreError> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM entries WHERE bucket = ? AND key = ?")
            .bind(target.bucket())
            .bind(BUCKET_METADATA_KEY)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(MetaStoreError::BucketNotFound);
        }
        sqlx::query("DELETE FROM entries WHERE bucket = ? AND key = ?")
            .bind(target.bucket())
            .bind(target.key())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Create a bucket. Re-creating an existing bucket succeeds silently
    /// and leaves its metadata untouched.
    pub async fn create_bucket(
        &self,
        bucket: &str,
        data: &BucketMetadata,
    ) -> Result<(), MetaStoreError> {
        let encoded = wire::encode_bucket(data)?;
        sqlx::query("INSERT OR IGNORE INTO entries (bucket, key, data) VALUES (?, ?, ?)")
            .bind(bucket)
            .bind(BUCKET_METADATA_KEY)
            .bind(&encoded)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop a bucket's whole keyspace atomically.
    pub async fn delete_bucket(&self, bucket: &str) -> Result<(), MetaStoreError> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM entries WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(BUCKET_METADATA_KEY)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(MetaStoreError::BucketNotFound);
        }
        sqlx::query("DELETE FROM entries WHERE bucket = ?")
            .bind(bucket)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// All buckets, name-ascending.
    pub async fn list_buckets(&self) -> Result<Vec<BucketEntry>, MetaStoreError> {
        let rows = sqlx::query("SELECT bucket, data FROM entries WHERE key = ? ORDER BY bucket ASC")
            .bind(BUCKET_METADATA_KEY)
            .fetch_all(&self.pool)
            .await?;
        let mut buckets = Vec::with_capacity(rows.len());
        for row in rows {
            let data: Vec<u8> = row.try_get(1)?;
            buckets.push(BucketEntry {
                name: row.try_get(0)?,
                metadata: wire::decode_bucket(&data)?,
            });
        }
        Ok(buckets)
    }

    /// Walk a bucket's keys in lexical order starting at the first key
    /// `>= seek`, skipping the reserved metadata key. The callback
    /// decides whether iteration continues; an error aborts it.
    pub async fn for_each<F>(
        &self,
        bucket: &str,
        seek: &str,
        mut f: F,
    ) -> Result<(), MetaStoreError>
    where
        F: FnMut(&str, LazyObject) -> Result<bool, MetaStoreError>,
    {
        if !self.bucket_exists(bucket).await? {
            return Err(MetaStoreError::BucketNotFound);
        }
        let mut rows = sqlx::query(
            "SELECT key, data FROM entries
             WHERE bucket = ? AND key >= ? AND key <> ?
             ORDER BY key ASC",
        )
        .bind(bucket)
        .bind(seek)
        .bind(BUCKET_METADATA_KEY)
        .fetch(&self.pool);

        while let Some(row) = rows.try_next().await? {
            let key: String = row.try_get(0)?;
            let lazy = LazyObject {
                data: row.try_get(1)?,
            };
            if !f(&key, lazy)? {
                break;
            }
        }
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, MetaStoreError> {
        let row = sqlx::query("SELECT 1 FROM entries WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(BUCKET_METADATA_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}
