//! Object operations: streaming put, get/head, hard-link copy, delete.
//!
//! Each operation composes one metadata call with one blob call and
//! cleans up the blob side when the metadata side loses a race with a
//! concurrent bucket deletion.

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt as _, pin_mut};
use std::collections::BTreeMap;
use std::io;
use tokio::io::AsyncWriteExt as _;
use tracing::debug;

use crate::errors::S3Error;
use crate::models::{ObjectMetadata, Resource};
use crate::responses::{CopyObjectResult, ObjectResponse, S3Response, format_timestamp};
use crate::services::blob_store::BlobStore;
use crate::services::meta_store::{MetaStore, MetaStoreError};

/// Request-side object attributes captured on put.
#[derive(Debug, Clone, Default)]
pub struct PutAttributes {
    pub content_type: String,
    pub cache_control: String,
    pub user_defined: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct ObjectService {
    db: MetaStore,
    store: BlobStore,
}

impl ObjectService {
    pub fn new(db: MetaStore, store: BlobStore) -> Self {
        Self { db, store }
    }

    /// Stream a body into the blob store while hashing it, then record
    /// the metadata. The body is never buffered whole.
    pub async fn put<S>(
        &self,
        resource: &Resource,
        attrs: PutAttributes,
        body: S,
    ) -> Result<S3Response, S3Error>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        if let Err(MetaStoreError::BucketNotFound) = self.db.get(resource).await {
            return Err(S3Error::NoSuchBucket {
                bucket: resource.bucket().to_string(),
            });
        }

        let mut writer = self.store.create(resource).await?;
        let mut digest = md5::Context::new();
        let mut size: i64 = 0;

        pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.discard_blob(resource).await;
                    return Err(err.into());
                }
            };
            digest.consume(&chunk);
            size += chunk.len() as i64;
            if let Err(err) = writer.write_all(&chunk).await {
                self.discard_blob(resource).await;
                return Err(err.into());
            }
        }
        if let Err(err) = writer.flush().await {
            self.discard_blob(resource).await;
            return Err(err.into());
        }
        if let Err(err) = writer.sync_all().await {
            self.discard_blob(resource).await;
            return Err(err.into());
        }
        drop(writer);

        let content_md5 = format!("{:x}", digest.compute());
        let metadata = ObjectMetadata {
            content_md5: content_md5.clone(),
            size,
            cache_control: attrs.cache_control,
            last_modified: Utc::now(),
            content_type: attrs.content_type,
            version_id: String::new(),
            user_defined: attrs.user_defined,
        };
        if let Err(err) = self.db.put(resource, &metadata).await {
            // The bucket may have been deleted mid-write; drop the blob
            // either way so it cannot outlive its metadata.
            self.discard_blob(resource).await;
            return Err(match err {
                MetaStoreError::BucketNotFound => S3Error::NoSuchBucket {
                    bucket: resource.bucket().to_string(),
                },
                other => S3Error::internal(other),
            });
        }

        Ok(S3Response::Created { etag: content_md5 })
    }

    pub async fn get(&self, resource: &Resource) -> Result<S3Response, S3Error> {
        self.fetch(resource, false).await
    }

    pub async fn head(&self, resource: &Resource) -> Result<S3Response, S3Error> {
        self.fetch(resource, true).await
    }

    async fn fetch(&self, resource: &Resource, head: bool) -> Result<S3Response, S3Error> {
        let metadata = self
            .db
            .get(resource)
            .await
            .map_err(|err| classify(err, resource))?;

        let size = self
            .store
            .info(resource)
            .await
            .map_err(|err| classify_blob(err, resource))?;

        let file = if head {
            None
        } else {
            Some(
                self.store
                    .get(resource)
                    .await
                    .map_err(|err| classify_blob(err, resource))?,
            )
        };

        Ok(S3Response::Object(ObjectResponse {
            file,
            content_length: size,
            content_type: metadata.content_type,
            last_modified: format_timestamp(metadata.last_modified),
            cache_control: metadata.cache_control,
            etag: metadata.content_md5,
            user_defined: metadata.user_defined,
            version_id: metadata.version_id,
        }))
    }

    /// Copy by hard link, carrying the source metadata over with a fresh
    /// modification time.
    pub async fn copy(&self, src: &Resource, dst: &Resource) -> Result<S3Response, S3Error> {
        debug!(src = %src, dst = %dst, "copy object");

        let mut metadata = self.db.get(src).await.map_err(|err| classify(err, src))?;

        self.store
            .copy(src, dst)
            .await
            .map_err(|err| classify_blob(err, src))?;

        metadata.last_modified = Utc::now();
        if let Err(err) = self.db.put(dst, &metadata).await {
            self.discard_blob(dst).await;
            return Err(match err {
                MetaStoreError::BucketNotFound => S3Error::NoSuchBucket {
                    bucket: dst.bucket().to_string(),
                },
                other => S3Error::internal(other),
            });
        }

        Ok(S3Response::Copy(CopyObjectResult {
            last_modified: format_timestamp(metadata.last_modified),
            etag: metadata.content_md5,
        }))
    }

    /// Delete blob then metadata. Deleting what is not there succeeds.
    pub async fn delete(&self, resource: &Resource) -> Result<S3Response, S3Error> {
        if let Err(MetaStoreError::BucketNotFound) = self.db.get(resource).await {
            return Err(S3Error::NoSuchBucket {
                bucket: resource.bucket().to_string(),
            });
        }

        match self.store.delete(resource).await {
            Ok(()) => {}
            Err(err) if BlobStore::is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self.db.delete(resource).await {
            debug!(resource = %resource, error = %err, "metadata delete after blob delete");
        }

        Ok(S3Response::NoContent)
    }

    async fn discard_blob(&self, resource: &Resource) {
        if let Err(err) = self.store.delete(resource).await {
            if !BlobStore::is_not_found(&err) {
                debug!(resource = %resource, error = %err, "blob cleanup failed");
            }
        }
    }
}

fn classify(err: MetaStoreError, resource: &Resource) -> S3Error {
    match err {
        MetaStoreError::BucketNotFound => S3Error::NoSuchBucket {
            bucket: resource.bucket().to_string(),
        },
        MetaStoreError::KeyNotFound => S3Error::NoSuchKey {
            key: resource.key().to_string(),
        },
        other => S3Error::internal(other),
    }
}

fn classify_blob(err: io::Error, resource: &Resource) -> S3Error {
    if BlobStore::is_not_found(&err) {
        S3Error::NoSuchKey {
            key: resource.key().to_string(),
        }
    } else {
        err.into()
    }
}
