//! Bucket operations: create, delete, the paginated listing walk, and
//! the service-level bucket index.

use chrono::Utc;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::warn;

use crate::errors::S3Error;
use crate::models::{BucketMetadata, Credential, ObjectMetadata, Resource};
use crate::responses::{
    BucketResult, ContentResult, ListAllMyBucketsResult, ListBucketResult, S3Response,
    format_timestamp,
};
use crate::services::blob_store::BlobStore;
use crate::services::meta_store::{MetaStore, MetaStoreError};

const ENCODING_TYPE_URL: &str = "url";
const MAX_LIST_KEYS: i32 = 1000;

/// Raw listing query parameters; validation happens here, not in the
/// handler, so malformed values can be echoed back verbatim.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub marker: String,
    pub prefix: String,
    pub delimiter: String,
    pub encoding_type: String,
    pub max_keys: String,
}

#[derive(Clone)]
pub struct BucketService {
    db: MetaStore,
    store: BlobStore,
}

impl BucketService {
    pub fn new(db: MetaStore, store: BlobStore) -> Self {
        Self { db, store }
    }

    /// Create a bucket; repeating the call for an existing name succeeds
    /// without touching its metadata.
    pub async fn create(&self, bucket: &str) -> Result<S3Response, S3Error> {
        validate_bucket_name(bucket)?;
        let metadata = BucketMetadata {
            creation_date: Utc::now(),
        };
        self.db
            .create_bucket(bucket, &metadata)
            .await
            .map_err(S3Error::internal)?;
        self.store.create_bucket(bucket).await?;
        Ok(S3Response::NoContent)
    }

    /// Delete a bucket with all of its keys and blobs.
    pub async fn delete(&self, bucket: &str) -> Result<S3Response, S3Error> {
        match self.db.delete_bucket(bucket).await {
            Ok(()) => {}
            Err(MetaStoreError::BucketNotFound) => {
                return Err(S3Error::NoSuchBucket {
                    bucket: bucket.to_string(),
                });
            }
            Err(err) => return Err(S3Error::internal(err)),
        }
        self.store.delete_bucket(bucket).await?;
        Ok(S3Response::NoContent)
    }

    /// The paginated prefix + delimiter listing.
    ///
    /// Walks keys from the marker, rolling keys that continue past the
    /// delimiter up into common prefixes, until max-keys entries have
    /// been produced. Size drift between metadata and blobs is healed
    /// after the walk finishes, before the result is returned.
    pub async fn list(&self, bucket: &str, query: &ListQuery) -> Result<S3Response, S3Error> {
        let max_keys = parse_max_keys(&query.max_keys)?;
        if !query.encoding_type.is_empty() && query.encoding_type != ENCODING_TYPE_URL {
            return Err(S3Error::InvalidArgument {
                message: "Invalid Encoding Method specified in Request".to_string(),
                name: "encoding-type".to_string(),
                value: query.encoding_type.clone(),
            });
        }

        let mut result = ListBucketResult {
            name: bucket.to_string(),
            marker: query.marker.clone(),
            prefix: query.prefix.clone(),
            delimiter: query.delimiter.clone(),
            encoding_type: query.encoding_type.clone(),
            max_keys,
            ..Default::default()
        };
        let url_encode = result.encoding_type == ENCODING_TYPE_URL;
        // Emitted entries that still need their blob checked, as
        // (contents index, raw key, stored metadata).
        let mut emitted: Vec<(usize, String, ObjectMetadata)> = Vec::new();

        let walk = self
            .db
            .for_each(bucket, &query.marker, |key, lazy| {
                if !key.starts_with(&result.prefix) {
                    // Keys sorting before the prefix region are skipped
                    // (the marker may seek earlier than the prefix);
                    // anything after it ends the walk.
                    return Ok(key < result.prefix.as_str());
                }

                if !result.delimiter.is_empty() {
                    let pl = result.prefix.len();
                    if let Some(idx) = key[pl..].find(&result.delimiter) {
                        let mut end = pl + idx + 1;
                        while !key.is_char_boundary(end) {
                            end += 1;
                        }
                        let mut group = key[..end].to_string();
                        if url_encode {
                            group = url_encode_path(&group);
                        }
                        if group != result.marker {
                            if !result.append_prefix(group.clone()) {
                                result.is_truncated = true;
                                return Ok(false);
                            }
                            result.next_marker = group;
                        }
                        return Ok(true);
                    }
                }

                if key == result.marker {
                    return Ok(true);
                }
                if result.is_full() {
                    result.is_truncated = true;
                    return Ok(false);
                }

                let object = lazy.get()?;
                result.next_marker.clear();
                emitted.push((result.contents.len(), key.to_string(), object.clone()));
                result.contents.push(ContentResult {
                    key: if url_encode {
                        url_encode_path(key)
                    } else {
                        key.to_string()
                    },
                    last_modified: format_timestamp(object.last_modified),
                    etag: object.content_md5,
                    size: object.size,
                    storage_class: "STANDARD",
                });
                Ok(true)
            })
            .await;
        match walk {
            Ok(()) => {}
            Err(MetaStoreError::BucketNotFound) => {
                return Err(S3Error::NoSuchBucket {
                    bucket: bucket.to_string(),
                });
            }
            Err(err) => return Err(S3Error::internal(err)),
        }

        if !result.is_truncated {
            result.next_marker.clear();
        }

        // Heal outside the read stream: the walk must not write into the
        // store it is iterating.
        for (index, key, object) in emitted {
            if let Some(healed) = self.check_store(bucket, &key, object).await? {
                result.contents[index].size = healed.size;
                result.contents[index].etag = healed.content_md5;
            }
        }

        Ok(S3Response::ListBucket(result))
    }

    /// Reconcile stored size and digest with the blob on disk. Returns
    /// the corrected metadata when the record was rewritten.
    async fn check_store(
        &self,
        bucket: &str,
        key: &str,
        mut object: ObjectMetadata,
    ) -> Result<Option<ObjectMetadata>, S3Error> {
        let resource = Resource::new(bucket, key);
        let actual = self.store.info(&resource).await?;
        if actual == object.size {
            return Ok(None);
        }
        warn!(
            resource = %resource,
            stored = object.size,
            actual,
            "size mismatch between metadata and blob"
        );
        object.size = actual;
        object.content_md5 = self.store.md5(&resource).await?;
        self.db
            .put(&resource, &object)
            .await
            .map_err(S3Error::internal)?;
        Ok(Some(object))
    }

    /// Service-level listing of every bucket, name-ascending.
    pub async fn list_all(&self, owner: Option<&Credential>) -> Result<S3Response, S3Error> {
        let buckets = self.db.list_buckets().await.map_err(S3Error::internal)?;
        let result = ListAllMyBucketsResult {
            owner_id: owner.map(|c| c.access_key_id.clone()).unwrap_or_default(),
            owner_display_name: owner.map(|c| c.display_name.clone()).unwrap_or_default(),
            buckets: buckets
                .into_iter()
                .map(|bucket| BucketResult {
                    name: bucket.name,
                    creation_date: format_timestamp(bucket.metadata.creation_date),
                })
                .collect(),
        };
        Ok(S3Response::ListAllBuckets(result))
    }
}

/// Bucket names are 3-63 characters of dot-separated labels, each label
/// lowercase alphanumeric with interior hyphens.
fn validate_bucket_name(bucket: &str) -> Result<(), S3Error> {
    let invalid = |message: &str| {
        Err(S3Error::InvalidBucketName {
            message: message.to_string(),
        })
    };
    if bucket.len() < 3 {
        return invalid("BucketName too short");
    }
    if bucket.len() > 63 {
        return invalid("BucketName too long");
    }
    for label in bucket.split('.') {
        if !valid_label(label) {
            return invalid("BucketName not formatted correctly");
        }
    }
    Ok(())
}

fn valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    let edge = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    match bytes {
        [] => false,
        [only] => edge(*only),
        [first, middle @ .., last] => {
            edge(*first)
                && edge(*last)
                && middle.iter().all(|b| edge(*b) || *b == b'-')
        }
    }
}

fn parse_max_keys(value: &str) -> Result<i32, S3Error> {
    if value.is_empty() {
        return Ok(MAX_LIST_KEYS);
    }
    let invalid = || S3Error::InvalidArgument {
        message: "Argument maxKeys must be an integer between 0 and 2147483647".to_string(),
        name: "maxKeys".to_string(),
        value: value.to_string(),
    };
    let parsed: i64 = value.parse().map_err(|_| invalid())?;
    if parsed < 0 || parsed > i64::from(i32::MAX) {
        return Err(invalid());
    }
    Ok((parsed as i32).min(MAX_LIST_KEYS))
}

/// Path-style URL encoding for `encoding-type=url` responses.
fn url_encode_path(path: &str) -> String {
    const PATH: &AsciiSet = &NON_ALPHANUMERIC
        .remove(b'-')
        .remove(b'.')
        .remove(b'_')
        .remove(b'~')
        .remove(b'/');
    utf8_percent_encode(path, PATH).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::object_service::tests::{blob_write, object_meta};
    use chrono::TimeZone;

    async fn fixture() -> (tempfile::TempDir, BucketService) {
        let dir = tempfile::tempdir().unwrap();
        let db = MetaStore::open_in_memory().await.unwrap();
        let store = BlobStore::open(dir.path().join("buckets")).await.unwrap();
        (dir, BucketService::new(db, store))
    }

    /// The two-object fixture: a nested key and a top-level key.
    async fn populated() -> (tempfile::TempDir, BucketService) {
        let (dir, srv) = fixture().await;
        srv.create("foo").await.unwrap();
        blob_write(&srv.store, &Resource::new("foo", "bar/Example file.txt"), b"baz").await;
        blob_write(&srv.store, &Resource::new("foo", "example.jpeg"), b"").await;
        srv.db
            .put(
                &Resource::new("foo", "bar/Example file.txt"),
                &object_meta("73feffa4b7f6bb68e44cf984c85f6e88", 3, 2014),
            )
            .await
            .unwrap();
        srv.db
            .put(
                &Resource::new("foo", "example.jpeg"),
                &object_meta("d41d8cd98f00b204e9800998ecf8427e", 0, 2015),
            )
            .await
            .unwrap();
        (dir, srv)
    }

    fn listing(response: S3Response) -> ListBucketResult {
        match response {
            S3Response::ListBucket(result) => result,
            _ => panic!("expected a listing"),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let (_dir, srv) = fixture().await;
        assert!(matches!(
            srv.create("foo").await.unwrap(),
            S3Response::NoContent
        ));
        assert!(matches!(
            srv.create("foo").await.unwrap(),
            S3Response::NoContent
        ));
        let buckets = srv.db.list_buckets().await.unwrap();
        assert_eq!(buckets.len(), 1);
    }

    #[tokio::test]
    async fn create_validates_names() {
        let (_dir, srv) = fixture().await;
        for name in ["fo", "-abcd", "foo.-abcd", "foo.abcd-", "Foo.bar"] {
            let err = srv.create(name).await.unwrap_err();
            assert!(
                matches!(err, S3Error::InvalidBucketName { .. }),
                "name: {name}"
            );
        }
        let long = "a".repeat(64);
        assert!(matches!(
            srv.create(&long).await.unwrap_err(),
            S3Error::InvalidBucketName { .. }
        ));
        srv.create("valid-name.with.labels").await.unwrap();
    }

    #[tokio::test]
    async fn delete_missing_bucket_is_no_such_bucket() {
        let (_dir, srv) = fixture().await;
        assert!(matches!(
            srv.delete("foo").await.unwrap_err(),
            S3Error::NoSuchBucket { .. }
        ));
    }

    #[tokio::test]
    async fn list_on_missing_bucket_is_no_such_bucket() {
        let (_dir, srv) = fixture().await;
        let err = srv.list("foo", &ListQuery::default()).await.unwrap_err();
        assert!(matches!(err, S3Error::NoSuchBucket { .. }));
    }

    #[tokio::test]
    async fn plain_listing_returns_everything_sorted() {
        let (_dir, srv) = populated().await;
        let result = listing(srv.list("foo", &ListQuery::default()).await.unwrap());
        assert_eq!(result.max_keys, 1000);
        assert!(!result.is_truncated);
        assert_eq!(
            result
                .contents
                .iter()
                .map(|c| c.key.as_str())
                .collect::<Vec<_>>(),
            ["bar/Example file.txt", "example.jpeg"]
        );
        assert_eq!(result.contents[0].last_modified, "2014-05-06T03:02:01Z");
    }

    #[tokio::test]
    async fn delimiter_rolls_up_common_prefixes() {
        let (_dir, srv) = populated().await;
        let query = ListQuery {
            delimiter: "/".into(),
            ..Default::default()
        };
        let result = listing(srv.list("foo", &query).await.unwrap());
        assert_eq!(result.common_prefixes, ["bar/"]);
        assert_eq!(result.contents.len(), 1);
        assert_eq!(result.contents[0].key, "example.jpeg");
        assert_eq!(result.contents[0].size, 0);
        assert_eq!(result.max_keys, 1000);
    }

    #[tokio::test]
    async fn url_encoding_escapes_keys() {
        let (_dir, srv) = populated().await;
        let query = ListQuery {
            encoding_type: "url".into(),
            ..Default::default()
        };
        let result = listing(srv.list("foo", &query).await.unwrap());
        assert_eq!(result.contents[0].key, "bar/Example%20file.txt");
        assert_eq!(result.contents[1].key, "example.jpeg");
    }

    #[tokio::test]
    async fn unknown_encoding_type_is_rejected() {
        let (_dir, srv) = populated().await;
        let query = ListQuery {
            encoding_type: "base64".into(),
            ..Default::default()
        };
        let err = srv.list("foo", &query).await.unwrap_err();
        assert!(matches!(err, S3Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn prefix_listing_skips_keys_before_the_prefix_region() {
        let (_dir, srv) = populated().await;
        // Sorts before "bar/"; an empty marker seeks here first.
        blob_write(&srv.store, &Resource::new("foo", "aaa.txt"), b"x").await;
        srv.db
            .put(
                &Resource::new("foo", "aaa.txt"),
                &object_meta("9dd4e461268c8034f5c8564e155c67a6", 1, 2014),
            )
            .await
            .unwrap();

        let query = ListQuery {
            prefix: "bar/".into(),
            ..Default::default()
        };
        let result = listing(srv.list("foo", &query).await.unwrap());
        assert_eq!(result.contents.len(), 1);
        assert_eq!(result.contents[0].key, "bar/Example file.txt");
    }

    #[tokio::test]
    async fn prefix_filters_keys() {
        let (_dir, srv) = populated().await;
        let query = ListQuery {
            prefix: "bar/".into(),
            ..Default::default()
        };
        let result = listing(srv.list("foo", &query).await.unwrap());
        assert_eq!(result.contents.len(), 1);
        assert_eq!(result.contents[0].key, "bar/Example file.txt");
    }

    #[tokio::test]
    async fn max_keys_truncates() {
        let (_dir, srv) = populated().await;
        let query = ListQuery {
            max_keys: "1".into(),
            ..Default::default()
        };
        let result = listing(srv.list("foo", &query).await.unwrap());
        assert!(result.is_truncated);
        assert_eq!(result.max_keys, 1);
        assert_eq!(result.contents.len(), 1);
        assert_eq!(result.contents[0].key, "bar/Example file.txt");
    }

    #[tokio::test]
    async fn bad_max_keys_values_are_rejected() {
        let (_dir, srv) = populated().await;
        for value in ["foo", "-1", "2147483649"] {
            let query = ListQuery {
                max_keys: value.into(),
                ..Default::default()
            };
            let err = srv.list("foo", &query).await.unwrap_err();
            match err {
                S3Error::InvalidArgument { name, value: v, .. } => {
                    assert_eq!(name, "maxKeys");
                    assert_eq!(v, value);
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn oversized_max_keys_clamps_to_1000() {
        let (_dir, srv) = populated().await;
        let query = ListQuery {
            max_keys: "1001".into(),
            ..Default::default()
        };
        let result = listing(srv.list("foo", &query).await.unwrap());
        assert_eq!(result.max_keys, 1000);
        assert_eq!(result.contents.len(), 2);
    }

    #[tokio::test]
    async fn marker_resumes_after_key() {
        let (_dir, srv) = populated().await;
        let query = ListQuery {
            marker: "bar/Example file.txt".into(),
            ..Default::default()
        };
        let result = listing(srv.list("foo", &query).await.unwrap());
        assert_eq!(result.contents.len(), 1);
        assert_eq!(result.contents[0].key, "example.jpeg");
    }

    #[tokio::test]
    async fn delimiter_with_max_keys_one_truncates_at_the_prefix() {
        let (_dir, srv) = populated().await;
        let query = ListQuery {
            delimiter: "/".into(),
            max_keys: "1".into(),
            ..Default::default()
        };
        let result = listing(srv.list("foo", &query).await.unwrap());
        assert!(result.is_truncated);
        assert_eq!(result.common_prefixes, ["bar/"]);
        assert!(result.contents.is_empty());
        assert_eq!(result.next_marker, "bar/");
    }

    #[tokio::test]
    async fn pagination_covers_every_key_exactly_once() {
        let (_dir, srv) = fixture().await;
        srv.create("foo").await.unwrap();
        let keys = ["a", "b/one", "b/two", "c", "d/deep/deeper", "e"];
        for key in keys {
            blob_write(&srv.store, &Resource::new("foo", key), b"x").await;
            srv.db
                .put(
                    &Resource::new("foo", key),
                    &object_meta("9dd4e461268c8034f5c8564e155c67a6", 1, 2014),
                )
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut marker = String::new();
        loop {
            let query = ListQuery {
                marker: marker.clone(),
                delimiter: "/".into(),
                max_keys: "2".into(),
                ..Default::default()
            };
            let result = listing(srv.list("foo", &query).await.unwrap());
            seen.extend(result.contents.iter().map(|c| c.key.clone()));
            seen.extend(result.common_prefixes.iter().cloned());
            if !result.is_truncated {
                break;
            }
            // Resume from the last emitted item, whichever kind it was.
            marker = if result.next_marker.is_empty() {
                result
                    .contents
                    .last()
                    .map(|c| c.key.clone())
                    .unwrap_or_default()
            } else {
                result.next_marker.clone()
            };
        }
        seen.sort();
        assert_eq!(seen, ["a", "b/", "c", "d/", "e"]);
    }

    #[tokio::test]
    async fn listing_heals_size_drift() {
        let (_dir, srv) = populated().await;
        // Record a stale size for a blob that actually holds 3 bytes.
        srv.db
            .put(
                &Resource::new("foo", "bar/Example file.txt"),
                &object_meta("00000000000000000000000000000000", 999, 2014),
            )
            .await
            .unwrap();

        let result = listing(srv.list("foo", &ListQuery::default()).await.unwrap());
        assert_eq!(result.contents[0].size, 3);
        assert_eq!(result.contents[0].etag, "73feffa4b7f6bb68e44cf984c85f6e88");

        // The record itself was rewritten, not just the response.
        let healed = srv
            .db
            .get(&Resource::new("foo", "bar/Example file.txt"))
            .await
            .unwrap();
        assert_eq!(healed.size, 3);
        assert_eq!(healed.content_md5, "73feffa4b7f6bb68e44cf984c85f6e88");
        assert_eq!(
            healed.last_modified,
            Utc.with_ymd_and_hms(2014, 5, 6, 3, 2, 1).unwrap()
        );
    }

    #[test]
    fn max_keys_defaults_and_clamps() {
        assert_eq!(parse_max_keys("").unwrap(), 1000);
        assert_eq!(parse_max_keys("17").unwrap(), 17);
        assert_eq!(parse_max_keys("2147483647").unwrap(), 1000);
        assert!(parse_max_keys("2147483648").is_err());
        assert!(parse_max_keys("0").is_ok());
    }
}
