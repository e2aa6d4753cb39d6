//! Request routing.
//!
//! Bucket names can arrive in the Host header (virtual-hosted style) or
//! as the first path segment, so routing cannot be a static table; one
//! fallback handler extracts the resource, authenticates, and dispatches
//! on resource shape + method.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, header},
    response::Response,
};
use futures::TryStreamExt as _;
use percent_encoding::percent_decode_str;
use tracing::info;

use crate::auth::{self, SigningRequest};
use crate::errors::S3Error;
use crate::models::{Credential, Resource};
use crate::responses::error_response;
use crate::services::blob_store::BlobStore;
use crate::services::bucket_service::{BucketService, ListQuery};
use crate::services::meta_store::MetaStore;
use crate::services::object_service::{ObjectService, PutAttributes};

const SERVER_NAME: &str = "s3d";
const AMZ_META_PREFIX: &str = "x-amz-meta-";

/// Extracts bucket names from virtual-hosted-style Host headers.
///
/// Suffixes are normalised to a leading dot and tried longest-first, so
/// the most specific configured hostname wins.
#[derive(Debug, Clone)]
pub struct BucketParser {
    suffixes: Vec<String>,
}

impl BucketParser {
    pub fn new(hostnames: &[String]) -> Self {
        let mut suffixes: Vec<String> = Vec::new();
        for host in hostnames {
            if host.is_empty() {
                continue;
            }
            let suffix = if host.starts_with('.') {
                host.clone()
            } else {
                format!(".{host}")
            };
            if !suffixes.contains(&suffix) {
                suffixes.push(suffix);
            }
        }
        suffixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| b.cmp(a)));
        Self { suffixes }
    }

    pub fn parse(&self, host: &str) -> Option<String> {
        let host = host.split(':').next().unwrap_or("");
        self.suffixes
            .iter()
            .find(|suffix| host.len() > suffix.len() && host.ends_with(suffix.as_str()))
            .map(|suffix| host[..host.len() - suffix.len()].to_string())
    }
}

#[derive(Clone)]
pub struct AppState {
    buckets: BucketService,
    objects: ObjectService,
    credentials: Arc<HashMap<String, Credential>>,
    bucket_parser: Arc<BucketParser>,
    host_id: String,
    request_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        db: MetaStore,
        store: BlobStore,
        credentials: Vec<Credential>,
        hostnames: &[String],
        host_id: String,
    ) -> Self {
        let credentials = credentials
            .into_iter()
            .map(|cred| (cred.access_key_id.clone(), cred))
            .collect();
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        Self {
            buckets: BucketService::new(db.clone(), store.clone()),
            objects: ObjectService::new(db, store),
            credentials: Arc::new(credentials),
            bucket_parser: Arc::new(BucketParser::new(hostnames)),
            host_id,
            request_id: Arc::new(AtomicU64::new(seed)),
        }
    }

    fn next_request_id(&self) -> String {
        format!("{:X}", self.request_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<AppState>, req: Request) -> Response {
    let start = Instant::now();
    let request_id = state.next_request_id();

    let (parts, body) = req.into_parts();
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or("");

    let result = serve(
        &state,
        &parts.method,
        parts.uri.path(),
        parts.uri.query().unwrap_or(""),
        host,
        &parts.headers,
        body,
    )
    .await;

    let (resource_label, mut response) = match result {
        Ok((resource, response)) => (resource, response.into_http()),
        Err(err) => {
            info!(request_id = %request_id, code = err.code(), message = %err, "request failed");
            (String::new(), error_response(&err, &request_id, &state.host_id))
        }
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("x-amz-request-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&state.host_id) {
        headers.insert("x-amz-id-2", value);
    }
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));

    info!(
        request_id = %request_id,
        bucket = %resource_label,
        method = %parts.method,
        uri = %parts.uri,
        status = response.status().as_u16(),
        elapsed_us = start.elapsed().as_micros() as u64,
        "request"
    );
    response
}

async fn serve(
    state: &AppState,
    method: &Method,
    raw_path: &str,
    raw_query: &str,
    host: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<(String, crate::responses::S3Response), S3Error> {
    let path = percent_decode_str(raw_path)
        .decode_utf8()
        .map_err(|_| S3Error::invalid_request("invalid path"))?;
    let query = parse_query(raw_query)?;

    let resource = match state.bucket_parser.parse(host) {
        Some(bucket) => Resource::new(bucket, path.trim_start_matches('/')),
        None => Resource::parse(&path),
    };

    let signing = SigningRequest {
        method: method.as_str(),
        uri_path: path.as_ref(),
        host,
        query: &query,
        headers,
    };

    let authorization = auth::get_auth(&resource, &signing)?;
    let credential = match &authorization {
        Some(authorization) => {
            let Some(credential) = state.credentials.get(authorization.access_key_id()) else {
                return Err(S3Error::InvalidAccessKeyId {
                    access_key_id: authorization.access_key_id().to_string(),
                });
            };
            authorization.verify(&credential.secret_key, &signing)?;
            Some(credential.clone())
        }
        None => None,
    };

    let response = dispatch(
        state,
        method,
        &resource,
        &query,
        headers,
        body,
        credential.as_ref(),
    )
    .await?;
    Ok((resource.bucket().to_string(), response))
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: &AppState,
    method: &Method,
    resource: &Resource,
    query: &[(String, String)],
    headers: &HeaderMap,
    body: Body,
    credential: Option<&Credential>,
) -> Result<crate::responses::S3Response, S3Error> {
    if !resource.key().is_empty() {
        return match method.as_str() {
            "GET" => state.objects.get(resource).await,
            "HEAD" => state.objects.head(resource).await,
            "DELETE" => state.objects.delete(resource).await,
            "PUT" => {
                if let Some(copy_source) = headers
                    .get("x-amz-copy-source")
                    .and_then(|value| value.to_str().ok())
                {
                    let src = percent_decode_str(copy_source)
                        .decode_utf8()
                        .map_err(|_| S3Error::invalid_request("invalid copy source"))?;
                    return state.objects.copy(&Resource::parse(&src), resource).await;
                }
                let stream = body.into_data_stream().map_err(io::Error::other);
                state
                    .objects
                    .put(resource, put_attributes(headers), stream)
                    .await
            }
            _ => Err(S3Error::method_not_allowed(format!(
                "{method} method not allowed on object"
            ))),
        };
    }

    if !resource.bucket().is_empty() {
        return match method.as_str() {
            "GET" | "HEAD" => {
                state
                    .buckets
                    .list(resource.bucket(), &list_query(query))
                    .await
            }
            "PUT" => state.buckets.create(resource.bucket()).await,
            "DELETE" => state.buckets.delete(resource.bucket()).await,
            _ => Err(S3Error::method_not_allowed(format!(
                "{method} method not allowed on bucket"
            ))),
        };
    }

    match method.as_str() {
        "GET" | "HEAD" => state.buckets.list_all(credential).await,
        _ => Err(S3Error::method_not_allowed(format!(
            "{method} not allowed on service"
        ))),
    }
}

/// Parse the raw query string, rejecting malformed percent escapes.
fn parse_query(raw: &str) -> Result<Vec<(String, String)>, S3Error> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let invalid = || S3Error::invalid_request("invalid query");
    if !valid_escapes(raw) {
        return Err(invalid());
    }
    if percent_decode_str(raw).decode_utf8().is_err() {
        return Err(invalid());
    }
    Ok(url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect())
}

/// Every `%` must introduce exactly two hex digits; the decoder itself
/// passes malformed escapes through silently.
fn valid_escapes(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}

fn list_query(query: &[(String, String)]) -> ListQuery {
    ListQuery {
        marker: auth::query_get(query, "marker").to_string(),
        prefix: auth::query_get(query, "prefix").to_string(),
        delimiter: auth::query_get(query, "delimiter").to_string(),
        encoding_type: auth::query_get(query, "encoding-type").to_string(),
        max_keys: auth::query_get(query, "max-keys").to_string(),
    }
}

/// Collect the put-relevant request headers, including `x-amz-meta-*`.
fn put_attributes(headers: &HeaderMap) -> PutAttributes {
    let mut user_defined = BTreeMap::new();
    for name in headers.keys() {
        if let Some(key) = name.as_str().strip_prefix(AMZ_META_PREFIX)
            && let Some(value) = headers.get(name).and_then(|value| value.to_str().ok())
        {
            user_defined.insert(key.to_string(), value.to_string());
        }
    }
    PutAttributes {
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string(),
        cache_control: headers
            .get(header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string(),
        user_defined,
    }
}
