//! Response values returned by the operations layer and their HTTP/XML
//! renderings.
//!
//! Handlers never touch status codes or bodies directly; every success
//! shape lives here, next to the error envelope, so the whole wire
//! surface is in one place.

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::errors::S3Error;

pub const XMLNS_S3: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Every successful operation result.
#[derive(Debug)]
pub enum S3Response {
    /// 200 with an `ETag` header and no body (object put).
    Created { etag: String },
    /// 204 (deletes, bucket create).
    NoContent,
    /// An object fetch; `file` is `None` for HEAD.
    Object(ObjectResponse),
    ListBucket(ListBucketResult),
    ListAllBuckets(ListAllMyBucketsResult),
    Copy(CopyObjectResult),
}

#[derive(Debug)]
pub struct ObjectResponse {
    pub file: Option<File>,
    pub content_length: i64,
    pub content_type: String,
    pub last_modified: String,
    pub cache_control: String,
    pub etag: String,
    pub user_defined: BTreeMap<String, String>,
    pub version_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentResult {
    pub key: String,
    pub last_modified: String,
    pub etag: String,
    pub size: i64,
    pub storage_class: &'static str,
}

/// Result of a bucket listing, accumulated by the listing walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListBucketResult {
    pub name: String,
    pub prefix: String,
    pub marker: String,
    pub next_marker: String,
    pub max_keys: i32,
    pub delimiter: String,
    pub encoding_type: String,
    pub is_truncated: bool,
    pub common_prefixes: Vec<String>,
    pub contents: Vec<ContentResult>,
}

impl ListBucketResult {
    pub fn is_full(&self) -> bool {
        self.common_prefixes.len() + self.contents.len() >= self.max_keys as usize
    }

    /// Append a rolled-up prefix unless it repeats the previous one.
    /// Returns false when the result has no room left.
    pub fn append_prefix(&mut self, prefix: String) -> bool {
        if self.common_prefixes.last() != Some(&prefix) {
            if self.is_full() {
                return false;
            }
            self.common_prefixes.push(prefix);
        }
        true
    }

    fn to_xml(&self) -> String {
        let mut xml = String::from(XML_DECL);
        xml.push_str(&format!(r#"<ListBucketResult xmlns="{XMLNS_S3}">"#));
        xml.push_str(&format!("<Name>{}</Name>", xml_escape(&self.name)));
        xml.push_str(&format!("<Prefix>{}</Prefix>", xml_escape(&self.prefix)));
        xml.push_str(&format!("<Marker>{}</Marker>", xml_escape(&self.marker)));
        if !self.next_marker.is_empty() {
            xml.push_str(&format!(
                "<NextMarker>{}</NextMarker>",
                xml_escape(&self.next_marker)
            ));
        }
        xml.push_str(&format!("<MaxKeys>{}</MaxKeys>", self.max_keys));
        if !self.delimiter.is_empty() {
            xml.push_str(&format!(
                "<Delimiter>{}</Delimiter>",
                xml_escape(&self.delimiter)
            ));
        }
        if !self.encoding_type.is_empty() {
            xml.push_str(&format!(
                "<EncodingType>{}</EncodingType>",
                xml_escape(&self.encoding_type)
            ));
        }
        xml.push_str(&format!(
            "<IsTruncated>{}</IsTruncated>",
            if self.is_truncated { "true" } else { "false" }
        ));
        for item in &self.contents {
            xml.push_str("<Contents>");
            xml.push_str(&format!("<Key>{}</Key>", xml_escape(&item.key)));
            xml.push_str(&format!(
                "<LastModified>{}</LastModified>",
                xml_escape(&item.last_modified)
            ));
            xml.push_str(&format!(
                "<ETag>{}</ETag>",
                xml_escape(&quote_etag(&item.etag))
            ));
            xml.push_str(&format!("<Size>{}</Size>", item.size));
            xml.push_str(&format!(
                "<StorageClass>{}</StorageClass>",
                item.storage_class
            ));
            xml.push_str("</Contents>");
        }
        for prefix in &self.common_prefixes {
            xml.push_str("<CommonPrefixes><Prefix>");
            xml.push_str(&xml_escape(prefix));
            xml.push_str("</Prefix></CommonPrefixes>");
        }
        xml.push_str("</ListBucketResult>");
        xml
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketResult {
    pub name: String,
    pub creation_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListAllMyBucketsResult {
    pub owner_id: String,
    pub owner_display_name: String,
    pub buckets: Vec<BucketResult>,
}

impl ListAllMyBucketsResult {
    fn to_xml(&self) -> String {
        let mut xml = String::from(XML_DECL);
        xml.push_str(&format!(r#"<ListAllMyBucketsResult xmlns="{XMLNS_S3}">"#));
        xml.push_str(&format!(
            "<Owner><ID>{}</ID><DisplayName>{}</DisplayName></Owner>",
            xml_escape(&self.owner_id),
            xml_escape(&self.owner_display_name)
        ));
        xml.push_str("<Buckets>");
        for bucket in &self.buckets {
            xml.push_str(&format!(
                "<Bucket><Name>{}</Name><CreationDate>{}</CreationDate></Bucket>",
                xml_escape(&bucket.name),
                xml_escape(&bucket.creation_date)
            ));
        }
        xml.push_str("</Buckets></ListAllMyBucketsResult>");
        xml
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyObjectResult {
    pub last_modified: String,
    pub etag: String,
}

impl CopyObjectResult {
    fn to_xml(&self) -> String {
        format!(
            r#"{XML_DECL}<CopyObjectResult xmlns="{XMLNS_S3}"><LastModified>{}</LastModified><ETag>{}</ETag></CopyObjectResult>"#,
            xml_escape(&self.last_modified),
            xml_escape(&quote_etag(&self.etag))
        )
    }
}

impl S3Response {
    pub fn into_http(self) -> Response {
        match self {
            Self::Created { etag } => {
                let mut response = Response::new(Body::empty());
                set_header(response.headers_mut(), header::ETAG, &quote_etag(&etag));
                response
            }
            Self::NoContent => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::NO_CONTENT;
                response
            }
            Self::Object(object) => object.into_http(),
            Self::ListBucket(result) => xml_response(result.to_xml()),
            Self::ListAllBuckets(result) => xml_response(result.to_xml()),
            Self::Copy(result) => xml_response(result.to_xml()),
        }
    }
}

impl ObjectResponse {
    fn into_http(self) -> Response {
        let body = match self.file {
            Some(file) => Body::from_stream(ReaderStream::new(file)),
            None => Body::empty(),
        };
        let mut response = Response::new(body);
        let headers = response.headers_mut();

        set_header(
            headers,
            header::CONTENT_LENGTH,
            &self.content_length.max(0).to_string(),
        );
        if !self.content_type.is_empty() {
            set_header(headers, header::CONTENT_TYPE, &self.content_type);
        }
        set_header(headers, header::ETAG, &quote_etag(&self.etag));
        set_header(headers, header::LAST_MODIFIED, &self.last_modified);
        if !self.cache_control.is_empty() {
            set_header(headers, header::CACHE_CONTROL, &self.cache_control);
        }
        for (key, value) in &self.user_defined {
            if let Ok(name) = HeaderName::try_from(format!("x-amz-meta-{key}")) {
                set_header(headers, name, value);
            }
        }
        if !self.version_id.is_empty() {
            set_header(
                headers,
                HeaderName::from_static("x-amz-version-id"),
                &self.version_id,
            );
        }
        response
    }
}

/// Render the error envelope; request and host IDs are echoed in the body
/// as well as the response headers.
pub fn error_response(err: &S3Error, request_id: &str, host_id: &str) -> Response {
    let mut xml = String::from(XML_DECL);
    xml.push_str("<Error>");
    xml.push_str(&format!("<Code>{}</Code>", xml_escape(err.code())));
    xml.push_str(&format!("<Message>{}</Message>", xml_escape(&err.to_string())));
    for (name, value) in err.params() {
        xml.push_str(&format!("<{name}>{}</{name}>", xml_escape(&value)));
    }
    xml.push_str(&format!("<RequestId>{}</RequestId>", xml_escape(request_id)));
    xml.push_str(&format!("<HostId>{}</HostId>", xml_escape(host_id)));
    xml.push_str("</Error>");

    let mut response = xml_response(xml);
    *response.status_mut() = err.status();
    response
}

pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn quote_etag(md5: &str) -> String {
    format!("\"{}\"", md5.trim_matches('"'))
}

fn xml_response(body: String) -> Response {
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    response
}

fn set_header(headers: &mut axum::http::HeaderMap, name: impl Into<HeaderName>, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name.into(), value);
    }
}

pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
