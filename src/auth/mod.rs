//! Request authentication: AWS signature V2 and V4, header and
//! presigned-query forms.
//!
//! `get_auth` turns a request into an authorisation intent (or none, for
//! anonymous requests). The caller looks up the credential for the
//! extracted access key and asks the intent to verify itself against the
//! request.

pub mod v2;
pub mod v4;

use axum::http::HeaderMap;
use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use crate::errors::S3Error;
use crate::models::Resource;

pub const SCHEME_V4: &str = "AWS4-HMAC-SHA256";
pub const SCHEME_V2: &str = "AWS";

pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// ISO8601 "basic" layout used by SigV4 (`20130524T000000Z`).
pub const ISO8601_BASIC: &str = "%Y%m%dT%H%M%SZ";

const ERR_HEADER_SPACING: &str =
    "Authorization header is invalid -- one and only one ' ' (space) required";
const ERR_UNSUPPORTED_TYPE: &str = "Unsupported Authorization Type";
const ERR_INVALID_DATE: &str = "AWS authentication requires a valid Date or x-amz-date header";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("{message}")]
    InvalidArgument {
        message: String,
        name: String,
        value: String,
    },
    #[error("{0}")]
    MissingSecurityHeader(String),
    #[error("{0}")]
    MissingSecurityElement(String),
    #[error("{0}")]
    QueryParameters(String),
    #[error("{0}")]
    AccessDenied(String),
    #[error("signature does not match")]
    SignatureDoesNotMatch {
        access_key_id: String,
        string_to_sign: String,
        signature: String,
    },
}

impl From<AuthError> for S3Error {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidArgument {
                message,
                name,
                value,
            } => S3Error::InvalidArgument {
                message,
                name,
                value,
            },
            AuthError::MissingSecurityHeader(message) => S3Error::MissingSecurityHeader { message },
            AuthError::MissingSecurityElement(message) => {
                S3Error::MissingSecurityElement { message }
            }
            AuthError::QueryParameters(message) => {
                S3Error::AuthorizationQueryParametersError { message }
            }
            AuthError::AccessDenied(message) => S3Error::AccessDenied { message },
            AuthError::SignatureDoesNotMatch {
                access_key_id,
                string_to_sign,
                signature,
            } => S3Error::SignatureDoesNotMatch {
                access_key_id,
                string_to_sign,
                signature,
            },
        }
    }
}

/// The pieces of the incoming request that signing operates on. The path
/// is percent-decoded; the query is the parsed pair list in request
/// order.
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub uri_path: &'a str,
    pub host: &'a str,
    pub query: &'a [(String, String)],
    pub headers: &'a HeaderMap,
}

impl SigningRequest<'_> {
    /// First value of a header, or empty. Signing only ever deals in
    /// ASCII header values; anything else is treated as absent.
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    }
}

/// A parsed authorisation intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    V2(v2::AuthorizationV2),
    V4(v4::AuthorizationV4),
}

impl Authorization {
    pub fn access_key_id(&self) -> &str {
        match self {
            Self::V2(auth) => &auth.access_key_id,
            Self::V4(auth) => &auth.credential.access_key_id,
        }
    }

    pub fn verify(&self, secret_key: &str, req: &SigningRequest<'_>) -> Result<(), AuthError> {
        match self {
            Self::V2(auth) => auth.verify(secret_key, req),
            Self::V4(auth) => auth.verify(secret_key, req),
        }
    }
}

/// Resolve the authorisation intent of a request, if any.
///
/// The `Authorization` header wins; otherwise presigned query parameters
/// are consulted. A request carrying neither is anonymous.
pub fn get_auth(
    resource: &Resource,
    req: &SigningRequest<'_>,
) -> Result<Option<Authorization>, AuthError> {
    let auth_header = req.header("authorization");
    if !auth_header.is_empty() {
        let (date, date_raw) = get_date(req.headers)?;

        let (scheme, param) = auth_header.split_once(' ').unwrap_or(("", ""));
        return match scheme {
            SCHEME_V4 => Ok(Some(Authorization::V4(v4::parse_header(param, date)?))),
            SCHEME_V2 => Ok(Some(Authorization::V2(v2::parse_header(
                resource, param, date_raw,
            )?))),
            "" => Err(AuthError::InvalidArgument {
                message: ERR_HEADER_SPACING.to_string(),
                name: "Authorization".to_string(),
                value: auth_header.to_string(),
            }),
            _ => Err(AuthError::InvalidArgument {
                message: ERR_UNSUPPORTED_TYPE.to_string(),
                name: "Authorization".to_string(),
                value: auth_header.to_string(),
            }),
        };
    }

    if !query_get(req.query, "X-Amz-Algorithm").is_empty() {
        return Ok(Some(Authorization::V4(v4::parse_query(req.query)?)));
    }
    if !query_get(req.query, "AWSAccessKeyId").is_empty() {
        return Ok(Some(Authorization::V2(v2::parse_query(
            resource, req.query,
        )?)));
    }
    Ok(None)
}

/// First query value for an exact (case-sensitive) parameter name.
pub fn query_get<'a>(query: &'a [(String, String)], name: &str) -> &'a str {
    query
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
        .unwrap_or("")
}

/// Resolve the request date: `x-amz-date` first, then `Date`. Returns the
/// parsed instant along with the raw header string (the V2 string-to-sign
/// carries the bytes the client signed, not a reformatted date).
pub fn get_date(headers: &HeaderMap) -> Result<(DateTime<Utc>, String), AuthError> {
    for name in ["x-amz-date", "date"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok())
            && !value.is_empty()
        {
            let date = parse_date(value)
                .ok_or_else(|| AuthError::MissingSecurityHeader(ERR_INVALID_DATE.to_string()))?;
            return Ok((date, value.to_string()));
        }
    }
    Err(AuthError::MissingSecurityHeader(ERR_INVALID_DATE.to_string()))
}

/// Accepts the three HTTP date layouts plus ISO8601 basic.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    const LAYOUTS: [&str; 4] = [
        "%a, %d %b %Y %H:%M:%S GMT", // RFC1123
        "%A, %d-%b-%y %H:%M:%S GMT", // RFC850
        "%a %b %e %H:%M:%S %Y",      // asctime
        ISO8601_BASIC,
    ];
    LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(value, layout).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::TimeZone;

    fn request<'a>(
        headers: &'a HeaderMap,
        query: &'a [(String, String)],
    ) -> SigningRequest<'a> {
        SigningRequest {
            method: "GET",
            uri_path: "/",
            host: "localhost",
            query,
            headers,
        }
    }

    #[test]
    fn parses_all_accepted_date_layouts() {
        let expected = Utc.with_ymd_and_hms(2013, 5, 24, 0, 0, 0).unwrap();
        for value in [
            "Fri, 24 May 2013 00:00:00 GMT",
            "Friday, 24-May-13 00:00:00 GMT",
            "Fri May 24 00:00:00 2013",
            "20130524T000000Z",
        ] {
            assert_eq!(parse_date(value), Some(expected), "layout: {value}");
        }
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn anonymous_when_no_auth_material() {
        let headers = HeaderMap::new();
        let query = Vec::new();
        let auth = get_auth(&Resource::parse("/foo"), &request(&headers, &query)).unwrap();
        assert!(auth.is_none());
    }

    #[test]
    fn rejects_missing_date() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("AWS akid:signature"),
        );
        let query = Vec::new();
        let err = get_auth(&Resource::parse("/foo"), &request(&headers, &query)).unwrap_err();
        assert!(matches!(err, AuthError::MissingSecurityHeader(_)));
    }

    #[test]
    fn rejects_header_without_space() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("AWSakid:sig"));
        headers.insert(
            "date",
            HeaderValue::from_static("Fri, 24 May 2013 00:00:00 GMT"),
        );
        let query = Vec::new();
        let err = get_auth(&Resource::parse("/foo"), &request(&headers, &query)).unwrap_err();
        assert!(matches!(err, AuthError::InvalidArgument { .. }));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer token-of-some-kind"),
        );
        headers.insert(
            "date",
            HeaderValue::from_static("Fri, 24 May 2013 00:00:00 GMT"),
        );
        let query = Vec::new();
        let err = get_auth(&Resource::parse("/foo"), &request(&headers, &query)).unwrap_err();
        assert!(matches!(err, AuthError::InvalidArgument { .. }));
    }

    #[test]
    fn presigned_v4_wins_over_v2_parameters() {
        let headers = HeaderMap::new();
        let query = vec![
            ("X-Amz-Algorithm".to_string(), SCHEME_V4.to_string()),
            ("AWSAccessKeyId".to_string(), "akid".to_string()),
        ];
        // Incomplete V4 parameter set: classified as a V4 problem, not V2.
        let err = get_auth(&Resource::parse("/foo"), &request(&headers, &query)).unwrap_err();
        assert!(matches!(err, AuthError::QueryParameters(_)));
    }
}
