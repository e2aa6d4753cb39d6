//! Structured S3 error kinds.
//!
//! Every failure surfaced to a client is one of these variants; the code,
//! HTTP status and echo parameters are fixed per kind and rendered into
//! the XML error envelope by the response layer.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum S3Error {
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    #[error("No such key")]
    NoSuchKey { key: String },

    #[error("{message}")]
    InvalidBucketName { message: String },

    #[error("{message}")]
    InvalidArgument {
        message: String,
        name: String,
        value: String,
    },

    #[error("{message}")]
    InvalidRequest { message: String },

    #[error("{message}")]
    MethodNotAllowed { message: String },

    #[error("{message}")]
    MissingSecurityHeader { message: String },

    #[error("{message}")]
    MissingSecurityElement { message: String },

    #[error("{message}")]
    AuthorizationQueryParametersError { message: String },

    #[error("The AWS Access Key Id you provided does not exist in our records.")]
    InvalidAccessKeyId { access_key_id: String },

    #[error(
        "The request signature we calculated does not match the signature you \
         provided. Check your key and signing method."
    )]
    SignatureDoesNotMatch {
        access_key_id: String,
        string_to_sign: String,
        signature: String,
    },

    #[error("{message}")]
    AccessDenied { message: String },

    #[error("{message}")]
    Internal { message: String },
}

impl S3Error {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::MethodNotAllowed {
            message: message.into(),
        }
    }

    /// The `Code` element of the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSuchBucket { .. } => "NoSuchBucket",
            Self::NoSuchKey { .. } => "NoSuchKey",
            Self::InvalidBucketName { .. } => "InvalidBucketName",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::InvalidRequest { .. } => "InvalidRequest",
            Self::MethodNotAllowed { .. } => "MethodNotAllowed",
            Self::MissingSecurityHeader { .. } => "MissingSecurityHeader",
            Self::MissingSecurityElement { .. } => "MissingSecurityElement",
            Self::AuthorizationQueryParametersError { .. } => "AuthorizationQueryParametersError",
            Self::InvalidAccessKeyId { .. } => "InvalidAccessKeyId",
            Self::SignatureDoesNotMatch { .. } => "SignatureDoesNotMatch",
            Self::AccessDenied { .. } => "AccessDenied",
            Self::Internal { .. } => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoSuchBucket { .. } | Self::NoSuchKey { .. } => StatusCode::NOT_FOUND,
            Self::InvalidBucketName { .. }
            | Self::InvalidArgument { .. }
            | Self::InvalidRequest { .. }
            | Self::MissingSecurityHeader { .. }
            | Self::MissingSecurityElement { .. }
            | Self::AuthorizationQueryParametersError { .. } => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::InvalidAccessKeyId { .. }
            | Self::SignatureDoesNotMatch { .. }
            | Self::AccessDenied { .. } => StatusCode::FORBIDDEN,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Extra named elements echoed in the error body, in emission order.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::NoSuchBucket { bucket } => vec![("BucketName", bucket.clone())],
            Self::NoSuchKey { key } => vec![("Resource", key.clone())],
            Self::InvalidArgument { name, value, .. } => vec![
                ("ArgumentName", name.clone()),
                ("ArgumentValue", value.clone()),
            ],
            Self::InvalidAccessKeyId { access_key_id } => {
                vec![("AWSAccessKeyId", access_key_id.clone())]
            }
            Self::SignatureDoesNotMatch {
                access_key_id,
                string_to_sign,
                signature,
            } => vec![
                ("AWSAccessKeyId", access_key_id.clone()),
                ("StringToSign", string_to_sign.clone()),
                ("SignatureProvided", signature.clone()),
                (
                    "StringToSignBytes",
                    string_to_sign
                        .as_bytes()
                        .iter()
                        .map(|b| b.to_string())
                        .collect::<Vec<_>>()
                        .join(" "),
                ),
            ],
            _ => Vec::new(),
        }
    }
}

impl From<std::io::Error> for S3Error {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err)
    }
}

impl From<sqlx::Error> for S3Error {
    fn from(err: sqlx::Error) -> Self {
        Self::internal(err)
    }
}

impl From<crate::models::wire::WireError> for S3Error {
    fn from(err: crate::models::wire::WireError) -> Self {
        Self::internal(err)
    }
}
