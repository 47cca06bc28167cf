use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::error::RegistryError;

/// Distribution API error, rendered as
/// `{"errors":[{"code":..,"message":..,"detail":..}]}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    detail: Value,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn name_unknown(name: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "repository name not known to registry")
            .with_detail(json!({ "name": name }))
    }

    pub fn name_invalid(name: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "NAME_INVALID", "invalid repository name")
            .with_detail(json!({ "name": name }))
    }

    pub fn manifest_unknown(name: &str, reference: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", "manifest unknown")
            .with_detail(json!({ "name": name, "reference": reference }))
    }

    pub fn blob_unknown(digest: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", "blob unknown to registry")
            .with_detail(json!({ "digest": digest }))
    }

    pub fn digest_invalid(reference: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "DIGEST_INVALID",
            "provided digest did not match uploaded content",
        )
        .with_detail(json!({ "digest": reference }))
    }

    pub fn unsupported(method: &str) -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "UNSUPPORTED",
            "the operation is unsupported: this registry is read-only",
        )
        .with_detail(json!({ "method": method }))
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "no such endpoint").with_detail(json!({ "path": path }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let api = match &err {
            RegistryError::PackageNotFound { name } => Self::name_unknown(name),
            RegistryError::TagUnknown { name, tag } => Self::manifest_unknown(name, tag),
            RegistryError::ManifestUnknown { name, reference } => Self::manifest_unknown(name, reference),
            RegistryError::BlobUnknown(digest) => Self::blob_unknown(&digest.to_string()),
            // the corrupt copy is already purged; to a client it is simply gone
            RegistryError::DigestMismatch { expected, .. } => Self::blob_unknown(&expected.to_string()),
            RegistryError::InvalidDigest(e) => Self::digest_invalid(&e.to_string()),
            RegistryError::InvalidConfig(reason) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "MANIFEST_INVALID",
                "manifest invalid",
            )
            .with_detail(json!({ "reason": reason })),
            RegistryError::PayloadUnreadable { .. }
            | RegistryError::InvalidPath { .. }
            | RegistryError::Storage { .. }
            | RegistryError::Internal(_) => Self::internal(err.to_string()),
        };

        if api.status.is_server_error() {
            error!(code = api.code, error = %err, "Request failed");
        } else {
            debug!(code = api.code, error = %err, "Request rejected");
        }
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "errors": [{
                "code": self.code,
                "message": self.message,
                "detail": self.detail,
            }]
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    #[test]
    fn test_registry_error_mapping() {
        let cases = [
            (
                RegistryError::PackageNotFound { name: "x".to_string() },
                StatusCode::NOT_FOUND,
                "NAME_UNKNOWN",
            ),
            (
                RegistryError::TagUnknown {
                    name: "x".to_string(),
                    tag: "1".to_string(),
                },
                StatusCode::NOT_FOUND,
                "MANIFEST_UNKNOWN",
            ),
            (
                RegistryError::BlobUnknown(Digest::of(b"x")),
                StatusCode::NOT_FOUND,
                "BLOB_UNKNOWN",
            ),
            (
                RegistryError::DigestMismatch {
                    expected: Digest::of(b"x"),
                    actual: Digest::of(b"y"),
                    size: 1,
                },
                StatusCode::NOT_FOUND,
                "BLOB_UNKNOWN",
            ),
            (
                RegistryError::payload("foo", "/bin/foo", "gone"),
                StatusCode::INTERNAL_SERVER_ERROR,
                "UNKNOWN",
            ),
            (
                RegistryError::InvalidConfig("os is empty".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "MANIFEST_INVALID",
            ),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status(), status);
            assert_eq!(api.code(), code);
        }
    }

    #[test]
    fn test_invalid_digest_is_bad_request() {
        let err: RegistryError = "md5:abc".parse::<Digest>().unwrap_err().into();
        let api = ApiError::from(err);
        assert_eq!(api.status(), StatusCode::BAD_REQUEST);
        assert_eq!(api.code(), "DIGEST_INVALID");
    }
}
