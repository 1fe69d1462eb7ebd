use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use srcache::CacheError;
use srdriver::DriverError;
use srmeta::MetaError;
use srpull::PullError;

// the client-visible error codes, serialized into the standard error
// envelope {"errors":[{code,message,detail}]}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Code {
    #[serde(rename = "BLOB_UNKNOWN")]
    BlobUnknown,
    #[serde(rename = "MANIFEST_UNKNOWN")]
    ManifestUnknown,
    #[serde(rename = "MANIFEST_INVALID")]
    ManifestInvalid,
    #[serde(rename = "MANIFEST_BLOB_UNKNOWN")]
    ManifestBlobUnknown,
    #[serde(rename = "TAG_UNKNOWN")]
    TagUnknown,
    #[serde(rename = "NAME_UNKNOWN")]
    NameUnknown,
    #[serde(rename = "NAME_INVALID")]
    NameInvalid,
    #[serde(rename = "DIGEST_INVALID")]
    DigestInvalid,
    #[serde(rename = "DENIED")]
    Denied,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "UNSUPPORTED")]
    Unsupported,
    #[serde(rename = "TOOMANYREQUESTS")]
    TooManyRequests,
    // wraps a remote failure during pullthrough. 404 keeps clients happy
    #[serde(rename = "PULLTHROUGH_MANIFEST")]
    PullthroughManifest,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl Code {
    pub fn status(self) -> StatusCode {
        match self {
            Code::BlobUnknown
            | Code::ManifestUnknown
            | Code::TagUnknown
            | Code::NameUnknown
            | Code::PullthroughManifest => StatusCode::NOT_FOUND,
            Code::ManifestInvalid
            | Code::ManifestBlobUnknown
            | Code::NameInvalid
            | Code::DigestInvalid => StatusCode::BAD_REQUEST,
            Code::Denied => StatusCode::FORBIDDEN,
            Code::Unauthorized => StatusCode::UNAUTHORIZED,
            Code::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            Code::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DistError {
    pub code: Code,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

impl std::fmt::Display for DistError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for DistError {}

impl DistError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn blob_unknown() -> Self {
        Self::new(Code::BlobUnknown, "blob unknown to registry")
    }

    pub fn manifest_unknown() -> Self {
        Self::new(Code::ManifestUnknown, "manifest unknown")
    }

    pub fn manifest_blob_bad_size(digest: &str, actual: u64, declared: u64) -> Self {
        Self::new(Code::ManifestInvalid, "blob size does not match manifest").with_detail(json!({
            "digest": digest,
            "actual": actual,
            "declared": declared,
        }))
    }

    pub fn denied() -> Self {
        Self::new(Code::Denied, "access denied")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }
}

#[derive(Serialize)]
struct ErrorEntry {
    code: Code,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    errors: Vec<ErrorEntry>,
}

impl IntoResponse for DistError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        let body = ErrorEnvelope {
            errors: vec![ErrorEntry {
                code: self.code,
                message: self.message,
                detail: self.detail,
            }],
        };
        (status, Json(body)).into_response()
    }
}

// NotFound-class errors propagate verbatim, access problems collapse to
// denied, everything else is a server-side internal with the cause attached
// as detail
impl From<DriverError> for DistError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::NotFound => DistError::blob_unknown(),
            DriverError::Digest(_) => DistError::new(Code::DigestInvalid, "digest mismatch"),
            e => DistError::internal("storage driver error")
                .with_detail(json!(format!("{:?}", e))),
        }
    }
}

impl From<CacheError> for DistError {
    fn from(_: CacheError) -> Self {
        DistError::blob_unknown()
    }
}

impl From<MetaError> for DistError {
    fn from(e: MetaError) -> Self {
        match e {
            MetaError::NotFound { kind, name } => match kind.as_str() {
                "imagestreams" | "imagestream" => {
                    DistError::new(Code::NameUnknown, format!("repository {} not found", name))
                }
                "imagestreamtags" => {
                    DistError::new(Code::TagUnknown, format!("tag {} not found", name))
                }
                _ => DistError::new(Code::ManifestUnknown, format!("{} {} not found", kind, name)),
            },
            MetaError::Forbidden(m) => {
                DistError::new(Code::Denied, format!("access denied: {}", m))
            }
            MetaError::Unauthorized(m) => {
                DistError::new(Code::Unauthorized, format!("unauthorized: {}", m))
            }
            // quota exhaustion on a write path reads as access denied
            MetaError::QuotaExceeded(m) => {
                DistError::new(Code::Denied, format!("quota exceeded: {}", m))
            }
            e => DistError::internal("metadata plane error")
                .with_detail(json!(format!("{:?}", e))),
        }
    }
}

impl From<PullError> for DistError {
    fn from(e: PullError) -> Self {
        match e {
            PullError::BlobUnknown => DistError::blob_unknown(),
            PullError::ManifestUnknown => DistError::manifest_unknown(),
            PullError::TooManyRequests => {
                DistError::new(Code::TooManyRequests, "too many requests to upstream registry")
            }
            PullError::PullthroughManifest(inner) => DistError::new(
                Code::PullthroughManifest,
                "unable to pull manifest from remote registry",
            )
            .with_detail(json!(format!("{:?}", inner))),
            PullError::ConflictingMirrorPolicies => DistError::internal(
                "conflicting mirror policies: legacy content source policy and digest mirror set are both configured",
            ),
            PullError::Meta(e) => e.into(),
            PullError::Driver(e) => e.into(),
            e => DistError::internal("pullthrough error").with_detail(json!(format!("{:?}", e))),
        }
    }
}

impl From<sroci::manifest::Error> for DistError {
    fn from(e: sroci::manifest::Error) -> Self {
        DistError::new(Code::ManifestInvalid, "manifest verification failed")
            .with_detail(json!(format!("{:?}", e)))
    }
}

impl From<sroci::digest::Error> for DistError {
    fn from(e: sroci::digest::Error) -> Self {
        DistError::new(Code::DigestInvalid, "invalid digest").with_detail(json!(format!("{:?}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let err = DistError::manifest_blob_bad_size("sha256:abc", 10, 20);
        let body = serde_json::to_value(ErrorEnvelope {
            errors: vec![ErrorEntry {
                code: err.code,
                message: err.message.clone(),
                detail: err.detail.clone(),
            }],
        })
        .unwrap();
        assert_eq!(body["errors"][0]["code"], "MANIFEST_INVALID");
        assert_eq!(body["errors"][0]["detail"]["actual"], 10);
    }

    #[test]
    fn test_quota_maps_to_denied() {
        let err: DistError = MetaError::QuotaExceeded("limit".into()).into();
        assert_eq!(err.code, Code::Denied);
    }

    #[test]
    fn test_pullthrough_is_404() {
        let err: DistError =
            PullError::PullthroughManifest(Box::new(PullError::ManifestUnknown)).into();
        assert_eq!(err.code.status(), StatusCode::NOT_FOUND);
    }
}
