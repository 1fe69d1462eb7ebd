use async_trait::async_trait;
use srcreds::CredentialSecret;

use crate::types::{Image, ImageStream, ImageStreamMapping, MirrorRule};

// classification of control plane failures. auto-provisioning and the
// access-denied mapping key off these, so the kind strings inside NotFound
// are part of the contract
#[derive(Debug, Clone, thiserror::Error)]
pub enum MetaError {
    NotFound { kind: String, name: String },
    Forbidden(String),
    Unauthorized(String),
    Conflict(String),
    QuotaExceeded(String),
    Other(String),
}

// how wrong is this?
impl std::fmt::Display for MetaError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl MetaError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetaError::NotFound { .. })
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, MetaError::Forbidden(_) | MetaError::Unauthorized(_))
    }

    // does this NotFound refer to the named stream (or a mapping into it),
    // meaning a create-and-retry is worth attempting
    pub fn is_missing_stream(&self, stream_name: &str) -> bool {
        match self {
            MetaError::NotFound { kind, name } => {
                matches!(
                    kind.as_str(),
                    "imagestream" | "imagestreams" | "imagestreammappings"
                ) && name == stream_name
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessReview {
    pub namespace: String,
    pub resource: String,
    pub verb: String,
    pub name: String,
}

// the only surface the registry consumes from the external control plane.
// everything is request scoped, implementations carry their own auth
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn get_image(&self, digest: &str) -> Result<Image, MetaError>;
    async fn create_image(&self, image: Image) -> Result<Image, MetaError>;
    async fn update_image(&self, image: Image) -> Result<Image, MetaError>;

    async fn get_image_stream(&self, namespace: &str, name: &str)
    -> Result<ImageStream, MetaError>;
    // every stream in the cluster, consumed only by the offline pruner
    async fn list_image_streams(&self) -> Result<Vec<ImageStream>, MetaError>;
    async fn create_image_stream(&self, stream: ImageStream) -> Result<ImageStream, MetaError>;
    async fn create_image_stream_mapping(
        &self,
        mapping: ImageStreamMapping,
    ) -> Result<(), MetaError>;

    // name is "stream:tag"
    async fn delete_image_stream_tag(&self, namespace: &str, name: &str)
    -> Result<(), MetaError>;
    // name is "stream@digest"
    async fn get_image_stream_image(&self, namespace: &str, name: &str)
    -> Result<Image, MetaError>;

    async fn stream_secrets(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<CredentialSecret>, MetaError>;

    async fn list_legacy_mirror_rules(&self) -> Result<Vec<MirrorRule>, MetaError>;
    async fn list_digest_mirror_rules(&self) -> Result<Vec<MirrorRule>, MetaError>;
    async fn list_tag_mirror_rules(&self) -> Result<Vec<MirrorRule>, MetaError>;

    async fn local_subject_access_review(
        &self,
        namespace: &str,
        review: &AccessReview,
    ) -> Result<bool, MetaError>;
    async fn self_subject_access_review(&self, review: &AccessReview)
    -> Result<bool, MetaError>;
}
