use async_trait::async_trait;

use srmeta::{AccessReview, MetaError, MetadataClient};

// what a handler wants to do, in access review terms. repository records
// carry the namespace/name of the stream, the administrative records don't
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub resource: &'static str,
    pub namespace: String,
    pub name: String,
    pub verb: &'static str,
}

impl AccessRecord {
    pub fn repository(namespace: &str, name: &str, verb: &'static str) -> Self {
        Self {
            resource: "imagestreams",
            namespace: namespace.to_string(),
            name: name.to_string(),
            verb,
        }
    }

    pub fn admin(verb: &'static str) -> Self {
        Self {
            resource: "admin",
            namespace: String::new(),
            name: String::new(),
            verb,
        }
    }

    pub fn metrics() -> Self {
        Self {
            resource: "metrics",
            namespace: String::new(),
            name: String::new(),
            verb: "get",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    Unauthorized,
    Forbidden,
    Upstream(String),
}

// how wrong is this?
impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// the contract an authentication provider has to satisfy. the provider
// itself lives outside this crate, the registry only asks yes/no questions
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        token: Option<&str>,
        records: &[AccessRecord],
    ) -> Result<(), AuthError>;
}

// grants everything, for development mode and tests
pub struct PermissiveAuthorizer;

#[async_trait]
impl Authorizer for PermissiveAuthorizer {
    async fn authorize(
        &self,
        _token: Option<&str>,
        _records: &[AccessRecord],
    ) -> Result<(), AuthError> {
        Ok(())
    }
}

// answers through the metadata plane's access review endpoints
pub struct ReviewAuthorizer {
    meta: std::sync::Arc<dyn MetadataClient>,
}

impl ReviewAuthorizer {
    pub fn new(meta: std::sync::Arc<dyn MetadataClient>) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl Authorizer for ReviewAuthorizer {
    async fn authorize(
        &self,
        token: Option<&str>,
        records: &[AccessRecord],
    ) -> Result<(), AuthError> {
        if token.is_none() {
            return Err(AuthError::Unauthorized);
        }
        for record in records {
            let review = AccessReview {
                namespace: record.namespace.clone(),
                resource: record.resource.to_string(),
                verb: record.verb.to_string(),
                name: record.name.clone(),
            };
            let allowed = if record.namespace.is_empty() {
                self.meta.self_subject_access_review(&review).await
            } else {
                self.meta
                    .local_subject_access_review(&record.namespace, &review)
                    .await
            };
            match allowed {
                Ok(true) => {}
                Ok(false) => return Err(AuthError::Forbidden),
                Err(MetaError::Unauthorized(_)) => return Err(AuthError::Unauthorized),
                Err(MetaError::Forbidden(_)) => return Err(AuthError::Forbidden),
                Err(e) => return Err(AuthError::Upstream(format!("{:?}", e))),
            }
        }
        Ok(())
    }
}

// pulls the bearer or basic token out of an Authorization header value
pub fn extract_token(header: Option<&str>) -> Option<&str> {
    let header = header?;
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("Basic "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_extract_token() {
        assert_eq!(extract_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(extract_token(Some("Basic dXNlcg==")), Some("dXNlcg=="));
        assert_eq!(extract_token(Some("Bearer ")), None);
        assert_eq!(extract_token(None), None);
    }

    #[tokio::test]
    async fn test_review_authorizer_denies_on_review() {
        let fake = Arc::new(srmeta::FakeMetadataClient::new());
        fake.deny_verb("update");
        let authorizer = ReviewAuthorizer::new(fake);
        let ok = authorizer
            .authorize(Some("t"), &[AccessRecord::repository("ns", "app", "get")])
            .await;
        assert!(ok.is_ok());
        let denied = authorizer
            .authorize(Some("t"), &[AccessRecord::repository("ns", "app", "update")])
            .await;
        assert!(matches!(denied, Err(AuthError::Forbidden)));
    }

    #[tokio::test]
    async fn test_review_authorizer_requires_token() {
        let fake = Arc::new(srmeta::FakeMetadataClient::new());
        let authorizer = ReviewAuthorizer::new(fake);
        assert!(matches!(
            authorizer
                .authorize(None, &[AccessRecord::repository("ns", "app", "get")])
                .await,
            Err(AuthError::Unauthorized)
        ));
    }
}
