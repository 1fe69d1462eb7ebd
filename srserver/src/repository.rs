use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{info, trace};

use crate::auth::Authorizer;
use crate::blob::ScopedBlobService;
use crate::config::Config;
use crate::errors::DistError;
use crate::limiter::AdmissionLimiter;
use crate::manifest::ManifestService;
use crate::metrics::Sink;
use crate::signatures::SignatureService;
use crate::tags::TagService;
use srcache::{CachedBlobStatter, DigestCache};
use srcreds::{
    BasicCredentials, NodeCredentialStore, SecretCredentialStore, UnionCredentialStore,
};
use srdriver::{BlobStatter, BlobStore, Driver, LinkStore, ManifestStore, UploadStore};
use srmeta::{ImageStream, MetaError, MetadataClient};
use srpull::{
    MirrorResolver, PullthroughBlobStore, PullthroughManifestService, RemoteBlobGetter,
    RemoteClient,
};

// process-wide state. repositories are assembled per request on top of this
pub struct App {
    pub config: Config,
    pub blobs: Arc<dyn BlobStore>,
    // the global descriptor service flavor: cache-through to the driver,
    // no tenancy, for paths that ask "does this blob exist at all"
    pub descriptors: Arc<CachedBlobStatter<dyn BlobStatter>>,
    pub uploads: Arc<dyn UploadStore>,
    pub manifests: Arc<dyn ManifestStore>,
    pub links: Arc<dyn LinkStore>,
    pub meta: Arc<dyn MetadataClient>,
    pub authorizer: Arc<dyn Authorizer>,
    pub cache: DigestCache,
    pub remote: RemoteClient,
    pub node_creds: Option<Arc<NodeCredentialStore>>,
    pub read_limiter: AdmissionLimiter,
    pub write_limiter: AdmissionLimiter,
    pub inflight: ManifestInflight,
    pub sink: Arc<dyn Sink>,
}

impl App {
    pub fn new<D: Driver + 'static>(
        config: Config,
        driver: Arc<D>,
        meta: Arc<dyn MetadataClient>,
        authorizer: Arc<dyn Authorizer>,
        sink: Arc<dyn Sink>,
    ) -> Result<Arc<Self>, DistError> {
        let cache = if config.cache.disabled {
            DigestCache::disabled()
        } else {
            // ~number of blobs a node touches before recycling is fine, the
            // ttl is the actual consistency bound
            DigestCache::new(64 * 1024, 32, config.blob_repository_ttl())
        };
        let remote = RemoteClient::new()
            .map_err(|e| DistError::internal(format!("building remote client: {:?}", e)))?;
        let node_creds = if config.server.node_credentials_path.is_empty() {
            None
        } else {
            Some(Arc::new(NodeCredentialStore::new(
                config.server.node_credentials_path.clone(),
            )))
        };
        let read_limiter = AdmissionLimiter::new(&config.requests.read);
        let write_limiter = AdmissionLimiter::new(&config.requests.write);
        let statter: Arc<dyn BlobStatter> = driver.clone();
        Ok(Arc::new(App {
            blobs: driver.clone(),
            descriptors: Arc::new(CachedBlobStatter::new(cache.clone(), statter)),
            uploads: driver.clone(),
            manifests: driver.clone(),
            links: driver.clone(),
            config,
            meta,
            authorizer,
            cache,
            remote,
            node_creds,
            read_limiter,
            write_limiter,
            inflight: ManifestInflight::default(),
            sink,
        }))
    }
}

// first writer to claim a digest does the migration work, everyone else
// skips it. insert-if-absent, delete-on-completion
#[derive(Clone, Default)]
pub struct ManifestInflight {
    set: Arc<Mutex<HashSet<String>>>,
}

pub struct InflightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl ManifestInflight {
    pub fn claim(&self, digest: &str) -> Option<InflightGuard> {
        let mut set = self.set.lock().unwrap();
        if set.insert(digest.to_string()) {
            Some(InflightGuard {
                set: self.set.clone(),
                key: digest.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.key);
    }
}

// one image stream fetch per request, shared by every service assembled for
// it. streams are cached only for the lifetime of the request
pub struct StreamGetter {
    meta: Arc<dyn MetadataClient>,
    pub namespace: String,
    pub name: String,
    cached: tokio::sync::Mutex<Option<ImageStream>>,
}

impl StreamGetter {
    pub fn new(meta: Arc<dyn MetadataClient>, namespace: &str, name: &str) -> Self {
        Self {
            meta,
            namespace: namespace.to_string(),
            name: name.to_string(),
            cached: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<ImageStream, MetaError> {
        let mut cached = self.cached.lock().await;
        if let Some(stream) = cached.as_ref() {
            return Ok(stream.clone());
        }
        let stream = self
            .meta
            .get_image_stream(&self.namespace, &self.name)
            .await?;
        trace!("fetched image stream {}/{}", self.namespace, self.name);
        *cached = Some(stream.clone());
        Ok(stream)
    }

    // drop the memo after a write that changed the stream
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

// the per-request composition root: the repo-scoped blob service with
// pullthrough behind it, the manifest service and the tag service, all
// sharing one stream memo and one remote-store memo. the audit/metrics
// decorators wrap each service call exactly once, here
pub struct Repository {
    pub app: Arc<App>,
    pub namespace: String,
    pub name: String,
    blobs: Arc<ScopedBlobService>,
    manifests: ManifestService,
    tags: TagService,
    signatures: SignatureService,
}

impl Repository {
    // remote_access_enabled widens descriptor stats to remote registries,
    // set for manifest puts whose dependencies may not be local yet
    pub async fn new(
        app: Arc<App>,
        namespace: &str,
        name: &str,
        remote_access_enabled: bool,
    ) -> Result<Self, DistError> {
        let repo = format!("{}/{}", namespace, name);
        let stream = Arc::new(StreamGetter::new(app.meta.clone(), namespace, name));

        // pod secrets first, node credentials after
        let secrets = match app.meta.stream_secrets(namespace, name).await {
            Ok(secrets) => secrets,
            Err(MetaError::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut stores: Vec<Box<dyn BasicCredentials>> =
            vec![Box::new(SecretCredentialStore::new(secrets))];
        if let Some(node) = &app.node_creds {
            stores.push(Box::new(NodeStoreRef(node.clone())));
        }
        let creds: Arc<dyn BasicCredentials> = Arc::new(UnionCredentialStore::new(stores));

        let resolver = Arc::new(MirrorResolver::load(app.meta.as_ref()).await?);

        let getter = Arc::new(RemoteBlobGetter::new(
            app.remote.clone(),
            app.cache.clone(),
            creds,
            resolver,
            app.config.server.advertised_addr.clone(),
            app.config.pullthrough.insecure_covers_registry,
        ));

        let pull_blobs = Arc::new(PullthroughBlobStore::new(
            app.blobs.clone(),
            getter.clone(),
            app.config.pullthrough.mirror,
        ));
        let pull_manifests = Arc::new(PullthroughManifestService::new(
            app.manifests.clone(),
            getter.clone(),
            app.config.pullthrough.mirror,
            app.config.pullthrough.insecure_covers_registry,
        ));

        let blobs = Arc::new(ScopedBlobService::new(
            app.clone(),
            repo.clone(),
            stream.clone(),
            getter.clone(),
            pull_blobs,
            remote_access_enabled,
        ));
        let manifests = ManifestService::new(
            app.clone(),
            namespace,
            name,
            stream.clone(),
            blobs.clone(),
            pull_manifests,
        );
        let tags = TagService::new(app.clone(), namespace, name, stream.clone());
        let signatures = SignatureService::new(app.clone());

        Ok(Self {
            app,
            namespace: namespace.to_string(),
            name: name.to_string(),
            blobs,
            manifests,
            tags,
            signatures,
        })
    }

    pub fn repo(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn blobs(&self) -> &ScopedBlobService {
        &self.blobs
    }

    pub fn manifests(&self) -> &ManifestService {
        &self.manifests
    }

    pub fn tags(&self) -> &TagService {
        &self.tags
    }

    pub fn signatures(&self) -> &SignatureService {
        &self.signatures
    }

    // the audit + metrics decorator every service call goes through
    pub async fn observed<T>(
        &self,
        func: &'static str,
        fut: impl Future<Output = Result<T, DistError>>,
    ) -> Result<T, DistError> {
        let result = fut.await;
        if let Err(e) = &result {
            self.app.sink.failure(func);
            info!("{}({}): {}", func, self.repo(), e);
        }
        result
    }
}

// adapter so the shared node store can sit inside a per-request union
struct NodeStoreRef(Arc<NodeCredentialStore>);

impl BasicCredentials for NodeStoreRef {
    fn basic(&self, url: &url::Url) -> Option<(String, String)> {
        self.0.basic(url)
    }

    fn err(&self) -> Option<String> {
        self.0.err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inflight_claim_once() {
        let inflight = ManifestInflight::default();
        let guard = inflight.claim("sha256:abc");
        assert!(guard.is_some());
        assert!(inflight.claim("sha256:abc").is_none());
        drop(guard);
        assert!(inflight.claim("sha256:abc").is_some());
    }
}
