use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{info, warn};
use oci_spec::image::Digest;
use serde_json::json;

use crate::blob::ScopedBlobService;
use crate::errors::{Code, DistError};
use crate::repository::{App, StreamGetter};
use srdriver::{DriverError, LinkKind};
use srmeta::{
    Image, ImageLayer, ImageStreamMapping, MANAGED_ANNOTATION, MANAGED_ANNOTATION_VALUE,
    MetaError, ObjectMeta,
};
use sroci::manifest::ParsedManifest;
use srpull::PullthroughManifestService;

// dependency verification backoff against eventually consistent object
// stores: 6 attempts, 100ms base, doubling
const VERIFY_STEPS: u32 = 6;
const VERIFY_BASE_DELAY: Duration = Duration::from_millis(100);

pub struct ManifestService {
    app: Arc<App>,
    namespace: String,
    name: String,
    repo: String,
    stream: Arc<StreamGetter>,
    blobs: Arc<ScopedBlobService>,
    pull: Arc<PullthroughManifestService>,
}

impl ManifestService {
    pub fn new(
        app: Arc<App>,
        namespace: &str,
        name: &str,
        stream: Arc<StreamGetter>,
        blobs: Arc<ScopedBlobService>,
        pull: Arc<PullthroughManifestService>,
    ) -> Self {
        Self {
            app,
            namespace: namespace.to_string(),
            name: name.to_string(),
            repo: format!("{}/{}", namespace, name),
            stream,
            blobs,
            pull,
        }
    }

    // true iff the stream records an image whose name equals the digest
    pub async fn exists(&self, digest: &Digest) -> Result<bool, DistError> {
        let name = format!("{}@{}", self.name, digest);
        match self
            .app
            .meta
            .get_image_stream_image(&self.namespace, &name)
            .await
        {
            Ok(_) => Ok(true),
            Err(MetaError::NotFound { .. }) => Ok(false),
            Err(e) if e.is_access_denied() => Err(DistError::denied()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, digest: &Digest) -> Result<(String, Bytes), DistError> {
        let stream = match self.stream.get().await {
            Ok(stream) => stream,
            Err(MetaError::NotFound { .. }) => return Err(DistError::manifest_unknown()),
            Err(e) => return Err(e.into()),
        };
        let image = match self.app.meta.get_image(&digest.to_string()).await {
            Ok(image) => image,
            Err(MetaError::NotFound { .. }) => return Err(DistError::manifest_unknown()),
            Err(e) if e.is_access_denied() => return Err(DistError::denied()),
            Err(e) => return Err(e.into()),
        };

        // older images carry the manifest payload on the metadata record.
        // the first request to notice migrates it into local storage, any
        // concurrent request skips the write
        if let Some(payload) = &image.docker_image_manifest {
            if matches!(
                self.app.manifests.get_manifest(digest).await,
                Err(DriverError::NotFound)
            ) {
                if let Some(_guard) = self.app.inflight.claim(&digest.to_string()) {
                    let media_type = image.docker_image_manifest_media_type.clone();
                    if let Err(e) = self
                        .app
                        .manifests
                        .put_manifest(digest, &media_type, Bytes::from(payload.clone()))
                        .await
                    {
                        warn!("migrating manifest {} failed: {:?}", digest, e);
                    } else {
                        info!("migrated manifest {} into local storage", digest);
                    }
                }
            }
        }

        log::trace!(
            "serving manifest {} as {}",
            digest,
            self.display_reference(&image, &digest.to_string())
        );
        let found = self.pull.get(&stream, digest).await?;

        // seed the layer cache so the blob pulls that follow skip the scan
        for layer in &image.docker_image_layers {
            if let Ok(layer_digest) = layer.name.parse::<Digest>() {
                self.app.cache.add(&layer_digest, None, Some(&self.repo));
            }
        }
        Ok(found)
    }

    pub async fn put(
        &self,
        media_type: Option<&str>,
        payload: Bytes,
        tag: Option<&str>,
    ) -> Result<Digest, DistError> {
        let manifest = ParsedManifest::parse(media_type, payload)?;
        manifest.verify()?;
        if manifest.is_schema2() && !self.app.config.compatibility.accept_schema2 {
            return Err(
                DistError::new(Code::ManifestInvalid, "manifest rejected")
                    .with_detail(json!("schema 2 not allowed")),
            );
        }

        self.verify_dependencies(&manifest).await?;

        let digest = manifest.digest().clone();
        self.app
            .manifests
            .put_manifest(&digest, manifest.media_type(), manifest.payload().clone())
            .await?;
        self.app
            .links
            .link(&self.repo, LinkKind::Manifest, &digest)
            .await?;
        self.app.cache.add(&digest, None, Some(&self.repo));

        let image = self.build_image(&manifest);
        match tag {
            Some(tag) => {
                self.submit_mapping(image, tag).await?;
                self.stream.invalidate().await;
            }
            None => {
                // first writer registers the image record, the rest skip
                if let Some(_guard) = self.app.inflight.claim(&digest.to_string()) {
                    match self.app.meta.create_image(image).await {
                        Ok(_) => {}
                        Err(MetaError::Conflict(_)) => {}
                        Err(MetaError::QuotaExceeded(_)) => return Err(DistError::denied()),
                        Err(e) if e.is_access_denied() => return Err(DistError::denied()),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(digest)
    }

    // a mapping into a stream that doesn't exist yet provisions the stream
    // and retries exactly once. both steps succeeding is what makes the put
    // a success, partial outcomes surface as failure
    async fn submit_mapping(&self, image: Image, tag: &str) -> Result<(), DistError> {
        let mapping = ImageStreamMapping {
            metadata: ObjectMeta {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                ..Default::default()
            },
            image,
            tag: tag.to_string(),
        };
        match self.app.meta.create_image_stream_mapping(mapping.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_missing_stream(&self.name) => {
                info!(
                    "auto provisioning image stream {}/{}",
                    self.namespace, self.name
                );
                let stream = srmeta::ImageStream {
                    metadata: ObjectMeta {
                        namespace: self.namespace.clone(),
                        name: self.name.clone(),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match self.app.meta.create_image_stream(stream).await {
                    Ok(_) | Err(MetaError::Conflict(_)) => {}
                    Err(MetaError::QuotaExceeded(_)) => return Err(DistError::denied()),
                    Err(e) if e.is_access_denied() => return Err(DistError::denied()),
                    Err(e) => return Err(e.into()),
                }
                match self.app.meta.create_image_stream_mapping(mapping).await {
                    Ok(()) => Ok(()),
                    Err(MetaError::QuotaExceeded(_)) => Err(DistError::denied()),
                    Err(e) if e.is_access_denied() => Err(DistError::denied()),
                    Err(e) => Err(e.into()),
                }
            }
            Err(MetaError::QuotaExceeded(_)) => Err(DistError::denied()),
            Err(e) if e.is_access_denied() => Err(DistError::denied()),
            Err(e) => Err(e.into()),
        }
    }

    // every referenced blob must be statable through this repository before
    // the manifest is accepted. writes race object store consistency, hence
    // the bounded retry
    async fn verify_dependencies(&self, manifest: &ParsedManifest) -> Result<(), DistError> {
        for dep in manifest.dependencies() {
            let descriptor = self.stat_with_retry(&dep.digest).await.map_err(|e| {
                if e.code == Code::BlobUnknown {
                    DistError::new(Code::ManifestBlobUnknown, "manifest references unknown blob")
                        .with_detail(json!(dep.digest.to_string()))
                } else {
                    e
                }
            })?;
            if let Some(declared) = dep.size {
                if descriptor.size() != 0 && descriptor.size() != declared {
                    return Err(DistError::manifest_blob_bad_size(
                        &dep.digest.to_string(),
                        descriptor.size(),
                        declared,
                    ));
                }
            }
        }
        Ok(())
    }

    async fn stat_with_retry(
        &self,
        digest: &Digest,
    ) -> Result<oci_spec::image::Descriptor, DistError> {
        let mut delay = VERIFY_BASE_DELAY;
        let mut last = None;
        for attempt in 0..VERIFY_STEPS {
            match self.blobs.stat(digest).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(e) if e.code == Code::BlobUnknown => {
                    last = Some(e);
                    if attempt + 1 < VERIFY_STEPS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(DistError::blob_unknown))
    }

    // refuse while the stream still references the digest, otherwise only
    // the local link goes away
    pub async fn delete(&self, digest: &Digest) -> Result<(), DistError> {
        let stream = match self.stream.get().await {
            Ok(stream) => stream,
            Err(MetaError::NotFound { .. }) => {
                return Err(DistError::new(Code::NameUnknown, "repository unknown"));
            }
            Err(e) => return Err(e.into()),
        };
        if stream.references_image(&digest.to_string()) {
            return Err(DistError::new(
                Code::Unsupported,
                "manifest is still referenced by the image stream",
            ));
        }
        match self
            .app
            .links
            .unlink(&self.repo, LinkKind::Manifest, digest)
            .await
        {
            Ok(()) => Ok(()),
            Err(DriverError::NotFound) => Err(DistError::manifest_unknown()),
            Err(e) => Err(e.into()),
        }
    }

    // managed images live under our advertised address, everything else
    // keeps its upstream home
    fn display_reference(&self, image: &Image, digest: &str) -> String {
        if image.is_managed() || image.docker_image_reference.is_empty() {
            format!(
                "{}/{}@{}",
                self.app.config.server.advertised_addr, self.repo, digest
            )
        } else {
            image.docker_image_reference.clone()
        }
    }

    fn build_image(&self, manifest: &ParsedManifest) -> Image {
        let digest = manifest.digest().to_string();
        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(
            MANAGED_ANNOTATION.to_string(),
            MANAGED_ANNOTATION_VALUE.to_string(),
        );
        let layers = manifest
            .dependencies()
            .into_iter()
            .map(|dep| ImageLayer {
                name: dep.digest.to_string(),
                size: dep.size.unwrap_or(0),
                media_type: srdriver::OCTET_STREAM.to_string(),
            })
            .collect();
        Image {
            metadata: ObjectMeta {
                namespace: String::new(),
                name: digest.clone(),
                annotations,
            },
            docker_image_reference: format!(
                "{}/{}@{}",
                self.app.config.server.advertised_addr, self.repo, digest
            ),
            docker_image_manifest: None,
            docker_image_manifest_media_type: manifest.media_type().to_string(),
            docker_image_layers: layers,
            docker_image_metadata: srmeta::DockerImageMetadata {
                id: manifest
                    .config_digest()
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
            },
            signatures: Vec::new(),
        }
    }
}
