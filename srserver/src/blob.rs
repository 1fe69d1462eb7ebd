use std::sync::Arc;

use bytes::Bytes;
use log::{info, trace};
use oci_spec::image::{Descriptor, Digest};

use crate::errors::DistError;
use crate::repository::{App, StreamGetter};
use srdriver::{BlobStream, DriverError, LinkKind, OCTET_STREAM};
use srmeta::{Image, ImageStream, MetaError};
use srpull::{PullthroughBlobStore, RemoteBlobGetter};

// the repository-scoped descriptor service. a blob is only visible through
// a repository that has legitimately referenced it: via a link written at
// push time, via the shared digest cache, or because an image in the
// backing stream lists it. a bare global hit is never enough
pub struct ScopedBlobService {
    app: Arc<App>,
    repo: String,
    stream: Arc<StreamGetter>,
    getter: Arc<RemoteBlobGetter>,
    pull: Arc<PullthroughBlobStore>,
    remote_access_enabled: bool,
}

impl ScopedBlobService {
    pub fn new(
        app: Arc<App>,
        repo: String,
        stream: Arc<StreamGetter>,
        getter: Arc<RemoteBlobGetter>,
        pull: Arc<PullthroughBlobStore>,
        remote_access_enabled: bool,
    ) -> Self {
        Self {
            app,
            repo,
            stream,
            getter,
            pull,
            remote_access_enabled,
        }
    }

    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor, DistError> {
        // 1. cache: descriptor present and this repo in the record
        if let Ok(record) = self.app.cache.get(digest) {
            if record.contains_repository(&self.repo) {
                if let Some(descriptor) = record.descriptor() {
                    trace!("scoped stat cache hit {} in {}", digest, self.repo);
                    return Ok(descriptor);
                }
            }
        }

        // 2. upstream: the link written at push time plus the driver
        match self.app.links.linked(&self.repo, LinkKind::Layer, digest).await {
            Ok(true) => match self.app.blobs.stat(digest).await {
                Ok(descriptor) => {
                    self.app
                        .cache
                        .add(digest, Some(&descriptor), Some(&self.repo));
                    return Ok(descriptor);
                }
                // link left behind after a prune, fall through to the stream
                Err(DriverError::NotFound) => {}
                Err(e) => return Err(e.into()),
            },
            Ok(false) => {}
            Err(e) => return Err(e.into()),
        }

        // 3. the image stream view
        let stream = match self.stream.get().await {
            Ok(stream) => stream,
            Err(MetaError::NotFound { .. }) => return Err(DistError::blob_unknown()),
            Err(e) => return Err(e.into()),
        };

        if let Some(descriptor) = self.membership_scan(&stream, digest).await? {
            return Ok(descriptor);
        }

        // 4. nothing in the stream matched; a pull of a freshly pushed
        // manifest's dependencies may still find them remotely
        if self.remote_access_enabled {
            let descriptor = self.getter.stat(&stream, digest).await?;
            self.app
                .cache
                .add(digest, Some(&descriptor), Some(&self.repo));
            return Ok(descriptor);
        }

        Err(DistError::blob_unknown())
    }

    // walk tag events youngest-first (every tag's newest item, then the
    // older history), fetch each referenced image and look for the digest
    // among its layers and config. the first match caches every layer of
    // that image against this repository so the rest of the pull is cheap
    async fn membership_scan(
        &self,
        stream: &ImageStream,
        digest: &Digest,
    ) -> Result<Option<Descriptor>, DistError> {
        let mut events: Vec<&str> = Vec::new();
        for list in &stream.status.tags {
            if let Some(event) = list.items.first() {
                events.push(&event.image);
            }
        }
        for list in &stream.status.tags {
            for event in list.items.iter().skip(1) {
                events.push(&event.image);
            }
        }
        events.dedup();

        let wanted = digest.to_string();
        for image_digest in events {
            let image = match self.app.meta.get_image(image_digest).await {
                Ok(image) => image,
                Err(MetaError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            if let Some(descriptor) = self.match_image(&image, &wanted) {
                info!(
                    "digest {} found in image {} for {}",
                    digest, image_digest, self.repo
                );
                self.cache_image_layers(&image);
                return Ok(Some(descriptor));
            }
        }
        Ok(None)
    }

    fn match_image(&self, image: &Image, wanted: &str) -> Option<Descriptor> {
        for layer in &image.docker_image_layers {
            if layer.name == wanted {
                return Some(Descriptor::new(
                    OCTET_STREAM.into(),
                    layer.size,
                    layer.name.parse::<Digest>().ok()?,
                ));
            }
        }
        if image.config_digest() == Some(wanted) {
            // config size isn't tracked in the metadata record
            return wanted
                .parse::<Digest>()
                .ok()
                .map(|d| Descriptor::new(OCTET_STREAM.into(), 0, d));
        }
        // a cross-algorithm alias recorded earlier counts as a match too
        if let Ok(record) = self.app.cache.get(&wanted.parse().ok()?) {
            if let Some(descriptor) = record.descriptor() {
                let aliased = descriptor.digest().to_string();
                if aliased != wanted
                    && image.layer_digests().any(|l| l == aliased)
                {
                    return Some(descriptor);
                }
            }
        }
        None
    }

    fn cache_image_layers(&self, image: &Image) {
        for layer in &image.docker_image_layers {
            if let Ok(layer_digest) = layer.name.parse::<Digest>() {
                let descriptor =
                    Descriptor::new(OCTET_STREAM.into(), layer.size, layer_digest.clone());
                self.app
                    .cache
                    .add(&layer_digest, Some(&descriptor), Some(&self.repo));
            }
        }
        if let Some(config) = image.config_digest() {
            if let Ok(config_digest) = config.parse::<Digest>() {
                self.app.cache.add(&config_digest, None, Some(&self.repo));
            }
        }
    }

    // serve enforces the same tenancy as stat, then streams from local
    // storage or through pullthrough
    pub async fn serve(&self, digest: &Digest) -> Result<(Descriptor, BlobStream), DistError> {
        let descriptor = self.stat(digest).await?;
        match self.app.blobs.open(digest).await {
            Ok(found) => return Ok(found),
            Err(DriverError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        let stream = self
            .stream
            .get()
            .await
            .map_err(|_| DistError::blob_unknown())?;
        let (served, body) = self.pull.serve(&stream, digest).await?;
        self.app.sink.pullthrough_blob();
        // content length comes from whichever descriptor knows the size
        let descriptor = if descriptor.size() > 0 { descriptor } else { served };
        Ok((descriptor, body))
    }

    pub async fn get(&self, digest: &Digest) -> Result<Bytes, DistError> {
        self.stat(digest).await?;
        match self.app.blobs.get(digest).await {
            Ok(data) => return Ok(data),
            Err(DriverError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        let stream = self
            .stream
            .get()
            .await
            .map_err(|_| DistError::blob_unknown())?;
        Ok(self.pull.get(&stream, digest).await?)
    }

    pub fn set_descriptor(&self, digest: &Digest, descriptor: &Descriptor) {
        self.app.cache.add(digest, Some(descriptor), Some(&self.repo));
    }

    pub fn clear(&self, digest: &Digest) {
        self.app.cache.remove(digest);
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }
}
