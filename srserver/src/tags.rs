use std::collections::BTreeMap;
use std::sync::Arc;

use oci_spec::image::Digest;

use crate::errors::{Code, DistError};
use crate::repository::{App, StreamGetter};
use srmeta::MetaError;

pub struct TagService {
    app: Arc<App>,
    namespace: String,
    name: String,
    stream: Arc<StreamGetter>,
}

impl TagService {
    pub fn new(app: Arc<App>, namespace: &str, name: &str, stream: Arc<StreamGetter>) -> Self {
        Self {
            app,
            namespace: namespace.to_string(),
            name: name.to_string(),
            stream,
        }
    }

    async fn stream(&self) -> Result<srmeta::ImageStream, DistError> {
        match self.stream.get().await {
            Ok(stream) => Ok(stream),
            Err(MetaError::NotFound { .. }) => Err(DistError::new(
                Code::NameUnknown,
                format!("repository {}/{} unknown", self.namespace, self.name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    // non-managed images only resolve through pullthrough, so with it off
    // their tags are hidden rather than served broken. pullthrough is
    // forced on in config, the filter stays for the day that changes
    async fn filter_unmanaged(
        &self,
        tags: BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, DistError> {
        if self.app.config.pullthrough.enabled {
            return Ok(tags);
        }
        let mut out = BTreeMap::new();
        for (tag, digest) in tags {
            match self.app.meta.get_image(&digest).await {
                Ok(image) if image.is_managed() => {
                    out.insert(tag, digest);
                }
                Ok(_) | Err(MetaError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    // tag -> latest image digest
    pub async fn all(&self) -> Result<BTreeMap<String, String>, DistError> {
        let stream = self.stream().await?;
        self.filter_unmanaged(stream.tag_digests()).await
    }

    pub async fn get(&self, tag: &str) -> Result<String, DistError> {
        let all = self.all().await?;
        all.get(tag).cloned().ok_or_else(|| {
            DistError::new(Code::TagUnknown, format!("tag {} unknown", tag))
        })
    }

    // every tag whose latest image is the given digest
    pub async fn lookup(&self, digest: &Digest) -> Result<Vec<String>, DistError> {
        let all = self.all().await?;
        let wanted = digest.to_string();
        Ok(all
            .into_iter()
            .filter(|(_, d)| *d == wanted)
            .map(|(tag, _)| tag)
            .collect())
    }

    // point a tag at an already registered image
    pub async fn tag(&self, tag: &str, digest: &Digest) -> Result<(), DistError> {
        self.stream().await?;
        let image = match self.app.meta.get_image(&digest.to_string()).await {
            Ok(image) => image,
            Err(MetaError::NotFound { .. }) => return Err(DistError::manifest_unknown()),
            Err(e) => return Err(e.into()),
        };
        let mapping = srmeta::ImageStreamMapping {
            metadata: srmeta::ObjectMeta {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                ..Default::default()
            },
            image,
            tag: tag.to_string(),
        };
        match self.app.meta.create_image_stream_mapping(mapping).await {
            Ok(()) => {
                self.stream.invalidate().await;
                Ok(())
            }
            Err(MetaError::QuotaExceeded(_)) => Err(DistError::denied()),
            Err(e) if e.is_access_denied() => Err(DistError::denied()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn untag(&self, tag: &str) -> Result<(), DistError> {
        self.stream().await?;
        let name = format!("{}:{}", self.name, tag);
        match self
            .app
            .meta
            .delete_image_stream_tag(&self.namespace, &name)
            .await
        {
            Ok(()) => {
                self.stream.invalidate().await;
                Ok(())
            }
            Err(MetaError::NotFound { .. }) => Err(DistError::new(
                Code::TagUnknown,
                format!("tag {} unknown", tag),
            )),
            Err(e) if e.is_access_denied() => Err(DistError::denied()),
            Err(e) => Err(e.into()),
        }
    }
}
