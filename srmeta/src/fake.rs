use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use srcreds::CredentialSecret;

use crate::client::{AccessReview, MetaError, MetadataClient};
use crate::types::{
    Image, ImageStream, ImageStreamMapping, MirrorRule, NamedTagEventList, TagEvent,
};

// in-memory control plane for tests. the mapping-create path mutates stream
// status the way the real plane would so auto-provision and tag flows can be
// exercised end to end

#[derive(Default)]
struct Inner {
    streams: BTreeMap<(String, String), ImageStream>,
    images: BTreeMap<String, Image>,
    secrets: BTreeMap<(String, String), Vec<CredentialSecret>>,
    legacy_rules: Vec<MirrorRule>,
    digest_rules: Vec<MirrorRule>,
    tag_rules: Vec<MirrorRule>,
    // next call to the named method fails with the queued error
    fail_next: BTreeMap<&'static str, MetaError>,
    denied_verbs: Vec<String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeMetadataClient {
    inner: Mutex<Inner>,
}

impl FakeMetadataClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_stream(&self, stream: ImageStream) {
        let key = stream.name_key();
        self.inner.lock().unwrap().streams.insert(key, stream);
    }

    pub fn put_image(&self, image: Image) {
        let key = image.metadata.name.clone();
        self.inner.lock().unwrap().images.insert(key, image);
    }

    pub fn put_secrets(&self, namespace: &str, name: &str, secrets: Vec<CredentialSecret>) {
        self.inner
            .lock()
            .unwrap()
            .secrets
            .insert((namespace.to_string(), name.to_string()), secrets);
    }

    pub fn set_mirror_rules(
        &self,
        legacy: Vec<MirrorRule>,
        digest: Vec<MirrorRule>,
        tag: Vec<MirrorRule>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.legacy_rules = legacy;
        inner.digest_rules = digest;
        inner.tag_rules = tag;
    }

    pub fn fail_next(&self, method: &'static str, err: MetaError) {
        self.inner.lock().unwrap().fail_next.insert(method, err);
    }

    pub fn deny_verb(&self, verb: &str) {
        self.inner.lock().unwrap().denied_verbs.push(verb.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn stream(&self, namespace: &str, name: &str) -> Option<ImageStream> {
        self.inner
            .lock()
            .unwrap()
            .streams
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn enter(&self, method: &'static str) -> Result<(), MetaError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(method.to_string());
        if let Some(err) = inner.fail_next.remove(method) {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataClient for FakeMetadataClient {
    async fn get_image(&self, digest: &str) -> Result<Image, MetaError> {
        self.enter("get_image")?;
        self.inner
            .lock()
            .unwrap()
            .images
            .get(digest)
            .cloned()
            .ok_or_else(|| MetaError::NotFound {
                kind: "images".to_string(),
                name: digest.to_string(),
            })
    }

    async fn create_image(&self, image: Image) -> Result<Image, MetaError> {
        self.enter("create_image")?;
        let mut inner = self.inner.lock().unwrap();
        let key = image.metadata.name.clone();
        if inner.images.contains_key(&key) {
            return Err(MetaError::Conflict(key));
        }
        inner.images.insert(key, image.clone());
        Ok(image)
    }

    async fn update_image(&self, image: Image) -> Result<Image, MetaError> {
        self.enter("update_image")?;
        let mut inner = self.inner.lock().unwrap();
        let key = image.metadata.name.clone();
        inner.images.insert(key, image.clone());
        Ok(image)
    }

    async fn get_image_stream(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ImageStream, MetaError> {
        self.enter("get_image_stream")?;
        self.inner
            .lock()
            .unwrap()
            .streams
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| MetaError::NotFound {
                kind: "imagestreams".to_string(),
                name: name.to_string(),
            })
    }

    async fn list_image_streams(&self) -> Result<Vec<ImageStream>, MetaError> {
        self.enter("list_image_streams")?;
        Ok(self.inner.lock().unwrap().streams.values().cloned().collect())
    }

    async fn create_image_stream(&self, stream: ImageStream) -> Result<ImageStream, MetaError> {
        self.enter("create_image_stream")?;
        let mut inner = self.inner.lock().unwrap();
        let key = stream.name_key();
        if inner.streams.contains_key(&key) {
            return Err(MetaError::Conflict(key.1));
        }
        inner.streams.insert(key, stream.clone());
        Ok(stream)
    }

    async fn create_image_stream_mapping(
        &self,
        mapping: ImageStreamMapping,
    ) -> Result<(), MetaError> {
        self.enter("create_image_stream_mapping")?;
        let mut inner = self.inner.lock().unwrap();
        let key = (
            mapping.metadata.namespace.clone(),
            mapping.metadata.name.clone(),
        );
        if !inner.streams.contains_key(&key) {
            return Err(MetaError::NotFound {
                kind: "imagestreammappings".to_string(),
                name: mapping.metadata.name.clone(),
            });
        }
        let digest = mapping.image.metadata.name.clone();
        inner.images.insert(digest.clone(), mapping.image.clone());
        let stream = inner.streams.get_mut(&key).unwrap();
        let event = TagEvent {
            created: None,
            image: digest,
            docker_image_reference: mapping.image.docker_image_reference.clone(),
            generation: 1,
        };
        match stream.status.tags.iter_mut().find(|t| t.tag == mapping.tag) {
            Some(list) => list.items.insert(0, event),
            None => stream.status.tags.push(NamedTagEventList {
                tag: mapping.tag.clone(),
                items: vec![event],
            }),
        }
        Ok(())
    }

    async fn delete_image_stream_tag(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), MetaError> {
        self.enter("delete_image_stream_tag")?;
        let (stream_name, tag) = name.split_once(':').ok_or_else(|| {
            MetaError::Other(format!("bad imagestreamtag name {}", name))
        })?;
        let mut inner = self.inner.lock().unwrap();
        let stream = inner
            .streams
            .get_mut(&(namespace.to_string(), stream_name.to_string()))
            .ok_or_else(|| MetaError::NotFound {
                kind: "imagestreamtags".to_string(),
                name: name.to_string(),
            })?;
        let before = stream.status.tags.len();
        stream.status.tags.retain(|t| t.tag != tag);
        if stream.status.tags.len() == before {
            return Err(MetaError::NotFound {
                kind: "imagestreamtags".to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn get_image_stream_image(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Image, MetaError> {
        self.enter("get_image_stream_image")?;
        let (stream_name, digest) = name.split_once('@').ok_or_else(|| {
            MetaError::Other(format!("bad imagestreamimage name {}", name))
        })?;
        let inner = self.inner.lock().unwrap();
        let stream = inner
            .streams
            .get(&(namespace.to_string(), stream_name.to_string()))
            .ok_or_else(|| MetaError::NotFound {
                kind: "imagestreams".to_string(),
                name: stream_name.to_string(),
            })?;
        if !stream.references_image(digest) {
            return Err(MetaError::NotFound {
                kind: "imagestreamimages".to_string(),
                name: name.to_string(),
            });
        }
        inner
            .images
            .get(digest)
            .cloned()
            .ok_or_else(|| MetaError::NotFound {
                kind: "images".to_string(),
                name: digest.to_string(),
            })
    }

    async fn stream_secrets(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<CredentialSecret>, MetaError> {
        self.enter("stream_secrets")?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_legacy_mirror_rules(&self) -> Result<Vec<MirrorRule>, MetaError> {
        self.enter("list_legacy_mirror_rules")?;
        Ok(self.inner.lock().unwrap().legacy_rules.clone())
    }

    async fn list_digest_mirror_rules(&self) -> Result<Vec<MirrorRule>, MetaError> {
        self.enter("list_digest_mirror_rules")?;
        Ok(self.inner.lock().unwrap().digest_rules.clone())
    }

    async fn list_tag_mirror_rules(&self) -> Result<Vec<MirrorRule>, MetaError> {
        self.enter("list_tag_mirror_rules")?;
        Ok(self.inner.lock().unwrap().tag_rules.clone())
    }

    async fn local_subject_access_review(
        &self,
        _namespace: &str,
        review: &AccessReview,
    ) -> Result<bool, MetaError> {
        self.enter("local_subject_access_review")?;
        Ok(!self
            .inner
            .lock()
            .unwrap()
            .denied_verbs
            .contains(&review.verb))
    }

    async fn self_subject_access_review(
        &self,
        review: &AccessReview,
    ) -> Result<bool, MetaError> {
        self.enter("self_subject_access_review")?;
        Ok(!self
            .inner
            .lock()
            .unwrap()
            .denied_verbs
            .contains(&review.verb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectMeta;

    fn stream(ns: &str, name: &str) -> ImageStream {
        ImageStream {
            metadata: ObjectMeta {
                namespace: ns.into(),
                name: name.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mapping_requires_stream() {
        let fake = FakeMetadataClient::new();
        let mapping = ImageStreamMapping {
            metadata: ObjectMeta {
                namespace: "ns".into(),
                name: "app".into(),
                ..Default::default()
            },
            image: Image {
                metadata: ObjectMeta {
                    name: "sha256:abc".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
            tag: "latest".into(),
        };
        let err = fake
            .create_image_stream_mapping(mapping.clone())
            .await
            .unwrap_err();
        assert!(err.is_missing_stream("app"));

        fake.put_stream(stream("ns", "app"));
        fake.create_image_stream_mapping(mapping).await.unwrap();
        let got = fake.stream("ns", "app").unwrap();
        assert_eq!(got.latest_tag_event("latest").unwrap().image, "sha256:abc");
        // the image was registered too
        assert!(fake.get_image("sha256:abc").await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_next() {
        let fake = FakeMetadataClient::new();
        fake.put_stream(stream("ns", "app"));
        fake.fail_next("get_image_stream", MetaError::Forbidden("no".into()));
        assert!(fake.get_image_stream("ns", "app").await.is_err());
        assert!(fake.get_image_stream("ns", "app").await.is_ok());
    }
}
