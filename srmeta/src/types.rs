use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// entities as the metadata control plane serializes them. the control plane
// owns naming, tagging and access; the registry only reads these and writes
// through the operations on MetadataClient

// annotation on an image marking it as produced by this registry. images
// without it came from somewhere else and are served via pullthrough
pub const MANAGED_ANNOTATION: &str = "imageregistry.io/managed";
pub const MANAGED_ANNOTATION_VALUE: &str = "true";

// annotation on a stream marking the whole upstream repository insecure
pub const INSECURE_REPOSITORY_ANNOTATION: &str = "imageregistry.io/insecure-repository";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageStream {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ImageStreamSpec,
    #[serde(default)]
    pub status: ImageStreamStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageStreamSpec {
    #[serde(default)]
    pub tags: Vec<TagReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagReference {
    pub name: String,
    #[serde(default)]
    pub from: Option<ObjectReference>,
    #[serde(default, rename = "importPolicy")]
    pub import_policy: ImportPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportPolicy {
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectReference {
    #[serde(default)]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageStreamStatus {
    #[serde(default, rename = "dockerImageRepository")]
    pub docker_image_repository: String,
    #[serde(default)]
    pub tags: Vec<NamedTagEventList>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedTagEventList {
    pub tag: String,
    #[serde(default)]
    pub items: Vec<TagEvent>,
}

// a historical record of which image a tag pointed at at a given moment.
// items are newest first, generation is monotonically versioned by the
// control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagEvent {
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    pub image: String,
    #[serde(default, rename = "dockerImageReference")]
    pub docker_image_reference: String,
    #[serde(default)]
    pub generation: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Image {
    pub metadata: ObjectMeta,
    #[serde(default, rename = "dockerImageReference")]
    pub docker_image_reference: String,
    #[serde(default, rename = "dockerImageManifest")]
    pub docker_image_manifest: Option<String>,
    #[serde(default, rename = "dockerImageManifestMediaType")]
    pub docker_image_manifest_media_type: String,
    #[serde(default, rename = "dockerImageLayers")]
    pub docker_image_layers: Vec<ImageLayer>,
    #[serde(default, rename = "dockerImageMetadata")]
    pub docker_image_metadata: DockerImageMetadata,
    #[serde(default)]
    pub signatures: Vec<ImageSignature>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageLayer {
    // name is the layer digest
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, rename = "mediaType")]
    pub media_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerImageMetadata {
    // the config blob digest
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageSignature {
    pub name: String,
    #[serde(default, with = "content_b64")]
    pub content: Vec<u8>,
    #[serde(default, rename = "type")]
    pub kind: String,
}

mod content_b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

// write-only envelope attaching an Image to an ImageStream at a tag
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageStreamMapping {
    pub metadata: ObjectMeta,
    pub image: Image,
    pub tag: String,
}

// a single mirror rewrite rule. per-registry rules (source with no path)
// apply to every sub-repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorRule {
    pub source: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

impl ImageStream {
    pub fn name_key(&self) -> (String, String) {
        (self.metadata.namespace.clone(), self.metadata.name.clone())
    }

    // the newest event for a tag, if any
    pub fn latest_tag_event(&self, tag: &str) -> Option<&TagEvent> {
        self.status
            .tags
            .iter()
            .find(|t| t.tag == tag)
            .and_then(|t| t.items.first())
    }

    // tag -> latest image digest
    pub fn tag_digests(&self) -> BTreeMap<String, String> {
        self.status
            .tags
            .iter()
            .filter_map(|t| t.items.first().map(|e| (t.tag.clone(), e.image.clone())))
            .collect()
    }

    // does any event in the history reference the image digest
    pub fn references_image(&self, digest: &str) -> bool {
        self.status
            .tags
            .iter()
            .any(|t| t.items.iter().any(|e| e.image == digest))
    }

    pub fn insecure_by_annotation(&self) -> bool {
        self.metadata
            .annotations
            .get(INSECURE_REPOSITORY_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn tag_insecure(&self, tag: &str) -> bool {
        self.spec
            .tags
            .iter()
            .find(|t| t.name == tag)
            .map(|t| t.import_policy.insecure)
            .unwrap_or(false)
    }
}

impl Image {
    pub fn is_managed(&self) -> bool {
        self.metadata
            .annotations
            .get(MANAGED_ANNOTATION)
            .map(|v| v == MANAGED_ANNOTATION_VALUE)
            .unwrap_or(false)
    }

    // the digest this image is keyed by
    pub fn digest(&self) -> &str {
        &self.metadata.name
    }

    pub fn layer_digests(&self) -> impl Iterator<Item = &str> {
        self.docker_image_layers.iter().map(|l| l.name.as_str())
    }

    pub fn config_digest(&self) -> Option<&str> {
        if self.docker_image_metadata.id.is_empty() {
            None
        } else {
            Some(&self.docker_image_metadata.id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_with_tags() -> ImageStream {
        ImageStream {
            metadata: ObjectMeta {
                namespace: "ns".into(),
                name: "app".into(),
                ..Default::default()
            },
            status: ImageStreamStatus {
                tags: vec![
                    NamedTagEventList {
                        tag: "latest".into(),
                        items: vec![
                            TagEvent {
                                image: "sha256:new".into(),
                                ..Default::default()
                            },
                            TagEvent {
                                image: "sha256:old".into(),
                                ..Default::default()
                            },
                        ],
                    },
                    NamedTagEventList {
                        tag: "v1".into(),
                        items: vec![TagEvent {
                            image: "sha256:old".into(),
                            ..Default::default()
                        }],
                    },
                ],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_latest_tag_event() {
        let stream = stream_with_tags();
        assert_eq!(stream.latest_tag_event("latest").unwrap().image, "sha256:new");
        assert!(stream.latest_tag_event("missing").is_none());
    }

    #[test]
    fn test_references_image_sees_history() {
        let stream = stream_with_tags();
        assert!(stream.references_image("sha256:old"));
        assert!(stream.references_image("sha256:new"));
        assert!(!stream.references_image("sha256:other"));
    }

    #[test]
    fn test_managed_flag() {
        let mut image = Image::default();
        assert!(!image.is_managed());
        image
            .metadata
            .annotations
            .insert(MANAGED_ANNOTATION.into(), MANAGED_ANNOTATION_VALUE.into());
        assert!(image.is_managed());
    }
}
