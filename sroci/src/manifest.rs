use std::io::Cursor;

use base64::Engine;
use bytes::Bytes;
use oci_spec::image::{Digest, ImageIndex, ImageManifest};
use serde::Deserialize;

use crate::digest::{parse_digest, payload_digest};

pub const OCI_IMAGE_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    BadJson(#[from] serde_json::Error),
    OciSpec(#[from] oci_spec::OciSpecError),
    BadMediaType(String),
    BadDigest(String),
    BadSignature,
    NoLayers,
    HistoryMismatch { layers: usize, history: usize },
    BadSchemaVersion(u32),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// a blob a manifest depends on. schema 1 only carries the digest so size is
// optional, and a declared size that disagrees with storage is the caller's
// problem to report
#[derive(Debug, Clone)]
pub struct BlobDependency {
    pub digest: Digest,
    pub size: Option<u64>,
}

#[derive(Debug)]
pub enum ManifestDetail {
    Schema1(Schema1Manifest),
    Image(ImageManifest),
    Index(ImageIndex),
}

// one parsed member of the manifest family. payload is the exact byte
// sequence to store and serve back, digest is the content address clients
// will pull it by (for signed schema 1 that is the jws-stripped payload, not
// the bytes on the wire)
#[derive(Debug)]
pub struct ParsedManifest {
    media_type: String,
    digest: Digest,
    payload: Bytes,
    detail: ManifestDetail,
}

#[derive(Debug, Deserialize)]
pub struct Schema1Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    pub name: Option<String>,
    pub tag: Option<String>,
    pub architecture: Option<String>,
    #[serde(rename = "fsLayers", default)]
    pub fs_layers: Vec<Schema1FsLayer>,
    #[serde(default)]
    pub history: Vec<Schema1History>,
    #[serde(default)]
    pub signatures: Vec<Schema1Signature>,
}

#[derive(Debug, Deserialize)]
pub struct Schema1FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

#[derive(Debug, Deserialize)]
pub struct Schema1History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

#[derive(Debug, Deserialize)]
pub struct Schema1Signature {
    pub protected: Option<String>,
    pub signature: Option<String>,
}

#[derive(Deserialize)]
struct Schema1Protected {
    #[serde(rename = "formatLength")]
    format_length: usize,
    #[serde(rename = "formatTail")]
    format_tail: String,
}

// for sniffing when the client didn't send a content type. docker schema 1
// has no mediaType field at all so we go by shape
#[derive(Deserialize)]
struct Shape {
    #[serde(rename = "schemaVersion")]
    schema_version: Option<u32>,
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    manifests: Option<serde_json::Value>,
    #[serde(rename = "fsLayers")]
    fs_layers: Option<serde_json::Value>,
}

impl ParsedManifest {
    pub fn parse(media_type: Option<&str>, payload: Bytes) -> Result<Self, Error> {
        // older clients send a bare json content type, treat that like no
        // content type at all and go by shape
        let media_type = match media_type {
            Some(mt) if !mt.is_empty() && !mt.starts_with("application/json") => mt.to_string(),
            _ => sniff_media_type(&payload)?,
        };
        match media_type.as_str() {
            OCI_IMAGE_MANIFEST_V1 | DOCKER_MANIFEST_V2 => {
                let manifest = ImageManifest::from_reader(Cursor::new(&payload))?;
                Ok(ParsedManifest {
                    digest: payload_digest(&payload),
                    media_type,
                    payload,
                    detail: ManifestDetail::Image(manifest),
                })
            }
            OCI_IMAGE_INDEX_V1 | DOCKER_MANIFEST_LIST_V2 => {
                let index = ImageIndex::from_reader(Cursor::new(&payload))?;
                Ok(ParsedManifest {
                    digest: payload_digest(&payload),
                    media_type,
                    payload,
                    detail: ManifestDetail::Index(index),
                })
            }
            DOCKER_MANIFEST_V1 | DOCKER_MANIFEST_V1_SIGNED => {
                let manifest: Schema1Manifest = serde_json::from_slice(&payload)?;
                if manifest.schema_version != 1 {
                    return Err(Error::BadSchemaVersion(manifest.schema_version));
                }
                let digest = schema1_digest(&payload, &manifest)?;
                Ok(ParsedManifest {
                    digest,
                    media_type,
                    payload,
                    detail: ManifestDetail::Schema1(manifest),
                })
            }
            other => Err(Error::BadMediaType(other.to_string())),
        }
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn detail(&self) -> &ManifestDetail {
        &self.detail
    }

    pub fn is_index(&self) -> bool {
        matches!(self.detail, ManifestDetail::Index(_))
    }

    pub fn is_schema1(&self) -> bool {
        matches!(self.detail, ManifestDetail::Schema1(_))
    }

    pub fn is_schema2(&self) -> bool {
        self.media_type == DOCKER_MANIFEST_V2
    }

    // the blobs that must exist in the repository before this manifest is
    // accepted. an index never contributes here: sub-manifests are allowed to
    // be sparse and are not descended into
    pub fn dependencies(&self) -> Vec<BlobDependency> {
        match &self.detail {
            ManifestDetail::Schema1(m) => m
                .fs_layers
                .iter()
                .filter_map(|l| parse_digest(&l.blob_sum).ok())
                .map(|digest| BlobDependency { digest, size: None })
                .collect(),
            ManifestDetail::Image(m) => {
                let mut deps = Vec::with_capacity(m.layers().len() + 1);
                deps.push(BlobDependency {
                    digest: m.config().digest().clone(),
                    size: Some(m.config().size()),
                });
                for layer in m.layers() {
                    deps.push(BlobDependency {
                        digest: layer.digest().clone(),
                        size: Some(layer.size()),
                    });
                }
                deps
            }
            ManifestDetail::Index(_) => Vec::new(),
        }
    }

    pub fn config_digest(&self) -> Option<Digest> {
        match &self.detail {
            ManifestDetail::Image(m) => Some(m.config().digest().clone()),
            _ => None,
        }
    }

    // structural checks beyond what parsing already enforced
    pub fn verify(&self) -> Result<(), Error> {
        match &self.detail {
            ManifestDetail::Schema1(m) => {
                if m.fs_layers.is_empty() {
                    return Err(Error::NoLayers);
                }
                if m.fs_layers.len() != m.history.len() {
                    return Err(Error::HistoryMismatch {
                        layers: m.fs_layers.len(),
                        history: m.history.len(),
                    });
                }
                for layer in &m.fs_layers {
                    parse_digest(&layer.blob_sum)
                        .map_err(|_| Error::BadDigest(layer.blob_sum.clone()))?;
                }
                Ok(())
            }
            // digests were validated by the oci_spec parse, nothing further
            ManifestDetail::Image(_) => Ok(()),
            ManifestDetail::Index(_) => Ok(()),
        }
    }
}

fn sniff_media_type(payload: &[u8]) -> Result<String, Error> {
    let shape: Shape = serde_json::from_slice(payload)?;
    if let Some(mt) = shape.media_type {
        return Ok(mt);
    }
    if shape.fs_layers.is_some() || shape.schema_version == Some(1) {
        return Ok(DOCKER_MANIFEST_V1_SIGNED.to_string());
    }
    if shape.manifests.is_some() {
        return Ok(OCI_IMAGE_INDEX_V1.to_string());
    }
    Err(Error::BadMediaType(String::new()))
}

// the digest of a signed schema 1 manifest addresses the jws payload, which
// is the original bytes with the signatures block spliced out: the protected
// header of any signature records where the splice happened (formatLength)
// and what the closing bytes were (formatTail)
fn schema1_digest(payload: &[u8], manifest: &Schema1Manifest) -> Result<Digest, Error> {
    let Some(protected) = manifest
        .signatures
        .iter()
        .find_map(|s| s.protected.as_deref())
    else {
        return Ok(payload_digest(payload));
    };
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let protected: Schema1Protected =
        serde_json::from_slice(&engine.decode(protected).map_err(|_| Error::BadSignature)?)?;
    if protected.format_length > payload.len() {
        return Err(Error::BadSignature);
    }
    let tail = engine
        .decode(&protected.format_tail)
        .map_err(|_| Error::BadSignature)?;
    let mut canonical = Vec::with_capacity(protected.format_length + tail.len());
    canonical.extend_from_slice(&payload[..protected.format_length]);
    canonical.extend_from_slice(&tail);
    Ok(payload_digest(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA2: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 7023,
            "digest": "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7"
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 32654,
                "digest": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f"
            }
        ]
    }"#;

    const OCI_INDEX: &str = r#"{
        "schemaVersion": 2,
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": 7143,
                "digest": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f",
                "platform": { "architecture": "amd64", "os": "linux" }
            }
        ]
    }"#;

    const SCHEMA1: &str = r#"{
        "schemaVersion": 1,
        "name": "ns/app",
        "tag": "latest",
        "architecture": "amd64",
        "fsLayers": [
            { "blobSum": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f" }
        ],
        "history": [
            { "v1Compatibility": "{}" }
        ]
    }"#;

    #[test]
    fn test_parse_schema2() {
        let m = ParsedManifest::parse(Some(DOCKER_MANIFEST_V2), Bytes::from(SCHEMA2)).unwrap();
        assert!(m.is_schema2());
        assert!(!m.is_index());
        let deps = m.dependencies();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].size, Some(7023));
        m.verify().unwrap();
    }

    #[test]
    fn test_parse_index_no_descent() {
        let m = ParsedManifest::parse(Some(OCI_IMAGE_INDEX_V1), Bytes::from(OCI_INDEX)).unwrap();
        assert!(m.is_index());
        assert!(m.dependencies().is_empty());
        m.verify().unwrap();
    }

    #[test]
    fn test_parse_schema1_unsigned() {
        let m = ParsedManifest::parse(Some(DOCKER_MANIFEST_V1), Bytes::from(SCHEMA1)).unwrap();
        assert!(m.is_schema1());
        assert_eq!(m.dependencies().len(), 1);
        assert_eq!(m.digest(), &payload_digest(SCHEMA1.as_bytes()));
        m.verify().unwrap();
    }

    #[test]
    fn test_schema1_history_mismatch() {
        let bad = serde_json::json!({
            "schemaVersion": 1,
            "name": "ns/app",
            "tag": "latest",
            "fsLayers": [
                { "blobSum": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f" }
            ],
            "history": []
        })
        .to_string();
        let m = ParsedManifest::parse(Some(DOCKER_MANIFEST_V1), Bytes::from(bad)).unwrap();
        assert!(matches!(m.verify(), Err(Error::HistoryMismatch { .. })));
    }

    #[test]
    fn test_sniff_without_content_type() {
        let m = ParsedManifest::parse(None, Bytes::from(OCI_INDEX)).unwrap();
        assert!(m.is_index());
        let m = ParsedManifest::parse(None, Bytes::from(SCHEMA1)).unwrap();
        assert!(m.is_schema1());
    }

    #[test]
    fn test_signed_schema1_digest_strips_jws() {
        // hand-build a signed manifest: body ends with "}" and the signature
        // block replaces it, recording formatLength and the original tail
        let body = SCHEMA1.trim_end();
        let format_length = body.len() - 1;
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let protected = engine.encode(
            serde_json::json!({
                "formatLength": format_length,
                "formatTail": engine.encode("}"),
            })
            .to_string(),
        );
        let signed = format!(
            "{},\"signatures\":[{{\"protected\":\"{}\",\"signature\":\"x\"}}]}}",
            &body[..format_length],
            protected
        );
        let m =
            ParsedManifest::parse(Some(DOCKER_MANIFEST_V1_SIGNED), Bytes::from(signed)).unwrap();
        // digest addresses the stripped payload, i.e. the original body
        assert_eq!(m.digest(), &payload_digest(body.as_bytes()));
    }
}
