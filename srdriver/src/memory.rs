use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use oci_spec::image::{Descriptor, Digest};

use crate::{
    BlobStatter, BlobStore, BlobStream, DriverError, LinkKind, LinkStore, ManifestStore,
    OCTET_STREAM, UploadStore, Walker, check_repo_path,
};
use sroci::digest::{parse_digest, payload_digest, verify_payload};

// storage driver backed by maps, for tests and as the reference for what the
// filesystem driver has to do. lock sections are short, nothing is held
// across await

#[derive(Default)]
struct Inner {
    blobs: BTreeMap<String, Bytes>,
    manifests: BTreeMap<String, (String, Bytes)>,
    uploads: BTreeMap<String, BytesMut>,
    // key is "<repo>\n<kind>"
    links: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Default)]
pub struct MemoryDriver {
    inner: RwLock<Inner>,
}

fn link_key(repo: &str, kind: LinkKind) -> String {
    match kind {
        LinkKind::Layer => format!("{}\nlayers", repo),
        LinkKind::Manifest => format!("{}\nmanifests", repo),
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStatter for MemoryDriver {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, DriverError> {
        let inner = self.inner.read().unwrap();
        let data = inner
            .blobs
            .get(&digest.to_string())
            .ok_or(DriverError::NotFound)?;
        Ok(Descriptor::new(
            OCTET_STREAM.into(),
            data.len() as u64,
            digest.clone(),
        ))
    }
}

#[async_trait]
impl BlobStore for MemoryDriver {
    async fn get(&self, digest: &Digest) -> Result<Bytes, DriverError> {
        let inner = self.inner.read().unwrap();
        inner
            .blobs
            .get(&digest.to_string())
            .cloned()
            .ok_or(DriverError::NotFound)
    }

    async fn open(&self, digest: &Digest) -> Result<(Descriptor, BlobStream), DriverError> {
        let data = self.get(digest).await?;
        let descriptor = Descriptor::new(OCTET_STREAM.into(), data.len() as u64, digest.clone());
        let stream = futures::stream::once(async move { Ok::<_, std::io::Error>(data) }).boxed();
        Ok((descriptor, stream))
    }

    async fn put(&self, data: Bytes) -> Result<Descriptor, DriverError> {
        let digest = payload_digest(&data);
        let descriptor = Descriptor::new(OCTET_STREAM.into(), data.len() as u64, digest.clone());
        self.inner
            .write()
            .unwrap()
            .blobs
            .insert(digest.to_string(), data);
        Ok(descriptor)
    }

    async fn delete(&self, digest: &Digest) -> Result<u64, DriverError> {
        let mut inner = self.inner.write().unwrap();
        match inner.blobs.remove(&digest.to_string()) {
            Some(data) => Ok(data.len() as u64),
            None => Err(DriverError::NotFound),
        }
    }
}

#[async_trait]
impl UploadStore for MemoryDriver {
    async fn create_upload(&self) -> Result<String, DriverError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.inner
            .write()
            .unwrap()
            .uploads
            .insert(id.clone(), BytesMut::new());
        Ok(id)
    }

    async fn append_upload(&self, id: &str, chunk: Bytes) -> Result<u64, DriverError> {
        let mut inner = self.inner.write().unwrap();
        let buf = inner.uploads.get_mut(id).ok_or(DriverError::NotFound)?;
        buf.extend_from_slice(&chunk);
        Ok(buf.len() as u64)
    }

    async fn commit_upload(&self, id: &str, expected: &Digest) -> Result<Descriptor, DriverError> {
        let mut inner = self.inner.write().unwrap();
        let buf = inner.uploads.remove(id).ok_or(DriverError::NotFound)?;
        let data = buf.freeze();
        verify_payload(expected, &data)?;
        let descriptor = Descriptor::new(OCTET_STREAM.into(), data.len() as u64, expected.clone());
        inner.blobs.insert(expected.to_string(), data);
        Ok(descriptor)
    }

    async fn cancel_upload(&self, id: &str) -> Result<(), DriverError> {
        self.inner
            .write()
            .unwrap()
            .uploads
            .remove(id)
            .map(|_| ())
            .ok_or(DriverError::NotFound)
    }
}

#[async_trait]
impl ManifestStore for MemoryDriver {
    async fn get_manifest(&self, digest: &Digest) -> Result<(String, Bytes), DriverError> {
        let inner = self.inner.read().unwrap();
        inner
            .manifests
            .get(&digest.to_string())
            .cloned()
            .ok_or(DriverError::NotFound)
    }

    async fn put_manifest(
        &self,
        digest: &Digest,
        media_type: &str,
        payload: Bytes,
    ) -> Result<(), DriverError> {
        self.inner
            .write()
            .unwrap()
            .manifests
            .insert(digest.to_string(), (media_type.to_string(), payload));
        Ok(())
    }

    async fn delete_manifest(&self, digest: &Digest) -> Result<(), DriverError> {
        self.inner
            .write()
            .unwrap()
            .manifests
            .remove(&digest.to_string())
            .map(|_| ())
            .ok_or(DriverError::NotFound)
    }
}

#[async_trait]
impl LinkStore for MemoryDriver {
    async fn link(&self, repo: &str, kind: LinkKind, digest: &Digest) -> Result<(), DriverError> {
        check_repo_path(repo)?;
        self.inner
            .write()
            .unwrap()
            .links
            .entry(link_key(repo, kind))
            .or_default()
            .insert(digest.to_string());
        Ok(())
    }

    async fn unlink(
        &self,
        repo: &str,
        kind: LinkKind,
        digest: &Digest,
    ) -> Result<(), DriverError> {
        check_repo_path(repo)?;
        let mut inner = self.inner.write().unwrap();
        let removed = inner
            .links
            .get_mut(&link_key(repo, kind))
            .map(|set| set.remove(&digest.to_string()))
            .unwrap_or(false);
        if removed { Ok(()) } else { Err(DriverError::NotFound) }
    }

    async fn linked(
        &self,
        repo: &str,
        kind: LinkKind,
        digest: &Digest,
    ) -> Result<bool, DriverError> {
        check_repo_path(repo)?;
        let inner = self.inner.read().unwrap();
        Ok(inner
            .links
            .get(&link_key(repo, kind))
            .map(|set| set.contains(&digest.to_string()))
            .unwrap_or(false))
    }

    async fn links(&self, repo: &str, kind: LinkKind) -> Result<Vec<Digest>, DriverError> {
        check_repo_path(repo)?;
        let inner = self.inner.read().unwrap();
        Ok(inner
            .links
            .get(&link_key(repo, kind))
            .map(|set| set.iter().filter_map(|s| parse_digest(s).ok()).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Walker for MemoryDriver {
    async fn all_blobs(&self) -> Result<Vec<(Digest, u64)>, DriverError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .blobs
            .iter()
            .filter_map(|(k, v)| parse_digest(k).ok().map(|d| (d, v.len() as u64)))
            .collect())
    }

    async fn all_repositories(&self) -> Result<Vec<String>, DriverError> {
        let inner = self.inner.read().unwrap();
        let mut repos: Vec<String> = inner
            .links
            .keys()
            .filter_map(|k| k.split_once('\n').map(|(repo, _)| repo.to_string()))
            .collect();
        repos.sort();
        repos.dedup();
        Ok(repos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_upload_roundtrip() {
        let driver = MemoryDriver::new();
        let id = driver.create_upload().await.unwrap();
        driver
            .append_upload(&id, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        let digest = payload_digest(b"abc");
        let desc = driver.commit_upload(&id, &digest).await.unwrap();
        assert_eq!(desc.size(), 3);
        assert_eq!(driver.get(&digest).await.unwrap().as_ref(), b"abc");
        // upload is gone after commit
        assert!(matches!(
            driver.cancel_upload(&id).await,
            Err(DriverError::NotFound)
        ));
    }
}
