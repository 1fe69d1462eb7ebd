use std::sync::Arc;

use bytes::Bytes;
use log::{info, warn};
use oci_spec::image::{Descriptor, Digest};

use crate::PullError;
use crate::getter::RemoteBlobGetter;
use srdriver::{BlobStatter, BlobStore, BlobStream, DriverError};
use srmeta::ImageStream;

// read-through layer over the local blob store. a digest that a previous
// probe located remotely is forwarded straight to that repository, anything
// else is probed via the getter. remote reads can optionally be mirrored
// into local storage, strictly best-effort: the client read never waits on
// or fails with the mirror write
pub struct PullthroughBlobStore {
    local: Arc<dyn BlobStore>,
    getter: Arc<RemoteBlobGetter>,
    mirror: bool,
}

impl PullthroughBlobStore {
    pub fn new(local: Arc<dyn BlobStore>, getter: Arc<RemoteBlobGetter>, mirror: bool) -> Self {
        Self {
            local,
            getter,
            mirror,
        }
    }

    pub async fn stat(
        &self,
        stream: &ImageStream,
        digest: &Digest,
    ) -> Result<Descriptor, PullError> {
        match self.local.stat(digest).await {
            Ok(descriptor) => return Ok(descriptor),
            Err(DriverError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(repo) = self.getter.memoized(digest).await {
            if let Some(descriptor) = repo.stat_blob(digest).await? {
                return Ok(descriptor);
            }
        }
        self.getter.stat(stream, digest).await
    }

    // open for serving. remote bodies are plain chunk streams, some
    // upstreams answer 200 or 203 to range requests so nothing here relies
    // on seeking; the content length comes from the descriptor
    pub async fn serve(
        &self,
        stream: &ImageStream,
        digest: &Digest,
    ) -> Result<(Descriptor, BlobStream), PullError> {
        match self.local.open(digest).await {
            Ok(found) => return Ok(found),
            Err(DriverError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let repo = match self.getter.memoized(digest).await {
            Some(repo) => repo,
            None => {
                // locates and memoizes the serving repository
                self.getter.stat(stream, digest).await?;
                self.getter
                    .memoized(digest)
                    .await
                    .ok_or(PullError::BlobUnknown)?
            }
        };

        let descriptor = repo
            .stat_blob(digest)
            .await?
            .ok_or(PullError::BlobUnknown)?;
        let (_, body) = repo
            .open_blob(digest)
            .await?
            .ok_or(PullError::BlobUnknown)?;

        if self.mirror {
            self.spawn_mirror(repo, descriptor.clone());
        }

        Ok((descriptor, body))
    }

    pub async fn get(&self, stream: &ImageStream, digest: &Digest) -> Result<Bytes, PullError> {
        match self.local.get(digest).await {
            Ok(data) => return Ok(data),
            Err(DriverError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        let descriptor = self.stat(stream, digest).await?;
        let repo = self
            .getter
            .memoized(digest)
            .await
            .ok_or(PullError::BlobUnknown)?;
        let data = repo
            .get_blob(&descriptor)
            .await?
            .ok_or(PullError::BlobUnknown)?;
        if self.mirror {
            let local = self.local.clone();
            let data = data.clone();
            let digest = digest.clone();
            tokio::spawn(async move {
                match local.put(data).await {
                    Ok(_) => info!("mirrored blob {}", digest),
                    Err(e) => warn!("mirroring blob {} failed: {:?}", digest, e),
                }
            });
        }
        Ok(data)
    }

    // a second fetch in the background that lands the blob in local storage.
    // serving streams the remote body to the client, it cannot also be
    // consumed for the write, and a mirror failure must never fail the read
    fn spawn_mirror(&self, repo: Arc<crate::client::RemoteRepository>, descriptor: Descriptor) {
        let local = self.local.clone();
        tokio::spawn(async move {
            let digest = descriptor.digest().clone();
            match repo.get_blob(&descriptor).await {
                Ok(Some(data)) => match local.put(data).await {
                    Ok(_) => info!("mirrored blob {}", digest),
                    Err(e) => warn!("mirroring blob {} failed: {:?}", digest, e),
                },
                Ok(None) => warn!("blob {} vanished from remote during mirror", digest),
                Err(e) => warn!("mirror fetch of {} failed: {:?}", digest, e),
            }
        });
    }
}
