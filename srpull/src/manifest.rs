use std::sync::Arc;

use bytes::Bytes;
use log::{info, trace, warn};
use oci_spec::image::Digest;

use crate::PullError;
use crate::client::ClientError;
use crate::getter::{RemoteBlobGetter, candidate_repositories};
use crate::mirror::{PullKind, repo_string};
use srdriver::{DriverError, ManifestStore};
use srmeta::ImageStream;

// read-through for manifests: local unknown-revision turns into a walk over
// the stream's remote repositories with per-reference credentials. a fetched
// manifest is written back into the local store when mirroring is on, but
// only best-effort
pub struct PullthroughManifestService {
    local: Arc<dyn ManifestStore>,
    getter: Arc<RemoteBlobGetter>,
    mirror: bool,
    insecure_covers_registry: bool,
}

impl PullthroughManifestService {
    pub fn new(
        local: Arc<dyn ManifestStore>,
        getter: Arc<RemoteBlobGetter>,
        mirror: bool,
        insecure_covers_registry: bool,
    ) -> Self {
        Self {
            local,
            getter,
            mirror,
            insecure_covers_registry,
        }
    }

    pub async fn get(
        &self,
        stream: &ImageStream,
        digest: &Digest,
    ) -> Result<(String, Bytes), PullError> {
        match self.local.get_manifest(digest).await {
            Ok(found) => return Ok(found),
            Err(DriverError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let (primary, secondary) = candidate_repositories(stream, self.insecure_covers_registry);
        let mut first_err: Option<PullError> = None;
        let mut ratelimited = false;

        for candidate in primary.iter().chain(secondary.iter()) {
            let sources = match self
                .getter
                .resolver()
                .resolve(&candidate.reference, PullKind::Digest)
            {
                Ok(sources) => sources,
                Err(e) => return Err(e),
            };
            for source in sources {
                if source.resolve_registry() == self.getter.local_registry() {
                    trace!("skipping manifest pullthrough into ourselves for {}", digest);
                    continue;
                }
                let repo = self.getter.repository(&source, candidate.insecure);
                match repo.get_manifest(&digest.to_string()).await {
                    Ok(Some((media_type, got_digest, payload))) => {
                        if &got_digest != digest {
                            warn!(
                                "remote {} answered manifest {} for {}",
                                repo_string(&source),
                                got_digest,
                                digest
                            );
                            continue;
                        }
                        if self.mirror {
                            match self
                                .local
                                .put_manifest(digest, &media_type, payload.clone())
                                .await
                            {
                                Ok(()) => info!("mirrored manifest {}", digest),
                                Err(e) => {
                                    warn!("mirroring manifest {} failed: {:?}", digest, e)
                                }
                            }
                        }
                        return Ok((media_type, payload));
                    }
                    Ok(None) => {}
                    Err(ClientError::TooManyRequests) => {
                        ratelimited = true;
                    }
                    Err(e) => {
                        warn!(
                            "manifest pullthrough from {} failed: {:?}",
                            repo_string(&source),
                            e
                        );
                        if first_err.is_none() {
                            first_err = Some(e.into());
                        }
                    }
                }
            }
        }

        if ratelimited {
            Err(PullError::TooManyRequests)
        } else if let Some(e) = first_err {
            Err(PullError::PullthroughManifest(Box::new(e)))
        } else {
            Err(PullError::ManifestUnknown)
        }
    }
}
