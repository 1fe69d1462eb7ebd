use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::{info, trace, warn};
use oci_spec::{
    distribution::Reference,
    image::{Descriptor, Digest},
};
use tokio::sync::RwLock;

use crate::client::{RemoteClient, RemoteRepository};
use crate::mirror::{MirrorResolver, PullKind, repo_string};
use crate::PullError;
use srcache::DigestCache;
use srcreds::{BasicCredentials, parse_registry_url};
use srmeta::ImageStream;

// a remote repository a stream event points at, with the insecure transport
// decision already made
#[derive(Clone)]
pub struct Candidate {
    pub reference: Reference,
    pub insecure: bool,
}

// finds a remote location for a digest referenced by a stream. probes the
// previously seen repositories first, then the top item of every tag, then
// the rest of the history. successful probes are memoized per request so the
// read path never searches twice, and the digest -> repository association
// goes into the shared cache for the next request
pub struct RemoteBlobGetter {
    client: RemoteClient,
    cache: DigestCache,
    creds: Arc<dyn BasicCredentials>,
    resolver: Arc<MirrorResolver>,
    // the advertised address of this registry, pullthrough refuses to
    // recurse into itself
    local_registry: String,
    // one insecure tag marks every repository on that registry insecure.
    // intentionally broad, kept behind a flag
    insecure_covers_registry: bool,
    memo: Arc<RwLock<HashMap<String, Arc<RemoteRepository>>>>,
}

impl RemoteBlobGetter {
    pub fn new(
        client: RemoteClient,
        cache: DigestCache,
        creds: Arc<dyn BasicCredentials>,
        resolver: Arc<MirrorResolver>,
        local_registry: String,
        insecure_covers_registry: bool,
    ) -> Self {
        Self {
            client,
            cache,
            creds,
            resolver,
            local_registry,
            insecure_covers_registry,
            memo: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // the remote repository a previous probe in this request found the
    // digest in
    pub async fn memoized(&self, digest: &Digest) -> Option<Arc<RemoteRepository>> {
        self.memo.read().await.get(&digest.to_string()).cloned()
    }

    pub async fn stat(
        &self,
        stream: &ImageStream,
        digest: &Digest,
    ) -> Result<Descriptor, PullError> {
        if let Some(repo) = self.memoized(digest).await {
            if let Some(descriptor) = repo.stat_blob(digest).await? {
                return Ok(descriptor);
            }
        }

        let (primary, secondary) = candidate_repositories(stream, self.insecure_covers_registry);
        let cached = self.cache.repositories(digest);

        // previously cached repos first (fast path), then primary, then
        // secondary
        let mut ordered: Vec<Candidate> = Vec::new();
        let mut push = |c: &Candidate| {
            if !ordered
                .iter()
                .any(|o| repo_string(&o.reference) == repo_string(&c.reference))
            {
                ordered.push(c.clone());
            }
        };
        for c in primary.iter().chain(secondary.iter()) {
            if cached.contains(&repo_string(&c.reference)) {
                push(c);
            }
        }
        for c in primary.iter() {
            push(c);
        }
        for c in secondary.iter() {
            push(c);
        }

        let mut ratelimited = false;
        for candidate in ordered {
            match self.probe(&candidate, digest).await {
                Ok(Some(descriptor)) => {
                    self.cache
                        .add(digest, None, Some(&repo_string(&candidate.reference)));
                    return Ok(descriptor);
                }
                Ok(None) => {}
                Err(PullError::TooManyRequests) => {
                    ratelimited = true;
                }
                Err(e) => {
                    warn!(
                        "remote stat of {} in {} failed: {:?}",
                        digest,
                        repo_string(&candidate.reference),
                        e
                    );
                }
            }
        }
        if ratelimited {
            Err(PullError::TooManyRequests)
        } else {
            Err(PullError::BlobUnknown)
        }
    }

    // try one candidate through its mirror set. on success the winning
    // remote repository is memoized under the digest
    async fn probe(
        &self,
        candidate: &Candidate,
        digest: &Digest,
    ) -> Result<Option<Descriptor>, PullError> {
        for source in self.resolver.resolve(&candidate.reference, PullKind::Digest)? {
            if source.resolve_registry() == self.local_registry {
                trace!("skipping pullthrough into ourselves for {}", digest);
                continue;
            }
            let repo = Arc::new(self.repository(&source, candidate.insecure));
            match repo.stat_blob(digest).await {
                Ok(Some(descriptor)) => {
                    info!(
                        "found {} in remote repository {}",
                        digest,
                        repo_string(&source)
                    );
                    self.memo
                        .write()
                        .await
                        .insert(digest.to_string(), repo.clone());
                    return Ok(Some(descriptor));
                }
                Ok(None) => {}
                Err(crate::client::ClientError::TooManyRequests) => {
                    return Err(PullError::TooManyRequests);
                }
                Err(e) => {
                    warn!("stat against {} failed: {:?}", repo_string(&source), e);
                }
            }
        }
        Ok(None)
    }

    pub fn repository(&self, reference: &Reference, insecure: bool) -> RemoteRepository {
        let credentials = parse_registry_url(reference.resolve_registry())
            .and_then(|url| self.creds.basic(&url));
        self.client
            .repository(reference.clone(), credentials, insecure)
    }

    pub fn local_registry(&self) -> &str {
        &self.local_registry
    }

    pub fn resolver(&self) -> &MirrorResolver {
        &self.resolver
    }
}

// candidate repositories from the stream's tag events. primary is the top
// item of every tag, secondary everything older. insecure transport is per
// tag import policy, optionally widened to every repository on a registry
// that any insecure tag touches
pub fn candidate_repositories(
    stream: &ImageStream,
    insecure_covers_registry: bool,
) -> (Vec<Candidate>, Vec<Candidate>) {
    let stream_insecure = stream.insecure_by_annotation();

    let mut insecure_registries: BTreeSet<String> = BTreeSet::new();
    if insecure_covers_registry {
        for list in &stream.status.tags {
            if stream.tag_insecure(&list.tag) {
                for event in &list.items {
                    if let Ok(r) = event.docker_image_reference.parse::<Reference>() {
                        insecure_registries.insert(r.resolve_registry().to_string());
                    }
                }
            }
        }
    }

    let mut primary = Vec::new();
    let mut secondary = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for list in &stream.status.tags {
        let tag_insecure = stream.tag_insecure(&list.tag);
        for (i, event) in list.items.iter().enumerate() {
            let Ok(reference) = event.docker_image_reference.parse::<Reference>() else {
                continue;
            };
            let key = repo_string(&reference);
            if !seen.insert(key) {
                continue;
            }
            let insecure = stream_insecure
                || tag_insecure
                || insecure_registries.contains(reference.resolve_registry());
            let candidate = Candidate {
                reference,
                insecure,
            };
            if i == 0 {
                primary.push(candidate);
            } else {
                secondary.push(candidate);
            }
        }
    }
    (primary, secondary)
}
