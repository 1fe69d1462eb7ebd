use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::trace;
use moka::sync::Cache;
use oci_spec::image::{Descriptor, Digest};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    BlobUnknown,
}

// how wrong is this?
impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// repository membership per record is itself a tiny lru: the set is bounded
// and the oldest name falls out when a new one arrives at capacity
struct RepoLru {
    capacity: usize,
    names: Vec<String>,
}

impl RepoLru {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            names: Vec::new(),
        }
    }

    fn touch(&mut self, repo: &str) {
        if let Some(pos) = self.names.iter().position(|n| n == repo) {
            let name = self.names.remove(pos);
            self.names.push(name);
        } else {
            if self.names.len() >= self.capacity {
                self.names.remove(0);
            }
            self.names.push(repo.to_string());
        }
    }

    fn contains(&mut self, repo: &str) -> bool {
        if let Some(pos) = self.names.iter().position(|n| n == repo) {
            let name = self.names.remove(pos);
            self.names.push(name);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, repo: &str) {
        self.names.retain(|n| n != repo);
    }
}

// one record shared between every digest key that names the same bytes. the
// alias list remembers the extra keys so remove can take them all out
pub struct BlobRecord {
    descriptor: RwLock<Option<Descriptor>>,
    repositories: Mutex<RepoLru>,
    aliases: Mutex<Vec<String>>,
}

impl BlobRecord {
    fn new(repo_capacity: usize) -> Self {
        Self {
            descriptor: RwLock::new(None),
            repositories: Mutex::new(RepoLru::new(repo_capacity)),
            aliases: Mutex::new(Vec::new()),
        }
    }

    pub fn descriptor(&self) -> Option<Descriptor> {
        self.descriptor.read().unwrap().clone()
    }

    pub fn contains_repository(&self, repo: &str) -> bool {
        self.repositories.lock().unwrap().contains(repo)
    }

    pub fn repositories(&self) -> Vec<String> {
        self.repositories.lock().unwrap().names.clone()
    }
}

// digest -> {descriptor?, repository set} with a ttl fixed at first
// creation. later adds extend the record in place and never re-insert the
// moka entry, so the expiry clock keeps running from the first sighting.
// that bounds how long a blob can stay falsely attributed to a repository
// after the underlying stream lost the tag
#[derive(Clone)]
pub struct DigestCache {
    inner: Option<Cache<String, Arc<BlobRecord>>>,
    repo_capacity: usize,
}

impl DigestCache {
    pub fn new(capacity: u64, repo_capacity: usize, ttl: Duration) -> Self {
        if ttl.is_zero() {
            return Self::disabled();
        }
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self {
            inner: Some(inner),
            repo_capacity,
        }
    }

    pub fn disabled() -> Self {
        Self {
            inner: None,
            repo_capacity: 0,
        }
    }

    pub fn get(&self, digest: &Digest) -> Result<Arc<BlobRecord>, CacheError> {
        let inner = self.inner.as_ref().ok_or(CacheError::BlobUnknown)?;
        inner.get(&digest.to_string()).ok_or(CacheError::BlobUnknown)
    }

    // both fields optional but at least one non-empty, otherwise a no-op.
    // silently succeeds when the cache is disabled
    pub fn add(&self, digest: &Digest, descriptor: Option<&Descriptor>, repo: Option<&str>) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        if descriptor.is_none() && repo.is_none() {
            return;
        }
        let key = digest.to_string();
        let record = inner
            .entry(key.clone())
            .or_insert_with(|| Arc::new(BlobRecord::new(self.repo_capacity)))
            .into_value();
        if let Some(desc) = descriptor {
            *record.descriptor.write().unwrap() = Some(desc.clone());
            let desc_key = desc.digest().to_string();
            if desc_key != key {
                // cross-algorithm insertion: index the same record under the
                // descriptor's own digest so a lookup by either succeeds
                trace!("digest cache alias {} -> {}", desc_key, key);
                record.aliases.lock().unwrap().push(desc_key.clone());
                inner.insert(desc_key, record.clone());
            }
        }
        if let Some(repo) = repo {
            record.repositories.lock().unwrap().touch(repo);
        }
    }

    pub fn remove(&self, digest: &Digest) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let key = digest.to_string();
        if let Some(record) = inner.get(&key) {
            for alias in record.aliases.lock().unwrap().drain(..) {
                inner.invalidate(&alias);
            }
        }
        inner.invalidate(&key);
    }

    pub fn remove_repository(&self, digest: &Digest, repo: &str) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        if let Some(record) = inner.get(&digest.to_string()) {
            record.repositories.lock().unwrap().remove(repo);
        }
    }

    pub fn purge(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.invalidate_all();
        }
    }

    pub fn contains_repository(&self, digest: &Digest, repo: &str) -> bool {
        self.get(digest)
            .map(|r| r.contains_repository(repo))
            .unwrap_or(false)
    }

    pub fn repositories(&self, digest: &Digest) -> Vec<String> {
        self.get(digest).map(|r| r.repositories()).unwrap_or_default()
    }
}
