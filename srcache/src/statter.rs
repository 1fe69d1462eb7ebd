use std::sync::Arc;

use async_trait::async_trait;
use log::trace;
use oci_spec::image::{Descriptor, Digest};

use crate::digestcache::DigestCache;
use srdriver::{BlobStatter, DriverError};

// the Stat/SetDescriptor/Clear surface both descriptor service flavors
// implement. the global flavor lives here; the repository-scoped one needs
// the image stream view and is composed further up
#[async_trait]
pub trait BlobDescriptorService: Send + Sync {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, DriverError>;
    async fn set_descriptor(&self, digest: &Digest, descriptor: Descriptor);
    async fn clear(&self, digest: &Digest);
}

// cache-through to the storage driver's statter. misses hit the driver and
// the answer is recorded, NotFound is never cached
pub struct CachedBlobStatter<S: ?Sized> {
    cache: DigestCache,
    upstream: Arc<S>,
}

impl<S: BlobStatter + ?Sized> CachedBlobStatter<S> {
    pub fn new(cache: DigestCache, upstream: Arc<S>) -> Self {
        Self { cache, upstream }
    }
}

#[async_trait]
impl<S: BlobStatter + ?Sized> BlobDescriptorService for CachedBlobStatter<S> {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, DriverError> {
        if let Ok(record) = self.cache.get(digest) {
            if let Some(descriptor) = record.descriptor() {
                trace!("descriptor cache hit {}", digest);
                return Ok(descriptor);
            }
        }
        let descriptor = self.upstream.stat(digest).await?;
        self.cache.add(digest, Some(&descriptor), None);
        Ok(descriptor)
    }

    async fn set_descriptor(&self, digest: &Digest, descriptor: Descriptor) {
        self.cache.add(digest, Some(&descriptor), None);
    }

    async fn clear(&self, digest: &Digest) {
        self.cache.remove(digest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct CountingStatter {
        descriptor: Option<Descriptor>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl BlobStatter for CountingStatter {
        async fn stat(&self, _digest: &Digest) -> Result<Descriptor, DriverError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.descriptor.clone().ok_or(DriverError::NotFound)
        }
    }

    fn descriptor(digest: &Digest, size: u64) -> Descriptor {
        Descriptor::new("application/octet-stream".into(), size, digest.clone())
    }

    #[tokio::test]
    async fn test_stat_caches_upstream_answer() {
        let d = sroci::digest::payload_digest(b"abc");
        let upstream = Arc::new(CountingStatter {
            descriptor: Some(descriptor(&d, 3)),
            calls: AtomicU64::new(0),
        });
        let cache = DigestCache::new(100, 4, Duration::from_secs(60));
        let svc = CachedBlobStatter::new(cache, upstream.clone());

        assert_eq!(svc.stat(&d).await.unwrap().size(), 3);
        assert_eq!(svc.stat(&d).await.unwrap().size(), 3);
        assert_eq!(upstream.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_repo_scoped_entry_answers_global_stat() {
        // anything a repository legitimately sees must also exist globally:
        // a record added with a repo attribution satisfies the global flavor
        // without touching the driver
        let d = sroci::digest::payload_digest(b"abc");
        let upstream = Arc::new(CountingStatter {
            descriptor: None,
            calls: AtomicU64::new(0),
        });
        let cache = DigestCache::new(100, 4, Duration::from_secs(60));
        cache.add(&d, Some(&descriptor(&d, 3)), Some("ns/app"));
        let svc = CachedBlobStatter::new(cache, upstream.clone());
        assert_eq!(svc.stat(&d).await.unwrap().size(), 3);
        assert_eq!(upstream.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached() {
        let d = sroci::digest::payload_digest(b"abc");
        let upstream = Arc::new(CountingStatter {
            descriptor: None,
            calls: AtomicU64::new(0),
        });
        let cache = DigestCache::new(100, 4, Duration::from_secs(60));
        let svc = CachedBlobStatter::new(cache, upstream.clone());

        assert!(svc.stat(&d).await.is_err());
        assert!(svc.stat(&d).await.is_err());
        assert_eq!(upstream.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_clear_forces_upstream() {
        let d = sroci::digest::payload_digest(b"abc");
        let upstream = Arc::new(CountingStatter {
            descriptor: Some(descriptor(&d, 3)),
            calls: AtomicU64::new(0),
        });
        let cache = DigestCache::new(100, 4, Duration::from_secs(60));
        let svc = CachedBlobStatter::new(cache, upstream.clone());

        svc.stat(&d).await.unwrap();
        svc.clear(&d).await;
        svc.stat(&d).await.unwrap();
        assert_eq!(upstream.calls.load(Ordering::Relaxed), 2);
    }
}
