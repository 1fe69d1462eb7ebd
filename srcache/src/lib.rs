pub mod digestcache;
pub mod statter;

pub use digestcache::{BlobRecord, CacheError, DigestCache};
pub use statter::{BlobDescriptorService, CachedBlobStatter};
