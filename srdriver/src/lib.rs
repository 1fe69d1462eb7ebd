pub mod fs;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use oci_spec::image::{Descriptor, Digest};

pub use fs::FsDriver;
pub use memory::MemoryDriver;

// body of a blob read. the inner stream is chunked and not seekable, callers
// that need the length take it from the descriptor
pub type BlobStream = BoxStream<'static, std::io::Result<Bytes>>;

pub const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    // blob/manifest/upload is not in the store. callers map this to their
    // own unknown-class error, never to a 5xx
    NotFound,
    Errno(#[from] rustix::io::Errno),
    Io(#[from] std::io::Error),
    Digest(#[from] sroci::digest::Error),
    BadPath(String),
    Corrupt(String),
}

// how wrong is this?
impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[async_trait]
pub trait BlobStatter: Send + Sync {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, DriverError>;
}

#[async_trait]
pub trait BlobStore: BlobStatter {
    async fn get(&self, digest: &Digest) -> Result<Bytes, DriverError>;
    async fn open(&self, digest: &Digest) -> Result<(Descriptor, BlobStream), DriverError>;
    // content-addressed write, digest computed over data
    async fn put(&self, data: Bytes) -> Result<Descriptor, DriverError>;
    // returns freed bytes
    async fn delete(&self, digest: &Digest) -> Result<u64, DriverError>;
}

#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn create_upload(&self) -> Result<String, DriverError>;
    // returns the total size after the append
    async fn append_upload(&self, id: &str, chunk: Bytes) -> Result<u64, DriverError>;
    async fn commit_upload(&self, id: &str, expected: &Digest) -> Result<Descriptor, DriverError>;
    async fn cancel_upload(&self, id: &str) -> Result<(), DriverError>;
}

#[async_trait]
pub trait ManifestStore: Send + Sync {
    // returns (media type, payload)
    async fn get_manifest(&self, digest: &Digest) -> Result<(String, Bytes), DriverError>;
    async fn put_manifest(
        &self,
        digest: &Digest,
        media_type: &str,
        payload: Bytes,
    ) -> Result<(), DriverError>;
    async fn delete_manifest(&self, digest: &Digest) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Layer,
    Manifest,
}

// per-repository link files tying a global blob or manifest revision into a
// repository namespace. the pruner and the tenancy checks are built on these
#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn link(&self, repo: &str, kind: LinkKind, digest: &Digest) -> Result<(), DriverError>;
    async fn unlink(&self, repo: &str, kind: LinkKind, digest: &Digest)
    -> Result<(), DriverError>;
    async fn linked(&self, repo: &str, kind: LinkKind, digest: &Digest)
    -> Result<bool, DriverError>;
    async fn links(&self, repo: &str, kind: LinkKind) -> Result<Vec<Digest>, DriverError>;
}

// walk surface for the offline pruner, which is the only component allowed
// to enumerate the layout
#[async_trait]
pub trait Walker: Send + Sync {
    async fn all_blobs(&self) -> Result<Vec<(Digest, u64)>, DriverError>;
    async fn all_repositories(&self) -> Result<Vec<String>, DriverError>;
}

pub trait Driver: BlobStore + UploadStore + ManifestStore + LinkStore + Walker {}
impl<T: BlobStore + UploadStore + ManifestStore + LinkStore + Walker> Driver for T {}

// repo names come from the URL path, check them before they become file
// system paths. registry name grammar is enforced at the http layer, this is
// only the traversal guard
pub fn check_repo_path(repo: &str) -> Result<(), DriverError> {
    if repo.is_empty() {
        return Err(DriverError::BadPath(repo.to_string()));
    }
    for seg in repo.split('/') {
        if seg.is_empty() || seg == "." || seg == ".." || seg.starts_with('_') {
            return Err(DriverError::BadPath(repo.to_string()));
        }
    }
    Ok(())
}
