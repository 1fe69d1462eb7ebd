pub mod blob;
pub mod client;
pub mod getter;
pub mod manifest;
pub mod mirror;

pub use blob::PullthroughBlobStore;
pub use client::{RemoteClient, RemoteRepository};
pub use getter::RemoteBlobGetter;
pub use manifest::PullthroughManifestService;
pub use mirror::{MirrorResolver, PullKind};

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    BlobUnknown,
    ManifestUnknown,
    // remote said 429, surfaced to the client as too many requests
    TooManyRequests,
    // every pullthrough candidate failed, wrapping the first failure
    PullthroughManifest(Box<PullError>),
    ConflictingMirrorPolicies,
    Client(#[from] client::ClientError),
    Meta(#[from] srmeta::MetaError),
    Driver(#[from] srdriver::DriverError),
}

// how wrong is this?
impl std::fmt::Display for PullError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
