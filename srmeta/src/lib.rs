pub mod client;
pub mod fake;
pub mod types;

pub use client::{AccessReview, MetaError, MetadataClient};
pub use fake::FakeMetadataClient;
pub use types::*;
