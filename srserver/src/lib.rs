pub mod auth;
pub mod blob;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod limiter;
pub mod manifest;
pub mod metrics;
pub mod pruner;
pub mod repository;
pub mod routes;
pub mod signatures;
pub mod tags;

pub use config::Config;
pub use errors::{Code, DistError};
pub use repository::{App, Repository};
pub use routes::router;
