//! Fetching, admission control and dataset bootstrap

pub mod budget;
pub mod config;
pub mod fetch;
pub mod loader;
pub mod metadata;

pub use budget::LoadBudget;
pub use config::StreamingConfig;
pub use fetch::{Fetch, FetchKind, FetchOptions, FileFetcher, RequestMode};
pub use loader::{BinaryLoader, UrlTransform};
pub use metadata::{base_dir_of, BoxExtent, CloudMetadata};
