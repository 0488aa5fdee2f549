//! Injected fetch capability
//!
//! The octree never talks to a transport directly. It asks a [`Fetch`]
//! implementation for the bytes behind a URL; HTTP clients, caches and test
//! doubles all plug in here.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::{Error, Result};

/// What a request is for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FetchKind {
    Metadata,
    Hierarchy,
    Points,
}

/// Cross-origin mode requested for a fetch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RequestMode {
    #[default]
    Cors,
    SameOrigin,
    NoCors,
}

/// Per-request options passed to [`Fetch::fetch`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchOptions {
    pub kind: FetchKind,
    pub mode: RequestMode,
}

impl FetchOptions {
    pub fn metadata() -> Self {
        Self { kind: FetchKind::Metadata, mode: RequestMode::Cors }
    }

    pub fn hierarchy() -> Self {
        Self { kind: FetchKind::Hierarchy, mode: RequestMode::Cors }
    }

    pub fn points() -> Self {
        Self { kind: FetchKind::Points, mode: RequestMode::Cors }
    }
}

/// Source of the full response body behind a URL
pub trait Fetch: Send + Sync {
    fn fetch(&self, url: &str, options: &FetchOptions) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

impl<F: Fetch> Fetch for Arc<F> {
    fn fetch(&self, url: &str, options: &FetchOptions) -> impl Future<Output = Result<Vec<u8>>> + Send {
        (**self).fetch(url, options)
    }
}

/// Fetches URLs as paths below a local directory
#[derive(Clone, Debug)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path for a URL; leading slashes are ignored
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.root.join(url.trim_start_matches('/'))
    }
}

impl Fetch for FileFetcher {
    fn fetch(&self, url: &str, _options: &FetchOptions) -> impl Future<Output = Result<Vec<u8>>> + Send {
        let path = self.path_for(url);
        let url = url.to_string();
        async move {
            tokio::fs::read(&path).await.map_err(|e| Error::Fetch {
                url,
                reason: e.to_string(),
            })
        }
    }
}
