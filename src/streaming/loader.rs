//! Dataset loader state shared by every node of one octree

use std::fmt;
use std::sync::Arc;

use crate::octree::Version;

/// Maps a dataset-relative path to the URL actually fetched
pub type UrlTransform = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Format version, URL mapping and lifetime of one dataset's loader
#[derive(Clone)]
pub struct BinaryLoader {
    version: Version,
    disposed: bool,
    url_transform: Option<UrlTransform>,
}

impl BinaryLoader {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            disposed: false,
            url_transform: None,
        }
    }

    /// Prefix or otherwise rewrite every URL before it is fetched
    pub fn with_url_transform(mut self, transform: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.url_transform = Some(Arc::new(transform));
        self
    }

    pub fn set_url_transform(&mut self, transform: UrlTransform) {
        self.url_transform = Some(transform);
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Stop the loader. A disposed loader admits no further node loads.
    pub fn dispose(&mut self) {
        self.disposed = true;
    }

    /// URL to fetch for a dataset-relative path
    pub fn resolve_url(&self, path: &str) -> String {
        match &self.url_transform {
            Some(transform) => transform(path),
            None => path.to_string(),
        }
    }
}

impl fmt::Debug for BinaryLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryLoader")
            .field("version", &self.version)
            .field("disposed", &self.disposed)
            .field("url_transform", &self.url_transform.is_some())
            .finish()
    }
}
