//! Octree geometry: the node tree plus the load governor.
//!
//! Node loads are async tasks that may run concurrently up to the in-flight
//! budget. All shared bookkeeping (tree, budget, `needs_update`, `disposed`)
//! sits behind one mutex that is only taken between suspension points, never
//! across an `.await`.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::types::DVec3;
use crate::core::{Error, Result};
use crate::math::Aabb;
use crate::streaming::{
    base_dir_of, BinaryLoader, CloudMetadata, Fetch, FetchOptions, LoadBudget, StreamingConfig,
    UrlTransform,
};

use super::hierarchy::{decode_hierarchy, HierarchyChunk};
use super::node::{GeometryNode, LoadState, LoadStateKind, NodeId, PointPayload, Released};
use super::tree::OctreeTree;
use super::url;
use super::version::Version;

/// Dataset-wide layout of one octree
#[derive(Clone, Debug, PartialEq)]
pub struct GeometrySettings {
    /// Base path of the octree files
    pub octree_dir: String,
    /// Point spacing at the root level
    pub spacing: f64,
    /// Name digits covered by one hierarchy chunk
    pub hierarchy_step_size: u32,
    /// Root bounds, translated so the dataset starts at the origin
    pub bounding_box: Aabb,
    pub tight_bounding_box: Aabb,
    /// Translation removed from the dataset coordinates
    pub offset: DVec3,
}

/// How a call to [`OctreeGeometry::load`] ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The node now owns its payload
    Loaded,
    /// Admission control turned the request down; nothing happened
    Declined,
}

/// URLs a single admitted load will fetch
struct LoadPlan {
    name: String,
    hierarchy_url: Option<String>,
    point_url: String,
}

struct GeometryState {
    tree: OctreeTree,
    loader: BinaryLoader,
    budget: LoadBudget,
    settings: GeometrySettings,
    disposed: bool,
    needs_update: bool,
}

impl GeometryState {
    fn node(&self, id: NodeId) -> Result<&GeometryNode> {
        self.tree.get(id).ok_or(Error::UnknownNode(id))
    }

    fn can_load(&self, node: &GeometryNode) -> bool {
        matches!(node.state(), LoadState::Unloaded | LoadState::Failed)
            && !self.disposed
            && !self.loader.is_disposed()
            && self.budget.has_capacity()
    }

    /// Whether loading `node` starts with its hierarchy chunk
    fn wants_hierarchy(&self, node: &GeometryNode) -> bool {
        self.loader.version().hierarchy_on_demand()
            && node.level() % self.settings.hierarchy_step_size == 0
            && node.has_children()
    }

    fn point_url(&self, node: &GeometryNode) -> String {
        let path = url::point_url(
            &self.settings.octree_dir,
            self.loader.version(),
            node.name(),
            self.settings.hierarchy_step_size,
        );
        self.loader.resolve_url(&path)
    }

    fn hierarchy_url(&self, node: &GeometryNode) -> String {
        let path = url::hierarchy_url(
            &self.settings.octree_dir,
            node.name(),
            self.settings.hierarchy_step_size,
        );
        self.loader.resolve_url(&path)
    }

    fn plan(&self, node: &GeometryNode) -> LoadPlan {
        LoadPlan {
            name: node.name().to_string(),
            hierarchy_url: self.wants_hierarchy(node).then(|| self.hierarchy_url(node)),
            point_url: self.point_url(node),
        }
    }
}

/// Streamed point cloud octree
///
/// Owns the root node and every node materialized below it, and governs
/// node loads: at most `max_nodes_loading` loads are in flight, nothing
/// loads once the geometry is disposed, and every load-state change raises
/// the `needs_update` flag the LOD driver polls each frame.
pub struct OctreeGeometry<F> {
    state: Mutex<GeometryState>,
    fetcher: F,
}

impl<F: Fetch> OctreeGeometry<F> {
    pub fn new(
        fetcher: F,
        loader: BinaryLoader,
        settings: GeometrySettings,
        config: &StreamingConfig,
    ) -> Result<Self> {
        config.validate()?;
        if settings.hierarchy_step_size == 0 {
            return Err(Error::Config("hierarchy_step_size must be at least 1".into()));
        }

        let state = GeometryState {
            tree: OctreeTree::new(settings.bounding_box, settings.spacing),
            loader,
            budget: LoadBudget::new(config.max_nodes_loading, config.memory_budget_mb),
            settings,
            disposed: false,
            needs_update: true,
        };

        Ok(Self {
            state: Mutex::new(state),
            fetcher,
        })
    }

    /// Build the geometry described by parsed metadata
    ///
    /// `base_dir` is the directory the metadata file was read from. Datasets
    /// that list their whole hierarchy in the metadata get every node
    /// materialized up front.
    pub fn from_metadata(
        fetcher: F,
        metadata: &CloudMetadata,
        base_dir: &str,
        config: &StreamingConfig,
    ) -> Result<Self> {
        let version = metadata.parsed_version()?;
        let settings = metadata.settings(base_dir, config)?;
        let geometry = Self::new(fetcher, BinaryLoader::new(version), settings, config)?;

        {
            let mut guard = geometry.lock();
            let tree = &mut guard.tree;
            if version.flat_hierarchy_in_metadata() && !metadata.hierarchy.is_empty() {
                tree.apply_flat_hierarchy(&metadata.hierarchy)?;
            } else if let Some(num_points) = metadata.root_num_points() {
                let root = tree.root();
                if let Some(node) = tree.get_mut(root) {
                    node.num_points = num_points;
                }
            }
        }

        Ok(geometry)
    }

    /// Fetch `metadata_url` and build the geometry it describes
    pub async fn open(fetcher: F, metadata_url: &str, config: &StreamingConfig) -> Result<Self> {
        let bytes = fetcher.fetch(metadata_url, &FetchOptions::metadata()).await?;
        let metadata = CloudMetadata::from_slice(&bytes)?;
        log::info!(
            "Opened {} (version {}, {} points, step {:?})",
            metadata_url,
            metadata.version,
            metadata.points,
            metadata.hierarchy_step_size
        );
        Self::from_metadata(fetcher, &metadata, base_dir_of(metadata_url), config)
    }

    fn lock(&self) -> MutexGuard<'_, GeometryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    // --- Tree access ---

    pub fn root(&self) -> NodeId {
        self.lock().tree.root()
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.lock().tree.find(name)
    }

    pub fn node_count(&self) -> usize {
        self.lock().tree.node_count()
    }

    pub fn count_in_state(&self, kind: LoadStateKind) -> usize {
        self.lock().tree.count_in_state(kind)
    }

    /// Run `f` on a node. The geometry is locked while `f` runs, so `f` must
    /// not call back into this geometry.
    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&GeometryNode) -> R) -> Option<R> {
        self.lock().tree.get(id).map(f)
    }

    /// Run `f` on the whole tree, under the same locking rule as
    /// [`with_node`](Self::with_node)
    pub fn with_tree<R>(&self, f: impl FnOnce(&OctreeTree) -> R) -> R {
        f(&self.lock().tree)
    }

    /// Visit `start` (if `include_self`) and all of its descendants
    ///
    /// Every reachable node is visited exactly once; the order is not
    /// guaranteed.
    pub fn traverse(&self, start: NodeId, include_self: bool, visit: impl FnMut(&GeometryNode)) {
        self.lock().tree.traverse(start, include_self, visit);
    }

    pub fn children(&self, id: NodeId) -> Option<[Option<NodeId>; 8]> {
        self.lock().tree.get(id).map(|node| *node.children())
    }

    // --- Dataset layout ---

    pub fn version(&self) -> Version {
        self.lock().loader.version()
    }

    pub fn settings(&self) -> GeometrySettings {
        self.lock().settings.clone()
    }

    pub fn set_url_transform(&self, transform: UrlTransform) {
        self.lock().loader.set_url_transform(transform);
    }

    /// URL of a node's point payload
    pub fn point_url(&self, id: NodeId) -> Result<String> {
        let state = self.lock();
        let node = state.node(id)?;
        Ok(state.point_url(node))
    }

    /// URL of the hierarchy chunk rooted at a node
    pub fn hierarchy_url(&self, id: NodeId) -> Result<String> {
        let state = self.lock();
        let node = state.node(id)?;
        Ok(state.hierarchy_url(node))
    }

    // --- Governor ---

    pub fn num_nodes_loading(&self) -> usize {
        self.lock().budget.nodes_loading()
    }

    pub fn max_nodes_loading(&self) -> usize {
        self.lock().budget.max_nodes_loading()
    }

    pub fn set_max_nodes_loading(&self, max: usize) {
        self.lock().budget.set_max_nodes_loading(max);
    }

    /// Bytes held by loaded payloads
    pub fn resident_bytes(&self) -> usize {
        self.lock().budget.resident_bytes()
    }

    pub fn memory_pressure(&self) -> f32 {
        self.lock().budget.memory_pressure()
    }

    pub fn should_evict(&self) -> bool {
        self.lock().budget.should_evict()
    }

    pub fn needs_update(&self) -> bool {
        self.lock().needs_update
    }

    /// Read and clear the `needs_update` flag
    pub fn take_needs_update(&self) -> bool {
        std::mem::take(&mut self.lock().needs_update)
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Whether a load of `id` would be admitted right now
    pub fn can_load(&self, id: NodeId) -> bool {
        let state = self.lock();
        state.node(id).map(|node| state.can_load(node)).unwrap_or(false)
    }

    // --- Node lifecycle ---

    /// Load a node's payload
    ///
    /// Returns [`LoadOutcome::Declined`] without doing anything when the node
    /// is already loading or loaded, the geometry or its loader is disposed,
    /// or the in-flight budget is used up. A failed node is admitted again,
    /// so calling `load` is how a driver retries it. Otherwise the node is marked loading and
    /// holds one budget slot until the load settles. Nodes that start a
    /// hierarchy chunk first fetch and decode that chunk, then their points.
    ///
    /// Failures leave the node [`LoadState::Failed`] and are returned to the
    /// caller once the budget slot has been released. Dropping the returned
    /// future before it completes settles the node the same way.
    pub async fn load(&self, id: NodeId) -> Result<LoadOutcome> {
        let Some(plan) = self.admit(id)? else {
            return Ok(LoadOutcome::Declined);
        };

        let in_flight = InFlight {
            geometry: self,
            id,
            name: plan.name.clone(),
            settled: false,
        };
        let result = self.fetch_node(id, &plan).await;
        in_flight.settle(result)
    }

    fn admit(&self, id: NodeId) -> Result<Option<LoadPlan>> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let node = state.node(id)?;
        if !state.can_load(node) {
            log::trace!(
                "Declined load of {} ({:?}, {}/{} loading, disposed: {})",
                node.name(),
                node.state().kind(),
                state.budget.nodes_loading(),
                state.budget.max_nodes_loading(),
                state.disposed
            );
            return Ok(None);
        }
        let plan = state.plan(node);

        let admitted = state.budget.begin_load();
        debug_assert!(admitted, "capacity checked above");
        if let Some(node) = state.tree.get_mut(id) {
            node.state = LoadState::Loading;
        }
        state.needs_update = true;

        log::debug!(
            "Loading {} ({}, {}/{} loading)",
            plan.name,
            if plan.hierarchy_url.is_some() { "hierarchy + points" } else { "points" },
            state.budget.nodes_loading(),
            state.budget.max_nodes_loading()
        );
        Ok(Some(plan))
    }

    async fn fetch_node(&self, id: NodeId, plan: &LoadPlan) -> Result<PointPayload> {
        if let Some(hierarchy_url) = &plan.hierarchy_url {
            let bytes = self.fetcher.fetch(hierarchy_url, &FetchOptions::hierarchy()).await?;
            let chunk = decode_hierarchy(&plan.name, &bytes)?;
            self.apply_hierarchy(id, &chunk)?;

            if self.is_disposed() {
                return Err(Error::Disposed(plan.name.clone()));
            }
        }

        let data = self.fetcher.fetch(&plan.point_url, &FetchOptions::points()).await?;
        Ok(PointPayload::new(data))
    }

    fn apply_hierarchy(&self, id: NodeId, chunk: &HierarchyChunk) -> Result<usize> {
        if chunk.partial {
            log::warn!(
                "Hierarchy chunk {} ended early; using the {} records decoded",
                chunk.root.name,
                chunk.record_count()
            );
        }

        let mut state = self.lock();
        let created = state.tree.apply_hierarchy(id, chunk)?;
        state.needs_update = true;

        log::debug!(
            "Decoded hierarchy chunk {}: {} records, {} new nodes",
            chunk.root.name,
            chunk.record_count(),
            created
        );
        Ok(created)
    }

    /// Record the result of an admitted load and release its budget slot
    fn settle(&self, id: NodeId, name: &str, result: Result<PointPayload>) -> Result<LoadOutcome> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.budget.end_load();
        state.needs_update = true;

        let (new_state, outcome) = match result {
            Ok(payload) if !state.disposed => {
                log::debug!("Loaded {} ({} bytes)", name, payload.byte_len());
                state.budget.add_resident(payload.byte_len());
                (LoadState::Loaded(payload), Ok(LoadOutcome::Loaded))
            }
            Ok(_) => {
                log::info!("Discarding payload of {}: geometry disposed while loading", name);
                (LoadState::Failed, Err(Error::Disposed(name.to_string())))
            }
            Err(e) => {
                log::warn!("Failed to load {}: {}", name, e);
                (LoadState::Failed, Err(e))
            }
        };

        if let Some(node) = state.tree.get_mut(id) {
            node.state = new_state;
        }
        outcome
    }

    /// Settle a load whose future was dropped mid-flight
    fn abandon(&self, id: NodeId, name: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.budget.end_load();
        state.needs_update = true;
        if let Some(node) = state.tree.get_mut(id) {
            node.state = LoadState::Failed;
        }
        log::warn!("Load of {} dropped before settling", name);
    }

    /// Put a failed node back to unloaded without retrying it
    ///
    /// Returns `false` if the node was not in the failed state.
    pub fn reset_failed(&self, id: NodeId) -> Result<bool> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let node = state.tree.get_mut(id).ok_or(Error::UnknownNode(id))?;
        if !node.is_failed() {
            return Ok(false);
        }
        node.state = LoadState::Unloaded;
        state.needs_update = true;
        Ok(true)
    }

    /// Release a node's payload
    ///
    /// No-op returning `false` unless the node owns a payload and has a
    /// parent. Registered dispose handlers run once, after the geometry lock
    /// is released.
    pub fn dispose_node(&self, id: NodeId) -> Result<bool> {
        let released = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let node = state.tree.get_mut(id).ok_or(Error::UnknownNode(id))?;
            let Some(released) = node.dispose() else {
                return Ok(false);
            };
            state.budget.remove_resident(released.payload.byte_len());
            state.needs_update = true;
            released
        };

        released.run_handlers();
        Ok(true)
    }

    /// Register a callback for the next time the node's payload is released
    pub fn add_dispose_handler(&self, id: NodeId, handler: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut state = self.lock();
        let node = state.tree.get_mut(id).ok_or(Error::UnknownNode(id))?;
        node.add_dispose_handler(handler);
        Ok(())
    }

    /// Store the tight bounds and centroid a payload decoder computed
    pub fn refine_bounds(&self, id: NodeId, tight_bounding_box: Aabb, mean: DVec3) -> Result<()> {
        let mut state = self.lock();
        let node = state.tree.get_mut(id).ok_or(Error::UnknownNode(id))?;
        node.tight_bounding_box = tight_bounding_box;
        node.mean = mean;
        Ok(())
    }

    /// Tear the geometry down
    ///
    /// Disposes the loader and every node payload except the root's, then
    /// marks the geometry disposed so later loads are declined. Loads already
    /// in flight still settle, as failures.
    pub fn dispose(&self) {
        let released: Vec<Released> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.disposed {
                return;
            }

            state.loader.dispose();
            let mut released = Vec::new();
            for node in state.tree.iter_mut() {
                if let Some(r) = node.dispose() {
                    state.budget.remove_resident(r.payload.byte_len());
                    released.push(r);
                }
            }
            state.disposed = true;
            state.needs_update = true;
            released
        };

        let count = released.len();
        for r in released {
            r.run_handlers();
        }
        log::info!("Octree geometry disposed, released {} payloads", count);
    }
}

/// Budget slot held by an admitted load until it settles
struct InFlight<'a, F: Fetch> {
    geometry: &'a OctreeGeometry<F>,
    id: NodeId,
    name: String,
    settled: bool,
}

impl<F: Fetch> InFlight<'_, F> {
    fn settle(mut self, result: Result<PointPayload>) -> Result<LoadOutcome> {
        self.settled = true;
        self.geometry.settle(self.id, &self.name, result)
    }
}

impl<F: Fetch> Drop for InFlight<'_, F> {
    fn drop(&mut self) {
        if !self.settled {
            self.geometry.abandon(self.id, &self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    use crate::streaming::FileFetcher;

    /// In-memory fetcher that records every requested URL and can hold all
    /// requests until the test releases them.
    #[derive(Default)]
    struct MemoryFetcher {
        files: Mutex<HashMap<String, Vec<u8>>>,
        requests: Mutex<Vec<String>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl MemoryFetcher {
        fn with_files(files: &[(&str, Vec<u8>)]) -> Self {
            let fetcher = Self::default();
            for (url, bytes) in files {
                fetcher.insert(url, bytes.clone());
            }
            fetcher
        }

        fn gated(mut self) -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            self.gate = Some(gate.clone());
            (self, gate)
        }

        fn insert(&self, url: &str, bytes: Vec<u8>) {
            self.files.lock().unwrap().insert(url.to_string(), bytes);
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Fetch for MemoryFetcher {
        fn fetch(&self, url: &str, _options: &FetchOptions) -> impl Future<Output = Result<Vec<u8>>> + Send {
            self.requests.lock().unwrap().push(url.to_string());
            let url = url.to_string();
            let files = &self.files;
            let gate = self.gate.clone();
            async move {
                if let Some(gate) = gate {
                    let _permit = gate.acquire().await.expect("gate closed");
                }
                let found = files.lock().unwrap().get(&url).cloned();
                found.ok_or(Error::Fetch {
                    url,
                    reason: "not found".into(),
                })
            }
        }
    }

    fn record(mask: u8, num_points: u32) -> Vec<u8> {
        let mut r = vec![mask];
        r.extend_from_slice(&num_points.to_le_bytes());
        r
    }

    fn settings() -> GeometrySettings {
        let bounds = Aabb::new(DVec3::ZERO, DVec3::splat(8.0));
        GeometrySettings {
            octree_dir: "data".into(),
            spacing: 1.0,
            hierarchy_step_size: 5,
            bounding_box: bounds,
            tight_bounding_box: bounds,
            offset: DVec3::ZERO,
        }
    }

    fn geometry(version: Version, fetcher: MemoryFetcher, max_loading: usize) -> OctreeGeometry<MemoryFetcher> {
        let config = StreamingConfig { max_nodes_loading: max_loading, ..Default::default() };
        OctreeGeometry::new(fetcher, BinaryLoader::new(version), settings(), &config).unwrap()
    }

    /// Version 1.4 dataset whose metadata lists r, r0, r1 and r2
    fn flat_geometry(fetcher: MemoryFetcher, max_loading: usize) -> OctreeGeometry<MemoryFetcher> {
        let metadata = CloudMetadata::from_slice(
            br#"{
                "version": "1.4",
                "octreeDir": "data",
                "boundingBox": {"lx": 0, "ly": 0, "lz": 0, "ux": 8, "uy": 8, "uz": 8},
                "spacing": 1.0,
                "hierarchy": [["r", 100], ["r0", 10], ["r1", 11], ["r2", 12]]
            }"#,
        )
        .unwrap();
        let config = StreamingConfig { max_nodes_loading: max_loading, ..Default::default() };
        OctreeGeometry::from_metadata(fetcher, &metadata, "", &config).unwrap()
    }

    fn root_chunk_files() -> Vec<(&'static str, Vec<u8>)> {
        vec![
            ("data/r/r.hrc", [record(0b0000_0101, 1000), record(0, 10), record(0, 20)].concat()),
            ("data/r/r.bin", vec![7; 12]),
            ("data/r/r0.bin", vec![1; 30]),
            ("data/r/r2.bin", vec![2; 40]),
        ]
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_root_load_decodes_hierarchy_then_points() {
        let geo = geometry(Version::new(1, 7), MemoryFetcher::with_files(&root_chunk_files()), 4);
        let root = geo.root();
        assert!(geo.take_needs_update());

        assert_eq!(geo.load(root).await.unwrap(), LoadOutcome::Loaded);

        assert_eq!(geo.fetcher().requests(), ["data/r/r.hrc", "data/r/r.bin"]);
        assert_eq!(geo.node_count(), 3);
        assert!(geo.find("r0").is_some());
        assert!(geo.find("r2").is_some());
        assert!(geo.find("r1").is_none());

        geo.with_node(root, |node| {
            assert!(node.is_loaded());
            assert_eq!(node.num_points(), 1000);
            assert_eq!(node.payload().unwrap().byte_len(), 12);
        })
        .unwrap();

        assert_eq!(geo.num_nodes_loading(), 0);
        assert_eq!(geo.resident_bytes(), 12);
        assert!(geo.take_needs_update());
        assert!(!geo.needs_update());
    }

    #[tokio::test]
    async fn test_child_below_step_loads_points_only() {
        let geo = geometry(Version::new(1, 7), MemoryFetcher::with_files(&root_chunk_files()), 4);
        geo.load(geo.root()).await.unwrap();

        let r0 = geo.find("r0").unwrap();
        assert_eq!(geo.load(r0).await.unwrap(), LoadOutcome::Loaded);
        assert_eq!(geo.fetcher().requests().last().unwrap(), "data/r/r0.bin");
        assert_eq!(geo.count_in_state(LoadStateKind::Loaded), 2);
    }

    #[tokio::test]
    async fn test_old_version_never_fetches_hierarchy() {
        let fetcher = MemoryFetcher::with_files(&[("data/r.bin", vec![0; 4]), ("data/r0.bin", vec![0; 4])]);
        let geo = flat_geometry(fetcher, 4);
        assert_eq!(geo.node_count(), 4);

        let root = geo.root();
        assert_eq!(geo.with_node(root, |n| n.num_points()), Some(100));
        assert_eq!(geo.point_url(root).unwrap(), "data/r.bin");

        assert_eq!(geo.load(root).await.unwrap(), LoadOutcome::Loaded);
        let r0 = geo.find("r0").unwrap();
        assert_eq!(geo.load(r0).await.unwrap(), LoadOutcome::Loaded);
        assert_eq!(geo.fetcher().requests(), ["data/r.bin", "data/r0.bin"]);
    }

    #[tokio::test]
    async fn test_urls_follow_version() {
        let geo14 = geometry(Version::new(1, 4), MemoryFetcher::default(), 4);
        let geo15 = geometry(Version::new(1, 5), MemoryFetcher::default(), 4);

        assert_eq!(geo14.point_url(geo14.root()).unwrap(), "data/r.bin");
        assert_eq!(geo15.point_url(geo15.root()).unwrap(), "data/r/r.bin");
        assert_eq!(geo15.hierarchy_url(geo15.root()).unwrap(), "data/r/r.hrc");
    }

    #[tokio::test]
    async fn test_url_transform_is_applied_to_fetches() {
        let fetcher = MemoryFetcher::with_files(&[
            ("https://host/cloud/data/r/r.hrc", record(0, 5)),
            ("https://host/cloud/data/r/r.bin", vec![1, 2]),
        ]);
        let geo = geometry(Version::new(1, 8), fetcher, 4);
        geo.set_url_transform(Arc::new(|path: &str| format!("https://host/cloud/{path}")));

        assert_eq!(geo.load(geo.root()).await.unwrap(), LoadOutcome::Loaded);
        assert_eq!(
            geo.fetcher().requests(),
            ["https://host/cloud/data/r/r.hrc", "https://host/cloud/data/r/r.bin"]
        );
    }

    #[tokio::test]
    async fn test_second_load_while_loading_is_declined() {
        let (fetcher, gate) = MemoryFetcher::with_files(&root_chunk_files()).gated();
        let geo = Arc::new(geometry(Version::new(1, 7), fetcher, 4));
        let root = geo.root();

        let first = tokio::spawn({
            let geo = geo.clone();
            async move { geo.load(root).await }
        });
        wait_until(|| geo.num_nodes_loading() == 1).await;

        assert!(!geo.can_load(root));
        assert_eq!(geo.load(root).await.unwrap(), LoadOutcome::Declined);
        assert_eq!(geo.num_nodes_loading(), 1);

        gate.add_permits(1);
        assert_eq!(first.await.unwrap().unwrap(), LoadOutcome::Loaded);
        assert_eq!(geo.num_nodes_loading(), 0);

        // Already loaded: declined as well, without touching the budget.
        assert_eq!(geo.load(root).await.unwrap(), LoadOutcome::Declined);
        assert_eq!(geo.fetcher().requests().len(), 2);
    }

    #[tokio::test]
    async fn test_budget_caps_in_flight_loads() {
        let (fetcher, gate) = MemoryFetcher::with_files(&[
            ("data/r0.bin", vec![0; 10]),
            ("data/r1.bin", vec![0; 11]),
            ("data/r2.bin", vec![0; 12]),
        ])
        .gated();
        let geo = Arc::new(flat_geometry(fetcher, 2));
        let ids: Vec<NodeId> = ["r0", "r1", "r2"].iter().map(|n| geo.find(n).unwrap()).collect();

        let handles: Vec<_> = ids[..2]
            .iter()
            .map(|&id| {
                let geo = geo.clone();
                tokio::spawn(async move { geo.load(id).await })
            })
            .collect();
        wait_until(|| geo.num_nodes_loading() == 2).await;

        assert_eq!(geo.load(ids[2]).await.unwrap(), LoadOutcome::Declined);
        assert_eq!(geo.count_in_state(LoadStateKind::Loading), geo.num_nodes_loading());
        assert!(geo.num_nodes_loading() <= geo.max_nodes_loading());

        gate.add_permits(1);
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), LoadOutcome::Loaded);
        }
        assert_eq!(geo.num_nodes_loading(), 0);
        assert_eq!(geo.count_in_state(LoadStateKind::Loading), 0);

        assert_eq!(geo.load(ids[2]).await.unwrap(), LoadOutcome::Loaded);
        assert_eq!(geo.resident_bytes(), 33);
    }

    #[tokio::test]
    async fn test_fetch_failure_restores_budget_and_propagates() {
        let geo = geometry(Version::new(1, 7), MemoryFetcher::with_files(&[("data/r/r.hrc", record(0, 1))]), 4);
        let root = geo.root();

        let err = geo.load(root).await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
        assert_eq!(geo.num_nodes_loading(), 0);
        assert_eq!(geo.with_node(root, |n| n.state().kind()), Some(LoadStateKind::Failed));

        // Calling load again on a failed node is a retry.
        assert!(geo.can_load(root));
        assert!(matches!(geo.load(root).await, Err(Error::Fetch { .. })));
        assert_eq!(geo.num_nodes_loading(), 0);

        geo.fetcher().insert("data/r/r.bin", vec![9; 3]);
        assert_eq!(geo.load(root).await.unwrap(), LoadOutcome::Loaded);
        assert_eq!(geo.num_nodes_loading(), 0);
        assert_eq!(geo.fetcher().requests().iter().filter(|u| u.ends_with("r.bin")).count(), 3);
    }

    #[tokio::test]
    async fn test_old_version_failed_node_retries_on_load() {
        let fetcher = MemoryFetcher::default();
        let geo = flat_geometry(fetcher, 4);
        let r0 = geo.find("r0").unwrap();

        assert!(geo.load(r0).await.is_err());
        geo.fetcher().insert("data/r0.bin", vec![1; 6]);
        assert_eq!(geo.load(r0).await.unwrap(), LoadOutcome::Loaded);
        assert_eq!(geo.resident_bytes(), 6);
    }

    #[tokio::test]
    async fn test_reset_failed_returns_node_to_unloaded() {
        let geo = flat_geometry(MemoryFetcher::default(), 4);
        let r1 = geo.find("r1").unwrap();

        assert!(!geo.reset_failed(r1).unwrap());
        assert!(geo.load(r1).await.is_err());
        geo.take_needs_update();

        assert!(geo.reset_failed(r1).unwrap());
        assert_eq!(geo.with_node(r1, |n| n.state().kind()), Some(LoadStateKind::Unloaded));
        assert!(geo.needs_update());
        assert!(!geo.reset_failed(r1).unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_hierarchy_fails_before_points() {
        let fetcher = MemoryFetcher::with_files(&[("data/r/r.hrc", vec![1, 2, 3]), ("data/r/r.bin", vec![0])]);
        let geo = geometry(Version::new(1, 7), fetcher, 4);
        let root = geo.root();

        assert!(matches!(geo.load(root).await, Err(Error::Decode(_))));
        assert_eq!(geo.fetcher().requests(), ["data/r/r.hrc"]);
        assert_eq!(geo.num_nodes_loading(), 0);
        assert!(geo.with_node(root, |n| n.is_failed()).unwrap());
    }

    #[tokio::test]
    async fn test_truncated_hierarchy_still_loads_points() {
        let mut chunk = [record(0b0000_0011, 5), record(0, 1)].concat();
        chunk.extend_from_slice(&[0, 0]);
        let fetcher = MemoryFetcher::with_files(&[("data/r/r.hrc", chunk), ("data/r/r.bin", vec![0; 2])]);
        let geo = geometry(Version::new(1, 7), fetcher, 4);

        assert_eq!(geo.load(geo.root()).await.unwrap(), LoadOutcome::Loaded);
        assert!(geo.find("r0").is_some());
        assert!(geo.find("r1").is_none());
    }

    #[tokio::test]
    async fn test_dispose_node_rules() {
        let geo = geometry(Version::new(1, 7), MemoryFetcher::with_files(&root_chunk_files()), 4);
        let root = geo.root();
        geo.load(root).await.unwrap();
        let r0 = geo.find("r0").unwrap();
        let r2 = geo.find("r2").unwrap();
        geo.load(r0).await.unwrap();

        // Root payload is protected.
        assert!(!geo.dispose_node(root).unwrap());
        assert!(geo.with_node(root, |n| n.is_loaded()).unwrap());

        // Nothing to release on an unloaded node.
        assert!(!geo.dispose_node(r2).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        geo.add_dispose_handler(r0, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(geo.resident_bytes(), 42);
        assert!(geo.dispose_node(r0).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(geo.resident_bytes(), 12);
        assert_eq!(geo.with_node(r0, |n| n.state().kind()), Some(LoadStateKind::Unloaded));

        assert!(!geo.dispose_node(r0).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Disposed nodes can stream back in.
        assert_eq!(geo.load(r0).await.unwrap(), LoadOutcome::Loaded);

        assert!(matches!(geo.dispose_node(NodeId(999)), Err(Error::UnknownNode(_))));
    }

    #[tokio::test]
    async fn test_reload_after_dispose_does_not_duplicate_nodes() {
        let files = vec![
            ("data/r/r.hrc", [record(0b0000_0001, 9), record(0b0000_0001, 8), record(0, 7)].concat()),
            ("data/r/r.bin", vec![0; 1]),
        ];
        let config = StreamingConfig::default();
        let settings = GeometrySettings { hierarchy_step_size: 1, ..settings() };
        let geo = OctreeGeometry::new(
            MemoryFetcher::with_files(&files),
            BinaryLoader::new(Version::new(1, 7)),
            settings,
            &config,
        )
        .unwrap();

        geo.load(geo.root()).await.unwrap();
        assert_eq!(geo.node_count(), 3);

        // With a step of 1, r0 starts its own chunk at data/r/0/r0.hrc.
        let r0 = geo.find("r0").unwrap();
        assert_eq!(geo.hierarchy_url(r0).unwrap(), "data/r/0/r0.hrc");
        geo.fetcher().insert("data/r/0/r0.hrc", [record(0b0000_0001, 8), record(0, 70)].concat());
        geo.fetcher().insert("data/r/0/r0.bin", vec![0; 5]);

        geo.load(r0).await.unwrap();
        geo.dispose_node(r0).unwrap();
        geo.load(r0).await.unwrap();

        assert_eq!(geo.node_count(), 3);
        let r00 = geo.find("r00").unwrap();
        assert_eq!(geo.with_node(r00, |n| n.num_points()), Some(70));
    }

    #[tokio::test]
    async fn test_dispose_geometry_declines_further_loads() {
        let geo = geometry(Version::new(1, 7), MemoryFetcher::with_files(&root_chunk_files()), 4);
        let root = geo.root();
        geo.load(root).await.unwrap();
        let r0 = geo.find("r0").unwrap();
        let r2 = geo.find("r2").unwrap();
        geo.load(r0).await.unwrap();

        geo.dispose();
        assert!(geo.is_disposed());
        assert!(geo.with_node(root, |n| n.is_loaded()).unwrap());
        assert!(!geo.with_node(r0, |n| n.is_loaded()).unwrap());
        assert_eq!(geo.resident_bytes(), 12);

        assert_eq!(geo.load(r2).await.unwrap(), LoadOutcome::Declined);
        assert_eq!(geo.num_nodes_loading(), 0);

        // Disposing twice is harmless.
        geo.dispose();
    }

    #[tokio::test]
    async fn test_dispose_while_loading_settles_as_failure() {
        let (fetcher, gate) = MemoryFetcher::with_files(&[("data/r0.bin", vec![0; 8])]).gated();
        let geo = Arc::new(flat_geometry(fetcher, 4));
        let r0 = geo.find("r0").unwrap();

        let load = tokio::spawn({
            let geo = geo.clone();
            async move { geo.load(r0).await }
        });
        wait_until(|| geo.num_nodes_loading() == 1).await;

        geo.dispose();
        gate.add_permits(1);

        assert!(matches!(load.await.unwrap(), Err(Error::Disposed(_))));
        assert_eq!(geo.num_nodes_loading(), 0);
        assert_eq!(geo.resident_bytes(), 0);
        assert!(geo.with_node(r0, |n| n.is_failed()).unwrap());
    }

    #[tokio::test]
    async fn test_dropped_load_releases_budget_slot() {
        let (fetcher, _gate) = MemoryFetcher::with_files(&[("data/r0.bin", vec![0; 8])]).gated();
        let geo = Arc::new(flat_geometry(fetcher, 1));
        let r0 = geo.find("r0").unwrap();

        let load = tokio::spawn({
            let geo = geo.clone();
            async move { geo.load(r0).await }
        });
        wait_until(|| geo.num_nodes_loading() == 1).await;

        load.abort();
        assert!(load.await.unwrap_err().is_cancelled());

        assert_eq!(geo.num_nodes_loading(), 0);
        assert!(geo.with_node(r0, |n| n.is_failed()).unwrap());
    }

    #[tokio::test]
    async fn test_refine_bounds() {
        let geo = geometry(Version::new(1, 7), MemoryFetcher::default(), 4);
        let root = geo.root();
        let tight = Aabb::new(DVec3::splat(1.0), DVec3::splat(2.0));

        geo.refine_bounds(root, tight, DVec3::splat(1.5)).unwrap();
        geo.with_node(root, |n| {
            assert_eq!(*n.tight_bounding_box(), tight);
            assert_eq!(n.mean(), DVec3::splat(1.5));
            assert_eq!(n.bounding_box().max, DVec3::splat(8.0));
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_traverse_after_hierarchy_load() {
        let geo = geometry(Version::new(1, 7), MemoryFetcher::with_files(&root_chunk_files()), 4);
        let root = geo.root();
        geo.load(root).await.unwrap();

        let mut names = Vec::new();
        geo.traverse(root, true, |node| names.push(node.name().to_string()));
        names.sort();
        assert_eq!(names, ["r", "r0", "r2"]);

        let mut below = 0;
        geo.traverse(root, false, |_| below += 1);
        assert_eq!(below, 2);
    }

    #[tokio::test]
    async fn test_open_dataset_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = dir.path().join("perugia");
        std::fs::create_dir_all(cloud.join("data/r")).unwrap();
        std::fs::write(
            cloud.join("cloud.js"),
            r#"{
                "version": "1.7",
                "octreeDir": "data",
                "points": 30,
                "boundingBox": {"lx": 100, "ly": 100, "lz": 0, "ux": 108, "uy": 108, "uz": 8},
                "spacing": 0.5,
                "hierarchyStepSize": 5
            }"#,
        )
        .unwrap();
        std::fs::write(cloud.join("data/r/r.hrc"), [record(0b1000_0000, 30), record(0, 4)].concat()).unwrap();
        std::fs::write(cloud.join("data/r/r.bin"), vec![0u8; 64]).unwrap();

        let geo = OctreeGeometry::open(
            FileFetcher::new(dir.path()),
            "perugia/cloud.js",
            &StreamingConfig::default(),
        )
        .await
        .unwrap();

        let settings = geo.settings();
        assert_eq!(settings.octree_dir, "perugia/data");
        assert_eq!(settings.offset, DVec3::new(100.0, 100.0, 0.0));

        assert_eq!(geo.load(geo.root()).await.unwrap(), LoadOutcome::Loaded);
        let r7 = geo.find("r7").unwrap();
        geo.with_node(r7, |n| {
            assert_eq!(n.num_points(), 4);
            assert_eq!(n.spacing(), 0.25);
            assert_eq!(n.bounding_box().min, DVec3::splat(4.0));
        })
        .unwrap();
    }

    #[test]
    fn test_new_accepts_largest_memory_budget() {
        let config: StreamingConfig =
            serde_json::from_str(r#"{"memory_budget_mb": 18446744073709551615}"#).unwrap();
        assert!(config.validate().is_ok());

        let geo = OctreeGeometry::new(
            MemoryFetcher::default(),
            BinaryLoader::new(Version::new(1, 7)),
            settings(),
            &config,
        )
        .unwrap();
        assert!(!geo.should_evict());
    }

    #[test]
    fn test_new_rejects_zero_step() {
        let settings = GeometrySettings { hierarchy_step_size: 0, ..settings() };
        let result = OctreeGeometry::new(
            MemoryFetcher::default(),
            BinaryLoader::new(Version::new(1, 7)),
            settings,
            &StreamingConfig::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
