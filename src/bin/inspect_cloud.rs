//! Point cloud inspector: opens a dataset from disk and streams its top levels.
//!
//! Usage: cargo run --release --bin inspect_cloud -- --dir <PATH> [OPTIONS]
//!
//! Options:
//!   --dir <PATH>         Dataset directory holding cloud.js
//!   --levels <N>         Deepest level to load (default: 2)
//!   --max-loading <N>    Node loads in flight (default: 4)
//!   --config <FILE>      Streaming config JSON (optional)

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;

use pointstream::octree::LoadStateKind;
use pointstream::{FileFetcher, LoadOutcome, NodeId, OctreeGeometry, StreamingConfig};

#[tokio::main]
async fn main() {
    pointstream::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    let Some(dir) = parse_str_arg(&args, "--dir") else {
        eprintln!("Usage: inspect_cloud --dir <PATH> [--levels N] [--max-loading N] [--config FILE]");
        std::process::exit(2);
    };
    let levels = parse_u32_arg(&args, "--levels").unwrap_or(2);

    let mut config = match parse_str_arg(&args, "--config") {
        Some(path) => match StreamingConfig::load_sync(&PathBuf::from(path)) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to read config: {}", e);
                std::process::exit(1);
            }
        },
        None => StreamingConfig::default(),
    };
    if let Some(max) = parse_usize_arg(&args, "--max-loading") {
        config.max_nodes_loading = max;
    }

    let start = Instant::now();
    let geometry = match OctreeGeometry::open(FileFetcher::new(&dir), "cloud.js", &config).await {
        Ok(geometry) => Arc::new(geometry),
        Err(e) => {
            log::error!("Failed to open {}: {}", dir, e);
            std::process::exit(1);
        }
    };

    let settings = geometry.settings();
    println!("=== {} ===", dir);
    println!("Version:        {}", geometry.version());
    println!("Octree dir:     {}", settings.octree_dir);
    println!("Step size:      {}", settings.hierarchy_step_size);
    println!("Spacing:        {}", settings.spacing);
    println!("Offset:         {:?}", settings.offset);
    println!("Size:           {:?}", settings.bounding_box.size());
    println!();

    let mut frontier = vec![geometry.root()];
    for level in 0..=levels {
        if frontier.is_empty() {
            break;
        }
        let (loaded, failed) = load_level(&geometry, &frontier).await;
        println!("Level {:>2}: {:>5} nodes, {:>5} loaded, {:>3} failed", level, frontier.len(), loaded, failed);

        frontier = frontier
            .iter()
            .filter_map(|&id| geometry.children(id))
            .flat_map(|children| children.into_iter().flatten())
            .collect();
    }

    let points: u64 = geometry.with_tree(|tree| {
        tree.iter()
            .filter(|node| node.is_loaded())
            .map(|node| node.num_points() as u64)
            .sum()
    });

    println!();
    println!("Nodes known:    {}", geometry.node_count());
    println!("Nodes loaded:   {}", geometry.count_in_state(LoadStateKind::Loaded));
    println!("Points loaded:  {}", points);
    println!("Bytes resident: {}", geometry.resident_bytes());
    println!("Elapsed:        {:.2?}", start.elapsed());
}

/// Load every node of one level, keeping at most `max_nodes_loading` in flight
async fn load_level(geometry: &Arc<OctreeGeometry<FileFetcher>>, ids: &[NodeId]) -> (usize, usize) {
    let mut queue: VecDeque<NodeId> = ids.iter().copied().collect();
    let mut tasks = JoinSet::new();
    let (mut loaded, mut failed) = (0, 0);

    loop {
        while tasks.len() < geometry.max_nodes_loading() {
            let Some(id) = queue.pop_front() else {
                break;
            };
            let geometry = geometry.clone();
            tasks.spawn(async move { (id, geometry.load(id).await) });
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok((_, Ok(LoadOutcome::Loaded))) => loaded += 1,
            Ok((id, Ok(LoadOutcome::Declined))) => log::debug!("Load of node {} declined", id),
            Ok((id, Err(e))) => {
                failed += 1;
                log::warn!("Node {}: {}", id, e);
            }
            Err(e) => log::error!("Load task panicked: {}", e),
        }
    }

    (loaded, failed)
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
