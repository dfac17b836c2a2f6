use std::fs;
use std::path::Path;

use log::{info, warn};
use thiserror::Error;

use crate::memory::{page_size, NodeSet};

const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    #[error("worker node {node} does not exist (machine has {count} nodes)")]
    UnknownNode { node: u32, count: usize },
    #[error("no worker nodes configured")]
    NoWorkers,
}

/// One NUMA node and the CPUs attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaNode {
    pub id: u32,
    pub cpus: Vec<usize>,
}

/// NUMA Topology Detector.
/// Identifies the memory nodes that placement decisions are made over.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    nodes: Vec<NumaNode>,
    page_size: usize,
    available_ram: u64,
}

impl NumaTopology {
    /// Detects the system's NUMA nodes from sysfs.
    pub fn detect() -> Self {
        Self::from_sysfs(Path::new(SYSFS_NODE_ROOT))
    }

    /// Reads `node<N>/cpulist` entries under `root`.
    pub fn from_sysfs(root: &Path) -> Self {
        let mut nodes: Vec<NumaNode> = fs::read_dir(root)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let id = name.to_str()?.strip_prefix("node")?.parse::<u32>().ok()?;
                let cpus = fs::read_to_string(entry.path().join("cpulist"))
                    .map(|s| parse_cpulist(&s))
                    .unwrap_or_default();
                Some(NumaNode { id, cpus })
            })
            .collect();
        nodes.sort_by_key(|n| n.id);

        if nodes.is_empty() {
            warn!("No NUMA nodes found under {}. Fallback to a single node.", root.display());
            let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
            let cpus = (0..count.max(1) as usize).collect();
            nodes.push(NumaNode { id: 0, cpus });
        }

        let av_pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) }.max(0) as u64;
        let page_size = page_size();

        Self { nodes, page_size, available_ram: av_pages * page_size as u64 }
    }

    /// Builds a topology by hand.
    pub fn with_nodes(nodes: Vec<NumaNode>, page_size: usize) -> Self {
        Self { nodes, page_size, available_ram: 0 }
    }

    pub fn nodes(&self) -> &[NumaNode] {
        &self.nodes
    }

    /// Number of configured NUMA nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn all_nodes(&self) -> NodeSet {
        self.nodes.iter().map(|n| n.id).collect()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Checks that every worker node exists.
    pub fn validate_workers(&self, workers: &NodeSet) -> Result<(), TopologyError> {
        if workers.is_empty() {
            return Err(TopologyError::NoWorkers);
        }
        let all = self.all_nodes();
        match workers.iter().find(|&node| !all.contains(node)) {
            Some(node) => Err(TopologyError::UnknownNode { node, count: self.nodes.len() }),
            None => Ok(()),
        }
    }

    pub fn print_summary(&self) {
        info!(
            "Topology Discovery: {} NUMA nodes, {} byte pages, {:.2} GB RAM available.",
            self.nodes.len(),
            self.page_size,
            self.available_ram as f64 / 1e9
        );
        for node in &self.nodes {
            info!("  node {}: {} cpus {:?}", node.id, node.cpus.len(), node.cpus);
        }
    }
}

/// Parses a kernel cpulist such as `0-3,8,10-11`.
pub fn parse_cpulist(text: &str) -> Vec<usize> {
    text.trim()
        .split(',')
        .filter(|part| !part.is_empty())
        .flat_map(|part| {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (lo.parse().ok(), hi.parse().ok()),
                None => (part.parse().ok(), part.parse().ok()),
            };
            match (lo, hi) {
                (Some(lo), Some(hi)) if lo <= hi => lo..=hi,
                _ => {
                    warn!("Ignoring malformed cpulist fragment '{}'", part);
                    #[allow(clippy::reversed_empty_ranges)]
                    { 1..=0 }
                }
            }
        })
        .collect()
}
