use std::sync::{Arc, Mutex, PoisonError};

use libc::c_int;
use log::{debug, warn};
use numaflux_io::memory::is_aligned;
use numaflux_io::{align_down, align_up, MemPolicy, NodeSet, NumaBackend};

use crate::error::{CoreError, Result};
use crate::segment::{MemorySegment, SegmentKind};
use crate::weights::{round_to, NodeWeightTable};

/// Slack for floating point noise in the local/interleave split.
const RATIO_EPSILON: f64 = 1e-9;

/// A target layout for every tracked segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    /// Fraction of each range favouring the worker nodes.
    Ratio(f64),
    /// Percentage points moved from non-worker to worker weight.
    Shift(f64),
    /// The configured node weights as loaded.
    Baseline,
    /// Percentage of resident pages migrated to a remote node.
    Migrate(f64),
}

#[derive(Debug, Clone)]
pub struct PlacementOptions {
    /// Segments this size or smaller are skipped by sweeps.
    pub min_segment_bytes: usize,
    /// Also rebind the interleaved part of a ratio placement.
    pub rebind_interleaved: bool,
    pub page_size: usize,
}

impl Default for PlacementOptions {
    fn default() -> Self {
        Self { min_segment_bytes: 1 << 20, rebind_interleaved: false, page_size: numaflux_io::page_size() }
    }
}

/// Byte lengths chosen by a ratio placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatioSplit {
    pub interleave_len: usize,
    pub local_len: usize,
}

/// One contiguous piece of a weighted placement.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedChunk {
    pub addr: usize,
    pub len: usize,
    pub nodes: NodeSet,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub pages: usize,
    pub to_remote: usize,
    pub to_local: usize,
    pub not_present: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub placed: usize,
    pub skipped: usize,
    pub stale: usize,
    pub bytes: usize,
}

/// Turns ratios and weight tables into page binding and migration calls.
pub struct PlacementEngine {
    backend: Arc<dyn NumaBackend>,
    all_nodes: NodeSet,
    workers: NodeSet,
    baseline: NodeWeightTable,
    options: PlacementOptions,
    working: Mutex<Option<(i64, NodeWeightTable)>>,
}

impl PlacementEngine {
    pub fn new(
        backend: Arc<dyn NumaBackend>,
        all_nodes: NodeSet,
        workers: NodeSet,
        baseline: NodeWeightTable,
        options: PlacementOptions,
    ) -> Result<Self> {
        if workers.is_empty() {
            return Err(CoreError::Config("at least one worker node is required".into()));
        }
        if !options.page_size.is_power_of_two() {
            return Err(CoreError::Config(format!("page size {} is not a power of two", options.page_size)));
        }
        Ok(Self { backend, all_nodes, workers, baseline, options, working: Mutex::new(None) })
    }

    pub fn node_count(&self) -> usize {
        self.all_nodes.len()
    }

    pub fn workers(&self) -> &NodeSet {
        &self.workers
    }

    pub fn baseline(&self) -> &NodeWeightTable {
        &self.baseline
    }

    pub fn options(&self) -> &PlacementOptions {
        &self.options
    }

    /// Largest meaningful shift: moving more than the non-worker weight
    /// would make non-worker weights negative.
    pub fn max_shift(&self) -> f64 {
        self.baseline.non_worker_sum(&self.workers).min(100.0)
    }

    /// A single worker node gets the local part outright; several share
    /// it round-robin.
    fn local_policy(&self) -> MemPolicy {
        if self.workers.len() == 1 {
            MemPolicy::Bind
        } else {
            MemPolicy::Interleave
        }
    }

    fn check_aligned(&self, addr: usize, len: usize) -> Result<()> {
        let page = self.options.page_size;
        if !is_aligned(addr, page) {
            return Err(CoreError::Misaligned { what: "address", value: addr });
        }
        if !is_aligned(len, page) {
            return Err(CoreError::Misaligned { what: "length", value: len });
        }
        Ok(())
    }

    /// Splits `[addr, addr + len)` so that a share `r` of its pages ends up
    /// on the worker nodes, counting the worker share of the interleaved
    /// part. The leading part is interleaved, the trailing part is bound to
    /// the workers.
    pub fn place(&self, addr: usize, len: usize, r: f64) -> Result<RatioSplit> {
        self.check_aligned(addr, len)?;
        if !(0.0..=1.0).contains(&r) {
            return Err(CoreError::RatioOutOfRange(r));
        }

        let n = self.node_count();
        if n <= 1 {
            return Ok(RatioSplit { interleave_len: 0, local_len: len });
        }

        let mut local_ratio = r - (1.0 - r) / (n - 1) as f64;
        if local_ratio < 0.0 && local_ratio > -RATIO_EPSILON {
            local_ratio = 0.0;
        }
        let interleave_ratio = 1.0 - local_ratio;
        if !(0.0..=1.0).contains(&local_ratio) || !(0.0..=1.0).contains(&interleave_ratio) {
            return Err(CoreError::PlacementArithmetic(format!(
                "ratio {} gives local {} / interleave {} on {} nodes",
                r, local_ratio, interleave_ratio, n
            )));
        }

        let page = self.options.page_size;
        let interleave_len = align_down((interleave_ratio * len as f64) as usize, page).min(len);
        let local_len = len - interleave_len;
        if local_len + interleave_len != len || !is_aligned(local_len, page) || !is_aligned(interleave_len, page) {
            return Err(CoreError::PlacementArithmetic(format!(
                "split {} + {} does not cover {} bytes in whole pages",
                interleave_len, local_len, len
            )));
        }

        if self.options.rebind_interleaved && interleave_len > 0 {
            self.backend.bind(addr, interleave_len, MemPolicy::Interleave, &self.all_nodes)?;
        }
        if local_len > 0 {
            self.backend.bind(addr + interleave_len, local_len, self.local_policy(), &self.workers)?;
        }
        Ok(RatioSplit { interleave_len, local_len })
    }

    /// Lays the range out according to `table`.
    ///
    /// Walking the table from the smallest weight up, each step interleaves
    /// one chunk across every node not yet finished, sized so that the
    /// current node reaches its full share; that node then drops out.
    pub fn place_weighted(&self, addr: usize, len: usize, table: &NodeWeightTable) -> Result<Vec<WeightedChunk>> {
        self.check_aligned(addr, len)?;
        let page = self.options.page_size;

        let mut remaining_nodes = table.nodes();
        let mut active = table.len();
        let mut consumed_weight = 0.0;
        let mut assigned = 0;
        let mut chunks = Vec::with_capacity(table.len());

        for (i, entry) in table.entries().iter().enumerate() {
            if assigned == len {
                break;
            }
            let remaining = len - assigned;
            let size = if i + 1 == table.len() {
                remaining
            } else {
                let share = (entry.weight - consumed_weight).max(0.0) / 100.0;
                align_up((active as f64 * share * len as f64) as usize, page).min(remaining)
            };

            if size > 0 {
                let start = addr + assigned;
                self.backend.bind(start, size, MemPolicy::Interleave, &remaining_nodes)?;
                chunks.push(WeightedChunk { addr: start, len: size, nodes: remaining_nodes.clone() });
            }

            assigned += size;
            active -= 1;
            consumed_weight = entry.weight;
            remaining_nodes.remove(entry.node);
        }
        Ok(chunks)
    }

    /// Working table for `shift`, recomputed only when the shift changes.
    pub fn working_table(&self, shift: f64) -> Result<NodeWeightTable> {
        let key = (round_to(shift, 1) * 10.0) as i64;
        let mut cached = self.working.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((k, table)) = cached.as_ref() {
            if *k == key {
                return Ok(table.clone());
            }
        }
        let table = self.baseline.shifted(&self.workers, shift)?;
        *cached = Some((key, table.clone()));
        Ok(table)
    }

    /// Moves already resident pages so that `remote_pct` percent of them
    /// sit on the first non-worker node and the rest on the first worker.
    pub fn migrate(&self, addr: usize, len: usize, remote_pct: f64) -> Result<MigrationSummary> {
        self.check_aligned(addr, len)?;
        if !(0.0..=100.0).contains(&remote_pct) {
            return Err(CoreError::RatioOutOfRange(remote_pct / 100.0));
        }
        let (Some(local), Some(remote)) = (
            self.workers.iter().next(),
            self.all_nodes.iter().find(|&n| !self.workers.contains(n)),
        ) else {
            return Ok(MigrationSummary::default());
        };

        let page = self.options.page_size;
        let pages = len / page;
        let (alternating_pct, rest) = if remote_pct <= 50.0 { (remote_pct, local) } else { (100.0 - remote_pct, remote) };
        let alternating = ((pages as f64 * alternating_pct / 100.0 * 2.0).round() as usize).min(pages);

        let (first, second) = if remote_pct <= 50.0 { (remote, local) } else { (local, remote) };
        let targets: Vec<c_int> = (0..pages)
            .map(|i| {
                let node = if i >= alternating {
                    rest
                } else if i % 2 == 0 {
                    first
                } else {
                    second
                };
                node as c_int
            })
            .collect();
        let addrs: Vec<usize> = (0..pages).map(|i| addr + i * page).collect();
        let mut status = vec![0 as c_int; pages];

        self.backend.move_pages(&addrs, &targets, &mut status)?;

        let mut summary = MigrationSummary { pages, ..Default::default() };
        for (i, &st) in status.iter().enumerate() {
            if st == -libc::ENOENT {
                summary.not_present += 1;
            } else if st < 0 {
                warn!("move_pages: page {:#x} stayed put ({})", addrs[i], -st);
                summary.failed += 1;
            } else if targets[i] as u32 == remote {
                summary.to_remote += 1;
            } else {
                summary.to_local += 1;
            }
        }
        Ok(summary)
    }

    /// Applies `distribution` to one segment's page-aligned range.
    pub fn place_segment(&self, segment: &MemorySegment, distribution: Distribution) -> Result<()> {
        let page = self.options.page_size;
        let addr = segment.page_aligned_start(page);
        let len = segment.page_aligned_len(page);
        match distribution {
            Distribution::Ratio(r) => self.place(addr, len, r).map(drop),
            Distribution::Shift(s) => self.place_weighted(addr, len, &self.working_table(s)?).map(drop),
            Distribution::Baseline => self.place_weighted(addr, len, &self.baseline).map(drop),
            Distribution::Migrate(pct) => self.migrate(addr, len, pct).map(drop),
        }
    }

    /// Applies `distribution` to every sufficiently large segment. Segments
    /// unmapped since the snapshot was taken are skipped.
    pub fn place_all(&self, segments: &[MemorySegment], distribution: Distribution) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();
        for segment in segments {
            if !sweepable(segment, self.options.min_segment_bytes) {
                summary.skipped += 1;
                continue;
            }
            match self.place_segment(segment, distribution) {
                Ok(()) => {
                    summary.placed += 1;
                    summary.bytes += segment.len();
                }
                Err(CoreError::Numa(e)) if e.is_stale_range() => {
                    debug!("Segment {} vanished before placement: {}", segment, e);
                    summary.stale += 1;
                }
                Err(e) => return Err(e),
            }
        }
        debug!(
            "Placed {:?}: {} segments ({} MiB), {} skipped, {} stale",
            distribution,
            summary.placed,
            summary.bytes >> 20,
            summary.skipped,
            summary.stale
        );
        Ok(summary)
    }
}

/// Text and stack stay where the kernel put them.
fn sweepable(segment: &MemorySegment, min_bytes: usize) -> bool {
    !matches!(segment.kind(), SegmentKind::Text | SegmentKind::Stack) && segment.len() > min_bytes
}
