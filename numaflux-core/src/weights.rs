use std::fs;
use std::path::Path;

use log::{debug, info};
use numaflux_io::NodeSet;

use crate::error::{CoreError, Result};

/// Percentage of a range's bytes that should live on `node`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeWeight {
    pub node: u32,
    pub weight: f64,
}

/// Per-node byte distribution, sorted by weight ascending and summing to 100.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeWeightTable {
    entries: Vec<NodeWeight>,
}

impl NodeWeightTable {
    /// Sorts `entries` by weight and checks that they sum to 100.
    pub fn new(mut entries: Vec<NodeWeight>) -> Result<Self> {
        entries.sort_by(|a, b| a.weight.total_cmp(&b.weight));
        let sum: f64 = entries.iter().map(|e| e.weight).sum();
        if entries.is_empty() || sum.round() as i64 != 100 {
            return Err(CoreError::WeightSum(sum));
        }
        Ok(Self { entries })
    }

    /// Equal shares for every node in `nodes`.
    pub fn uniform(nodes: &NodeSet) -> Result<Self> {
        let share = 100.0 / nodes.len() as f64;
        Self::new(nodes.iter().map(|node| NodeWeight { node, weight: share }).collect())
    }

    /// Parses `weight node-id` lines. Blank lines are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let bad = |reason: &str| CoreError::WeightFormat { line: i + 1, reason: reason.to_string() };

            let mut fields = line.split_whitespace();
            let weight: f64 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| bad("expected a numeric weight"))?;
            let node: u32 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| bad("expected a node id after the weight"))?;
            if !weight.is_finite() || weight < 0.0 {
                return Err(bad("weights must be non-negative"));
            }
            if entries.iter().any(|e: &NodeWeight| e.node == node) {
                return Err(bad("node listed twice"));
            }
            entries.push(NodeWeight { node, weight });
        }
        Self::new(entries)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| CoreError::Io { path: path.to_path_buf(), source })?;
        let table = Self::parse(&text)?;
        info!("Node weights loaded from {}: {}", path.display(), table);
        Ok(table)
    }

    /// Fails if the table names a node outside `known`.
    pub fn check_nodes(&self, known: &NodeSet) -> Result<()> {
        match self.entries.iter().find(|e| !known.contains(e.node)) {
            Some(entry) => Err(CoreError::Config(format!(
                "node weights name node {}, which is not one of {:?}",
                entry.node, known
            ))),
            None => Ok(()),
        }
    }

    pub fn entries(&self) -> &[NodeWeight] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn nodes(&self) -> NodeSet {
        self.entries.iter().map(|e| e.node).collect()
    }

    pub fn weight_of(&self, node: u32) -> Option<f64> {
        self.entries.iter().find(|e| e.node == node).map(|e| e.weight)
    }

    /// Sum of the weights of nodes inside `workers`.
    pub fn worker_sum(&self, workers: &NodeSet) -> f64 {
        self.entries.iter().filter(|e| workers.contains(e.node)).map(|e| e.weight).sum()
    }

    pub fn non_worker_sum(&self, workers: &NodeSet) -> f64 {
        self.entries.iter().filter(|e| !workers.contains(e.node)).map(|e| e.weight).sum()
    }

    /// The working table for a shift of `shift` percentage points from
    /// non-worker to worker nodes. Each group keeps its internal
    /// proportions; weights are rounded to one decimal.
    pub fn shifted(&self, workers: &NodeSet, shift: f64) -> Result<Self> {
        let ww = self.worker_sum(workers);
        let nww = self.non_worker_sum(workers);
        if ww <= 0.0 {
            return Err(CoreError::Config(format!("worker nodes {:?} carry no weight", workers)));
        }
        let worker_total = ww + shift;
        let other_total = 100.0 - worker_total;

        let entries = self
            .entries
            .iter()
            .map(|e| {
                let weight = if workers.contains(e.node) {
                    e.weight / ww * worker_total
                } else if nww > 0.0 {
                    e.weight / nww * other_total
                } else {
                    0.0
                };
                NodeWeight { node: e.node, weight: round_to(weight, 1) }
            })
            .collect();

        let table = Self::new(entries)?;
        debug!("Working weights for shift {}: {}", shift, table);
        Ok(table)
    }
}

impl std::fmt::Display for NodeWeightTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{:.1}", e.node, e.weight)?;
        }
        Ok(())
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(u32, f64)]) -> NodeWeightTable {
        NodeWeightTable::new(pairs.iter().map(|&(node, weight)| NodeWeight { node, weight }).collect()).unwrap()
    }

    #[test]
    fn test_entries_are_sorted_ascending() {
        let t = table(&[(0, 70.0), (1, 30.0)]);
        assert_eq!(t.entries()[0], NodeWeight { node: 1, weight: 30.0 });
        assert_eq!(t.entries()[1].node, 0);
    }

    #[test]
    fn test_sum_must_be_one_hundred() {
        let err = NodeWeightTable::new(vec![NodeWeight { node: 0, weight: 60.0 }, NodeWeight { node: 1, weight: 30.0 }]);
        assert!(matches!(err, Err(CoreError::WeightSum(s)) if (s - 90.0).abs() < 1e-9));
        // Rounding slack
        assert!(NodeWeightTable::new(vec![
            NodeWeight { node: 0, weight: 33.3 },
            NodeWeight { node: 1, weight: 33.3 },
            NodeWeight { node: 2, weight: 33.3 },
        ])
        .is_ok());
    }

    #[test]
    fn test_parse_weight_file() {
        let t = NodeWeightTable::parse("25 3\n\n 25 2\n20 1\n30 0\n").unwrap();
        let order: Vec<u32> = t.entries().iter().map(|e| e.node).collect();
        assert_eq!(order[0], 1);
        assert_eq!(*order.last().unwrap(), 0);
        assert_eq!(t.weight_of(2), Some(25.0));

        let err = NodeWeightTable::parse("50 0\nfifty 1\n").unwrap_err();
        assert!(matches!(err, CoreError::WeightFormat { line: 2, .. }));
        assert!(NodeWeightTable::parse("50 0\n50 0\n").is_err());
        assert!(NodeWeightTable::parse("100\n").is_err());
    }

    #[test]
    fn test_nodes_must_exist() {
        let t = table(&[(0, 50.0), (3, 50.0)]);
        assert!(t.check_nodes(&NodeSet::first_n(4)).is_ok());
        assert!(matches!(t.check_nodes(&NodeSet::first_n(2)), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_shifted_moves_weight_to_workers() {
        let base = table(&[(0, 40.0), (1, 20.0), (2, 25.0), (3, 15.0)]);
        let workers = NodeSet::first_n(2);
        assert_eq!(base.worker_sum(&workers), 60.0);
        assert_eq!(base.non_worker_sum(&workers), 40.0);

        let shifted = base.shifted(&workers, 20.0).unwrap();
        // workers 60 -> 80, keeping 2:1
        assert!((shifted.weight_of(0).unwrap() - 53.3).abs() < 1e-9);
        assert!((shifted.weight_of(1).unwrap() - 26.7).abs() < 1e-9);
        // non-workers 40 -> 20, keeping 25:15
        assert!((shifted.weight_of(2).unwrap() - 12.5).abs() < 1e-9);
        assert!((shifted.weight_of(3).unwrap() - 7.5).abs() < 1e-9);

        let zero = base.shifted(&workers, 0.0).unwrap();
        assert_eq!(zero, base);
    }

    #[test]
    fn test_full_shift_empties_non_workers() {
        let base = table(&[(0, 50.0), (1, 50.0)]);
        let shifted = base.shifted(&NodeSet::single(0), 50.0).unwrap();
        assert_eq!(shifted.weight_of(0), Some(100.0));
        assert_eq!(shifted.weight_of(1), Some(0.0));
        assert!(base.shifted(&NodeSet::single(5), 10.0).is_err());
    }
}
