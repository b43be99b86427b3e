//! Static model of a machine's cache hierarchy.
//!
//! A [`Topology`] describes the hierarchy level by level: how many children
//! each cluster at a level has, the capacity in bytes shared by a cluster's
//! workers, and the transfer block size of that level. Building it yields a
//! [`ClusterTree`], a fixed arena of clusters with the RAM root at the top
//! and one zero-capacity leaf per worker at the bottom. Hierarchical
//! schedulers attach their own per-cluster state as the tree's payload.

use serde::{Deserialize, Serialize};
use std::sync::MutexGuard;

use super::ConfigError;

/// Effective capacity of the root. The root models RAM, which the space
/// bound treats as infinite; any configured value is replaced by this.
pub const UNBOUNDED: u64 = 1 << 45;

/// Index of a cluster within its tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(pub(crate) u32);

impl ClusterId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cluster#{}", self.0)
    }
}

/// Per-level description of a cache hierarchy.
///
/// Index 0 is the root (RAM) level. `fan_outs[i]` is the number of children
/// of every cluster at level `i`; the product over all levels is the number
/// of leaves and must equal the worker count. `capacities[0]` is ignored,
/// the root is always [`UNBOUNDED`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Topology {
    pub fan_outs: Vec<usize>,
    pub capacities: Vec<u64>,
    pub block_sizes: Vec<u64>,
}

impl Topology {
    pub fn new(fan_outs: Vec<usize>, capacities: Vec<u64>, block_sizes: Vec<u64>) -> Self {
        Topology {
            fan_outs,
            capacities,
            block_sizes,
        }
    }

    /// A root over `workers` single-worker clusters of `capacity` bytes
    /// each. The smallest hierarchy that exercises space bounds.
    pub fn two_level(workers: usize, capacity: u64, block_size: u64) -> Self {
        Topology {
            fan_outs: vec![workers, 1],
            capacities: vec![UNBOUNDED, capacity],
            block_sizes: vec![block_size, block_size],
        }
    }

    /// Number of configured levels, excluding the implicit leaf level.
    pub fn num_levels(&self) -> usize {
        self.fan_outs.len()
    }

    /// Number of leaves, i.e. workers the hierarchy expects.
    pub fn num_leaves(&self) -> usize {
        self.fan_outs.iter().product()
    }

    pub fn validate(&self, num_workers: usize) -> Result<(), ConfigError> {
        if self.fan_outs.len() != self.capacities.len()
            || self.fan_outs.len() != self.block_sizes.len()
        {
            return Err(ConfigError::LevelMismatch {
                fan_outs: self.fan_outs.len(),
                capacities: self.capacities.len(),
                block_sizes: self.block_sizes.len(),
            });
        }
        if self.fan_outs.is_empty() {
            return Err(ConfigError::NoLevels);
        }
        for (level, &fan) in self.fan_outs.iter().enumerate() {
            if fan == 0 {
                return Err(ConfigError::ZeroFanOut { level });
            }
        }
        for (level, &block) in self.block_sizes.iter().enumerate() {
            if block == 0 {
                return Err(ConfigError::ZeroBlockSize { level });
            }
        }
        // capacities[0] is ignored; the levels below must shrink monotonically.
        for level in 1..self.capacities.len() {
            if self.capacities[level] == 0 {
                return Err(ConfigError::ZeroCapacity { level });
            }
            if level >= 2 && self.capacities[level] > self.capacities[level - 1] {
                return Err(ConfigError::CapacityOrder { level });
            }
        }
        let leaves = self.num_leaves();
        if leaves != num_workers {
            return Err(ConfigError::WorkerCountMismatch {
                leaves,
                workers: num_workers,
            });
        }
        Ok(())
    }
}

/// What a payload builder gets to see about the cluster being created.
pub(crate) struct NodeSpec {
    pub level: usize,
    pub capacity: u64,
    pub block_size: u64,
    pub num_children: usize,
    pub is_leaf: bool,
}

pub(crate) struct ClusterNode<P> {
    pub level: usize,
    pub capacity: u64,
    pub block_size: u64,
    pub parent: Option<ClusterId>,
    pub children: Vec<ClusterId>,
    /// Position among the parent's children; 0 for the root.
    pub sibling_index: usize,
    pub payload: P,
}

/// Arena of clusters in depth-first order, root first. Leaves appear in
/// worker order: leaf `t` is where worker `t` starts every tree walk.
pub(crate) struct ClusterTree<P> {
    nodes: Vec<ClusterNode<P>>,
    leaves: Vec<ClusterId>,
    num_levels: usize,
}

impl<P> ClusterTree<P> {
    /// Builds the tree for `topo`, calling `make` once per cluster to
    /// create its payload.
    pub fn build(
        topo: &Topology,
        num_workers: usize,
        mut make: impl FnMut(&NodeSpec) -> P,
    ) -> Result<Self, ConfigError> {
        topo.validate(num_workers)?;
        let mut tree = ClusterTree {
            nodes: Vec::new(),
            leaves: Vec::with_capacity(num_workers),
            num_levels: topo.num_levels(),
        };
        tree.grow(topo, 0, None, 0, &mut make);
        Ok(tree)
    }

    fn grow(
        &mut self,
        topo: &Topology,
        level: usize,
        parent: Option<ClusterId>,
        sibling_index: usize,
        make: &mut impl FnMut(&NodeSpec) -> P,
    ) -> ClusterId {
        let is_leaf = level == topo.num_levels();
        let spec = if is_leaf {
            NodeSpec {
                level,
                capacity: 0,
                block_size: 1,
                num_children: 0,
                is_leaf,
            }
        } else {
            NodeSpec {
                level,
                capacity: if level == 0 {
                    UNBOUNDED
                } else {
                    topo.capacities[level]
                },
                block_size: topo.block_sizes[level],
                num_children: topo.fan_outs[level],
                is_leaf,
            }
        };
        let id = ClusterId(self.nodes.len() as u32);
        self.nodes.push(ClusterNode {
            level,
            capacity: spec.capacity,
            block_size: spec.block_size,
            parent,
            children: Vec::new(),
            sibling_index,
            payload: make(&spec),
        });
        if is_leaf {
            self.leaves.push(id);
        } else {
            for i in 0..topo.fan_outs[level] {
                let child = self.grow(topo, level + 1, Some(id), i, make);
                self.nodes[id.index()].children.push(child);
            }
        }
        id
    }

    pub fn root(&self) -> ClusterId {
        ClusterId(0)
    }

    pub fn leaf_for(&self, worker: usize) -> ClusterId {
        self.leaves[worker]
    }

    pub fn node(&self, id: ClusterId) -> &ClusterNode<P> {
        &self.nodes[id.index()]
    }

    pub fn parent(&self, id: ClusterId) -> Option<ClusterId> {
        self.nodes[id.index()].parent
    }

    /// Configured levels; leaves sit one level below the last configured one.
    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    pub fn num_leaves(&self) -> usize {
        self.leaves.len()
    }

    /// Clusters from `from` (inclusive) up to and including the root.
    pub fn path_up(&self, from: ClusterId) -> PathUp<'_, P> {
        PathUp {
            tree: self,
            next: Some(from),
        }
    }

    /// True when `ancestor` lies strictly above `id` on its path to the root.
    pub fn is_strict_ancestor(&self, ancestor: ClusterId, id: ClusterId) -> bool {
        let mut cur = self.parent(id);
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            cur = self.parent(c);
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClusterId, &ClusterNode<P>)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (ClusterId(i as u32), n))
    }
}

pub(crate) struct PathUp<'a, P> {
    tree: &'a ClusterTree<P>,
    next: Option<ClusterId>,
}

impl<P> Iterator for PathUp<'_, P> {
    type Item = ClusterId;

    fn next(&mut self) -> Option<ClusterId> {
        let cur = self.next?;
        self.next = self.tree.parent(cur);
        Some(cur)
    }
}

/// Snapshot of one cluster's space accounting, for diagnostics and tests.
#[derive(Clone, Debug)]
pub struct ClusterUsage {
    pub cluster: ClusterId,
    pub level: usize,
    pub capacity: u64,
    pub occupied: u64,
}

/// Per-thread record of held cluster locks.
///
/// Lock-based policies only ever lock clusters walking from a leaf toward
/// the root and release in exact reverse order; the ledger owns the guards
/// and asserts that discipline in debug builds. Dropping the ledger releases
/// whatever is still held, newest first.
pub(crate) struct LockLedger<'a, T> {
    held: Vec<(ClusterId, MutexGuard<'a, T>)>,
}

impl<'a, T> LockLedger<'a, T> {
    pub fn new() -> Self {
        LockLedger { held: Vec::new() }
    }

    pub fn acquire<P>(
        &mut self,
        tree: &ClusterTree<P>,
        id: ClusterId,
        guard: MutexGuard<'a, T>,
    ) {
        if let Some((newest, _)) = self.held.last() {
            debug_assert!(
                tree.is_strict_ancestor(id, *newest),
                "{id:?} acquired out of leaf-to-root order after {newest:?}"
            );
        }
        self.held.push((id, guard));
    }

    pub fn holds(&self, id: ClusterId) -> bool {
        self.held.iter().any(|(held, _)| *held == id)
    }

    pub fn guard(&self, id: ClusterId) -> Option<&T> {
        self.held
            .iter()
            .find(|(held, _)| *held == id)
            .map(|(_, g)| &**g)
    }

    pub fn guard_mut(&mut self, id: ClusterId) -> Option<&mut T> {
        self.held
            .iter_mut()
            .find(|(held, _)| *held == id)
            .map(|(_, g)| &mut **g)
    }

    pub fn newest(&self) -> Option<ClusterId> {
        self.held.last().map(|(id, _)| *id)
    }

    /// Releases the most recently acquired lock.
    pub fn release_newest(&mut self) {
        let released = self.held.pop();
        debug_assert!(released.is_some(), "release with no lock held");
    }

    pub fn release_all(&mut self) {
        while self.held.pop().is_some() {}
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Held locks must form a strictly ascending chain toward the root.
    pub fn check_consistency<P>(&self, tree: &ClusterTree<P>) {
        for pair in self.held.windows(2) {
            debug_assert!(
                tree.is_strict_ancestor(pair[1].0, pair[0].0),
                "held locks {:?} and {:?} are not in leaf-to-root order",
                pair[0].0,
                pair[1].0
            );
        }
    }
}

impl<T> Drop for LockLedger<'_, T> {
    fn drop(&mut self) {
        self.release_all();
    }
}
