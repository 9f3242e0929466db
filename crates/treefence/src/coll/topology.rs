// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reverse-tree topology.
//!
//! Tree indices are positions in the sorted participant hostlist. With fan-out
//! `W`, index `i` has parent `(i - 1) / W` and children `i*W + 1 ..= i*W + W`
//! clipped to the list. Every node computes the same tree from the same list,
//! no negotiation involved.

use crate::context::NodeId;
use crate::error::{Error, Result};

/// Position of one index in a reverse tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreePosition {
    /// Own index
    pub index: usize,
    /// Parent index (`None` at the root)
    pub parent: Option<usize>,
    /// Direct children, ascending
    pub children: Vec<usize>,
    /// Distance from the root
    pub depth: u32,
}

impl TreePosition {
    /// Compute the position of `index` in a tree of `count` nodes.
    pub fn compute(count: usize, width: u32, index: usize) -> Result<Self> {
        if width == 0 {
            return Err(Error::Topology("tree width must be > 0".into()));
        }
        if index >= count {
            return Err(Error::Topology(format!(
                "index {} out of range for {} nodes",
                index, count
            )));
        }
        let w = width as usize;
        let parent = if index == 0 { None } else { Some((index - 1) / w) };

        let first = index.saturating_mul(w).saturating_add(1);
        let last = index.saturating_mul(w).saturating_add(w).min(count - 1);
        let children = if first < count {
            (first..=last).collect()
        } else {
            Vec::new()
        };

        let mut depth = 0;
        let mut cur = index;
        while cur != 0 {
            cur = (cur - 1) / w;
            depth += 1;
        }

        Ok(Self {
            index,
            parent,
            children,
            depth,
        })
    }

    /// Whether this is index 0.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Every index below `index` in a tree of `count` nodes, ascending.
pub fn descendants(count: usize, width: u32, index: usize) -> Vec<usize> {
    let w = width.max(1) as usize;
    let mut out = Vec::new();
    // Descendants at each level form a contiguous index range.
    let mut lo = index;
    let mut hi = index;
    loop {
        let next_lo = lo.saturating_mul(w).saturating_add(1);
        let next_hi = hi.saturating_mul(w).saturating_add(w).min(count.saturating_sub(1));
        if next_lo >= count || next_lo > next_hi {
            break;
        }
        out.extend(next_lo..=next_hi);
        lo = next_lo;
        hi = next_hi;
    }
    out
}

/// Tree over a concrete hostlist, seen from one node.
#[derive(Clone, Debug)]
pub struct TreeTopology {
    hosts: Vec<NodeId>,
    width: u32,
    position: TreePosition,
    /// Full subtree, filled at the root only
    descendants: Vec<NodeId>,
}

impl TreeTopology {
    /// Build the tree for `hosts` (sorted, de-duplicated) from `local`'s point of view.
    pub fn new(hosts: Vec<NodeId>, width: u32, local: NodeId) -> Result<Self> {
        if hosts.is_empty() {
            return Err(Error::Topology("empty hostlist".into()));
        }
        let index = hosts
            .iter()
            .position(|h| *h == local)
            .ok_or_else(|| Error::NotParticipant(format!("node {}", local)))?;
        let position = TreePosition::compute(hosts.len(), width, index)?;
        let descendants = if position.is_root() {
            descendants(hosts.len(), width, 0)
                .into_iter()
                .map(|i| hosts[i])
                .collect()
        } else {
            Vec::new()
        };
        Ok(Self {
            hosts,
            width,
            position,
            descendants,
        })
    }

    /// Participating nodes in tree order.
    pub fn hosts(&self) -> &[NodeId] {
        &self.hosts
    }

    /// Fan-out.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Local position.
    pub fn position(&self) -> &TreePosition {
        &self.position
    }

    /// Whether the local node is the root.
    pub fn is_root(&self) -> bool {
        self.position.is_root()
    }

    /// Root node.
    pub fn root(&self) -> NodeId {
        self.hosts[0]
    }

    /// Parent node, `None` at the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.position.parent.map(|i| self.hosts[i])
    }

    /// Direct children in slot order.
    pub fn children(&self) -> Vec<NodeId> {
        self.position.children.iter().map(|&i| self.hosts[i]).collect()
    }

    /// Number of direct children.
    pub fn child_count(&self) -> usize {
        self.position.children.len()
    }

    /// Slot of `node` among the direct children.
    pub fn child_slot(&self, node: NodeId) -> Option<usize> {
        self.position
            .children
            .iter()
            .position(|&i| self.hosts[i] == node)
    }

    /// Complete subtree below the root (empty elsewhere).
    pub fn descendants(&self) -> &[NodeId] {
        &self.descendants
    }
}
