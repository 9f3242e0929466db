// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-process node context.
//!
//! Everything a collective needs to know about the surrounding job is reached
//! through a [`NodeContext`] built once at agent start: the local identity, the
//! configuration, the job layout and the step-control hooks. Nothing in this
//! crate reads process-wide statics, so several simulated nodes can live in a
//! single test process.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::coll::types::{ParticipantSet, ProcId};
use crate::config::FenceConfig;
use crate::error::{Error, Result};
use crate::metrics::FenceMetrics;

/// Job-wide node index, carried as the sender field of every wire header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Raw index.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(v: u32) -> Self {
        NodeId(v)
    }
}

// ============================================================================
// Job layout
// ============================================================================

/// Read-only view of the job's rank-to-node placement.
///
/// Implemented by the embedding launcher. All methods are queried on demand,
/// mostly while a collective is first constructed.
pub trait JobLayout: Send + Sync {
    /// Node hosting `proc`. Wildcard ranks are not resolved here.
    fn resolve(&self, proc: &ProcId) -> Option<NodeId>;

    /// Every node running at least one rank of `namespace`.
    fn namespace_nodes(&self, namespace: &str) -> Vec<NodeId>;

    /// Number of ranks placed on `node` (all namespaces).
    fn local_rank_count(&self, node: NodeId) -> usize;

    /// Node id registered for `hostname`.
    fn node_id(&self, hostname: &str) -> Option<NodeId>;

    /// Hostname registered for `node`.
    fn hostname(&self, node: NodeId) -> Option<String>;

    /// Address used to dial `node` for direct connections.
    ///
    /// The default resolves the node's hostname through the system resolver.
    fn direct_addr(&self, node: NodeId) -> Option<IpAddr> {
        let host = self.hostname(node)?;
        (host.as_str(), 0)
            .to_socket_addrs()
            .ok()?
            .next()
            .map(|addr| addr.ip())
    }

    /// Participating nodes of `set`, sorted ascending and de-duplicated.
    ///
    /// The position of a node in this list is its tree index.
    fn hostlist_for(&self, set: &ParticipantSet) -> Result<Vec<NodeId>> {
        let mut nodes = BTreeSet::new();
        for proc in set.iter() {
            if proc.is_wildcard() {
                let ns_nodes = self.namespace_nodes(&proc.namespace);
                if ns_nodes.is_empty() {
                    return Err(Error::Topology(format!(
                        "namespace {} has no nodes",
                        proc.namespace
                    )));
                }
                nodes.extend(ns_nodes);
            } else {
                let node = self
                    .resolve(proc)
                    .ok_or_else(|| Error::Topology(format!("cannot resolve {}", proc)))?;
                nodes.insert(node);
            }
        }
        if nodes.is_empty() {
            return Err(Error::Topology("empty participant set".into()));
        }
        Ok(nodes.into_iter().collect())
    }
}

/// Table-driven [`JobLayout`] for tests and the simulator.
#[derive(Clone, Debug, Default)]
pub struct StaticLayout {
    hosts: Vec<(String, Option<IpAddr>)>,
    by_name: HashMap<String, NodeId>,
    placement: HashMap<ProcId, NodeId>,
}

impl StaticLayout {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host; node ids are assigned in registration order.
    pub fn add_host(&mut self, hostname: impl Into<String>, addr: Option<IpAddr>) -> NodeId {
        let hostname = hostname.into();
        if let Some(&existing) = self.by_name.get(&hostname) {
            return existing;
        }
        let id = NodeId(self.hosts.len() as u32);
        self.by_name.insert(hostname.clone(), id);
        self.hosts.push((hostname, addr));
        id
    }

    /// Place `proc` on `node`.
    pub fn place(&mut self, proc: ProcId, node: NodeId) {
        self.placement.insert(proc, node);
    }

    /// `nodes` localhost hosts named `node{i}`, rank `i` of `namespace` on each.
    pub fn localhost(namespace: &str, nodes: usize) -> Self {
        let mut layout = Self::new();
        let loopback = IpAddr::from([127, 0, 0, 1]);
        for i in 0..nodes {
            let id = layout.add_host(format!("node{}", i), Some(loopback));
            layout.place(ProcId::new(namespace, i as u32), id);
        }
        layout
    }

    /// Number of registered hosts.
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

impl JobLayout for StaticLayout {
    fn resolve(&self, proc: &ProcId) -> Option<NodeId> {
        self.placement.get(proc).copied()
    }

    fn namespace_nodes(&self, namespace: &str) -> Vec<NodeId> {
        let set: BTreeSet<NodeId> = self
            .placement
            .iter()
            .filter(|(proc, _)| proc.namespace == namespace)
            .map(|(_, node)| *node)
            .collect();
        set.into_iter().collect()
    }

    fn local_rank_count(&self, node: NodeId) -> usize {
        self.placement.values().filter(|n| **n == node).count()
    }

    fn node_id(&self, hostname: &str) -> Option<NodeId> {
        self.by_name.get(hostname).copied()
    }

    fn hostname(&self, node: NodeId) -> Option<String> {
        self.hosts.get(node.0 as usize).map(|(name, _)| name.clone())
    }

    fn direct_addr(&self, node: NodeId) -> Option<IpAddr> {
        let (name, addr) = self.hosts.get(node.0 as usize)?;
        if addr.is_some() {
            return *addr;
        }
        (name.as_str(), 0)
            .to_socket_addrs()
            .ok()?
            .next()
            .map(|a| a.ip())
    }
}

// ============================================================================
// Job control
// ============================================================================

/// Hooks back into the launcher's step management.
pub trait JobControl: Send + Sync {
    /// Abort the current job step after an unrecoverable protocol violation.
    fn abort_step(&self, reason: &str);
}

/// [`JobControl`] that only logs the abort request.
#[derive(Debug, Default)]
pub struct LogOnlyControl;

impl JobControl for LogOnlyControl {
    fn abort_step(&self, reason: &str) {
        log::error!("[agent] job step abort requested: {}", reason);
    }
}

// ============================================================================
// Node context
// ============================================================================

/// Identity and collaborators of the local node.
pub struct NodeContext {
    /// Local node id
    pub node_id: NodeId,
    /// Local hostname
    pub hostname: String,
    /// Agent configuration
    pub config: FenceConfig,
    /// Rank placement
    pub layout: Arc<dyn JobLayout>,
    /// Step control
    pub control: Arc<dyn JobControl>,
    /// Shared counters
    pub metrics: Arc<FenceMetrics>,
}

impl NodeContext {
    /// Build the context for `hostname`, validating the configuration.
    pub fn new(
        hostname: impl Into<String>,
        config: FenceConfig,
        layout: Arc<dyn JobLayout>,
        control: Arc<dyn JobControl>,
    ) -> Result<Self> {
        config.validate()?;
        let hostname = hostname.into();
        let node_id = layout
            .node_id(&hostname)
            .ok_or_else(|| Error::Topology(format!("host {} not in job layout", hostname)))?;
        Ok(Self {
            node_id,
            hostname,
            config,
            layout,
            control,
            metrics: Arc::new(FenceMetrics::new()),
        })
    }

    /// Hostname of `node`, or its numeric id when the layout does not know it.
    pub fn host_label(&self, node: NodeId) -> String {
        self.layout
            .hostname(node)
            .unwrap_or_else(|| format!("node#{}", node))
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("hostname", &self.hostname)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_namespaces() -> StaticLayout {
        let mut layout = StaticLayout::new();
        let a = layout.add_host("alpha", None);
        let b = layout.add_host("beta", None);
        let c = layout.add_host("gamma", None);
        layout.place(ProcId::new("job1", 0), c);
        layout.place(ProcId::new("job1", 1), a);
        layout.place(ProcId::new("job1", 2), a);
        layout.place(ProcId::new("job2", 0), b);
        layout
    }

    #[test]
    fn test_hostlist_sorted_and_deduplicated() {
        let layout = two_namespaces();
        let set = ParticipantSet::new(vec![
            ProcId::new("job1", 0),
            ProcId::new("job1", 1),
            ProcId::new("job1", 2),
        ]);
        let hosts = layout.hostlist_for(&set).expect("hostlist");
        assert_eq!(hosts, vec![NodeId(0), NodeId(2)]);
    }

    #[test]
    fn test_wildcard_expands_namespace() {
        let layout = two_namespaces();
        let set = ParticipantSet::new(vec![ProcId::wildcard("job1"), ProcId::new("job2", 0)]);
        let hosts = layout.hostlist_for(&set).expect("hostlist");
        assert_eq!(hosts, vec![NodeId(0), NodeId(1), NodeId(2)]);
    }

    #[test]
    fn test_unresolvable_rank_is_topology_error() {
        let layout = two_namespaces();
        let set = ParticipantSet::new(vec![ProcId::new("job1", 42)]);
        assert!(matches!(layout.hostlist_for(&set), Err(Error::Topology(_))));
    }

    #[test]
    fn test_local_rank_count() {
        let layout = two_namespaces();
        assert_eq!(layout.local_rank_count(NodeId(0)), 2);
        assert_eq!(layout.local_rank_count(NodeId(1)), 1);
    }

    #[test]
    fn test_context_requires_known_host() {
        let layout: Arc<dyn JobLayout> = Arc::new(StaticLayout::localhost("sim", 2));
        let control: Arc<dyn JobControl> = Arc::new(LogOnlyControl);
        let ctx = NodeContext::new("node1", FenceConfig::default(), layout.clone(), control.clone())
            .expect("context");
        assert_eq!(ctx.node_id, NodeId(1));

        let missing = NodeContext::new("node9", FenceConfig::default(), layout, control);
        assert!(matches!(missing, Err(Error::Topology(_))));
    }
}
