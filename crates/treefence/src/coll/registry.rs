// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Collective instances keyed by participant set.
//!
//! Instances are created lazily, either by the first local `begin_fence` or
//! by the first wire message naming the set, and live until the agent stops.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use super::tree::TreeCollective;
use super::types::CollKey;
use crate::context::NodeContext;
use crate::error::Result;
use crate::transport::TransportAdapter;

/// Per-agent table of collective instances.
pub struct CollectiveRegistry {
    ctx: Arc<NodeContext>,
    transport: Arc<TransportAdapter>,
    collectives: DashMap<CollKey, Arc<TreeCollective>>,
}

impl CollectiveRegistry {
    /// Empty registry.
    pub fn new(ctx: Arc<NodeContext>, transport: Arc<TransportAdapter>) -> Self {
        Self {
            ctx,
            transport,
            collectives: DashMap::new(),
        }
    }

    /// Existing instance for `key`.
    pub fn get(&self, key: &CollKey) -> Option<Arc<TreeCollective>> {
        self.collectives.get(key).map(|r| r.value().clone())
    }

    /// Instance for `key`, created on first use.
    ///
    /// Construction failures are not cached; a later call retries.
    pub fn get_or_create(&self, key: &CollKey) -> Result<Arc<TreeCollective>> {
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }
        let created = TreeCollective::new(key.clone(), self.ctx.clone(), self.transport.clone())?;
        let coll = self
            .collectives
            .entry(key.clone())
            .or_insert(created)
            .value()
            .clone();
        Ok(coll)
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.collectives.len()
    }

    /// Whether no instance exists yet.
    pub fn is_empty(&self) -> bool {
        self.collectives.is_empty()
    }

    /// Snapshot of every instance.
    pub fn all(&self) -> Vec<Arc<TreeCollective>> {
        self.collectives.iter().map(|r| r.value().clone()).collect()
    }

    /// Run the timeout check on every instance; returns how many expired.
    pub fn reap_timeouts(&self, now: Instant) -> usize {
        // Callbacks may re-enter the registry, so no map guard is held here.
        self.all()
            .into_iter()
            .filter(|coll| coll.reap(now))
            .count()
    }
}

impl std::fmt::Debug for CollectiveRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectiveRegistry")
            .field("node", &self.ctx.node_id)
            .field("collectives", &self.collectives.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coll::types::{ParticipantSet, ProcId};
    use crate::config::FenceConfig;
    use crate::context::{JobControl, JobLayout, LogOnlyControl, StaticLayout};
    use crate::error::Error;
    use crate::transport::{ControlPlane, DeliveryMode, LoopbackNetwork};

    fn registry() -> CollectiveRegistry {
        let layout: Arc<dyn JobLayout> = Arc::new(StaticLayout::localhost("t", 4));
        let control: Arc<dyn JobControl> = Arc::new(LogOnlyControl);
        let ctx = Arc::new(
            NodeContext::new("node0", FenceConfig::default(), layout, control).expect("ctx"),
        );
        let plane: Arc<dyn ControlPlane> = LoopbackNetwork::new(DeliveryMode::Queued);
        let transport = Arc::new(TransportAdapter::new(ctx.clone(), plane, None));
        CollectiveRegistry::new(ctx, transport)
    }

    #[test]
    fn test_same_set_same_instance() {
        let reg = registry();
        let a = reg
            .get_or_create(&CollKey::fence(ParticipantSet::ranks("t", 4)))
            .expect("create");
        let b = reg
            .get_or_create(&CollKey::fence(ParticipantSet::ranks("t", 4)))
            .expect("lookup");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);

        reg.get_or_create(&CollKey::fence(ParticipantSet::ranks("t", 2)))
            .expect("second set");
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_unresolvable_set_not_cached() {
        let reg = registry();
        let key = CollKey::fence(ParticipantSet::new(vec![
            ProcId::new("t", 0),
            ProcId::new("t", 42),
        ]));
        let err = reg.get_or_create(&key).expect_err("rank 42 unplaced");
        assert!(matches!(err, Error::Topology(_)));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_reap_idle_is_noop() {
        let reg = registry();
        reg.get_or_create(&CollKey::fence(ParticipantSet::ranks("t", 4)))
            .expect("create");
        let far = Instant::now() + std::time::Duration::from_secs(3600);
        assert_eq!(reg.reap_timeouts(far), 0);
    }
}
