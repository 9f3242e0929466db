// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared harness: N in-process agents on one loopback control plane.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use treefence::transport::loopback::Pending;
use treefence::{
    ControlPlane, DeliveryMode, FenceAgent, FenceConfig, FenceError, JobControl, JobLayout,
    LoopbackNetwork, NodeContext, ParticipantSet, StaticLayout,
};

/// Namespace every simulated rank lives in.
pub const NS: &str = "job";

pub type Outcome = Result<Vec<u8>, FenceError>;

/// Step control that records abort requests instead of killing anything.
#[derive(Default)]
pub struct RecordingControl {
    aborts: Mutex<Vec<String>>,
}

impl RecordingControl {
    pub fn aborts(&self) -> Vec<String> {
        self.aborts.lock().clone()
    }
}

impl JobControl for RecordingControl {
    fn abort_step(&self, reason: &str) {
        self.aborts.lock().push(reason.to_string());
    }
}

/// Per-node callback results.
#[derive(Default)]
pub struct Results {
    by_node: Mutex<Vec<Vec<Outcome>>>,
}

impl Results {
    pub fn new(nodes: usize) -> Arc<Self> {
        Arc::new(Self {
            by_node: Mutex::new(vec![Vec::new(); nodes]),
        })
    }

    pub fn push(&self, node: usize, outcome: Outcome) {
        self.by_node.lock()[node].push(outcome);
    }

    pub fn of(&self, node: usize) -> Vec<Outcome> {
        self.by_node.lock()[node].clone()
    }

    pub fn count(&self) -> usize {
        self.by_node.lock().iter().map(Vec::len).sum()
    }
}

pub struct Cluster {
    pub net: Arc<LoopbackNetwork>,
    pub agents: Vec<Arc<FenceAgent>>,
    pub control: Arc<RecordingControl>,
    pub results: Arc<Results>,
    pub set: ParticipantSet,
}

impl Cluster {
    /// `nodes` agents, one rank each, direct connections off.
    pub fn new(nodes: usize, width: u32, mode: DeliveryMode) -> Self {
        Self::with_config(nodes, mode, FenceConfig::default().with_tree_width(width))
    }

    pub fn with_config(nodes: usize, mode: DeliveryMode, config: FenceConfig) -> Self {
        let net = LoopbackNetwork::new(mode);
        let layout: Arc<dyn JobLayout> = Arc::new(StaticLayout::localhost(NS, nodes));
        let control = Arc::new(RecordingControl::default());
        let config = config
            .with_direct_conn(false)
            .with_retries(2, Duration::from_millis(1));

        let agents = (0..nodes)
            .map(|i| {
                let host = format!("node{}", i);
                let ctx = NodeContext::new(
                    host.as_str(),
                    config.clone(),
                    layout.clone(),
                    control.clone() as Arc<dyn JobControl>,
                )
                .expect("node context");
                let plane: Arc<dyn ControlPlane> = net.clone();
                let agent = FenceAgent::launch(ctx, plane).expect("agent");
                net.attach(host, agent.sink());
                agent
            })
            .collect();

        Self {
            net,
            agents,
            control,
            results: Results::new(nodes),
            set: ParticipantSet::ranks(NS, nodes as u32),
        }
    }

    /// Local contribution of `node`; its outcome lands in `results`.
    pub fn contribute(&self, node: usize, data: &[u8]) {
        let results = self.results.clone();
        self.agents[node]
            .begin_fence(&self.set, data, move |r| results.push(node, r))
            .expect("begin_fence");
    }

    /// Deliver queued messages FIFO until quiet; returns everything delivered.
    pub fn drain(&self) -> Vec<Pending> {
        let mut seen = Vec::new();
        loop {
            let batch = self.net.take_pending();
            if batch.is_empty() {
                return seen;
            }
            for msg in batch {
                self.net.deliver(&msg.host, &msg.bytes);
                seen.push(msg);
            }
        }
    }

    pub fn reap_all(&self, now: Instant) -> usize {
        self.agents.iter().map(|a| a.reap_timeouts(now)).sum()
    }

    pub fn shutdown(&self) {
        for agent in &self.agents {
            agent.shutdown();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Payload unique to `node` and `round`.
pub fn payload(node: usize, round: usize) -> Vec<u8> {
    format!("<n{}r{}>", node, round).into_bytes()
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
