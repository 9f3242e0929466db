// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # treefence - Tree-structured fence collectives
//!
//! A fence is a barrier with data exchange: every participating rank
//! contributes a blob, and once all have contributed every rank receives the
//! concatenation. `treefence` runs inside the per-node agent of a job
//! launcher and coordinates fences between nodes over a k-ary reduction tree.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use treefence::{
//!     DeliveryMode, FenceAgent, FenceConfig, LogOnlyControl, LoopbackNetwork, NodeContext,
//!     ParticipantSet, Result, StaticLayout,
//! };
//!
//! fn main() -> Result<()> {
//!     let net = LoopbackNetwork::new(DeliveryMode::Immediate);
//!     let layout = Arc::new(StaticLayout::localhost("job", 1));
//!     let config = FenceConfig::default().with_tree_width(8);
//!     let ctx = NodeContext::new("node0", config, layout, Arc::new(LogOnlyControl))?;
//!
//!     let agent = FenceAgent::launch(ctx, net.clone())?;
//!     net.attach("node0", agent.sink());
//!
//!     agent.begin_fence(&ParticipantSet::ranks("job", 1), b"my data", |result| {
//!         println!("aggregate: {:?}", result);
//!     })?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                            FenceAgent                               |
//! |   begin_fence | on_wire_message | on_control_message | reaper      |
//! +---------------------------------------------------------------------+
//! |                         Collective layer                            |
//! |   CollectiveRegistry -> TreeCollective (lock) -> CollState (pure)   |
//! +---------------------------------------------------------------------+
//! |                         Transport layer                             |
//! |   TransportAdapter: indirect (ControlPlane) | direct (mio reactor)  |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Round flow
//!
//! 1. Contributions gather at every node until the local rank and all
//!    children have contributed (FAN-IN).
//! 2. Each node forwards its aggregate to its parent; the root holds the
//!    full aggregate.
//! 3. The aggregate travels back down (FAN-OUT) and is delivered to every
//!    local caller.
//!
//! ## Modules Overview
//!
//! - [`agent`] - per-node facade (start here)
//! - [`coll`] - topology, buffers and the fence state machine
//! - [`transport`] - indirect and direct send paths
//! - [`protocol`] - wire header and framing
//! - [`config`] - tunables, JSON files and env overrides

/// Per-node fence agent.
pub mod agent;
/// Tree collectives (topology, buffers, state machine, registry).
pub mod coll;
/// Agent configuration.
pub mod config;
/// Node identity, job layout and step control.
pub mod context;
/// Error types.
pub mod error;
/// Atomic counters.
pub mod metrics;
/// Wire header, envelope and framing.
pub mod protocol;
/// Indirect, direct and loopback transports.
pub mod transport;

pub use agent::{FenceAgent, FenceHandle};
pub use coll::{
    CollKey, CollSnapshot, CollType, ContribStatus, ParticipantSet, Phase, ProcId, TreeTopology,
    RANK_WILDCARD,
};
pub use config::FenceConfig;
pub use context::{JobControl, JobLayout, LogOnlyControl, NodeContext, NodeId, StaticLayout};
pub use error::{Error, FenceError, Result};
pub use metrics::{FenceMetrics, MetricsSnapshot};
pub use protocol::{MessageHeader, MsgType};
pub use transport::{
    Completion, CompletionContext, ControlPlane, DeliveryMode, Fault, LinkState, LoopbackNetwork,
    MessageSink, SendStatus,
};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
