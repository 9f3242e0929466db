// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tree collectives.
//!
//! - [`types`]: participants and collective keys
//! - [`topology`]: k-ary tree placement of the participating hosts
//! - [`buffer`]: contribution buffers with a reserved header region
//! - [`state`]: the pure fence state machine
//! - [`tree`]: lock + action execution around one state machine
//! - [`registry`]: instances keyed by participant set

pub mod buffer;
pub mod registry;
pub mod state;
pub mod topology;
pub mod tree;
pub mod types;

pub use buffer::{decode_preamble, encode_preamble, ContributionBuffer};
pub use registry::CollectiveRegistry;
pub use state::{
    Action, CollSnapshot, CollState, ContribStatus, FenceCallback, Phase, SendState,
};
pub use topology::{TreePosition, TreeTopology};
pub use tree::TreeCollective;
pub use types::{CollKey, CollType, ParticipantSet, ProcId, RANK_WILDCARD};
