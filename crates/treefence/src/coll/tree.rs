// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-holding wrapper around one collective instance.
//!
//! [`TreeCollective`] owns a [`CollState`] behind its own mutex and executes
//! the actions the state machine emits only after the lock is released.
//! Indirect sends complete inline, so a completion re-entering the
//! collective from inside `execute` finds the lock free.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use super::state::{Action, CollSnapshot, CollState, ContribStatus, FenceCallback};
use super::topology::TreeTopology;
use super::types::CollKey;
use crate::context::{NodeContext, NodeId};
use crate::error::{Error, Result};
use crate::metrics::FenceMetrics;
use crate::transport::{Completion, SendStatus, TransportAdapter};

/// Direction of a tracked send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Leg {
    Up,
    Down,
}

/// One participant set's long-lived fence coordinator on this node.
pub struct TreeCollective {
    key: CollKey,
    digest: u64,
    ctx: Arc<NodeContext>,
    transport: Arc<TransportAdapter>,
    state: Mutex<CollState>,
    self_ref: Weak<TreeCollective>,
}

impl TreeCollective {
    /// Build the instance for `key`, resolving its tree position.
    ///
    /// Fails with [`Error::Topology`] when a participant cannot be placed and
    /// with [`Error::NotParticipant`] when this node hosts none of them.
    pub fn new(
        key: CollKey,
        ctx: Arc<NodeContext>,
        transport: Arc<TransportAdapter>,
    ) -> Result<Arc<Self>> {
        let hosts = ctx.layout.hostlist_for(&key.participants)?;
        if !hosts.contains(&ctx.node_id) {
            return Err(Error::NotParticipant(ctx.hostname.clone()));
        }
        let topology = TreeTopology::new(hosts, ctx.config.tree_width, ctx.node_id)?;
        log::debug!(
            "[coll] {} created: {} hosts, parent={:?}, children={:?}",
            key,
            topology.hosts().len(),
            topology.parent(),
            topology.children()
        );
        let state = CollState::new(&key, topology, ctx.node_id, ctx.config.direct_conn);
        let digest = key.digest();
        Ok(Arc::new_cyclic(|self_ref| Self {
            key,
            digest,
            ctx,
            transport,
            state: Mutex::new(state),
            self_ref: self_ref.clone(),
        }))
    }

    /// Collective key.
    pub fn key(&self) -> &CollKey {
        &self.key
    }

    /// Current generation.
    pub fn seq(&self) -> u32 {
        self.state.lock().seq()
    }

    /// Diagnostic copy of the current state.
    pub fn snapshot(&self) -> CollSnapshot {
        self.state.lock().snapshot()
    }

    /// Tree neighbourhood of this node.
    pub fn topology(&self) -> TreeTopology {
        self.state.lock().topology().clone()
    }

    fn metrics(&self) -> &FenceMetrics {
        &self.ctx.metrics
    }

    // ========================================================================
    // Contributions
    // ========================================================================

    /// Contribute local data for the next generation; returns the generation joined.
    ///
    /// `callback` fires exactly once when the call succeeds. When it fails
    /// the callback is dropped unused.
    pub fn contribute_local(&self, data: &[u8], callback: FenceCallback) -> Result<u32> {
        let mut out = Vec::new();
        let joined = {
            let mut state = self.state.lock();
            let joined = state.contribute_local(data, Some(callback), Instant::now(), &mut out)?;
            log::debug!(
                "[coll] {:016x} seq={} local contribution ({} bytes), phase {}",
                self.digest,
                joined,
                data.len(),
                state.phase()
            );
            joined
        };
        self.execute(out);
        Ok(joined)
    }

    /// FAN-IN from `sender` carrying generation `seq`.
    pub fn on_fan_in(&self, sender: NodeId, seq: u32, data: &[u8]) -> Result<ContribStatus> {
        let mut out = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let before = state.snapshot();
            let result = state.contribute_from_child(sender, seq, data, Instant::now(), &mut out);
            self.note(&state, &before, "FAN-IN", sender, seq, &result);
            result
        };
        self.execute(out);
        result
    }

    /// FAN-OUT from `sender` carrying generation `seq`.
    pub fn on_fan_out(&self, sender: NodeId, seq: u32, data: &[u8]) -> Result<ContribStatus> {
        let mut out = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let before = state.snapshot();
            let result = state.contribute_from_parent(sender, seq, data, &mut out);
            self.note(&state, &before, "FAN-OUT", sender, seq, &result);
            result
        };
        self.execute(out);
        result
    }

    fn note(
        &self,
        state: &CollState,
        before: &CollSnapshot,
        kind: &str,
        sender: NodeId,
        seq: u32,
        result: &Result<ContribStatus>,
    ) {
        match result {
            Ok(ContribStatus::Accepted) => log::debug!(
                "[coll] {:016x} {} seq={} from node {} accepted, phase {}",
                self.digest,
                kind,
                seq,
                sender,
                state.phase()
            ),
            Ok(ContribStatus::Duplicate) => {
                self.metrics().record_duplicate();
                log::debug!(
                    "[coll] {:016x} duplicate {} seq={} from node {} dropped",
                    self.digest,
                    kind,
                    seq,
                    sender
                );
            }
            Ok(ContribStatus::Stale) => {
                self.metrics().record_stale();
                log::debug!(
                    "[coll] {:016x} stale {} seq={} from node {} dropped (now seq={})",
                    self.digest,
                    kind,
                    seq,
                    sender,
                    state.seq()
                );
            }
            Err(Error::ProtocolDesync { expected, got }) => {
                self.metrics().record_protocol_error();
                log::error!(
                    "[coll] {:016x} {} from node {} desynchronized: expected seq={}, got seq={}",
                    self.digest,
                    kind,
                    sender,
                    expected,
                    got
                );
                self.dump(before);
            }
            Err(e) => log::warn!(
                "[coll] {:016x} {} from node {} rejected: {}",
                self.digest,
                kind,
                sender,
                e
            ),
        }
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    /// Abandon the in-flight generation when it is older than the configured timeout.
    pub fn reap(&self, now: Instant) -> bool {
        let mut out = Vec::new();
        let expired = {
            let mut state = self.state.lock();
            let seq = state.seq();
            let snapshot = state.snapshot();
            let expired = state.check_timeout(now, self.ctx.config.timeout(), &mut out);
            if expired {
                self.metrics().record_timeout();
                log::error!(
                    "[coll] {:016x} seq={} timed out after {:?} in {}",
                    self.digest,
                    seq,
                    self.ctx.config.timeout(),
                    snapshot.phase
                );
                self.dump(&snapshot);
            }
            expired
        };
        self.execute(out);
        expired
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Dump the collective at error level.
    pub fn log_state(&self) {
        let snapshot = self.snapshot();
        self.dump(&snapshot);
    }

    fn dump(&self, s: &CollSnapshot) {
        log::error!("[coll] {} on {}:", self.key, self.ctx.hostname);
        log::error!("[coll]   seq={} phase={} upward_send={:?}", s.seq, s.phase, s.upward_send);
        log::error!(
            "[coll]   local={} children={}/{} parent={}",
            s.contrib_local,
            s.children_contributed,
            s.children_expected,
            s.contrib_parent
        );
        log::error!(
            "[coll]   downward={}/{} upward_len={} downward_len={} callback={}",
            s.downward_done,
            s.downward_expected,
            s.upward_len,
            s.downward_len,
            s.callback_pending
        );
    }

    // ========================================================================
    // Action execution
    // ========================================================================

    fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SendUp { parent, seq, frame } => {
                    self.metrics().record_upward(frame.payload().len());
                    log::trace!(
                        "[coll] {:016x} seq={} FAN-IN to node {} ({} bytes)",
                        self.digest,
                        seq,
                        parent,
                        frame.len()
                    );
                    self.transport
                        .send(&[parent], &frame, self.completion(Leg::Up, seq));
                }
                Action::SendDown { to, seq, frame } => {
                    self.metrics().record_downward(frame.payload().len());
                    log::trace!(
                        "[coll] {:016x} seq={} FAN-OUT to {:?} ({} bytes)",
                        self.digest,
                        seq,
                        to,
                        frame.len()
                    );
                    self.transport
                        .send(&to, &frame, self.completion(Leg::Down, seq));
                }
                Action::Deliver { callback, data } => {
                    self.metrics().record_fence_completed();
                    callback(Ok(data));
                }
                Action::Notify { callback, error } => {
                    self.metrics().record_fence_failed();
                    log::error!("[coll] {:016x} local fence failed: {}", self.digest, error);
                    callback(Err(error));
                }
                Action::AbortStep { reason } => self.ctx.control.abort_step(&reason),
            }
        }
    }

    fn completion(&self, leg: Leg, seq: u32) -> Completion {
        let weak = self.self_ref.clone();
        Completion::new(move |status, context| {
            if let Some(this) = weak.upgrade() {
                this.metrics().record_completion(context);
                this.on_send_complete(leg, seq, status);
            }
        })
    }

    fn on_send_complete(&self, leg: Leg, seq: u32, status: SendStatus) {
        let ok = status.is_success();
        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            let handled = match leg {
                Leg::Up => state.upward_complete(seq, ok, &mut out),
                Leg::Down => state.downward_complete(seq, ok, &mut out),
            };
            if !handled {
                log::trace!(
                    "[coll] {:016x} late {:?} completion for seq={} ignored",
                    self.digest,
                    leg,
                    seq
                );
            } else if !ok {
                log::error!(
                    "[coll] {:016x} {:?} send for seq={} failed, generation abandoned",
                    self.digest,
                    leg,
                    seq
                );
            }
        }
        self.execute(out);
    }
}

impl fmt::Debug for TreeCollective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeCollective")
            .field("key", &self.key)
            .field("node", &self.ctx.node_id)
            .finish_non_exhaustive()
    }
}
