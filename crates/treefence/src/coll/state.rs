// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Collective state machine.
//!
//! [`CollState`] is pure: it never sends, sleeps or calls user code. Every
//! operation appends [`Action`]s to an outbox that the owner executes after
//! releasing its lock. Time is passed in explicitly.
//!
//! ```text
//!   SYNC --contribution--> COLLECT --local + all children--> UPWARD_FORWARD
//!     ^                       ^                                    |
//!     |                       |            upward done + parent reply (root: immediate)
//!     |                       |                                    v
//!     +---- all sends done ---+------ all sends done ------- DOWNWARD_FORWARD
//!       (no next-gen data)          (next-gen data queued)
//! ```
//!
//! Once the upward send of a generation has completed (immediately at the
//! root) its aggregate lives in the stamped frame or the downward buffer, so
//! the upward accumulators already belong to the next generation (`seq + 1`)
//! for the rest of UPWARD_FORWARD and all of DOWNWARD_FORWARD.

use std::fmt;
use std::time::{Duration, Instant};

use super::buffer::ContributionBuffer;
use super::topology::TreeTopology;
use super::types::CollKey;
use crate::context::NodeId;
use crate::error::{Error, FenceError, Result};
use crate::protocol::{Frame, MsgType};

/// Completion callback of one local fence call.
pub type FenceCallback =
    Box<dyn FnOnce(core::result::Result<Vec<u8>, FenceError>) + Send + 'static>;

/// Collective phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Idle, no pending data
    Sync,
    /// Accepting local and child contributions
    Collect,
    /// Aggregate sent upward; waiting for completion and the parent's reply
    UpwardForward,
    /// Aggregate delivered and relayed downward; waiting for send completions
    DownwardForward,
}

impl Phase {
    /// Name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Phase::Sync => "SYNC",
            Phase::Collect => "COLLECT",
            Phase::UpwardForward => "UPWARD_FORWARD",
            Phase::DownwardForward => "DOWNWARD_FORWARD",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State of the upward send of the current generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendState {
    /// Nothing sent
    None,
    /// Handed to the transport
    Active,
    /// Completed (synthetic at the root)
    Done,
    /// Transport reported failure
    Failed,
}

/// Result of a contribution that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContribStatus {
    /// Stored; may have triggered transitions
    Accepted,
    /// Repeat of an already stored contribution, dropped
    Duplicate,
    /// Retransmission from a finished generation, dropped
    Stale,
}

/// Side effect requested by the state machine.
pub enum Action {
    /// Send the upward aggregate to the parent.
    SendUp {
        /// Destination
        parent: NodeId,
        /// Generation
        seq: u32,
        /// Stamped FAN-IN frame
        frame: Frame,
    },
    /// Send the downward aggregate to one child or, at the root without
    /// direct connections, to the whole subtree at once.
    SendDown {
        /// Destinations
        to: Vec<NodeId>,
        /// Generation
        seq: u32,
        /// Stamped FAN-OUT frame
        frame: Frame,
    },
    /// Hand the aggregate to the local caller.
    Deliver {
        /// Caller's callback
        callback: FenceCallback,
        /// Aggregated contribution data
        data: Vec<u8>,
    },
    /// Report a failed generation to the local caller.
    Notify {
        /// Caller's callback
        callback: FenceCallback,
        /// Failure reason
        error: FenceError,
    },
    /// Ask the launcher to abort the job step.
    AbortStep {
        /// Human-readable reason
        reason: String,
    },
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::SendUp { parent, seq, frame } => f
                .debug_struct("SendUp")
                .field("parent", parent)
                .field("seq", seq)
                .field("len", &frame.len())
                .finish(),
            Action::SendDown { to, seq, frame } => f
                .debug_struct("SendDown")
                .field("to", to)
                .field("seq", seq)
                .field("len", &frame.len())
                .finish(),
            Action::Deliver { data, .. } => {
                f.debug_struct("Deliver").field("len", &data.len()).finish()
            }
            Action::Notify { error, .. } => f.debug_struct("Notify").field("error", error).finish(),
            Action::AbortStep { reason } => {
                f.debug_struct("AbortStep").field("reason", reason).finish()
            }
        }
    }
}

/// Diagnostic copy of a collective's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollSnapshot {
    /// Current generation
    pub seq: u32,
    /// Current phase
    pub phase: Phase,
    /// Upward send state
    pub upward_send: SendState,
    /// Local data contributed to the accumulating generation
    pub contrib_local: bool,
    /// Children that contributed to the accumulating generation
    pub children_contributed: usize,
    /// Direct children
    pub children_expected: usize,
    /// Parent reply received for the current generation
    pub contrib_parent: bool,
    /// Downward completions observed (local delivery included)
    pub downward_done: usize,
    /// Downward completions expected (local delivery included)
    pub downward_expected: usize,
    /// Upward contribution data size
    pub upward_len: usize,
    /// Downward contribution data size
    pub downward_len: usize,
    /// A local callback is registered
    pub callback_pending: bool,
}

/// Per-instance protocol state.
pub struct CollState {
    local: NodeId,
    topology: TreeTopology,
    direct: bool,

    seq: u32,
    phase: Phase,
    started: Option<Instant>,

    // Upward accumulators; next generation while in DOWNWARD_FORWARD
    contrib_local: bool,
    contrib_children: Vec<bool>,
    contrib_child_cnt: usize,
    upward: ContributionBuffer,
    upward_send: SendState,
    next_started: Option<Instant>,

    // Downward
    contrib_parent: bool,
    downward: ContributionBuffer,
    downward_expected: usize,
    downward_done: usize,

    callback: Option<FenceCallback>,
}

impl CollState {
    /// Fresh state at generation 0.
    ///
    /// `direct` selects per-child downward relays (and the parent as the
    /// expected FAN-OUT sender) instead of one root-to-subtree send.
    pub fn new(key: &CollKey, topology: TreeTopology, local: NodeId, direct: bool) -> Self {
        let children = topology.child_count();
        Self {
            local,
            topology,
            direct,
            seq: 0,
            phase: Phase::Sync,
            started: None,
            contrib_local: false,
            contrib_children: vec![false; children],
            contrib_child_cnt: 0,
            upward: ContributionBuffer::new(key),
            upward_send: SendState::None,
            next_started: None,
            contrib_parent: false,
            downward: ContributionBuffer::new(key),
            downward_expected: 0,
            downward_done: 0,
            callback: None,
        }
    }

    /// Current generation.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Tree seen from this node.
    pub fn topology(&self) -> &TreeTopology {
        &self.topology
    }

    /// Node allowed to send FAN-OUT messages here.
    pub fn downward_source(&self) -> Option<NodeId> {
        if self.topology.is_root() {
            None
        } else if self.direct {
            self.topology.parent()
        } else {
            Some(self.topology.root())
        }
    }

    /// Diagnostic copy.
    pub fn snapshot(&self) -> CollSnapshot {
        CollSnapshot {
            seq: self.seq,
            phase: self.phase,
            upward_send: self.upward_send,
            contrib_local: self.contrib_local,
            children_contributed: self.contrib_child_cnt,
            children_expected: self.contrib_children.len(),
            contrib_parent: self.contrib_parent,
            downward_done: self.downward_done,
            downward_expected: self.downward_expected,
            upward_len: self.upward.data_len(),
            downward_len: self.downward.data_len(),
            callback_pending: self.callback.is_some(),
        }
    }

    // ========================================================================
    // Contributions
    // ========================================================================

    /// Contribute this node's local data; returns the generation joined.
    ///
    /// Accepted in SYNC and COLLECT, and in DOWNWARD_FORWARD as the start of
    /// the next generation. Rejected in UPWARD_FORWARD. On rejection the
    /// callback is dropped without being called.
    pub fn contribute_local(
        &mut self,
        data: &[u8],
        callback: Option<FenceCallback>,
        now: Instant,
        out: &mut Vec<Action>,
    ) -> Result<u32> {
        if self.phase == Phase::UpwardForward {
            return Err(Error::WrongPhase(self.phase.name()));
        }
        if self.contrib_local {
            return Err(Error::AlreadyContributed {
                seq: self.accumulating_seq(),
            });
        }
        let joined = self.accumulating_seq();
        self.mark_activity(now);
        self.upward.reserve(data.len());
        self.upward.append(data);
        self.contrib_local = true;
        self.callback = callback;
        self.progress(out);
        Ok(joined)
    }

    /// Contribution from a direct child.
    pub fn contribute_from_child(
        &mut self,
        node: NodeId,
        seq: u32,
        data: &[u8],
        now: Instant,
        out: &mut Vec<Action>,
    ) -> Result<ContribStatus> {
        let slot = self
            .topology
            .child_slot(node)
            .ok_or(Error::UnexpectedSender {
                node,
                kind: MsgType::FanIn.name(),
            })?;
        let expected = self.accumulating_seq();

        if seq == expected {
            if self.contrib_children[slot] {
                return Ok(ContribStatus::Duplicate);
            }
            self.mark_activity(now);
            self.contrib_children[slot] = true;
            self.contrib_child_cnt += 1;
            self.upward.reserve(data.len());
            self.upward.append(data);
            self.progress(out);
            return Ok(ContribStatus::Accepted);
        }
        if seq == expected.wrapping_sub(1) {
            return Ok(ContribStatus::Stale);
        }
        Err(self.desync(expected, seq, node, out))
    }

    /// Downward aggregate from the parent (or the root without direct connections).
    pub fn contribute_from_parent(
        &mut self,
        node: NodeId,
        seq: u32,
        data: &[u8],
        out: &mut Vec<Action>,
    ) -> Result<ContribStatus> {
        if self.downward_source() != Some(node) {
            return Err(Error::UnexpectedSender {
                node,
                kind: MsgType::FanOut.name(),
            });
        }
        let s = self.seq;
        match self.phase {
            Phase::UpwardForward if seq == s => {
                if self.contrib_parent {
                    return Ok(ContribStatus::Duplicate);
                }
                self.downward.reserve(data.len());
                self.downward.append(data);
                self.contrib_parent = true;
                self.progress(out);
                Ok(ContribStatus::Accepted)
            }
            Phase::DownwardForward if seq == s => Ok(ContribStatus::Duplicate),
            _ if seq == s.wrapping_sub(1) => Ok(ContribStatus::Stale),
            _ => Err(self.desync(s, seq, node, out)),
        }
    }

    // ========================================================================
    // Completions
    // ========================================================================

    /// Transport finished the upward send of generation `seq`.
    ///
    /// On success the upward accumulators are cleared for the next generation.
    ///
    /// Completions for other generations are ignored and reported as `false`.
    pub fn upward_complete(&mut self, seq: u32, ok: bool, out: &mut Vec<Action>) -> bool {
        if self.phase != Phase::UpwardForward
            || seq != self.seq
            || self.upward_send != SendState::Active
        {
            return false;
        }
        if ok {
            self.upward_send = SendState::Done;
            self.reset_accumulators();
            self.progress(out);
        } else {
            self.upward_send = SendState::Failed;
            self.abandon(FenceError::SendFailed, out);
        }
        true
    }

    /// Transport finished one downward send of generation `seq`.
    pub fn downward_complete(&mut self, seq: u32, ok: bool, out: &mut Vec<Action>) -> bool {
        if self.phase != Phase::DownwardForward || seq != self.seq {
            return false;
        }
        if ok {
            self.downward_done += 1;
            self.progress(out);
        } else {
            self.abandon(FenceError::SendFailed, out);
        }
        true
    }

    /// Abandon the in-flight generation if it started more than `timeout` before `now`.
    pub fn check_timeout(&mut self, now: Instant, timeout: Duration, out: &mut Vec<Action>) -> bool {
        if self.phase == Phase::Sync {
            return false;
        }
        let expired = self
            .started
            .map(|t| now.saturating_duration_since(t) > timeout)
            .unwrap_or(false);
        if expired {
            self.abandon(FenceError::Timeout, out);
        }
        expired
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Whether the upward accumulators hold the next generation.
    fn collecting_next(&self) -> bool {
        match self.phase {
            Phase::DownwardForward => true,
            Phase::UpwardForward => self.upward_send == SendState::Done,
            Phase::Sync | Phase::Collect => false,
        }
    }

    /// Generation the upward accumulators currently collect for.
    fn accumulating_seq(&self) -> u32 {
        if self.collecting_next() {
            self.seq.wrapping_add(1)
        } else {
            self.seq
        }
    }

    fn mark_activity(&mut self, now: Instant) {
        if self.phase == Phase::Sync {
            self.phase = Phase::Collect;
            self.started = Some(now);
        } else if self.collecting_next() {
            self.next_started.get_or_insert(now);
        }
    }

    fn progress(&mut self, out: &mut Vec<Action>) {
        loop {
            let advanced = match self.phase {
                Phase::Sync => false,
                Phase::Collect => {
                    let ready = self.contrib_local
                        && self.contrib_child_cnt == self.contrib_children.len();
                    if ready {
                        self.forward_up(out);
                    }
                    ready
                }
                Phase::UpwardForward => {
                    let ready = self.upward_send == SendState::Done && self.contrib_parent;
                    if ready {
                        self.forward_down(out);
                    }
                    ready
                }
                Phase::DownwardForward => {
                    let ready = self.downward_done >= self.downward_expected;
                    if ready {
                        self.finish_generation();
                    }
                    ready
                }
            };
            if !advanced {
                break;
            }
        }
    }

    fn forward_up(&mut self, out: &mut Vec<Action>) {
        self.phase = Phase::UpwardForward;
        match self.topology.parent() {
            None => {
                self.downward.reserve(self.upward.data_len());
                self.downward.append(self.upward.data());
                self.upward_send = SendState::Done;
                self.contrib_parent = true;
                self.reset_accumulators();
            }
            Some(parent) => {
                let frame = self.upward.stamp(MsgType::FanIn, self.seq, self.local);
                self.upward_send = SendState::Active;
                out.push(Action::SendUp {
                    parent,
                    seq: self.seq,
                    frame,
                });
            }
        }
    }

    fn forward_down(&mut self, out: &mut Vec<Action>) {
        self.phase = Phase::DownwardForward;
        let frame = self.downward.stamp(MsgType::FanOut, self.seq, self.local);

        let mut sends = 0;
        if self.direct {
            for child in self.topology.children() {
                out.push(Action::SendDown {
                    to: vec![child],
                    seq: self.seq,
                    frame: frame.clone(),
                });
                sends += 1;
            }
        } else if self.topology.is_root() && !self.topology.descendants().is_empty() {
            out.push(Action::SendDown {
                to: self.topology.descendants().to_vec(),
                seq: self.seq,
                frame: frame.clone(),
            });
            sends += 1;
        }

        // Local delivery is not gated on remote completions and counts as done.
        self.downward_expected = sends + 1;
        self.downward_done = 1;
        if let Some(callback) = self.callback.take() {
            out.push(Action::Deliver {
                callback,
                data: self.downward.data().to_vec(),
            });
        }

        // Accumulators were cleared when the upward send completed and may
        // already hold next-generation contributions.
        self.upward_send = SendState::None;
    }

    fn finish_generation(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        self.reset_downward();
        if self.contrib_local || self.contrib_child_cnt > 0 {
            self.phase = Phase::Collect;
            self.started = self.next_started.take();
        } else {
            self.phase = Phase::Sync;
            self.started = None;
            self.callback = None;
        }
    }

    fn desync(&mut self, expected: u32, got: u32, node: NodeId, out: &mut Vec<Action>) -> Error {
        out.push(Action::AbortStep {
            reason: format!(
                "collective desynchronized: node {} sent seq={} while seq={} was expected in {}",
                node, got, expected, self.phase
            ),
        });
        self.abandon(FenceError::ProtocolError, out);
        Error::ProtocolDesync { expected, got }
    }

    /// Drop the in-flight generation and move past it.
    ///
    /// Contributions already accepted for the next generation survive: the
    /// instance continues in COLLECT with them.
    fn abandon(&mut self, error: FenceError, out: &mut Vec<Action>) {
        if self.phase == Phase::Sync {
            return;
        }
        let next = self.collecting_next();
        // In DOWNWARD_FORWARD the abandoned generation was already delivered;
        // a registered callback belongs to the next one.
        if self.phase != Phase::DownwardForward {
            if let Some(callback) = self.callback.take() {
                out.push(Action::Notify { callback, error });
            }
        }
        self.reset_downward();
        self.upward_send = SendState::None;
        self.seq = self.seq.wrapping_add(1);

        if next && (self.contrib_local || self.contrib_child_cnt > 0) {
            self.phase = Phase::Collect;
            self.started = self.next_started.take();
            self.progress(out);
        } else {
            self.reset_accumulators();
            self.phase = Phase::Sync;
            self.started = None;
            self.callback = None;
        }
    }

    fn reset_accumulators(&mut self) {
        self.contrib_local = false;
        self.contrib_children.fill(false);
        self.contrib_child_cnt = 0;
        self.upward.reset();
        self.next_started = None;
    }

    fn reset_downward(&mut self) {
        self.contrib_parent = false;
        self.downward.reset();
        self.downward_expected = 0;
        self.downward_done = 0;
    }
}

impl fmt::Debug for CollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollState")
            .field("local", &self.local)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coll::types::ParticipantSet;
    use std::sync::{Arc, Mutex};

    type Outcomes = Arc<Mutex<Vec<core::result::Result<Vec<u8>, FenceError>>>>;

    fn key() -> CollKey {
        CollKey::fence(ParticipantSet::ranks("t", 4))
    }

    fn state(index: u32, direct: bool) -> CollState {
        let hosts = (0..4).map(NodeId).collect();
        let topo = TreeTopology::new(hosts, 2, NodeId(index)).expect("topology");
        CollState::new(&key(), topo, NodeId(index), direct)
    }

    fn recorder() -> (Outcomes, FenceCallback) {
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let cb: FenceCallback = Box::new(move |res| sink.lock().expect("lock").push(res));
        (outcomes, cb)
    }

    fn run(actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Deliver { callback, data } => callback(Ok(data)),
                Action::Notify { callback, error } => callback(Err(error)),
                _ => {}
            }
        }
    }

    #[test]
    fn test_node1_waits_for_child() {
        let mut st = state(1, true);
        let now = Instant::now();
        let mut out = Vec::new();
        st.contribute_local(b"L1", None, now, &mut out).expect("local");
        assert_eq!(st.phase(), Phase::Collect);
        assert!(out.is_empty());

        st.contribute_from_child(NodeId(3), 0, b"C3", now, &mut out)
            .expect("child");
        assert_eq!(st.phase(), Phase::UpwardForward);
        match &out[..] {
            [Action::SendUp { parent, seq, frame }] => {
                assert_eq!(*parent, NodeId(0));
                assert_eq!(*seq, 0);
                assert!(frame.payload().ends_with(b"L1C3"));
            }
            other => panic!("unexpected actions {:?}", other),
        }
    }

    #[test]
    fn test_single_node_completes_immediately() {
        let hosts = vec![NodeId(0)];
        let topo = TreeTopology::new(hosts, 16, NodeId(0)).expect("topology");
        let mut st = CollState::new(&key(), topo, NodeId(0), true);
        let (outcomes, cb) = recorder();
        let mut out = Vec::new();
        st.contribute_local(b"solo", Some(cb), Instant::now(), &mut out)
            .expect("local");
        run(out);
        assert_eq!(st.phase(), Phase::Sync);
        assert_eq!(st.seq(), 1);
        assert_eq!(outcomes.lock().expect("lock")[0], Ok(b"solo".to_vec()));
    }

    #[test]
    fn test_duplicate_child_counts_once() {
        let mut st = state(0, true);
        let now = Instant::now();
        let mut out = Vec::new();
        let first = st
            .contribute_from_child(NodeId(1), 0, b"A", now, &mut out)
            .expect("first");
        let second = st
            .contribute_from_child(NodeId(1), 0, b"A", now, &mut out)
            .expect("second");
        assert_eq!(first, ContribStatus::Accepted);
        assert_eq!(second, ContribStatus::Duplicate);
        assert_eq!(st.snapshot().children_contributed, 1);
        assert_eq!(st.snapshot().upward_len, 1);
    }

    #[test]
    fn test_local_rejections() {
        let mut st = state(1, true);
        let now = Instant::now();
        let mut out = Vec::new();
        st.contribute_local(b"x", None, now, &mut out).expect("local");
        assert!(matches!(
            st.contribute_local(b"y", None, now, &mut out),
            Err(Error::AlreadyContributed { seq: 0 })
        ));
        st.contribute_from_child(NodeId(3), 0, b"z", now, &mut out)
            .expect("child");
        assert!(matches!(
            st.contribute_local(b"y", None, now, &mut out),
            Err(Error::WrongPhase("UPWARD_FORWARD"))
        ));
    }

    #[test]
    fn test_parent_reply_before_upward_completion() {
        let mut st = state(2, true);
        let (outcomes, cb) = recorder();
        let mut out = Vec::new();
        st.contribute_local(b"L2", Some(cb), Instant::now(), &mut out)
            .expect("local");
        out.clear();

        let status = st
            .contribute_from_parent(NodeId(0), 0, b"AGG", &mut out)
            .expect("parent");
        assert_eq!(status, ContribStatus::Accepted);
        assert_eq!(st.phase(), Phase::UpwardForward);
        assert!(out.is_empty());

        assert!(st.upward_complete(0, true, &mut out));
        run(out);
        assert_eq!(st.phase(), Phase::Sync);
        assert_eq!(st.seq(), 1);
        assert_eq!(outcomes.lock().expect("lock")[0], Ok(b"AGG".to_vec()));
    }

    #[test]
    fn test_stale_resubmission_is_noop() {
        let mut st = state(2, true);
        let mut out = Vec::new();
        st.contribute_local(b"L2", None, Instant::now(), &mut out)
            .expect("local");
        st.upward_complete(0, true, &mut out);
        st.contribute_from_parent(NodeId(0), 0, b"AGG", &mut out)
            .expect("parent");
        assert_eq!(st.seq(), 1);
        let before = st.snapshot();

        let status = st
            .contribute_from_parent(NodeId(0), 0, b"AGG", &mut out)
            .expect("stale");
        assert_eq!(status, ContribStatus::Stale);
        assert_eq!(st.snapshot(), before);
    }

    #[test]
    fn test_seq_two_ahead_desyncs_once() {
        let mut st = state(0, true);
        let (outcomes, cb) = recorder();
        let now = Instant::now();
        let mut out = Vec::new();
        st.contribute_local(b"L0", Some(cb), now, &mut out).expect("local");

        let err = st
            .contribute_from_child(NodeId(1), 2, b"bad", now, &mut out)
            .expect_err("desync");
        assert!(matches!(err, Error::ProtocolDesync { expected: 0, got: 2 }));
        let aborts = out
            .iter()
            .filter(|a| matches!(a, Action::AbortStep { .. }))
            .count();
        assert_eq!(aborts, 1);
        run(out);
        assert_eq!(
            outcomes.lock().expect("lock")[0],
            Err(FenceError::ProtocolError)
        );
        assert_eq!(st.phase(), Phase::Sync);
        assert_eq!(st.seq(), 1);
    }

    #[test]
    fn test_next_generation_buffered_during_downward() {
        let mut st = state(1, true);
        let now = Instant::now();
        let mut out = Vec::new();
        st.contribute_local(b"a", None, now, &mut out).expect("local");
        st.contribute_from_child(NodeId(3), 0, b"b", now, &mut out)
            .expect("child");
        st.upward_complete(0, true, &mut out);
        st.contribute_from_parent(NodeId(0), 0, b"ab..", &mut out)
            .expect("parent");
        assert_eq!(st.phase(), Phase::DownwardForward);

        // Child raced ahead into generation 1.
        let status = st
            .contribute_from_child(NodeId(3), 1, b"next", now, &mut out)
            .expect("next gen");
        assert_eq!(status, ContribStatus::Accepted);
        // Retransmission of generation 0 is stale now.
        let stale = st
            .contribute_from_child(NodeId(3), 0, b"b", now, &mut out)
            .expect("stale");
        assert_eq!(stale, ContribStatus::Stale);

        assert!(st.downward_complete(0, true, &mut out));
        assert_eq!(st.seq(), 1);
        assert_eq!(st.phase(), Phase::Collect);
        assert_eq!(st.snapshot().children_contributed, 1);
    }

    #[test]
    fn test_root_without_direct_sends_one_hostlist() {
        let mut st = state(0, false);
        let now = Instant::now();
        let mut out = Vec::new();
        st.contribute_local(b"0", None, now, &mut out).expect("local");
        st.contribute_from_child(NodeId(1), 0, b"13", now, &mut out)
            .expect("child1");
        st.contribute_from_child(NodeId(2), 0, b"2", now, &mut out)
            .expect("child2");
        let sends: Vec<_> = out
            .iter()
            .filter_map(|a| match a {
                Action::SendDown { to, .. } => Some(to.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(sends, vec![vec![NodeId(1), NodeId(2), NodeId(3)]]);
        assert_eq!(st.phase(), Phase::DownwardForward);
    }

    #[test]
    fn test_indirect_leaf_accepts_root_as_source() {
        let st = state(3, false);
        assert_eq!(st.downward_source(), Some(NodeId(0)));
        let st = state(3, true);
        assert_eq!(st.downward_source(), Some(NodeId(1)));
    }

    #[test]
    fn test_timeout_resets_and_notifies() {
        let mut st = state(0, true);
        let (outcomes, cb) = recorder();
        let t0 = Instant::now();
        let mut out = Vec::new();
        st.contribute_local(b"L0", Some(cb), t0, &mut out).expect("local");
        st.contribute_from_child(NodeId(1), 0, b"x", t0, &mut out)
            .expect("child");

        let timeout = Duration::from_secs(5);
        assert!(!st.check_timeout(t0 + Duration::from_secs(4), timeout, &mut out));
        assert!(st.check_timeout(t0 + Duration::from_secs(6), timeout, &mut out));
        run(out);
        assert_eq!(outcomes.lock().expect("lock")[0], Err(FenceError::Timeout));
        assert_eq!(st.phase(), Phase::Sync);
        assert_eq!(st.snapshot().children_contributed, 0);
    }

    #[test]
    fn test_upward_failure_abandons_generation() {
        let mut st = state(2, true);
        let (outcomes, cb) = recorder();
        let mut out = Vec::new();
        st.contribute_local(b"L2", Some(cb), Instant::now(), &mut out)
            .expect("local");
        assert!(st.upward_complete(0, false, &mut out));
        run(out);
        assert_eq!(outcomes.lock().expect("lock")[0], Err(FenceError::SendFailed));
        assert_eq!(st.seq(), 1);
        // A late completion for the abandoned generation is ignored.
        let mut late = Vec::new();
        assert!(!st.upward_complete(0, true, &mut late));
    }

    #[test]
    fn test_unexpected_sender_rejected() {
        let mut st = state(1, true);
        let mut out = Vec::new();
        assert!(matches!(
            st.contribute_from_child(NodeId(2), 0, b"", Instant::now(), &mut out),
            Err(Error::UnexpectedSender { .. })
        ));
        assert!(matches!(
            st.contribute_from_parent(NodeId(2), 0, b"", &mut out),
            Err(Error::UnexpectedSender { .. })
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_child_next_generation_accepted_while_awaiting_root() {
        // Without direct connections node1 waits for the root's hostlist
        // send while its own child may already have the aggregate.
        let mut st = state(1, false);
        let now = Instant::now();
        let mut out = Vec::new();
        st.contribute_local(b"L1", None, now, &mut out).expect("local");
        st.contribute_from_child(NodeId(3), 0, b"C3", now, &mut out)
            .expect("child");
        assert!(st.upward_complete(0, true, &mut out));
        assert_eq!(st.phase(), Phase::UpwardForward);
        out.clear();

        let next = st
            .contribute_from_child(NodeId(3), 1, b"N3", now, &mut out)
            .expect("next generation");
        assert_eq!(next, ContribStatus::Accepted);
        let retrans = st
            .contribute_from_child(NodeId(3), 0, b"C3", now, &mut out)
            .expect("retransmission");
        assert_eq!(retrans, ContribStatus::Stale);
        let again = st
            .contribute_from_child(NodeId(3), 1, b"N3", now, &mut out)
            .expect("repeat");
        assert_eq!(again, ContribStatus::Duplicate);
        assert!(out.is_empty(), "no abort: {:?}", out);
        assert_eq!(st.seq(), 0);

        st.contribute_from_parent(NodeId(0), 0, b"AGG", &mut out)
            .expect("fan-out");
        assert_eq!(st.seq(), 1);
        assert_eq!(st.phase(), Phase::Collect);
        assert_eq!(st.snapshot().children_contributed, 1);

        out.clear();
        st.contribute_local(b"L1", None, now, &mut out).expect("local gen 1");
        match &out[..] {
            [Action::SendUp { seq, frame, .. }] => {
                assert_eq!(*seq, 1);
                assert!(frame.payload().ends_with(b"N3L1"));
            }
            other => panic!("unexpected actions {:?}", other),
        }
    }

    #[test]
    fn test_downward_failure_keeps_next_generation() {
        let mut st = state(1, true);
        let now = Instant::now();
        let mut out = Vec::new();
        st.contribute_local(b"a", None, now, &mut out).expect("local");
        st.contribute_from_child(NodeId(3), 0, b"b", now, &mut out)
            .expect("child");
        st.upward_complete(0, true, &mut out);
        st.contribute_from_parent(NodeId(0), 0, b"ab", &mut out)
            .expect("parent");
        assert_eq!(st.phase(), Phase::DownwardForward);

        let (outcomes, cb) = recorder();
        st.contribute_from_child(NodeId(3), 1, b"c", now, &mut out)
            .expect("child gen 1");
        st.contribute_local(b"d", Some(cb), now, &mut out)
            .expect("local gen 1");
        out.clear();

        // The relay to node3 for generation 0 fails.
        assert!(st.downward_complete(0, false, &mut out));
        assert!(
            !out.iter().any(|a| matches!(a, Action::Notify { .. })),
            "generation 1 caller is not failed: {:?}",
            out
        );
        match &out[..] {
            [Action::SendUp { seq, frame, .. }] => {
                assert_eq!(*seq, 1);
                assert!(frame.payload().ends_with(b"cd"));
            }
            other => panic!("unexpected actions {:?}", other),
        }
        assert_eq!(st.seq(), 1);
        assert_eq!(st.phase(), Phase::UpwardForward);

        let mut out = Vec::new();
        st.upward_complete(1, true, &mut out);
        st.contribute_from_parent(NodeId(0), 1, b"abcd", &mut out)
            .expect("parent gen 1");
        run(out);
        let outcomes = outcomes.lock().expect("lock");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], Ok(b"abcd".to_vec()));
    }

    #[test]
    fn test_downward_failure_without_next_generation_goes_idle() {
        let mut st = state(1, true);
        let (outcomes, cb) = recorder();
        let now = Instant::now();
        let mut out = Vec::new();
        st.contribute_local(b"a", Some(cb), now, &mut out).expect("local");
        st.contribute_from_child(NodeId(3), 0, b"b", now, &mut out)
            .expect("child");
        st.upward_complete(0, true, &mut out);
        st.contribute_from_parent(NodeId(0), 0, b"ab", &mut out)
            .expect("parent");
        run(std::mem::take(&mut out));

        assert!(st.downward_complete(0, false, &mut out));
        assert!(out.is_empty());
        assert_eq!(st.phase(), Phase::Sync);
        assert_eq!(st.seq(), 1);
        let outcomes = outcomes.lock().expect("lock");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], Ok(b"ab".to_vec()));
    }
}
