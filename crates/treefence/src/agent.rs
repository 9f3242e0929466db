// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-node fence agent.
//!
//! [`FenceAgent`] is what the embedding node daemon talks to. It owns the
//! reactor thread, the direct links, the transport adapter and the registry
//! of collective instances, and routes every inbound message, whether it
//! came over the control plane or a direct socket, to the right instance.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use treefence::{
//!     DeliveryMode, FenceAgent, FenceConfig, LogOnlyControl, LoopbackNetwork, NodeContext,
//!     ParticipantSet, StaticLayout,
//! };
//!
//! let net = LoopbackNetwork::new(DeliveryMode::Immediate);
//! let layout = Arc::new(StaticLayout::localhost("job", 1));
//! let ctx = NodeContext::new("node0", FenceConfig::default(), layout, Arc::new(LogOnlyControl))?;
//! let agent = FenceAgent::launch(ctx, net.clone())?;
//! net.attach("node0", agent.sink());
//!
//! agent.begin_fence(&ParticipantSet::ranks("job", 1), b"hello", |result| {
//!     println!("fence done: {:?}", result);
//! })?;
//! # Ok::<(), treefence::Error>(())
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use crate::coll::{
    decode_preamble, CollKey, CollSnapshot, CollectiveRegistry, ContribStatus, ParticipantSet,
    TreeCollective,
};
use crate::context::{NodeContext, NodeId};
use crate::error::{Error, FenceError, Result};
use crate::metrics::MetricsSnapshot;
use crate::protocol::{decode_indirect, DirectMessage, MessageHeader, MsgType};
use crate::transport::direct::{IoThread, IoThreadHandle, ReactorConfig, ReactorHandler};
use crate::transport::{ConnId, ControlPlane, DirectLinks, LinkState, MessageSink, TransportAdapter};

/// Receipt for an accepted local fence call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FenceHandle {
    key: CollKey,
    seq: u32,
}

impl FenceHandle {
    /// Collective the call joined.
    pub fn key(&self) -> &CollKey {
        &self.key
    }

    /// Generation the local contribution belongs to.
    pub fn seq(&self) -> u32 {
        self.seq
    }
}

/// Components that only exist once the reactor runs.
struct Runtime {
    io: Arc<IoThreadHandle>,
    direct: Option<Arc<DirectLinks>>,
    registry: CollectiveRegistry,
}

/// Fence agent of one node.
pub struct FenceAgent {
    ctx: Arc<NodeContext>,
    plane: Arc<dyn ControlPlane>,
    runtime: OnceLock<Runtime>,
    stopped: AtomicBool,
}

impl FenceAgent {
    /// Create an agent; call [`start`](Self::start) before use.
    pub fn new(ctx: NodeContext, plane: Arc<dyn ControlPlane>) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(ctx),
            plane,
            runtime: OnceLock::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Create and start an agent.
    pub fn launch(ctx: NodeContext, plane: Arc<dyn ControlPlane>) -> Result<Arc<Self>> {
        let agent = Self::new(ctx, plane);
        agent.start()?;
        Ok(agent)
    }

    /// Spawn the reactor and, when enabled, the direct listener.
    ///
    /// Starting twice is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.runtime.get().is_some() {
            return Ok(());
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let handler: Weak<dyn ReactorHandler> = Arc::downgrade(self) as Weak<dyn ReactorHandler>;
        let io = Arc::new(IoThread::spawn(ReactorConfig::from_fence(&self.ctx.config), handler)?);
        let direct = if self.ctx.config.direct_conn {
            Some(Arc::new(DirectLinks::new(self.ctx.clone(), io.clone())))
        } else {
            None
        };
        let transport = Arc::new(TransportAdapter::new(
            self.ctx.clone(),
            self.plane.clone(),
            direct.clone(),
        ));
        let registry = CollectiveRegistry::new(self.ctx.clone(), transport);

        match io.local_addr() {
            Some(addr) => log::info!(
                "[agent] {} (node {}) started, direct listener on {}",
                self.ctx.hostname,
                self.ctx.node_id,
                addr
            ),
            None => log::info!(
                "[agent] {} (node {}) started, direct connections disabled",
                self.ctx.hostname,
                self.ctx.node_id
            ),
        }

        let runtime = Runtime {
            io,
            direct,
            registry,
        };
        if let Err(lost) = self.runtime.set(runtime) {
            // Raced with another start; keep the winner's reactor.
            lost.io.shutdown();
        }
        Ok(())
    }

    fn runtime(&self) -> Result<&Runtime> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        self.runtime.get().ok_or(Error::Shutdown)
    }

    /// Node context.
    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// Local node id.
    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    /// This agent as a control-plane receiver.
    pub fn sink(self: &Arc<Self>) -> Weak<dyn MessageSink> {
        Arc::downgrade(self) as Weak<dyn MessageSink>
    }

    // ========================================================================
    // Local API
    // ========================================================================

    /// Contribute `payload` to the next fence of `participants`.
    ///
    /// Never blocks. On `Ok`, `callback` runs exactly once with either the
    /// aggregate of every participant's data or a [`FenceError`]; it may run
    /// before this returns when this node completes the round itself. On
    /// `Err` the callback is dropped without running.
    pub fn begin_fence<F>(
        &self,
        participants: &ParticipantSet,
        payload: &[u8],
        callback: F,
    ) -> Result<FenceHandle>
    where
        F: FnOnce(core::result::Result<Vec<u8>, FenceError>) + Send + 'static,
    {
        let rt = self.runtime()?;
        let key = CollKey::fence(participants.clone());
        let coll = rt.registry.get_or_create(&key)?;
        let seq = coll.contribute_local(payload, Box::new(callback))?;
        self.ctx.metrics.record_fence_started();
        Ok(FenceHandle { key, seq })
    }

    /// Existing collective instance for `participants`.
    pub fn collective(&self, participants: &ParticipantSet) -> Option<Arc<TreeCollective>> {
        let rt = self.runtime().ok()?;
        rt.registry.get(&CollKey::fence(participants.clone()))
    }

    /// Diagnostic state of the collective for `participants`.
    pub fn snapshot(&self, participants: &ParticipantSet) -> Option<CollSnapshot> {
        self.collective(participants).map(|c| c.snapshot())
    }

    /// Number of collective instances.
    pub fn collective_count(&self) -> usize {
        self.runtime().map(|rt| rt.registry.len()).unwrap_or(0)
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Direct listener address.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.runtime().ok()?.io.local_addr()
    }

    /// Direct link state toward `node` (`None` when direct connections are off).
    pub fn direct_state(&self, node: NodeId) -> Option<LinkState> {
        let rt = self.runtime().ok()?;
        rt.direct.as_ref().map(|d| d.state(node))
    }

    /// Abandon every generation older than the configured timeout.
    ///
    /// Driven by the reactor tick; exposed so callers can pass their own clock.
    pub fn reap_timeouts(&self, now: Instant) -> usize {
        match self.runtime() {
            Ok(rt) => rt.registry.reap_timeouts(now),
            Err(_) => 0,
        }
    }

    /// Stop the reactor. Pending fences stay pending until their instance is dropped.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(rt) = self.runtime.get() {
            rt.io.shutdown();
        }
        log::info!("[agent] {} stopped", self.ctx.hostname);
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Route a FAN-IN or FAN-OUT message to its collective.
    ///
    /// `payload` starts with the collective preamble. The instance is created
    /// when this is the first message naming its participant set.
    pub fn on_wire_message(&self, header: &MessageHeader, payload: &[u8]) -> Result<ContribStatus> {
        let rt = self.runtime()?;
        if !matches!(header.msg_type, MsgType::FanIn | MsgType::FanOut) {
            return Err(Error::UnsupportedMessage(header.msg_type as u32));
        }
        let (key, used) = decode_preamble(payload)?;
        let data = &payload[used..];
        log::trace!(
            "[agent] {} seq={} from node {} for {} ({} bytes)",
            header.msg_type.name(),
            header.seq,
            header.sender,
            key,
            data.len()
        );
        let coll = rt.registry.get_or_create(&key)?;
        match header.msg_type {
            MsgType::FanIn => coll.on_fan_in(header.sender, header.seq, data),
            _ => coll.on_fan_out(header.sender, header.seq, data),
        }
    }

    /// Process one complete control-plane message.
    pub fn on_control_message(&self, bytes: &[u8]) -> Result<ContribStatus> {
        let rt = self.runtime()?;
        let msg = decode_indirect(bytes)?;
        if msg.rport != 0 {
            if let Some(direct) = &rt.direct {
                direct.on_advert(msg.header.sender, msg.rport);
            }
        }
        self.on_wire_message(&msg.header, msg.payload)
    }

    fn on_direct_message(&self, conn: ConnId, remote: SocketAddr, msg: DirectMessage) {
        let rt = match self.runtime() {
            Ok(rt) => rt,
            Err(_) => return,
        };
        let direct = match &rt.direct {
            Some(direct) => direct,
            None => return,
        };
        let header = msg.header;
        match header.msg_type {
            MsgType::DirectHello => direct.on_hello(conn, header.sender, remote),
            MsgType::FanIn | MsgType::FanOut => {
                if direct.owner(conn) != Some(header.sender) {
                    log::warn!(
                        "[agent] {} from node {} on conn {} owned by {:?}, dropped",
                        header.msg_type.name(),
                        header.sender,
                        conn,
                        direct.owner(conn)
                    );
                    return;
                }
                if let Err(e) = self.on_wire_message(&header, &msg.payload) {
                    log::warn!("[agent] direct message from node {} failed: {}", header.sender, e);
                }
            }
            MsgType::DirectModex => {
                log::warn!(
                    "[agent] unsupported {} from node {} on conn {}",
                    header.msg_type.name(),
                    header.sender,
                    conn
                );
            }
        }
    }
}

impl ReactorHandler for FenceAgent {
    fn on_connected(&self, conn: ConnId, remote: SocketAddr, outbound: bool) {
        if let Ok(Some(direct)) = self.runtime().map(|rt| rt.direct.as_ref()) {
            direct.on_connected(conn, remote, outbound);
        }
    }

    fn on_message(&self, conn: ConnId, remote: SocketAddr, msg: DirectMessage) {
        self.on_direct_message(conn, remote, msg);
    }

    fn on_closed(&self, conn: ConnId, reason: Option<String>) {
        if let Some(reason) = &reason {
            log::debug!("[agent] conn {} closed: {}", conn, reason);
        }
        if let Ok(Some(direct)) = self.runtime().map(|rt| rt.direct.as_ref()) {
            direct.on_closed(conn);
        }
    }

    fn on_tick(&self, now: Instant) {
        let expired = self.reap_timeouts(now);
        if expired > 0 {
            log::debug!("[agent] reaper abandoned {} generation(s)", expired);
        }
    }
}

impl MessageSink for FenceAgent {
    fn receive(&self, bytes: &[u8]) {
        if let Err(e) = self.on_control_message(bytes) {
            log::warn!("[agent] control message rejected on {}: {}", self.ctx.hostname, e);
        }
    }
}

impl fmt::Debug for FenceAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceAgent")
            .field("node", &self.ctx.node_id)
            .field("hostname", &self.ctx.hostname)
            .field("started", &self.runtime.get().is_some())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FenceConfig;
    use crate::context::{JobControl, JobLayout, LogOnlyControl, StaticLayout};
    use crate::protocol::Frame;
    use crate::transport::{DeliveryMode, LoopbackNetwork};

    fn agent(host: &str, nodes: usize, net: &Arc<LoopbackNetwork>) -> Arc<FenceAgent> {
        let layout: Arc<dyn JobLayout> = Arc::new(StaticLayout::localhost("t", nodes));
        let control: Arc<dyn JobControl> = Arc::new(LogOnlyControl);
        let config = FenceConfig::default().with_direct_conn(false);
        let ctx = NodeContext::new(host, config, layout, control).expect("ctx");
        let plane: Arc<dyn ControlPlane> = net.clone();
        let agent = FenceAgent::launch(ctx, plane).expect("launch");
        net.attach(host, agent.sink());
        agent
    }

    #[test]
    fn test_not_started_and_stopped() {
        let net = LoopbackNetwork::new(DeliveryMode::Immediate);
        let layout: Arc<dyn JobLayout> = Arc::new(StaticLayout::localhost("t", 1));
        let ctx = NodeContext::new("node0", FenceConfig::default(), layout, Arc::new(LogOnlyControl))
            .expect("ctx");
        let a = FenceAgent::new(ctx, net);
        let err = a
            .begin_fence(&ParticipantSet::ranks("t", 1), b"x", |_| {})
            .expect_err("not started");
        assert!(matches!(err, Error::Shutdown));

        a.start().expect("start");
        a.start().expect("second start is a no-op");
        a.shutdown();
        assert!(a.begin_fence(&ParticipantSet::ranks("t", 1), b"x", |_| {}).is_err());
    }

    #[test]
    fn test_rejects_unsupported_types() {
        let net = LoopbackNetwork::new(DeliveryMode::Immediate);
        let a = agent("node0", 2, &net);
        let header = MessageHeader::new(MsgType::DirectModex, 0, NodeId(1), 0);
        let err = a.on_wire_message(&header, &[]).expect_err("modex");
        assert!(matches!(err, Error::UnsupportedMessage(3)));
        a.shutdown();
    }

    #[test]
    fn test_control_message_creates_instance() {
        let net = LoopbackNetwork::new(DeliveryMode::Queued);
        let a = agent("node0", 2, &net);
        let set = ParticipantSet::ranks("t", 2);
        let mut buf = crate::coll::ContributionBuffer::new(&CollKey::fence(set.clone()));
        buf.append(b"child");
        let frame: Frame = buf.stamp(MsgType::FanIn, 0, NodeId(1));

        assert_eq!(a.collective_count(), 0);
        let status = a.on_control_message(&frame.indirect_bytes(0)).expect("fan-in");
        assert_eq!(status, ContribStatus::Accepted);
        assert_eq!(a.collective_count(), 1);
        let snap = a.snapshot(&set).expect("snapshot");
        assert_eq!(snap.children_contributed, 1);
        assert!(!snap.contrib_local);
        a.shutdown();
    }

    #[test]
    fn test_two_node_fence_immediate() {
        let net = LoopbackNetwork::new(DeliveryMode::Immediate);
        let a = agent("node0", 2, &net);
        let b = agent("node1", 2, &net);
        let set = ParticipantSet::ranks("t", 2);

        let got = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let g0 = got.clone();
        let h0 = a
            .begin_fence(&set, b"A", move |r| g0.lock().push((0, r)))
            .expect("node0");
        assert_eq!(h0.seq(), 0);
        let g1 = got.clone();
        b.begin_fence(&set, b"B", move |r| g1.lock().push((1, r)))
            .expect("node1");

        let got = got.lock();
        assert_eq!(got.len(), 2);
        for (_, r) in got.iter() {
            assert_eq!(r.as_deref(), Ok(&b"AB"[..]));
        }
        a.shutdown();
        b.shutdown();
    }
}
