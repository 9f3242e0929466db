// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Direct peer-to-peer links between tree-adjacent nodes.
//!
//! Link lifecycle per peer:
//!
//! ```text
//! INIT --indirect send carrying our port--> PORT_SENT --socket up--> CONNECTED
//!   ^                                                                   |
//!   +--------------------------- socket closed -------------------------+
//! ```
//!
//! Only the endpoint with the lower [`NodeId`] dials after seeing the other
//! side's advertised port; the dialler opens with a DIRECT-HELLO naming
//! itself. If a second socket for the same pair still comes up, the first
//! established one is kept and the newcomer is closed without notice.
//!
//! Each peer's state sits behind its own lock so unrelated peers never
//! serialize on each other.

pub mod io_thread;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::context::{NodeContext, NodeId};
use crate::metrics::FenceMetrics;
use crate::protocol::{Frame, MsgType};
use crate::transport::Completion;

pub use io_thread::{ConnId, IoThread, IoThreadHandle, ReactorConfig, ReactorHandler};

/// Connection state toward one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Nothing advertised yet
    Init,
    /// Our listener port was advertised over the control plane
    PortSent,
    /// Socket established and identified
    Connected {
        /// Reactor connection
        conn: ConnId,
    },
}

#[derive(Debug)]
struct PeerLink {
    state: LinkState,
    /// Outbound socket being established
    pending_conn: Option<ConnId>,
    peer_addr: Option<SocketAddr>,
}

impl PeerLink {
    fn new() -> Self {
        Self {
            state: LinkState::Init,
            pending_conn: None,
            peer_addr: None,
        }
    }
}

/// Per-peer direct connection table.
pub struct DirectLinks {
    ctx: Arc<NodeContext>,
    io: Arc<IoThreadHandle>,
    listen_port: u16,
    links: DashMap<NodeId, Arc<Mutex<PeerLink>>>,
    conn_owner: DashMap<ConnId, NodeId>,
}

impl DirectLinks {
    /// Links driven by the reactor behind `io`.
    pub fn new(ctx: Arc<NodeContext>, io: Arc<IoThreadHandle>) -> Self {
        let listen_port = io.local_addr().map(|a| a.port()).unwrap_or(0);
        Self {
            ctx,
            io,
            listen_port,
            links: DashMap::new(),
            conn_owner: DashMap::new(),
        }
    }

    /// Port advertised to peers (0 when not listening).
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    fn metrics(&self) -> &FenceMetrics {
        &self.ctx.metrics
    }

    fn link(&self, node: NodeId) -> Arc<Mutex<PeerLink>> {
        self.links
            .entry(node)
            .or_insert_with(|| Arc::new(Mutex::new(PeerLink::new())))
            .clone()
    }

    fn existing(&self, node: NodeId) -> Option<Arc<Mutex<PeerLink>>> {
        self.links.get(&node).map(|r| r.value().clone())
    }

    /// Current state toward `node`.
    pub fn state(&self, node: NodeId) -> LinkState {
        self.existing(node)
            .map(|l| l.lock().state)
            .unwrap_or(LinkState::Init)
    }

    /// Node a connection belongs to, once identified.
    pub fn owner(&self, conn: ConnId) -> Option<NodeId> {
        self.conn_owner.get(&conn).map(|r| *r.value())
    }

    /// Established connection to `node`, if any.
    pub fn route(&self, node: NodeId) -> Option<(ConnId, SocketAddr)> {
        let link = self.existing(node)?;
        let guard = link.lock();
        match guard.state {
            LinkState::Connected { conn } => {
                let addr = guard
                    .peer_addr
                    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
                Some((conn, addr))
            }
            _ => None,
        }
    }

    /// Port to advertise on an indirect send to `node` (0 = none).
    pub fn advertise(&self, node: NodeId) -> u16 {
        if self.listen_port == 0 || node == self.ctx.node_id {
            return 0;
        }
        let link = self.link(node);
        let mut guard = link.lock();
        match guard.state {
            LinkState::Init => {
                guard.state = LinkState::PortSent;
                log::debug!("[direct] advertising port {} to node {}", self.listen_port, node);
                self.listen_port
            }
            LinkState::PortSent => self.listen_port,
            LinkState::Connected { .. } => 0,
        }
    }

    /// `node` advertised its listener on `port`.
    pub fn on_advert(&self, node: NodeId, port: u16) {
        if port == 0 || node == self.ctx.node_id {
            return;
        }
        if self.ctx.node_id > node {
            log::trace!("[direct] node {} advertised port {}, waiting to be dialled", node, port);
            return;
        }
        let link = self.link(node);
        let mut guard = link.lock();
        if matches!(guard.state, LinkState::Connected { .. }) || guard.pending_conn.is_some() {
            return;
        }
        let ip = match self.ctx.layout.direct_addr(node) {
            Some(ip) => ip,
            None => {
                log::warn!("[direct] no address for node {}, staying indirect", node);
                return;
            }
        };
        let addr = SocketAddr::new(ip, port);
        match self.io.connect(addr) {
            Ok(conn) => {
                log::debug!("[direct] dialling node {} at {} (conn {})", node, addr, conn);
                guard.pending_conn = Some(conn);
                self.conn_owner.insert(conn, node);
            }
            Err(e) => log::warn!("[direct] cannot dial node {}: {}", node, e),
        }
    }

    /// Reactor reports a socket up.
    ///
    /// Outbound sockets are identified immediately with a DIRECT-HELLO;
    /// inbound ones wait for the peer's hello.
    pub fn on_connected(&self, conn: ConnId, remote: SocketAddr, outbound: bool) {
        if !outbound {
            return;
        }
        let node = match self.owner(conn) {
            Some(node) => node,
            None => {
                self.io.close(conn);
                return;
            }
        };
        let hello = Frame::header_only(MsgType::DirectHello, 0, self.ctx.node_id);
        self.io.send(conn, hello, Completion::noop());
        self.establish(node, conn, remote);
    }

    /// DIRECT-HELLO received on an accepted socket.
    pub fn on_hello(&self, conn: ConnId, sender: NodeId, remote: SocketAddr) {
        if sender == self.ctx.node_id || self.ctx.layout.hostname(sender).is_none() {
            log::warn!("[direct] hello from unknown node {} on conn {}", sender, conn);
            self.io.close(conn);
            return;
        }
        self.conn_owner.insert(conn, sender);
        self.establish(sender, conn, remote);
    }

    fn establish(&self, node: NodeId, conn: ConnId, remote: SocketAddr) {
        let link = self.link(node);
        let mut guard = link.lock();
        if guard.pending_conn == Some(conn) {
            guard.pending_conn = None;
        }
        let state = guard.state;
        match state {
            LinkState::Connected { conn: existing } if existing != conn => {
                drop(guard);
                log::debug!(
                    "[direct] node {} already connected on conn {}, dropping conn {}",
                    node,
                    existing,
                    conn
                );
                self.conn_owner.remove(&conn);
                self.io.close(conn);
            }
            LinkState::Connected { .. } => {}
            _ => {
                guard.state = LinkState::Connected { conn };
                guard.peer_addr = Some(remote);
                drop(guard);
                self.metrics().record_direct_established();
                log::debug!("[direct] node {} connected on conn {} ({})", node, conn, remote);
            }
        }
    }

    /// Reactor reports a socket gone.
    pub fn on_closed(&self, conn: ConnId) {
        let node = match self.conn_owner.remove(&conn) {
            Some((_, node)) => node,
            None => return,
        };
        let link = match self.existing(node) {
            Some(link) => link,
            None => return,
        };
        let mut guard = link.lock();
        if guard.pending_conn == Some(conn) {
            guard.pending_conn = None;
        }
        if guard.state == (LinkState::Connected { conn }) {
            guard.state = LinkState::Init;
            guard.peer_addr = None;
            drop(guard);
            self.metrics().record_direct_closed();
            log::debug!("[direct] link to node {} closed (conn {})", node, conn);
        }
    }

    /// Queue `frame` on an established connection.
    pub fn send(&self, conn: ConnId, frame: Frame, completion: Completion) {
        self.io.send(conn, frame, completion);
    }
}

impl fmt::Debug for DirectLinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectLinks")
            .field("node", &self.ctx.node_id)
            .field("listen_port", &self.listen_port)
            .field("links", &self.links.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FenceConfig;
    use crate::context::{JobControl, JobLayout, LogOnlyControl, StaticLayout};
    use crate::protocol::DirectMessage;
    use std::sync::Weak;
    use std::time::{Duration, Instant};

    struct Idle;

    impl ReactorHandler for Idle {
        fn on_connected(&self, _: ConnId, _: SocketAddr, _: bool) {}
        fn on_message(&self, _: ConnId, _: SocketAddr, _: DirectMessage) {}
        fn on_closed(&self, _: ConnId, _: Option<String>) {}
        fn on_tick(&self, _: Instant) {}
    }

    fn links(host: &str) -> (DirectLinks, Arc<Idle>) {
        let layout: Arc<dyn JobLayout> = Arc::new(StaticLayout::localhost("t", 3));
        let control: Arc<dyn JobControl> = Arc::new(LogOnlyControl);
        let config = FenceConfig::default().with_listen(Some("127.0.0.1".parse().expect("ip")), 0);
        let ctx = Arc::new(NodeContext::new(host, config.clone(), layout, control).expect("ctx"));
        let idle = Arc::new(Idle);
        let io = IoThread::spawn(
            ReactorConfig {
                tick: Duration::from_millis(50),
                ..ReactorConfig::from_fence(&config)
            },
            Arc::downgrade(&idle) as Weak<dyn ReactorHandler>,
        )
        .expect("reactor");
        (DirectLinks::new(ctx, Arc::new(io)), idle)
    }

    #[test]
    fn test_advertise_moves_to_port_sent() {
        let (links, _idle) = links("node1");
        assert_ne!(links.listen_port(), 0);
        assert_eq!(links.state(NodeId(0)), LinkState::Init);
        assert_eq!(links.advertise(NodeId(0)), links.listen_port());
        assert_eq!(links.state(NodeId(0)), LinkState::PortSent);
        assert_eq!(links.advertise(NodeId(1)), 0, "never advertise to self");
    }

    #[test]
    fn test_higher_node_does_not_dial() {
        let (links, _idle) = links("node2");
        links.on_advert(NodeId(0), 40000);
        assert!(links.existing(NodeId(0)).is_none());
    }

    #[test]
    fn test_hello_establishes_and_duplicate_is_dropped() {
        let (links, _idle) = links("node0");
        let remote: SocketAddr = "127.0.0.1:5000".parse().expect("addr");
        links.on_hello(7, NodeId(2), remote);
        assert_eq!(links.state(NodeId(2)), LinkState::Connected { conn: 7 });
        assert_eq!(links.route(NodeId(2)), Some((7, remote)));

        links.on_hello(8, NodeId(2), remote);
        assert_eq!(links.state(NodeId(2)), LinkState::Connected { conn: 7 });
        assert_eq!(links.owner(8), None);

        links.on_closed(7);
        assert_eq!(links.state(NodeId(2)), LinkState::Init);
        assert!(links.route(NodeId(2)).is_none());
    }

    #[test]
    fn test_hello_from_unknown_node_rejected() {
        let (links, _idle) = links("node0");
        let remote: SocketAddr = "127.0.0.1:5000".parse().expect("addr");
        links.on_hello(3, NodeId(99), remote);
        assert_eq!(links.state(NodeId(99)), LinkState::Init);
    }
}
