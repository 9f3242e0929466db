// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport adapter.
//!
//! Ships stamped [`Frame`]s to one node or a list of nodes and reports the
//! outcome through a [`Completion`] that fires exactly once.
//!
//! # Paths
//!
//! | Path | When | Completion |
//! |------|------|------------|
//! | Indirect (control plane) | hostlists, first contact, direct disabled | inline, after retries |
//! | Direct (socket) | single peer with an established link | deferred, last byte written |
//!
//! Indirect messages to a single peer advertise the local direct listener
//! port until a direct link to that peer is up.

pub mod direct;
pub mod indirect;
pub mod loopback;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::context::{NodeContext, NodeId};
use crate::error::{Error, Result};
use crate::metrics::FenceMetrics;
use crate::protocol::Frame;

pub use direct::{ConnId, DirectLinks, LinkState};
pub use indirect::{ControlPlane, IndirectPath};
pub use loopback::{DeliveryMode, Fault, LoopbackNetwork, MessageSink};

// ============================================================================
// Completions
// ============================================================================

/// Outcome of one send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// Delivered to the transport peer
    Success,
    /// Retries exhausted, socket failed or the transport shut down
    Failed,
}

impl SendStatus {
    /// Whether the send succeeded.
    pub fn is_success(self) -> bool {
        self == SendStatus::Success
    }
}

/// Where a completion fired relative to the `send` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionContext {
    /// Before `send` returned, on the caller's thread
    Inline,
    /// Later, from the reactor thread
    Deferred,
}

type CompletionFn = Box<dyn FnOnce(SendStatus, CompletionContext) + Send + 'static>;

/// Exactly-once send completion.
///
/// Consumed by [`Completion::complete`]. A completion dropped without being
/// completed fires `Failed`/`Deferred` from its destructor, so every send
/// reports exactly once even when a queue is torn down.
pub struct Completion {
    callback: Option<CompletionFn>,
}

impl Completion {
    /// Wrap a callback.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(SendStatus, CompletionContext) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(f)),
        }
    }

    /// Completion that ignores the outcome.
    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    /// Fire the callback.
    pub fn complete(mut self, status: SendStatus, context: CompletionContext) {
        if let Some(cb) = self.callback.take() {
            cb(status, context);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(cb) = self.callback.take() {
            log::warn!("[transport] completion dropped without firing, reporting failure");
            cb(SendStatus::Failed, CompletionContext::Deferred);
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

// ============================================================================
// Destinations
// ============================================================================

/// Resolved destination of a send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Established direct socket to one peer
    Direct {
        /// Peer node
        node: NodeId,
        /// Peer socket address
        peer: SocketAddr,
        /// Reactor connection
        conn: ConnId,
    },
    /// Control-plane send to one or more hosts
    Indirect {
        /// Destination hostnames
        hostlist: Vec<String>,
        /// Direct listener port advertised in the envelope (0 = none)
        rport: u16,
    },
}

// ============================================================================
// Adapter
// ============================================================================

/// Routes frames over the direct or indirect path.
pub struct TransportAdapter {
    ctx: Arc<NodeContext>,
    indirect: IndirectPath,
    direct: Option<Arc<DirectLinks>>,
}

impl TransportAdapter {
    /// Adapter over `plane`, with optional direct links.
    pub fn new(
        ctx: Arc<NodeContext>,
        plane: Arc<dyn ControlPlane>,
        direct: Option<Arc<DirectLinks>>,
    ) -> Self {
        let indirect = IndirectPath::new(plane, &ctx.config, ctx.metrics.clone());
        Self {
            ctx,
            indirect,
            direct,
        }
    }

    /// Direct links, when enabled.
    pub fn direct(&self) -> Option<&Arc<DirectLinks>> {
        self.direct.as_ref()
    }

    fn metrics(&self) -> &FenceMetrics {
        &self.ctx.metrics
    }

    /// Pick the path for a send to `to`.
    ///
    /// Single-peer sends prefer a connected direct link; otherwise they go
    /// indirect and advertise the local listener.
    pub fn route(&self, to: &[NodeId]) -> Result<Destination> {
        if to.is_empty() {
            return Err(Error::Topology("send without destination".into()));
        }
        let mut rport = 0;
        if let (Some(direct), [node]) = (&self.direct, to) {
            if let Some((conn, peer)) = direct.route(*node) {
                return Ok(Destination::Direct {
                    node: *node,
                    peer,
                    conn,
                });
            }
            rport = direct.advertise(*node);
        }
        let hostlist = to
            .iter()
            .map(|node| self.ctx.layout.hostname(*node).ok_or(Error::UnknownNode(*node)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Destination::Indirect { hostlist, rport })
    }

    /// Send `frame` to `to`; `completion` fires exactly once.
    ///
    /// Must be called without holding collective or link locks: indirect
    /// completions fire before this returns.
    pub fn send(&self, to: &[NodeId], frame: &Frame, completion: Completion) {
        match self.route(to) {
            Ok(Destination::Direct { node, conn, .. }) => {
                self.metrics().record_direct_send();
                log::trace!("[transport] direct send to node {} on conn {}", node, conn);
                if let Some(direct) = &self.direct {
                    direct.send(conn, frame.clone(), completion);
                }
            }
            Ok(Destination::Indirect { hostlist, rport }) => {
                self.metrics().record_indirect_send();
                let bytes = frame.indirect_bytes(rport);
                let status = match self.indirect.send(&hostlist, &bytes) {
                    Ok(()) => SendStatus::Success,
                    Err(e) => {
                        log::error!("[indirect] send to {:?} failed: {}", hostlist, e);
                        SendStatus::Failed
                    }
                };
                completion.complete(status, CompletionContext::Inline);
            }
            Err(e) => {
                log::error!("[transport] cannot route to {:?}: {}", to, e);
                completion.complete(SendStatus::Failed, CompletionContext::Inline);
            }
        }
    }
}

impl fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportAdapter")
            .field("node", &self.ctx.node_id)
            .field("direct", &self.direct.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_completion_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let c = Completion::new(move |status, ctx| {
            assert_eq!(status, SendStatus::Success);
            assert_eq!(ctx, CompletionContext::Inline);
            h.fetch_add(1, Ordering::SeqCst);
        });
        c.complete(SendStatus::Success, CompletionContext::Inline);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_completion_reports_failure() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let s = seen.clone();
        let c = Completion::new(move |status, ctx| {
            *s.lock() = Some((status, ctx));
        });
        drop(c);
        assert_eq!(
            *seen.lock(),
            Some((SendStatus::Failed, CompletionContext::Deferred))
        );
    }
}
