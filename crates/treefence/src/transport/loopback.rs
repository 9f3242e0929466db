// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process control plane.
//!
//! [`LoopbackNetwork`] connects several agents living in one process. In
//! [`DeliveryMode::Immediate`] a send is handed to the destination before it
//! returns; in [`DeliveryMode::Queued`] messages wait until [`LoopbackNetwork::pump`]
//! (or a test) delivers them, possibly reordered or duplicated.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::indirect::ControlPlane;

/// Receiver of control-plane messages.
pub trait MessageSink: Send + Sync {
    /// Process one complete indirect message.
    fn receive(&self, bytes: &[u8]);
}

/// When sends reach their destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Inline, before `send` returns
    Immediate,
    /// On [`LoopbackNetwork::pump`]
    Queued,
}

/// Injected failure toward one host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fail the next `n` attempts
    FailAttempts(u32),
    /// Fail every attempt
    Partition,
}

/// A message waiting for delivery.
#[derive(Clone, Debug)]
pub struct Pending {
    /// Destination hostname
    pub host: String,
    /// Indirect message bytes
    pub bytes: Vec<u8>,
}

struct Inner {
    sinks: HashMap<String, Weak<dyn MessageSink>>,
    queue: VecDeque<Pending>,
    faults: HashMap<String, Fault>,
    delivered: u64,
}

/// In-process control plane shared by simulated nodes.
pub struct LoopbackNetwork {
    mode: DeliveryMode,
    inner: Mutex<Inner>,
}

impl LoopbackNetwork {
    /// Create a network with the given delivery mode.
    pub fn new(mode: DeliveryMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            inner: Mutex::new(Inner {
                sinks: HashMap::new(),
                queue: VecDeque::new(),
                faults: HashMap::new(),
                delivered: 0,
            }),
        })
    }

    /// Delivery mode.
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Attach `sink` under `hostname`.
    pub fn attach(&self, hostname: impl Into<String>, sink: Weak<dyn MessageSink>) {
        self.inner.lock().sinks.insert(hostname.into(), sink);
    }

    /// Detach `hostname`; later sends to it fail.
    pub fn detach(&self, hostname: &str) {
        self.inner.lock().sinks.remove(hostname);
    }

    /// Inject a fault toward `hostname`.
    pub fn set_fault(&self, hostname: impl Into<String>, fault: Fault) {
        self.inner.lock().faults.insert(hostname.into(), fault);
    }

    /// Remove any fault toward `hostname`.
    pub fn clear_fault(&self, hostname: &str) {
        self.inner.lock().faults.remove(hostname);
    }

    /// Messages delivered so far.
    pub fn delivered(&self) -> u64 {
        self.inner.lock().delivered
    }

    /// Number of queued messages.
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Remove and return every queued message.
    pub fn take_pending(&self) -> Vec<Pending> {
        self.inner.lock().queue.drain(..).collect()
    }

    /// Deliver one message now, bypassing the queue.
    ///
    /// Returns false when nobody is attached under `host`.
    pub fn deliver(&self, host: &str, bytes: &[u8]) -> bool {
        let sink = {
            let mut inner = self.inner.lock();
            let sink = inner.sinks.get(host).and_then(Weak::upgrade);
            if sink.is_some() {
                inner.delivered += 1;
            }
            sink
        };
        match sink {
            Some(sink) => {
                sink.receive(bytes);
                true
            }
            None => false,
        }
    }

    /// Deliver queued messages in FIFO order until the queue stays empty.
    ///
    /// Returns the number of messages delivered.
    pub fn pump(&self) -> usize {
        let mut count = 0;
        loop {
            let next = self.inner.lock().queue.pop_front();
            match next {
                Some(msg) => {
                    if self.deliver(&msg.host, &msg.bytes) {
                        count += 1;
                    }
                }
                None => return count,
            }
        }
    }

    fn check_fault(&self, inner: &mut Inner, host: &str) -> io::Result<()> {
        match inner.faults.get_mut(host) {
            Some(Fault::Partition) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} unreachable", host),
            )),
            Some(Fault::FailAttempts(n)) if *n > 0 => {
                *n -= 1;
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} did not acknowledge", host),
                ))
            }
            _ => Ok(()),
        }
    }
}

impl ControlPlane for LoopbackNetwork {
    fn send(&self, hosts: &[String], payload: &[u8], _timeout: Duration) -> io::Result<()> {
        {
            let mut inner = self.inner.lock();
            for host in hosts {
                if !inner.sinks.contains_key(host) {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("unknown host {}", host),
                    ));
                }
                self.check_fault(&mut inner, host)?;
            }
            if self.mode == DeliveryMode::Queued {
                for host in hosts {
                    inner.queue.push_back(Pending {
                        host: host.clone(),
                        bytes: payload.to_vec(),
                    });
                }
                return Ok(());
            }
        }
        for host in hosts {
            self.deliver(host, payload);
        }
        Ok(())
    }
}
