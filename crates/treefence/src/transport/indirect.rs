// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Indirect path over the launcher's control plane.
//!
//! The control plane is an external store-and-forward primitive. Each attempt
//! is a blocking call with its own timeout; [`IndirectPath`] layers the retry
//! schedule on top: `send_retries` attempts, sleeping `send_start_delay`
//! before the second and doubling after every failure.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::config::FenceConfig;
use crate::metrics::FenceMetrics;

/// Reliable point-to-point primitive provided by the launcher.
pub trait ControlPlane: Send + Sync {
    /// One blocking attempt to deliver `payload` to every host in `hosts`.
    fn send(&self, hosts: &[String], payload: &[u8], timeout: Duration) -> io::Result<()>;
}

/// Retry-with-backoff wrapper around a [`ControlPlane`].
pub struct IndirectPath {
    plane: Arc<dyn ControlPlane>,
    timeout: Duration,
    retries: u32,
    start_delay: Duration,
    metrics: Arc<FenceMetrics>,
}

impl IndirectPath {
    /// Wrap `plane` with the retry schedule from `config`.
    pub fn new(plane: Arc<dyn ControlPlane>, config: &FenceConfig, metrics: Arc<FenceMetrics>) -> Self {
        Self {
            plane,
            timeout: config.send_timeout(),
            retries: config.send_retries.max(1),
            start_delay: config.send_start_delay(),
            metrics,
        }
    }

    /// Deliver `payload`, retrying on failure. Blocks for the whole schedule.
    pub fn send(&self, hosts: &[String], payload: &[u8]) -> io::Result<()> {
        let mut delay = self.start_delay;
        let mut attempt = 1;
        loop {
            match self.plane.send(hosts, payload, self.timeout) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.retries => {
                    self.metrics.record_send_failure();
                    return Err(io::Error::new(
                        e.kind(),
                        format!("{} (after {} attempts)", e, attempt),
                    ));
                }
                Err(e) => {
                    log::warn!(
                        "[indirect] attempt {}/{} to {:?} failed: {}, retrying in {:?}",
                        attempt,
                        self.retries,
                        hosts,
                        e,
                        delay
                    );
                    self.metrics.record_send_retry();
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Fails the first `fail` attempts.
    struct Flaky {
        fail: u32,
        calls: Mutex<u32>,
    }

    impl ControlPlane for Flaky {
        fn send(&self, _hosts: &[String], _payload: &[u8], _timeout: Duration) -> io::Result<()> {
            let mut calls = self.calls.lock();
            *calls += 1;
            if *calls <= self.fail {
                Err(io::Error::new(io::ErrorKind::TimedOut, "no ack"))
            } else {
                Ok(())
            }
        }
    }

    fn path(plane: Arc<Flaky>, retries: u32) -> (IndirectPath, Arc<FenceMetrics>) {
        let config = FenceConfig::default().with_retries(retries, Duration::from_millis(1));
        let metrics = Arc::new(FenceMetrics::new());
        (IndirectPath::new(plane, &config, metrics.clone()), metrics)
    }

    #[test]
    fn test_retries_until_success() {
        let plane = Arc::new(Flaky {
            fail: 2,
            calls: Mutex::new(0),
        });
        let (path, metrics) = path(plane.clone(), 5);
        path.send(&["h".into()], b"x").expect("send");
        assert_eq!(*plane.calls.lock(), 3);
        assert_eq!(metrics.snapshot().send_retries, 2);
    }

    #[test]
    fn test_gives_up_after_bound() {
        let plane = Arc::new(Flaky {
            fail: u32::MAX,
            calls: Mutex::new(0),
        });
        let (path, metrics) = path(plane.clone(), 3);
        let err = path.send(&["h".into()], b"x").expect_err("must fail");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(*plane.calls.lock(), 3);
        assert_eq!(metrics.snapshot().send_failures, 1);
    }
}
