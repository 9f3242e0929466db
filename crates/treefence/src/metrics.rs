// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fence agent metrics.
//!
//! Counters for monitoring collective health:
//! - Fence outcomes (started, completed, failed, timed out)
//! - Protocol anomalies (duplicates, stale retransmissions, desyncs)
//! - Transport usage per path and completion flavour
//!
//! # Example
//!
//! ```
//! use treefence::metrics::FenceMetrics;
//!
//! let metrics = FenceMetrics::new();
//! metrics.record_fence_started();
//! metrics.record_fence_completed();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.fences_completed, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::transport::CompletionContext;

/// Metrics shared by every collective of one agent.
#[derive(Debug)]
pub struct FenceMetrics {
    // Fence outcomes
    fences_started: AtomicU64,
    fences_completed: AtomicU64,
    fences_failed: AtomicU64,
    timeouts: AtomicU64,

    // Protocol anomalies
    duplicates_dropped: AtomicU64,
    stale_dropped: AtomicU64,
    protocol_errors: AtomicU64,

    // Payload volume
    upward_bytes: AtomicU64,
    downward_bytes: AtomicU64,

    // Transport
    indirect_sends: AtomicU64,
    direct_sends: AtomicU64,
    send_retries: AtomicU64,
    send_failures: AtomicU64,
    inline_completions: AtomicU64,
    deferred_completions: AtomicU64,

    // Direct connections
    direct_established: AtomicU64,
    direct_closed: AtomicU64,

    start_time: Instant,
}

impl FenceMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            fences_started: AtomicU64::new(0),
            fences_completed: AtomicU64::new(0),
            fences_failed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            stale_dropped: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            upward_bytes: AtomicU64::new(0),
            downward_bytes: AtomicU64::new(0),
            indirect_sends: AtomicU64::new(0),
            direct_sends: AtomicU64::new(0),
            send_retries: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            inline_completions: AtomicU64::new(0),
            deferred_completions: AtomicU64::new(0),
            direct_established: AtomicU64::new(0),
            direct_closed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    // ========================================================================
    // Fence recording
    // ========================================================================

    /// Record a local fence call accepted.
    pub fn record_fence_started(&self) {
        self.fences_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an aggregate delivered to a local caller.
    pub fn record_fence_completed(&self) {
        self.fences_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a local caller notified with an error.
    pub fn record_fence_failed(&self) {
        self.fences_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a generation abandoned by the reaper.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Anomaly recording
    // ========================================================================

    /// Record a duplicate contribution dropped.
    pub fn record_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stale retransmission absorbed.
    pub fn record_stale(&self) {
        self.stale_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a protocol desynchronization.
    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Transport recording
    // ========================================================================

    /// Record an upward payload handed to the transport.
    pub fn record_upward(&self, bytes: usize) {
        self.upward_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a downward payload handed to the transport.
    pub fn record_downward(&self, bytes: usize) {
        self.downward_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a send over the control plane.
    pub fn record_indirect_send(&self) {
        self.indirect_sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send over a direct socket.
    pub fn record_direct_send(&self) {
        self.direct_sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one indirect retry.
    pub fn record_send_retry(&self) {
        self.send_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send reported as failed.
    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record which path a completion fired on.
    pub fn record_completion(&self, context: CompletionContext) {
        match context {
            CompletionContext::Inline => {
                self.inline_completions.fetch_add(1, Ordering::Relaxed);
            }
            CompletionContext::Deferred => {
                self.deferred_completions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a direct connection becoming usable.
    pub fn record_direct_established(&self) {
        self.direct_established.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a direct connection closed.
    pub fn record_direct_closed(&self) {
        self.direct_closed.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fences_started: self.fences_started.load(Ordering::Relaxed),
            fences_completed: self.fences_completed.load(Ordering::Relaxed),
            fences_failed: self.fences_failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            upward_bytes: self.upward_bytes.load(Ordering::Relaxed),
            downward_bytes: self.downward_bytes.load(Ordering::Relaxed),
            indirect_sends: self.indirect_sends.load(Ordering::Relaxed),
            direct_sends: self.direct_sends.load(Ordering::Relaxed),
            send_retries: self.send_retries.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            inline_completions: self.inline_completions.load(Ordering::Relaxed),
            deferred_completions: self.deferred_completions.load(Ordering::Relaxed),
            direct_established: self.direct_established.load(Ordering::Relaxed),
            direct_closed: self.direct_closed.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for FenceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`FenceMetrics`].
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    /// Local fence calls accepted
    pub fences_started: u64,
    /// Aggregates delivered locally
    pub fences_completed: u64,
    /// Local callers notified with an error
    pub fences_failed: u64,
    /// Generations abandoned by the reaper
    pub timeouts: u64,
    /// Duplicate contributions dropped
    pub duplicates_dropped: u64,
    /// Stale retransmissions absorbed
    pub stale_dropped: u64,
    /// Protocol desynchronizations
    pub protocol_errors: u64,
    /// Bytes forwarded up the tree
    pub upward_bytes: u64,
    /// Bytes broadcast down the tree
    pub downward_bytes: u64,
    /// Control-plane sends
    pub indirect_sends: u64,
    /// Direct socket sends
    pub direct_sends: u64,
    /// Indirect retries
    pub send_retries: u64,
    /// Sends reported failed
    pub send_failures: u64,
    /// Completions fired inline
    pub inline_completions: u64,
    /// Completions fired from the reactor
    pub deferred_completions: u64,
    /// Direct connections established
    pub direct_established: u64,
    /// Direct connections closed
    pub direct_closed: u64,
    /// Uptime in seconds
    pub uptime_secs: f64,
}

impl MetricsSnapshot {
    /// Add another snapshot's counters into this one (uptime keeps the max).
    pub fn merge(&mut self, other: &MetricsSnapshot) {
        self.fences_started += other.fences_started;
        self.fences_completed += other.fences_completed;
        self.fences_failed += other.fences_failed;
        self.timeouts += other.timeouts;
        self.duplicates_dropped += other.duplicates_dropped;
        self.stale_dropped += other.stale_dropped;
        self.protocol_errors += other.protocol_errors;
        self.upward_bytes += other.upward_bytes;
        self.downward_bytes += other.downward_bytes;
        self.indirect_sends += other.indirect_sends;
        self.direct_sends += other.direct_sends;
        self.send_retries += other.send_retries;
        self.send_failures += other.send_failures;
        self.inline_completions += other.inline_completions;
        self.deferred_completions += other.deferred_completions;
        self.direct_established += other.direct_established;
        self.direct_closed += other.direct_closed;
        self.uptime_secs = self.uptime_secs.max(other.uptime_secs);
    }

    /// Completed fences per second of uptime.
    pub fn fence_rate(&self) -> f64 {
        if self.uptime_secs > 0.0 {
            self.fences_completed as f64 / self.uptime_secs
        } else {
            0.0
        }
    }

    /// Fraction of finished fences that succeeded.
    pub fn success_rate(&self) -> f64 {
        let total = self.fences_completed + self.fences_failed;
        if total > 0 {
            self.fences_completed as f64 / total as f64
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_context_counters() {
        let metrics = FenceMetrics::new();
        metrics.record_completion(CompletionContext::Inline);
        metrics.record_completion(CompletionContext::Inline);
        metrics.record_completion(CompletionContext::Deferred);

        let snap = metrics.snapshot();
        assert_eq!(snap.inline_completions, 2);
        assert_eq!(snap.deferred_completions, 1);
    }

    #[test]
    fn test_success_rate() {
        let metrics = FenceMetrics::new();
        assert_eq!(metrics.snapshot().success_rate(), 1.0);

        metrics.record_fence_completed();
        metrics.record_fence_completed();
        metrics.record_fence_completed();
        metrics.record_fence_failed();
        assert!((metrics.snapshot().success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_sums_counters() {
        let a = FenceMetrics::new();
        a.record_duplicate();
        a.record_upward(100);
        let b = FenceMetrics::new();
        b.record_duplicate();
        b.record_downward(40);

        let mut total = a.snapshot();
        total.merge(&b.snapshot());
        assert_eq!(total.duplicates_dropped, 2);
        assert_eq!(total.upward_bytes, 100);
        assert_eq!(total.downward_bytes, 40);
    }
}
