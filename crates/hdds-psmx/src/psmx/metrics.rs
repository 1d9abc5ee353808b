// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PSMX Loan Metrics
//!
//! Atomic counters for loan and pipe activity. All metrics are thread-safe
//! and can be read/reset from any thread.
//!
//! # Tracked Metrics
//!
//! - `transport_loans`: Loans obtained from a PSMX pipe
//! - `heap_loans`: Heap loans allocated
//! - `loan_exhausted`: `request_loan` calls a pipe answered with nothing
//! - `pipe_writes`: Loans handed to a sink pipe
//! - `pipe_write_failures`: Sink pipe writes the transport refused
//! - `pipe_takes`: Loans taken from a source pipe
//! - `conventional_writes`: Writes delivered without a transport loan
//! - `network_unsent`: Writes with remote readers matched but no network sink
//! - `finalized`: Loans returned to their origin

use std::sync::atomic::{AtomicU64, Ordering};

/// PSMX metrics with atomic counters.
///
/// All counters use `Relaxed` ordering; values are eventually consistent.
#[derive(Debug, Default)]
pub struct PsmxMetrics {
    pub transport_loans: AtomicU64,
    pub heap_loans: AtomicU64,
    pub loan_exhausted: AtomicU64,
    pub pipe_writes: AtomicU64,
    pub pipe_write_failures: AtomicU64,
    pub pipe_takes: AtomicU64,
    pub conventional_writes: AtomicU64,
    pub network_unsent: AtomicU64,
    pub finalized: AtomicU64,
}

impl PsmxMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            transport_loans: AtomicU64::new(0),
            heap_loans: AtomicU64::new(0),
            loan_exhausted: AtomicU64::new(0),
            pipe_writes: AtomicU64::new(0),
            pipe_write_failures: AtomicU64::new(0),
            pipe_takes: AtomicU64::new(0),
            conventional_writes: AtomicU64::new(0),
            network_unsent: AtomicU64::new(0),
            finalized: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_transport_loans(&self) {
        self.transport_loans.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_heap_loans(&self) {
        self.heap_loans.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_loan_exhausted(&self) {
        self.loan_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_pipe_writes(&self) {
        self.pipe_writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_pipe_write_failures(&self) {
        self.pipe_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_pipe_takes(&self) {
        self.pipe_takes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_conventional_writes(&self) {
        self.conventional_writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_network_unsent(&self) {
        self.network_unsent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_finalized(&self) {
        self.finalized.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.transport_loans,
            &self.heap_loans,
            &self.loan_exhausted,
            &self.pipe_writes,
            &self.pipe_write_failures,
            &self.pipe_takes,
            &self.conventional_writes,
            &self.network_unsent,
            &self.finalized,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PsmxMetricsSnapshot {
        PsmxMetricsSnapshot {
            transport_loans: self.transport_loans.load(Ordering::Relaxed),
            heap_loans: self.heap_loans.load(Ordering::Relaxed),
            loan_exhausted: self.loan_exhausted.load(Ordering::Relaxed),
            pipe_writes: self.pipe_writes.load(Ordering::Relaxed),
            pipe_write_failures: self.pipe_write_failures.load(Ordering::Relaxed),
            pipe_takes: self.pipe_takes.load(Ordering::Relaxed),
            conventional_writes: self.conventional_writes.load(Ordering::Relaxed),
            network_unsent: self.network_unsent.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of PSMX metrics (non-atomic, for reporting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PsmxMetricsSnapshot {
    pub transport_loans: u64,
    pub heap_loans: u64,
    pub loan_exhausted: u64,
    pub pipe_writes: u64,
    pub pipe_write_failures: u64,
    pub pipe_takes: u64,
    pub conventional_writes: u64,
    pub network_unsent: u64,
    pub finalized: u64,
}

impl PsmxMetricsSnapshot {
    /// Share of writes that went through a sink pipe.
    ///
    /// Returns 0.0 if no writes have occurred.
    #[must_use]
    pub fn zero_copy_ratio(&self) -> f64 {
        let total = self.pipe_writes + self.conventional_writes;
        if total == 0 {
            0.0
        } else {
            self.pipe_writes as f64 / total as f64
        }
    }
}

impl std::fmt::Display for PsmxMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PSMX[loans={}, heap={}, exhausted={}, pipe_writes={}, pipe_failures={}, takes={}, conventional={}, unsent={}, finalized={}]",
            self.transport_loans,
            self.heap_loans,
            self.loan_exhausted,
            self.pipe_writes,
            self.pipe_write_failures,
            self.pipe_takes,
            self.conventional_writes,
            self.network_unsent,
            self.finalized
        )
    }
}

static GLOBAL_METRICS: PsmxMetrics = PsmxMetrics::new();

/// Process-wide PSMX metrics.
#[must_use]
pub fn global_metrics() -> &'static PsmxMetrics {
    &GLOBAL_METRICS
}
