// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reader sample cache holding loans, with read/take semantics.
//!
//! ```text
//! Buffer: [L0][L1][L2][L3]
//!          ^           ^
//!        oldest      newest
//!
//! read()  -> clones from the front, marks READ (cache keeps its reference)
//! take()  -> removes from the front (reference moves to the caller)
//! ```
//!
//! The cache owns one reference on every loan it holds. Eviction (KeepLast)
//! and [`ReaderCache::clear`] give that reference back.

use crate::error::{Error, Result};
use crate::loan::{LoanManager, LoanRef};
use crate::qos::{EndpointQos, History};
use std::collections::VecDeque;

/// NOT_READ vs READ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    NotRead,
    Read,
}

#[derive(Debug)]
struct CachedLoan {
    loan: LoanRef,
    state: ReadState,
}

/// Bounded loan cache of one reader.
#[derive(Debug)]
pub struct ReaderCache {
    samples: VecDeque<CachedLoan>,
    history: History,
    capacity: usize,
}

impl ReaderCache {
    #[must_use]
    pub fn new(qos: &EndpointQos) -> Self {
        let capacity = qos.cache_capacity().max(1);
        Self {
            samples: VecDeque::with_capacity(capacity.min(64)),
            history: qos.history,
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether [`store`](Self::store) would accept a sample (KeepLast always does).
    #[must_use]
    pub fn has_room(&self) -> bool {
        matches!(self.history, History::KeepLast(_)) || self.samples.len() < self.capacity
    }

    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.samples
            .iter()
            .filter(|s| s.state == ReadState::NotRead)
            .count()
    }

    /// Insert `loan`, taking over the caller's reference.
    ///
    /// KeepLast evicts the oldest sample when full. KeepAll refuses with
    /// `OutOfResources` and releases the loan.
    pub fn store(&mut self, loan: LoanRef, loans: &mut LoanManager) -> Result<()> {
        if self.samples.len() >= self.capacity {
            match self.history {
                History::KeepLast(_) => {
                    if let Some(evicted) = self.samples.pop_front() {
                        release_logged(&evicted.loan, loans);
                    }
                }
                History::KeepAll => {
                    release_logged(&loan, loans);
                    return Err(Error::OutOfResources);
                }
            }
        }
        self.samples.push_back(CachedLoan {
            loan,
            state: ReadState::NotRead,
        });
        Ok(())
    }

    /// Up to `max` loans from the front, marked READ. The cache keeps its
    /// references; the caller must take its own.
    pub fn read(&mut self, max: usize) -> Vec<LoanRef> {
        self.samples
            .iter_mut()
            .take(max)
            .map(|s| {
                s.state = ReadState::Read;
                LoanRef::clone(&s.loan)
            })
            .collect()
    }

    /// Remove up to `max` loans from the front; their references move to the
    /// caller.
    pub fn take(&mut self, max: usize) -> Vec<LoanRef> {
        let n = max.min(self.samples.len());
        self.samples.drain(..n).map(|s| s.loan).collect()
    }

    /// Give back every cached reference.
    pub fn clear(&mut self, loans: &mut LoanManager) {
        for cached in self.samples.drain(..) {
            release_logged(&cached.loan, loans);
        }
    }
}

fn release_logged(loan: &LoanRef, loans: &mut LoanManager) {
    if let Err(e) = loan.decref(Some(loans)) {
        log::warn!("[reader] releasing cached loan failed: {}", e);
    }
}
