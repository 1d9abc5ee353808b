// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-endpoint loan registry.
//!
//! Tracks the loans an endpoint has handed to user code (or is holding while
//! a write is in flight) so that pointers coming back from the application
//! can be mapped to their loans and released. Slots are reused; the table
//! grows by doubling when full.
//!
//! The manager itself is not synchronized: it lives inside its endpoint's
//! lock, and every mutation happens under that lock.

use super::sample::{defect, LoanRef, LoanedSample, Registration, SamplePtr};
use crate::config::DEFAULT_LOAN_POOL_CAPACITY;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`LoanManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(u64);

/// Growable table of registered loans.
pub struct LoanManager {
    id: ManagerId,
    slots: Vec<Option<LoanRef>>,
    live: usize,
}

impl LoanManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOAN_POOL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            id: ManagerId(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed)),
            slots: vec![None; capacity.max(1)],
            live: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> ManagerId {
        self.id
    }

    /// Current slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of registered loans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Store `loan` in the first free slot and record the slot in the loan.
    pub fn register(&mut self, loan: &LoanRef) -> Result<usize> {
        if loan.is_finalized() {
            return Err(Error::PreconditionNotMet(
                "cannot register a released loan".into(),
            ));
        }
        if let Some(reg) = loan.registration() {
            return Err(Error::BadParameter(format!(
                "loan {:?} already registered in {:?}",
                loan.sample_ptr(),
                reg.manager
            )));
        }
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                let old = self.slots.len();
                self.slots.resize(old * 2, None);
                log::debug!("[loan] manager {:?} grew {} -> {}", self.id, old, old * 2);
                old
            }
        };
        self.slots[index] = Some(Arc::clone(loan));
        loan.set_registration(Some(Registration {
            manager: self.id,
            index,
        }));
        self.live += 1;
        Ok(index)
    }

    /// Remove `loan` from its slot.
    ///
    /// The loan must be registered here, at the slot it records. Anything
    /// else is a bookkeeping defect.
    pub fn deregister(&mut self, loan: &LoanedSample) -> Result<()> {
        let Some(reg) = loan.registration() else {
            return Err(defect(format!(
                "deregister of unregistered loan {:?}",
                loan.sample_ptr()
            )));
        };
        if reg.manager != self.id {
            return Err(defect(format!(
                "loan {:?} belongs to {:?}, not {:?}",
                loan.sample_ptr(),
                reg.manager,
                self.id
            )));
        }
        let matches = self
            .slots
            .get(reg.index)
            .and_then(Option::as_ref)
            .is_some_and(|slot| std::ptr::eq(Arc::as_ptr(slot), loan));
        if !matches {
            return Err(defect(format!(
                "slot {} of {:?} does not hold loan {:?}",
                reg.index,
                self.id,
                loan.sample_ptr()
            )));
        }
        self.slots[reg.index] = None;
        loan.set_registration(None);
        self.live -= 1;
        Ok(())
    }

    /// [`deregister`](Self::deregister) on an optional manager; no manager is a no-op.
    pub fn deregister_opt(manager: Option<&mut Self>, loan: &LoanedSample) -> Result<()> {
        match manager {
            Some(manager) => manager.deregister(loan),
            None => Ok(()),
        }
    }

    /// Registered loan whose sample pointer equals `ptr`.
    #[must_use]
    pub fn find_by_ptr(&self, ptr: SamplePtr) -> Option<LoanRef> {
        self.slots
            .iter()
            .flatten()
            .find(|loan| loan.sample_ptr() == ptr)
            .cloned()
    }

    /// Whether this exact loan is registered here.
    #[must_use]
    pub fn contains(&self, loan: &LoanRef) -> bool {
        self.find_by_ptr(loan.sample_ptr())
            .is_some_and(|found| Arc::ptr_eq(&found, loan))
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&LoanRef> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoanRef> {
        self.slots.iter().flatten()
    }

    /// Finalize every registered loan; returns how many were released.
    ///
    /// Each loan should be at its last reference by now; anything else is
    /// logged as a defect and finalized anyway.
    pub fn fini(&mut self) -> usize {
        let mut released = 0;
        for slot in &mut self.slots {
            let Some(loan) = slot.take() else {
                continue;
            };
            loan.set_registration(None);
            let refc = loan.refcount();
            if refc != 1 {
                log::error!(
                    "[loan] defect: {:?} still has refc={} at manager teardown",
                    loan.sample_ptr(),
                    refc
                );
            }
            if !loan.is_finalized() {
                loan.finalize_unregistered();
            }
            released += 1;
        }
        self.live = 0;
        released
    }
}

impl Default for LoanManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LoanManager {
    fn drop(&mut self) {
        if self.live > 0 {
            let released = self.fini();
            log::debug!("[loan] manager {:?} released {} loans on drop", self.id, released);
        }
    }
}

impl std::fmt::Debug for LoanManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoanManager")
            .field("id", &self.id)
            .field("capacity", &self.slots.len())
            .field("live", &self.live)
            .finish()
    }
}
