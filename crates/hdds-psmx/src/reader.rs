// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reader: loaned read/take and loan return.
//!
//! Samples arrive either through [`Reader::try_deliver`] (conventional path,
//! copied into a heap loan) or from a source pipe (the transport's loan
//! itself, zero-copy for raw samples). Both land in the reader cache.
//!
//! # Loan Accounting
//!
//! Every loan handed to the application is registered in the reader's
//! [`LoanManager`] and counted in `lent` (by sample pointer). `read` takes an
//! extra reference (the cache keeps its own); `take` moves the cache's
//! reference out. A loan goes back through `return_loan` or by passing the
//! filled slot to the next `read`/`take`; a second return of the same loan
//! is a `BadParameter` without side effects.
//!
//! A KeepAll reader with a full cache leaves pending samples in its source
//! pipes until a `take` makes room.

use crate::binding::{BoundPipe, EndpointBinding};
use crate::cache::ReaderCache;
use crate::entity::{EntityHandle, EntityKind, Guid};
use crate::error::{Error, Result};
use crate::loan::{LoanManager, LoanRef, LoanedSample, SamplePtr, SampleState};
use crate::psmx::Locator;
use crate::qos::EndpointQos;
use crate::types::{SerDataKind, SerializedData, TypeSupport};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct ReaderState {
    loans: LoanManager,
    cache: ReaderCache,
    lent: HashMap<SamplePtr, u32>,
    deleted: bool,
}

/// Local reader bound to zero or more PSMX source pipes.
pub struct Reader {
    handle: EntityHandle,
    guid: Guid,
    topic_name: String,
    type_support: Arc<TypeSupport>,
    qos: EndpointQos,
    binding: RwLock<EndpointBinding>,
    data_available: Arc<AtomicBool>,
    /// Some pipe has no arrival callback; drain on every access.
    poll_pipes: bool,
    state: Mutex<ReaderState>,
}

impl Reader {
    pub(crate) fn new(
        handle: EntityHandle,
        topic_name: &str,
        type_support: Arc<TypeSupport>,
        qos: EndpointQos,
        binding: EndpointBinding,
    ) -> Self {
        let data_available = Arc::new(AtomicBool::new(false));
        let mut poll_pipes = false;
        for pipe in binding.pipes() {
            let flag = Arc::clone(&data_available);
            let registered = pipe
                .endpoint()
                .on_data_available(Arc::new(move || flag.store(true, Ordering::Release)));
            poll_pipes |= !registered;
        }
        let cache = ReaderCache::new(&qos);
        Self {
            handle,
            guid: Guid::generate(EntityKind::Reader),
            topic_name: topic_name.to_string(),
            type_support,
            qos,
            binding: RwLock::new(binding),
            data_available,
            poll_pipes,
            state: Mutex::new(ReaderState {
                loans: LoanManager::new(),
                cache,
                lent: HashMap::new(),
                deleted: false,
            }),
        }
    }

    #[must_use]
    pub fn handle(&self) -> EntityHandle {
        self.handle
    }

    #[must_use]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[must_use]
    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    #[must_use]
    pub fn type_support(&self) -> &Arc<TypeSupport> {
        &self.type_support
    }

    #[must_use]
    pub fn qos(&self) -> &EndpointQos {
        &self.qos
    }

    #[must_use]
    pub fn pipe_count(&self) -> usize {
        self.binding.read().len()
    }

    #[must_use]
    pub fn locators(&self) -> Vec<Locator> {
        self.binding.read().locators()
    }

    /// Loan-capable pipe of the highest priority, for allocators.
    pub(crate) fn first_loan_pipe(&self) -> Option<BoundPipe> {
        self.binding.read().loan_pipes().next().cloned()
    }

    /// Loans currently held by the application (counting repeats).
    #[must_use]
    pub fn lent_count(&self) -> usize {
        self.state.lock().lent.values().map(|n| *n as usize).sum()
    }

    /// Samples waiting in the cache (pipes not drained).
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Conventional-path delivery. `Ok(false)` means the cache is full
    /// (KeepAll) and the sample was not stored.
    pub fn try_deliver(&self, data: &SerializedData) -> Result<bool> {
        let mut state = self.state.lock();
        if state.deleted {
            return Ok(true);
        }
        if !state.cache.has_room() {
            return Ok(false);
        }
        let loan = self.heap_loan_from(data)?;
        let ReaderState { loans, cache, .. } = &mut *state;
        cache.store(loan, loans)?;
        Ok(true)
    }

    /// Non-destructive loaned read into `buffer`; returns the sample count.
    ///
    /// Filled slots from a previous call are returned first, as by
    /// [`return_loan`](Self::return_loan); if that fails nothing is read.
    pub fn read(&self, buffer: &mut [Option<LoanRef>]) -> Result<usize> {
        self.read_or_take(buffer, false)
    }

    /// Destructive loaned read into `buffer`; returns the sample count.
    pub fn take(&self, buffer: &mut [Option<LoanRef>]) -> Result<usize> {
        self.read_or_take(buffer, true)
    }

    /// Give back loans from `read`/`take`. A buffer without loans is a
    /// no-op.
    ///
    /// A buffer holding anything this reader did not lend is rejected
    /// untouched. If a transport refuses a release, the other slots are
    /// still returned and cleared, the refused loans stay in their slots
    /// and the first error is reported; calling again retries them.
    pub fn return_loan(&self, buffer: &mut [Option<LoanRef>]) -> Result<()> {
        if buffer.iter().all(Option::is_none) {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.check_lent(&state, buffer)?;
        self.release_slots(&mut state, buffer)
    }

    fn read_or_take(&self, buffer: &mut [Option<LoanRef>], take: bool) -> Result<usize> {
        if buffer.is_empty() {
            return Err(Error::BadParameter("empty sample buffer".into()));
        }
        let mut state = self.state.lock();
        if state.deleted {
            return Err(Error::PreconditionNotMet(format!(
                "reader {:?} deleted",
                self.guid
            )));
        }

        self.check_lent(&state, buffer)?;
        self.release_slots(&mut state, buffer)?;

        self.drain_pipes(&mut state);

        let samples = if take {
            state.cache.take(buffer.len())
        } else {
            state.cache.read(buffer.len())
        };
        let mut count = 0;
        for loan in samples {
            if !take {
                if let Err(e) = loan.incref() {
                    log::warn!("[reader] {:?} skipping sample: {}", self.guid, e);
                    continue;
                }
            }
            self.lend(&mut state, &loan)?;
            buffer[count] = Some(loan);
            count += 1;
        }
        Ok(count)
    }

    /// Every filled slot must hold a loan this reader lent out.
    fn check_lent(&self, state: &ReaderState, buffer: &[Option<LoanRef>]) -> Result<()> {
        let mut pending: HashMap<SamplePtr, u32> = HashMap::new();
        for loan in buffer.iter().flatten() {
            let ptr = loan.sample_ptr();
            let seen = pending.entry(ptr).or_insert(0);
            *seen += 1;
            let outstanding = state.lent.get(&ptr).copied().unwrap_or(0);
            if *seen > outstanding || !state.loans.contains(loan) {
                return Err(Error::BadParameter(format!(
                    "sample {:?} is not on loan from this reader",
                    ptr
                )));
            }
        }
        Ok(())
    }

    fn lend(&self, state: &mut ReaderState, loan: &LoanRef) -> Result<()> {
        let ptr = loan.sample_ptr();
        let count = state.lent.get(&ptr).copied().unwrap_or(0);
        if count == 0 {
            state.loans.register(loan)?;
        }
        state.lent.insert(ptr, count + 1);
        Ok(())
    }

    /// Release every filled slot of an already checked buffer. Refused
    /// loans are put back in their slot.
    fn release_slots(&self, state: &mut ReaderState, buffer: &mut [Option<LoanRef>]) -> Result<()> {
        let mut first_error = None;
        for slot in buffer.iter_mut() {
            let Some(loan) = slot.take() else {
                continue;
            };
            if let Err(e) = self.release_lent(state, &loan) {
                log::warn!(
                    "[reader] {:?} loan {:?} not returned: {}",
                    self.guid,
                    loan.sample_ptr(),
                    e
                );
                *slot = Some(loan);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Fails only when the decrement is refused, with nothing changed.
    fn release_lent(&self, state: &mut ReaderState, loan: &LoanRef) -> Result<()> {
        let ptr = loan.sample_ptr();
        let remaining = loan.decref(Some(&mut state.loans))?;
        let lent = state.lent.get(&ptr).copied().unwrap_or(0);
        if lent <= 1 {
            state.lent.remove(&ptr);
            if remaining > 0 {
                // still cached (read without take)
                // mismatches are logged by the manager as defects
                if let Err(e) = state.loans.deregister(loan) {
                    log::debug!("[reader] {:?} returned loan kept registered: {}", self.guid, e);
                }
            }
        } else {
            state.lent.insert(ptr, lent - 1);
        }
        Ok(())
    }

    fn drain_pipes(&self, state: &mut ReaderState) {
        let signalled = self.data_available.swap(false, Ordering::AcqRel);
        if !signalled && !self.poll_pipes {
            return;
        }
        let binding = self.binding.read();
        for pipe in binding.pipes() {
            loop {
                if !state.cache.has_room() {
                    // KeepAll cache full: the rest stays queued in the pipes
                    self.data_available.store(true, Ordering::Release);
                    return;
                }
                let Some(loan) = pipe.endpoint().take() else {
                    break;
                };
                self.ingest(state, loan);
            }
        }
    }

    /// Cache a loan taken from a pipe.
    fn ingest(&self, state: &mut ReaderState, loan: LoanRef) {
        let loan = match loan.state() {
            SampleState::Raw => loan,
            SampleState::SerializedData => {
                let converted = self
                    .type_support
                    .from_loaned_sample(SerDataKind::Data, &loan)
                    .and_then(|data| self.heap_loan_from(&data));
                release_logged(&loan);
                match converted {
                    Ok(heap) => heap,
                    Err(e) => {
                        log::warn!("[reader] {:?} undecodable sample dropped: {}", self.guid, e);
                        return;
                    }
                }
            }
            other => {
                log::warn!("[reader] {:?} dropping {:?} sample from pipe", self.guid, other);
                release_logged(&loan);
                return;
            }
        };
        if !state.cache.has_room() {
            log::debug!("[reader] {:?} cache full, pipe sample dropped", self.guid);
            release_logged(&loan);
            return;
        }
        let ReaderState { loans, cache, .. } = state;
        if let Err(e) = cache.store(loan, loans) {
            log::debug!("[reader] {:?} store failed: {}", self.guid, e);
        }
    }

    fn heap_loan_from(&self, data: &SerializedData) -> Result<LoanRef> {
        let sample = self.type_support.sample_from_serialized(data)?;
        let loan = LoanedSample::heap(sample.len()).ok_or(Error::OutOfResources)?;
        loan.copy_from(&sample)?;
        loan.set_metadata(data.metadata)?;
        loan.set_state(SampleState::Raw)?;
        Ok(loan)
    }

    /// Drop cached samples, release lent loans and pipes.
    pub(crate) fn shutdown(&self) {
        let released = {
            let mut state = self.state.lock();
            state.deleted = true;
            let ReaderState {
                loans, cache, lent, ..
            } = &mut *state;
            cache.clear(loans);
            lent.clear();
            loans.fini()
        };
        self.binding.write().release();
        log::debug!(
            "[reader] {:?} on '{}' deleted ({} lent loans released)",
            self.guid,
            self.topic_name,
            released
        );
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("guid", &self.guid)
            .field("topic", &self.topic_name)
            .field("type", &self.type_support.type_name())
            .finish()
    }
}

fn release_logged(loan: &LoanRef) {
    if let Err(e) = loan.decref(None) {
        log::warn!("[reader] releasing pipe loan failed: {}", e);
    }
}
