// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reference-counted sample loans.
//!
//! A [`LoanedSample`] owns the memory of exactly one sample. The memory comes
//! either from the heap or from a PSMX pipe ([`LoanOrigin`]) and goes back to
//! that origin exactly once, when the reference count drops to zero (or when
//! the loan is discarded before user code ever saw it).
//!
//! # Reference Counting
//!
//! ```text
//! heap()/request_loan()  refc = 1
//!        |
//!        +-- incref()    origin hook (may veto) -> refc + 1
//!        +-- decref()    origin hook (may veto) -> refc - 1
//!                          |
//!                          +-- refc == 0: deregister from manager, finalize
//! ```
//!
//! The loan's `inner` mutex only guards the buffer, metadata and registration
//! fields. Ownership discipline (which endpoint may decrement) is provided by
//! the owning endpoint's lock, see [`LoanManager`].

use super::manager::{LoanManager, ManagerId};
use crate::entity::Guid;
use crate::error::{Error, Result};
use crate::psmx::metrics::global_metrics;
use crate::psmx::{InstanceId, PsmxEndpoint};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared handle to a loan. Cloning the handle does not take a reference;
/// only [`LoanedSample::incref`] does.
pub type LoanRef = Arc<LoanedSample>;

/// Stable address of a loan's sample buffer, used for pointer lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SamplePtr(usize);

impl SamplePtr {
    /// Address of the first byte of `data`.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(data.as_ptr() as usize)
    }

    #[must_use]
    pub fn addr(self) -> usize {
        self.0
    }
}

/// Content of a loan's buffer. Set once, on first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleState {
    /// Nothing written yet.
    #[default]
    Uninitialized,
    /// In-memory representation of a fixed-size type.
    Raw,
    /// Serialized key only.
    SerializedKey,
    /// Serialized sample.
    SerializedData,
}

/// Data representation used for serialized payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingVersion {
    #[default]
    Xcdr1,
    Xcdr2,
}

/// Status flag: sample carries valid data.
pub const STATUS_VALID_DATA: u32 = 0;
/// Status flag: instance disposed.
pub const STATUS_DISPOSED: u32 = 1 << 0;
/// Status flag: instance unregistered.
pub const STATUS_UNREGISTERED: u32 = 1 << 1;

/// Metadata stamped into a loan by the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleMetadata {
    /// Originating writer.
    pub source: Guid,
    /// Source timestamp (ns since UNIX epoch).
    pub timestamp_ns: i64,
    /// Writer sequence number.
    pub sequence: u64,
    /// `STATUS_*` flags.
    pub status_flags: u32,
    /// Hash of the key (32-bit FNV-1a of `key_hash`).
    pub hash: u32,
    /// Encoding of serialized content.
    pub encoding: EncodingVersion,
    /// 16-byte instance key hash.
    pub key_hash: [u8; 16],
    /// Number of meaningful bytes in the buffer.
    pub sample_size: usize,
}

/// Where a loan's memory came from, and where it returns on finalize.
#[derive(Clone)]
pub enum LoanOrigin {
    /// Plain heap allocation, freed on finalize.
    Heap,
    /// Chunk owned by a PSMX pipe, handed back via `release_loan`.
    Psmx(Arc<dyn PsmxEndpoint>),
}

impl LoanOrigin {
    #[must_use]
    pub fn is_heap(&self) -> bool {
        matches!(self, LoanOrigin::Heap)
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&Arc<dyn PsmxEndpoint>> {
        match self {
            LoanOrigin::Heap => None,
            LoanOrigin::Psmx(ep) => Some(ep),
        }
    }

    /// PSMX instance the chunk belongs to (`None` for heap loans).
    #[must_use]
    pub fn instance_id(&self) -> Option<InstanceId> {
        self.endpoint().map(|ep| ep.instance_id())
    }
}

impl std::fmt::Debug for LoanOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoanOrigin::Heap => write!(f, "Heap"),
            LoanOrigin::Psmx(ep) => write!(f, "Psmx(instance={:#010x})", ep.instance_id()),
        }
    }
}

/// Slot a loan occupies in a [`LoanManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub manager: ManagerId,
    pub index: usize,
}

struct LoanInner {
    /// `None` once finalized.
    buffer: Option<Box<[u8]>>,
    metadata: SampleMetadata,
    state: SampleState,
    registration: Option<Registration>,
}

/// One sample's memory plus its ownership state.
pub struct LoanedSample {
    ptr: SamplePtr,
    len: usize,
    origin: LoanOrigin,
    refc: AtomicU32,
    inner: Mutex<LoanInner>,
}

impl LoanedSample {
    /// Allocate a zeroed heap loan of `size` bytes.
    ///
    /// Returns `None` on allocation failure or for `size == 0`.
    #[must_use]
    pub fn heap(size: usize) -> Option<LoanRef> {
        if size == 0 {
            return None;
        }
        let mut data: Vec<u8> = Vec::new();
        if data.try_reserve_exact(size).is_err() {
            log::warn!("[loan] heap allocation of {} bytes failed", size);
            return None;
        }
        data.resize(size, 0);
        global_metrics().inc_heap_loans();
        Some(Arc::new(Self::from_parts(
            data.into_boxed_slice(),
            size,
            LoanOrigin::Heap,
        )))
    }

    /// Wrap a transport chunk. Plugins call this from `request_loan`/`take`.
    ///
    /// `len` is clamped to the chunk size.
    #[must_use]
    pub fn from_chunk(chunk: Box<[u8]>, len: usize, origin: Arc<dyn PsmxEndpoint>) -> LoanRef {
        let len = len.min(chunk.len());
        Arc::new(Self::from_parts(chunk, len, LoanOrigin::Psmx(origin)))
    }

    fn from_parts(buffer: Box<[u8]>, len: usize, origin: LoanOrigin) -> Self {
        Self {
            ptr: SamplePtr::of(&buffer),
            len,
            origin,
            refc: AtomicU32::new(1),
            inner: Mutex::new(LoanInner {
                buffer: Some(buffer),
                metadata: SampleMetadata::default(),
                state: SampleState::Uninitialized,
                registration: None,
            }),
        }
    }

    #[must_use]
    pub fn sample_ptr(&self) -> SamplePtr {
        self.ptr
    }

    /// Sample size in bytes (a transport chunk may be larger).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn origin(&self) -> &LoanOrigin {
        &self.origin
    }

    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refc.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.inner.lock().buffer.is_none()
    }

    #[must_use]
    pub fn state(&self) -> SampleState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn metadata(&self) -> SampleMetadata {
        self.inner.lock().metadata
    }

    #[must_use]
    pub fn registration(&self) -> Option<Registration> {
        self.inner.lock().registration
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registration().is_some()
    }

    pub(crate) fn set_registration(&self, registration: Option<Registration>) {
        self.inner.lock().registration = registration;
    }

    /// Transition out of `Uninitialized`. Allowed exactly once.
    pub fn set_state(&self, state: SampleState) -> Result<()> {
        if state == SampleState::Uninitialized {
            return Err(Error::BadParameter(
                "cannot reset a sample to uninitialized".into(),
            ));
        }
        let mut inner = self.inner.lock();
        if inner.buffer.is_none() {
            return Err(released(self.ptr));
        }
        if inner.state != SampleState::Uninitialized {
            return Err(Error::PreconditionNotMet(format!(
                "sample state already {:?}",
                inner.state
            )));
        }
        inner.state = state;
        Ok(())
    }

    /// Stamp write-path metadata.
    pub fn set_metadata(&self, metadata: SampleMetadata) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.buffer.is_none() {
            return Err(released(self.ptr));
        }
        inner.metadata = metadata;
        Ok(())
    }

    /// Run `f` over the sample bytes.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let inner = self.inner.lock();
        let buffer = inner.buffer.as_deref().ok_or_else(|| released(self.ptr))?;
        Ok(f(&buffer[..self.len]))
    }

    /// Run `f` over the mutable sample bytes.
    pub fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        let buffer = inner
            .buffer
            .as_deref_mut()
            .ok_or_else(|| released(self.ptr))?;
        Ok(f(&mut buffer[..self.len]))
    }

    /// Copy of the sample bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_buffer(<[u8]>::to_vec)
    }

    /// Copy `data` to the start of the buffer.
    pub fn copy_from(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.len {
            return Err(Error::BadParameter(format!(
                "{} bytes do not fit a {}-byte loan",
                data.len(),
                self.len
            )));
        }
        self.with_buffer_mut(|buf| buf[..data.len()].copy_from_slice(data))
    }

    /// Take an additional reference.
    ///
    /// The origin's hook runs first and may refuse.
    pub fn incref(&self) -> Result<()> {
        if self.is_finalized() {
            return Err(released(self.ptr));
        }
        if let LoanOrigin::Psmx(ep) = &self.origin {
            ep.loan_incref(self)?;
        }
        self.refc.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop one reference; returns the remaining count.
    ///
    /// The origin's hook runs first and may veto, leaving the count
    /// unchanged. Dropping the last reference deregisters the loan from
    /// `manager` (which must be the owning manager if the loan is
    /// registered) and finalizes it.
    pub fn decref(&self, manager: Option<&mut LoanManager>) -> Result<u32> {
        if self.is_finalized() {
            return Err(released(self.ptr));
        }
        let last = self.refcount() <= 1;
        if last {
            // Check ownership before any state changes.
            if let Some(reg) = self.registration() {
                if manager.as_ref().map(|m| m.id()) != Some(reg.manager) {
                    return Err(defect(format!(
                        "last reference of {:?} released outside its manager {:?}",
                        self.ptr, reg.manager
                    )));
                }
            }
        }
        if let LoanOrigin::Psmx(ep) = &self.origin {
            ep.loan_decref(self)?;
        }
        if !last {
            let prev = self.refc.fetch_sub(1, Ordering::AcqRel);
            return Ok(prev.saturating_sub(1));
        }
        if self.is_registered() {
            LoanManager::deregister_opt(manager, self)?;
        }
        self.refc.store(0, Ordering::Release);
        self.finalize();
        Ok(0)
    }

    /// Deregister and finalize regardless of the reference count.
    ///
    /// Used for loans no user code has observed (write path failures,
    /// aborted batch requests, transport queues dropping samples).
    pub fn discard(&self, manager: Option<&mut LoanManager>) -> Result<()> {
        if self.is_finalized() {
            return Err(released(self.ptr));
        }
        if self.is_registered() {
            LoanManager::deregister_opt(manager, self)?;
            if self.is_registered() {
                return Err(defect(format!(
                    "discard of {:?} without its owning manager",
                    self.ptr
                )));
            }
        }
        self.refc.store(0, Ordering::Release);
        self.finalize();
        Ok(())
    }

    /// Finalize after the owning manager already cleared the slot.
    pub(crate) fn finalize_unregistered(&self) {
        self.refc.store(0, Ordering::Release);
        self.finalize();
    }

    fn finalize(&self) {
        let buffer = {
            let mut inner = self.inner.lock();
            inner.registration = None;
            inner.buffer.take()
        };
        let Some(buffer) = buffer else {
            log::error!("[loan] defect: {:?} finalized twice", self.ptr);
            return;
        };
        global_metrics().inc_finalized();
        match &self.origin {
            LoanOrigin::Heap => drop(buffer),
            LoanOrigin::Psmx(ep) => ep.release_loan(self, buffer),
        }
    }
}

impl Drop for LoanedSample {
    fn drop(&mut self) {
        if self.inner.get_mut().buffer.is_some() {
            log::debug!(
                "[loan] {:?} dropped with refc={} before finalize, releasing to {:?}",
                self.ptr,
                self.refcount(),
                self.origin
            );
            self.finalize();
        }
    }
}

impl std::fmt::Debug for LoanedSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LoanedSample")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("origin", &self.origin)
            .field("refc", &self.refcount())
            .field("state", &inner.state)
            .field("registration", &inner.registration)
            .field("finalized", &inner.buffer.is_none())
            .finish()
    }
}

fn released(ptr: SamplePtr) -> Error {
    Error::PreconditionNotMet(format!("loan {:?} already released", ptr))
}

/// Bookkeeping invariant violation. Unreachable through valid use.
pub(crate) fn defect(msg: String) -> Error {
    log::error!("[loan] defect: {}", msg);
    Error::PreconditionNotMet(msg)
}

/// Current wall-clock time in nanoseconds since the UNIX epoch.
#[must_use]
pub fn current_time_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_loan_basics() {
        let loan = LoanedSample::heap(16).expect("heap loan");
        assert_eq!(loan.len(), 16);
        assert_eq!(loan.refcount(), 1);
        assert!(loan.origin().is_heap());
        assert_eq!(loan.state(), SampleState::Uninitialized);
        assert!(!loan.is_registered());
        assert_eq!(loan.to_vec().unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_heap_loan_zero_size() {
        assert!(LoanedSample::heap(0).is_none());
    }

    #[test]
    fn test_sample_ptr_is_buffer_address() {
        let loan = LoanedSample::heap(8).unwrap();
        let addr = loan.with_buffer(|b| SamplePtr::of(b)).unwrap();
        assert_eq!(addr, loan.sample_ptr());
    }

    #[test]
    fn test_state_transitions_once() {
        let loan = LoanedSample::heap(4).unwrap();
        loan.set_state(SampleState::Raw).unwrap();
        assert_eq!(loan.state(), SampleState::Raw);
        assert!(matches!(
            loan.set_state(SampleState::SerializedData),
            Err(Error::PreconditionNotMet(_))
        ));
        assert!(matches!(
            loan.set_state(SampleState::Uninitialized),
            Err(Error::BadParameter(_))
        ));
        assert_eq!(loan.state(), SampleState::Raw);
    }

    #[test]
    fn test_copy_from_bounds() {
        let loan = LoanedSample::heap(4).unwrap();
        loan.copy_from(&[1, 2]).unwrap();
        assert_eq!(loan.to_vec().unwrap(), vec![1, 2, 0, 0]);
        assert!(matches!(
            loan.copy_from(&[0; 5]),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn test_refcount_to_zero_finalizes() {
        let loan = LoanedSample::heap(4).unwrap();
        loan.incref().unwrap();
        assert_eq!(loan.decref(None).unwrap(), 1);
        assert!(!loan.is_finalized());
        assert_eq!(loan.decref(None).unwrap(), 0);
        assert!(loan.is_finalized());
        assert!(matches!(loan.decref(None), Err(Error::PreconditionNotMet(_))));
        assert!(matches!(loan.incref(), Err(Error::PreconditionNotMet(_))));
        assert!(loan.to_vec().is_err());
    }

    #[test]
    fn test_discard_ignores_refcount() {
        let loan = LoanedSample::heap(4).unwrap();
        loan.incref().unwrap();
        loan.incref().unwrap();
        loan.discard(None).unwrap();
        assert!(loan.is_finalized());
        assert_eq!(loan.refcount(), 0);
    }

    #[test]
    fn test_registered_last_ref_requires_manager() {
        let mut manager = LoanManager::new();
        let loan = LoanedSample::heap(4).unwrap();
        manager.register(&loan).unwrap();

        // Without the owning manager the last reference cannot go.
        assert!(loan.decref(None).is_err());
        assert!(!loan.is_finalized());
        assert_eq!(loan.refcount(), 1);

        let mut other = LoanManager::new();
        assert!(loan.decref(Some(&mut other)).is_err());

        assert_eq!(loan.decref(Some(&mut manager)).unwrap(), 0);
        assert!(manager.is_empty());
        assert!(loan.is_finalized());
    }

    #[test]
    fn test_metadata_stamp() {
        let loan = LoanedSample::heap(4).unwrap();
        let meta = SampleMetadata {
            sequence: 7,
            sample_size: 4,
            ..SampleMetadata::default()
        };
        loan.set_metadata(meta).unwrap();
        assert_eq!(loan.metadata().sequence, 7);
    }

    #[test]
    fn test_current_time_positive() {
        assert!(current_time_ns() > 0);
    }
}
