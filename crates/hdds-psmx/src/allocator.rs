// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raw-buffer allocation routed to the heap or to an entity's PSMX pipe.
//!
//! ```text
//! bind(Heap)            -> Heap
//! bind(Entity(writer))  -> Publisher(sink pipe)   | Heap (no loan pipe)
//! bind(Entity(reader))  -> Subscriber(source pipe) | Heap (no loan pipe)
//! bind(Entity(other))   -> IllegalOperation
//! ```
//!
//! A subscriber allocator never allocates; it exists so that buffers
//! obtained on the read side can be released through the same facade, which
//! routes them back to the bound reader.

use crate::entity::{EntityHandle, EntityObject, EntityRegistry, PinnedEntity};
use crate::error::{Error, Result};
use crate::loan::{LoanManager, LoanRef, LoanedSample};
use crate::psmx::PsmxEndpoint;
use std::sync::Arc;

/// What an allocator is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorTarget {
    Heap,
    Entity(EntityHandle),
}

/// Routing of an allocator.
#[derive(Clone, Default)]
pub enum AllocatorKind {
    #[default]
    Unbound,
    Heap,
    Publisher(Arc<dyn PsmxEndpoint>),
    Subscriber(Arc<dyn PsmxEndpoint>),
}

impl AllocatorKind {
    #[must_use]
    pub fn is_unbound(&self) -> bool {
        matches!(self, AllocatorKind::Unbound)
    }

    #[must_use]
    pub fn is_heap(&self) -> bool {
        matches!(self, AllocatorKind::Heap)
    }
}

impl std::fmt::Debug for AllocatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocatorKind::Unbound => write!(f, "Unbound"),
            AllocatorKind::Heap => write!(f, "Heap"),
            AllocatorKind::Publisher(ep) => write!(f, "Publisher(instance={})", ep.instance_id()),
            AllocatorKind::Subscriber(ep) => {
                write!(f, "Subscriber(instance={})", ep.instance_id())
            }
        }
    }
}

/// Buffer allocator for one entity (or the heap).
#[derive(Debug, Default)]
pub struct DataAllocator {
    kind: AllocatorKind,
    entity: Option<PinnedEntity>,
    allocations: LoanManager,
}

impl DataAllocator {
    /// Resolve `target` and bind.
    ///
    /// Unknown handles are `BadParameter`; entities other than readers and
    /// writers are `IllegalOperation`.
    pub fn bind(registry: &EntityRegistry, target: AllocatorTarget) -> Result<Self> {
        let handle = match target {
            AllocatorTarget::Heap => {
                return Ok(Self {
                    kind: AllocatorKind::Heap,
                    entity: None,
                    allocations: LoanManager::new(),
                })
            }
            AllocatorTarget::Entity(handle) => handle,
        };
        let pinned = registry.pin(handle)?;
        let kind = match pinned.object() {
            EntityObject::Writer(writer) => writer
                .first_loan_pipe()
                .map_or(AllocatorKind::Heap, |pipe| {
                    AllocatorKind::Publisher(Arc::clone(pipe.endpoint()))
                }),
            EntityObject::Reader(reader) => reader
                .first_loan_pipe()
                .map_or(AllocatorKind::Heap, |pipe| {
                    AllocatorKind::Subscriber(Arc::clone(pipe.endpoint()))
                }),
            EntityObject::Other(kind) => {
                return Err(Error::IllegalOperation(format!(
                    "cannot bind an allocator to a {:?}",
                    kind
                )))
            }
        };
        log::debug!("[allocator] handle {} bound as {:?}", handle.raw(), kind);
        Ok(Self {
            kind,
            entity: Some(pinned),
            allocations: LoanManager::new(),
        })
    }

    #[must_use]
    pub fn kind(&self) -> &AllocatorKind {
        &self.kind
    }

    /// Handle of the bound entity, if any.
    #[must_use]
    pub fn entity(&self) -> Option<EntityHandle> {
        self.entity.as_ref().map(PinnedEntity::handle)
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.allocations.len()
    }

    /// Allocate `size` bytes. `None` when unbound, for subscribers, on pipe
    /// exhaustion or when the heap allocation fails.
    pub fn allocate(&mut self, size: usize) -> Option<LoanRef> {
        let loan = match &self.kind {
            AllocatorKind::Unbound | AllocatorKind::Subscriber(_) => return None,
            AllocatorKind::Heap => LoanedSample::heap(size)?,
            AllocatorKind::Publisher(endpoint) => endpoint.request_loan(size)?,
        };
        if let Err(e) = self.allocations.register(&loan) {
            log::warn!("[allocator] tracking allocation failed: {}", e);
            if let Err(e) = loan.discard(None) {
                log::warn!("[allocator] discarding allocation failed: {}", e);
            }
            return None;
        }
        Some(loan)
    }

    /// Release a buffer.
    ///
    /// Heap and publisher allocators release what they allocated. A
    /// subscriber allocator hands the buffer back to its reader, which must
    /// have lent it out through `read`/`take`.
    ///
    /// Releasing twice, releasing a foreign buffer, or releasing through an
    /// unbound allocator is `PreconditionNotMet`.
    pub fn release(&mut self, loan: &LoanRef) -> Result<()> {
        match &self.kind {
            AllocatorKind::Unbound => {
                return Err(Error::PreconditionNotMet("allocator not bound".into()))
            }
            AllocatorKind::Subscriber(_) => return self.release_to_reader(loan),
            AllocatorKind::Heap | AllocatorKind::Publisher(_) => {}
        }
        if !self.allocations.contains(loan) {
            return Err(Error::PreconditionNotMet(format!(
                "buffer {:?} not allocated here or already released",
                loan.sample_ptr()
            )));
        }
        loan.discard(Some(&mut self.allocations))
    }

    fn release_to_reader(&self, loan: &LoanRef) -> Result<()> {
        let Some(EntityObject::Reader(reader)) = self.entity.as_ref().map(PinnedEntity::object)
        else {
            return Err(Error::PreconditionNotMet(
                "subscriber allocator without a reader".into(),
            ));
        };
        let mut slot = [Some(Arc::clone(loan))];
        reader.return_loan(&mut slot).map_err(|e| match e {
            Error::BadParameter(_) => Error::PreconditionNotMet(format!(
                "buffer {:?} not on loan from reader {:?} or already released",
                loan.sample_ptr(),
                reader.guid()
            )),
            other => other,
        })
    }

    /// Release outstanding allocations, unpin, reset to unbound.
    pub fn unbind(&mut self) {
        let leaked = self.allocations.len();
        if leaked > 0 {
            log::warn!(
                "[allocator] unbind with {} outstanding allocation(s), releasing",
                leaked
            );
        }
        self.allocations.fini();
        self.entity = None;
        self.kind = AllocatorKind::Unbound;
    }
}

impl Drop for DataAllocator {
    fn drop(&mut self) {
        if !self.kind.is_unbound() {
            self.unbind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;

    #[test]
    fn test_heap_allocator() {
        let registry = EntityRegistry::new();
        let mut alloc = DataAllocator::bind(&registry, AllocatorTarget::Heap).unwrap();
        assert!(alloc.kind().is_heap());
        let buf = alloc.allocate(32).unwrap();
        assert_eq!(buf.len(), 32);
        assert_eq!(alloc.outstanding(), 1);
        alloc.release(&buf).unwrap();
        assert!(buf.is_finalized());
        assert!(matches!(alloc.release(&buf), Err(Error::PreconditionNotMet(_))));
    }

    #[test]
    fn test_foreign_release() {
        let registry = EntityRegistry::new();
        let mut alloc = DataAllocator::bind(&registry, AllocatorTarget::Heap).unwrap();
        let foreign = LoanedSample::heap(4).unwrap();
        assert!(matches!(alloc.release(&foreign), Err(Error::PreconditionNotMet(_))));
        assert!(!foreign.is_finalized());
    }

    #[test]
    fn test_unbind_releases_and_resets() {
        let registry = EntityRegistry::new();
        let mut alloc = DataAllocator::bind(&registry, AllocatorTarget::Heap).unwrap();
        let buf = alloc.allocate(8).unwrap();
        alloc.unbind();
        assert!(buf.is_finalized());
        assert!(alloc.kind().is_unbound());
        assert!(alloc.allocate(8).is_none());
        assert!(matches!(alloc.release(&buf), Err(Error::PreconditionNotMet(_))));
    }

    #[test]
    fn test_bind_errors() {
        let registry = EntityRegistry::new();
        let topic = registry.register(EntityObject::Other(EntityKind::Topic));
        assert!(matches!(
            DataAllocator::bind(&registry, AllocatorTarget::Entity(topic)),
            Err(Error::IllegalOperation(_))
        ));
        assert!(matches!(
            DataAllocator::bind(&registry, AllocatorTarget::Entity(EntityHandle::from_raw(999))),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn test_zero_size_heap_allocation() {
        let registry = EntityRegistry::new();
        let mut alloc = DataAllocator::bind(&registry, AllocatorTarget::Heap).unwrap();
        assert!(alloc.allocate(0).is_none());
    }
}
