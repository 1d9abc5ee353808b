// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity identities and the handle registry used by allocators.
//!
//! Handles are opaque integers; [`EntityRegistry::pin`] resolves one to a
//! live object and keeps it alive for as long as the pin is held.

use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::writer::Writer;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ENTITY_KEY: AtomicU32 = AtomicU32::new(1);

/// RTPS-style 16-byte GUID: 12-byte prefix + 4-byte entity id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Fresh GUID for a local entity of `kind`.
    #[must_use]
    pub fn generate(kind: EntityKind) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&crate::psmx::host_id().to_be_bytes());
        bytes[4..8].copy_from_slice(&std::process::id().to_be_bytes());
        let key = NEXT_ENTITY_KEY.fetch_add(1, Ordering::Relaxed);
        bytes[12..15].copy_from_slice(&key.to_be_bytes()[1..]);
        bytes[15] = kind.entity_kind_octet();
        Self(bytes)
    }

    #[must_use]
    pub fn prefix(&self) -> &[u8] {
        &self.0[..12]
    }

    #[must_use]
    pub fn entity_id(&self) -> [u8; 4] {
        [self.0[12], self.0[13], self.0[14], self.0[15]]
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guid(")?;
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")?;
        for byte in &self.0[12..] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Kind of DDS entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Participant,
    Topic,
    Publisher,
    Subscriber,
    Writer,
    Reader,
}

impl EntityKind {
    /// RTPS entityKind octet (user-defined entities).
    #[must_use]
    pub fn entity_kind_octet(self) -> u8 {
        match self {
            EntityKind::Participant => 0xc1,
            EntityKind::Topic => 0x0a,
            EntityKind::Publisher => 0x08,
            EntityKind::Subscriber => 0x09,
            EntityKind::Writer => 0x02,
            EntityKind::Reader => 0x07,
        }
    }
}

/// Opaque entity handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle(u64);

impl EntityHandle {
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Handle from a raw value (may not name a live entity).
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Object behind a handle.
#[derive(Clone)]
pub enum EntityObject {
    Writer(Arc<Writer>),
    Reader(Arc<Reader>),
    /// Entities without loan behaviour (participant, topic, publisher, subscriber).
    Other(EntityKind),
}

impl EntityObject {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityObject::Writer(_) => EntityKind::Writer,
            EntityObject::Reader(_) => EntityKind::Reader,
            EntityObject::Other(kind) => *kind,
        }
    }
}

impl std::fmt::Debug for EntityObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityObject::Writer(w) => write!(f, "Writer({:?})", w.guid()),
            EntityObject::Reader(r) => write!(f, "Reader({:?})", r.guid()),
            EntityObject::Other(kind) => write!(f, "{:?}", kind),
        }
    }
}

/// A resolved handle; the entity stays alive while pinned.
#[derive(Debug, Clone)]
pub struct PinnedEntity {
    handle: EntityHandle,
    object: EntityObject,
}

impl PinnedEntity {
    #[must_use]
    pub fn handle(&self) -> EntityHandle {
        self.handle
    }

    #[must_use]
    pub fn object(&self) -> &EntityObject {
        &self.object
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.object.kind()
    }
}

/// Concurrent handle -> entity map.
#[derive(Debug)]
pub struct EntityRegistry {
    next: AtomicU64,
    entities: DashMap<EntityHandle, EntityObject>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entities: DashMap::new(),
        }
    }

    /// Reserve a handle before the entity exists.
    #[must_use]
    pub fn next_handle(&self) -> EntityHandle {
        EntityHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Publish `object` under `handle`.
    pub fn insert(&self, handle: EntityHandle, object: EntityObject) {
        self.entities.insert(handle, object);
    }

    /// Register under a new handle.
    pub fn register(&self, object: EntityObject) -> EntityHandle {
        let handle = self.next_handle();
        self.insert(handle, object);
        handle
    }

    pub fn unregister(&self, handle: EntityHandle) -> Option<EntityObject> {
        self.entities.remove(&handle).map(|(_, object)| object)
    }

    /// Resolve `handle`; unknown handles are `BadParameter`.
    pub fn pin(&self, handle: EntityHandle) -> Result<PinnedEntity> {
        self.entities
            .get(&handle)
            .map(|entry| PinnedEntity {
                handle,
                object: entry.value().clone(),
            })
            .ok_or_else(|| Error::BadParameter(format!("unknown entity handle {}", handle.0)))
    }

    pub fn kind_of(&self, handle: EntityHandle) -> Result<EntityKind> {
        self.pin(handle).map(|pinned| pinned.kind())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
