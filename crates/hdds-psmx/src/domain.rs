// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain: endpoint creation and intra-process matching.
//!
//! # Architecture
//!
//! ```text
//! Domain
//! +-- catalog: Arc<TransportCatalog>          (PSMX instances)
//! +-- registry: EntityRegistry                (handle -> entity)
//! +-- endpoints: Mutex<HashMap<MatchKey, LocalEndpoints>>
//!
//! MatchKey
//! +-- topic_name: Arc<str>
//! +-- type_id: [u8; 14]  (MD5-14 of type name)
//! ```
//!
//! Creation and deletion hold the endpoints lock for the whole operation.
//! Topic and pipe list mutation in the plugins happens inside it, so
//! find-or-create of transport topics never races.
//!
//! A writer reaches a matched reader through PSMX for every instance both
//! are bound to; it falls back to conventional delivery when they share
//! none.

use crate::binding::EndpointBinding;
use crate::config::PsmxConfig;
use crate::entity::{EntityHandle, EntityKind, EntityObject, EntityRegistry};
use crate::error::{Error, Result};
use crate::psmx::fingerprint::type_id_from_name;
use crate::psmx::{EndpointDirection, TransportCatalog};
use crate::qos::EndpointQos;
use crate::reader::Reader;
use crate::types::TypeSupport;
use crate::writer::Writer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Domain ID type (0-232 per DDS spec)
pub type DomainId = u32;

/// Two endpoints match if they have the same (topic_name, type_id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MatchKey {
    topic_name: Arc<str>,
    type_id: [u8; 14],
}

impl MatchKey {
    fn new(topic_name: &str, type_support: &TypeSupport) -> Self {
        Self {
            topic_name: Arc::from(topic_name),
            type_id: type_id_from_name(type_support.type_name()),
        }
    }
}

#[derive(Default)]
struct LocalEndpoints {
    writers: Vec<Arc<Writer>>,
    readers: Vec<Arc<Reader>>,
}

/// One DDS domain in this process.
pub struct Domain {
    domain_id: DomainId,
    catalog: Arc<TransportCatalog>,
    registry: EntityRegistry,
    endpoints: Mutex<HashMap<MatchKey, LocalEndpoints>>,
}

impl Domain {
    #[must_use]
    pub fn new(domain_id: DomainId, catalog: Arc<TransportCatalog>) -> Self {
        log::debug!(
            "[domain] {} created with {} PSMX instance(s)",
            domain_id,
            catalog.len()
        );
        Self {
            domain_id,
            catalog,
            registry: EntityRegistry::new(),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Load the transports of `config` and create the domain.
    pub fn with_config(domain_id: DomainId, config: &PsmxConfig) -> Result<Self> {
        let catalog = TransportCatalog::from_config(config)?;
        Ok(Self::new(domain_id, Arc::new(catalog)))
    }

    #[must_use]
    pub fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<TransportCatalog> {
        &self.catalog
    }

    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Register an entity without loan behaviour (participant, topic, ...).
    pub fn create_entity(&self, kind: EntityKind) -> Result<EntityHandle> {
        if matches!(kind, EntityKind::Writer | EntityKind::Reader) {
            return Err(Error::IllegalOperation(format!(
                "{:?} must be created through create_writer/create_reader",
                kind
            )));
        }
        Ok(self.registry.register(EntityObject::Other(kind)))
    }

    pub fn create_writer(
        &self,
        topic_name: &str,
        type_support: Arc<TypeSupport>,
        qos: EndpointQos,
    ) -> Result<Arc<Writer>> {
        qos.validate()?;
        let mut endpoints = self.endpoints.lock();
        let binding = EndpointBinding::build(
            &self.catalog,
            topic_name,
            &type_support,
            &qos,
            EndpointDirection::Sink,
        )?;
        let handle = self.registry.next_handle();
        let writer = Arc::new(Writer::new(handle, topic_name, type_support, qos, binding));
        self.registry
            .insert(handle, EntityObject::Writer(Arc::clone(&writer)));

        let key = MatchKey::new(topic_name, writer.type_support());
        let local = endpoints.entry(key).or_default();
        for reader in &local.readers {
            match_pair(&writer, reader);
        }
        local.writers.push(Arc::clone(&writer));
        log::debug!(
            "[domain] {} writer {:?} on '{}' ({} pipe(s), {} local reader(s))",
            self.domain_id,
            writer.guid(),
            topic_name,
            writer.pipe_count(),
            writer.local_reader_count()
        );
        Ok(writer)
    }

    pub fn create_reader(
        &self,
        topic_name: &str,
        type_support: Arc<TypeSupport>,
        qos: EndpointQos,
    ) -> Result<Arc<Reader>> {
        qos.validate()?;
        let mut endpoints = self.endpoints.lock();
        let binding = EndpointBinding::build(
            &self.catalog,
            topic_name,
            &type_support,
            &qos,
            EndpointDirection::Source,
        )?;
        let handle = self.registry.next_handle();
        let reader = Arc::new(Reader::new(handle, topic_name, type_support, qos, binding));
        self.registry
            .insert(handle, EntityObject::Reader(Arc::clone(&reader)));

        let key = MatchKey::new(topic_name, reader.type_support());
        let local = endpoints.entry(key).or_default();
        for writer in &local.writers {
            match_pair(writer, &reader);
        }
        local.readers.push(Arc::clone(&reader));
        log::debug!(
            "[domain] {} reader {:?} on '{}' ({} pipe(s))",
            self.domain_id,
            reader.guid(),
            topic_name,
            reader.pipe_count()
        );
        Ok(reader)
    }

    /// Unmatch and delete `writer`; outstanding loans are released.
    pub fn delete_writer(&self, writer: &Arc<Writer>) -> Result<()> {
        let mut endpoints = self.endpoints.lock();
        let key = MatchKey::new(writer.topic_name(), writer.type_support());
        let found = endpoints.get_mut(&key).and_then(|local| {
            let pos = local.writers.iter().position(|w| Arc::ptr_eq(w, writer))?;
            Some(local.writers.swap_remove(pos))
        });
        if found.is_none() {
            return Err(Error::BadParameter(format!(
                "writer {:?} not in domain {}",
                writer.guid(),
                self.domain_id
            )));
        }
        self.registry.unregister(writer.handle());
        writer.shutdown();
        prune(&mut endpoints, &key);
        Ok(())
    }

    /// Unmatch and delete `reader`; cached samples and lent loans are
    /// released.
    pub fn delete_reader(&self, reader: &Arc<Reader>) -> Result<()> {
        let mut endpoints = self.endpoints.lock();
        let key = MatchKey::new(reader.topic_name(), reader.type_support());
        let Some(local) = endpoints.get_mut(&key) else {
            return Err(unknown_reader(reader, self.domain_id));
        };
        let Some(pos) = local.readers.iter().position(|r| Arc::ptr_eq(r, reader)) else {
            return Err(unknown_reader(reader, self.domain_id));
        };
        local.readers.swap_remove(pos);
        for writer in &local.writers {
            writer.unmatch_local_reader(reader);
        }
        self.registry.unregister(reader.handle());
        reader.shutdown();
        prune(&mut endpoints, &key);
        Ok(())
    }

    /// Number of live local writers and readers.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints
            .lock()
            .values()
            .map(|l| l.writers.len() + l.readers.len())
            .sum()
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        let endpoints = std::mem::take(self.endpoints.get_mut());
        for (_, local) in endpoints {
            for writer in local.writers {
                self.registry.unregister(writer.handle());
                writer.shutdown();
            }
            for reader in local.readers {
                self.registry.unregister(reader.handle());
                reader.shutdown();
            }
        }
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("domain_id", &self.domain_id)
            .field("instances", &self.catalog.len())
            .field("entities", &self.registry.len())
            .finish()
    }
}

fn match_pair(writer: &Arc<Writer>, reader: &Arc<Reader>) {
    let shared = writer.common_instances(&reader.locators());
    writer.match_local_reader(Arc::clone(reader), shared);
}

fn prune(endpoints: &mut HashMap<MatchKey, LocalEndpoints>, key: &MatchKey) {
    if endpoints
        .get(key)
        .is_some_and(|l| l.writers.is_empty() && l.readers.is_empty())
    {
        endpoints.remove(key);
    }
}

fn unknown_reader(reader: &Reader, domain_id: DomainId) -> Error {
    Error::BadParameter(format!(
        "reader {:?} not in domain {}",
        reader.guid(),
        domain_id
    ))
}
