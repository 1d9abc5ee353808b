// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PSMX: pluggable shared-memory exchange.
//!
//! A PSMX transport moves samples between endpoints on the same node by
//! handing over loans instead of copying serialized bytes. The object model
//! is three levels deep:
//!
//! ```text
//! PsmxInstance (one per configured transport)
//!   +-- PsmxTopic (topic name + type fingerprint)
//!         +-- PsmxEndpoint (one pipe per bound reader/writer)
//! ```
//!
//! Plugins implement the three traits below. Generic list management
//! ([`topic_add`], [`topic_remove`], [`endpoint_add`], [`endpoint_remove`],
//! [`instance_fini`]) lives here so plugins only provide constructors and
//! destructors.
//!
//! # Locators
//!
//! Each instance announces itself in discovery with a [`Locator`] of kind
//! [`LOCATOR_KIND_PSMX`]: the port carries the instance id and the address
//! carries the node identifier. Two endpoints can use the same instance iff
//! both locators are equal.

pub mod catalog;
pub mod fingerprint;
pub mod list;
pub mod loopback;
pub mod metrics;

pub use catalog::{InstanceEntry, PluginLoadFailure, TransportCatalog, TransportCatalogBuilder};
pub use fingerprint::{Extensibility, TypeFingerprint, TypeProperties};
pub use list::{NodeHandle, NodeList};
pub use metrics::{global_metrics, PsmxMetrics, PsmxMetricsSnapshot};

use crate::config::LOCATOR_KIND_PSMX;
use crate::error::{Error, Result};
use crate::loan::{LoanRef, LoanedSample};
use crate::qos::EndpointQos;
use std::sync::Arc;

/// Identifier of a PSMX instance (FNV-1a of the transport name).
pub type InstanceId = u32;

/// Callback a source pipe invokes when data arrives.
pub type DataAvailableFn = Arc<dyn Fn() + Send + Sync>;

/// 16-byte identifier of the node an instance lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    /// Identifier of this process on this host: host id + process id.
    #[must_use]
    pub fn local() -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&host_id().to_be_bytes());
        bytes[4..8].copy_from_slice(&std::process::id().to_be_bytes());
        Self(bytes)
    }
}

/// Compute a host ID from the machine identity.
///
/// Uses /etc/machine-id on Linux, falls back to `HOSTNAME`, then to a fixed
/// value.
#[must_use]
pub fn host_id() -> u32 {
    if let Ok(content) = std::fs::read_to_string("/etc/machine-id") {
        return fingerprint::fnv1a_32(content.trim().as_bytes());
    }
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        return fingerprint::fnv1a_32(hostname.as_bytes());
    }
    0xDEAD_BEEF
}

/// Discovery locator announcing PSMX reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locator {
    pub kind: i32,
    pub port: u32,
    pub address: [u8; 16],
}

impl Locator {
    #[must_use]
    pub fn psmx(instance_id: InstanceId, node: NodeId) -> Self {
        Self {
            kind: LOCATOR_KIND_PSMX,
            port: instance_id,
            address: node.0,
        }
    }

    #[must_use]
    pub fn for_instance(instance: &dyn PsmxInstance) -> Self {
        Self::psmx(instance.instance_id(), instance.node_identifier())
    }

    #[must_use]
    pub fn is_psmx(&self) -> bool {
        self.kind == LOCATOR_KIND_PSMX
    }
}

/// Writer side (sink) or reader side (source) of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointDirection {
    /// Accepts loans from a writer.
    Sink,
    /// Yields loans to a reader.
    Source,
}

/// What a plugin gets to build a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescriptor {
    pub topic_name: String,
    pub topic_hash: u32,
    pub type_name: String,
    pub fingerprint: TypeFingerprint,
}

/// One configured transport.
pub trait PsmxInstance: Send + Sync {
    fn name(&self) -> &str;

    fn instance_id(&self) -> InstanceId;

    /// Plugin-preferred priority; a non-zero configured priority overrides it.
    fn priority(&self) -> i32 {
        0
    }

    /// Whether pipes of this instance can hand out loans.
    fn supports_loans(&self) -> bool;

    /// Whether a type with these properties can be carried.
    fn type_supported(&self, properties: TypeProperties) -> bool;

    /// Whether an endpoint with this QoS can be served.
    fn qos_supported(&self, qos: &EndpointQos) -> bool;

    fn create_topic(&self, descriptor: &TopicDescriptor) -> Result<Arc<dyn PsmxTopic>>;

    /// Destructor for a topic; an error keeps the topic attached.
    fn delete_topic(&self, topic: &Arc<dyn PsmxTopic>) -> Result<()>;

    /// Final teardown once every topic is gone.
    fn deinit(&self) -> Result<()>;

    fn node_identifier(&self) -> NodeId;

    fn topic_list(&self) -> &NodeList<dyn PsmxTopic>;
}

/// A topic within one instance.
pub trait PsmxTopic: Send + Sync {
    fn topic_name(&self) -> &str;

    fn fingerprint(&self) -> TypeFingerprint;

    fn instance_id(&self) -> InstanceId;

    /// Whether samples of this type must be serialized into the loan
    /// (otherwise the raw in-memory form is exchanged).
    fn serialization_required(&self, properties: TypeProperties) -> bool {
        !properties.is_fixed_size()
    }

    fn create_endpoint(
        &self,
        qos: &EndpointQos,
        direction: EndpointDirection,
    ) -> Result<Arc<dyn PsmxEndpoint>>;

    /// Destructor for an endpoint; an error keeps the endpoint attached.
    fn delete_endpoint(&self, endpoint: &Arc<dyn PsmxEndpoint>) -> Result<()>;

    fn endpoint_list(&self) -> &NodeList<dyn PsmxEndpoint>;
}

/// A pipe bound to one reader or writer.
pub trait PsmxEndpoint: Send + Sync {
    fn direction(&self) -> EndpointDirection;

    fn instance_id(&self) -> InstanceId;

    fn supports_loans(&self) -> bool;

    /// Loan of at least `size` bytes, or `None` when exhausted or unsupported.
    fn request_loan(&self, size: usize) -> Option<LoanRef>;

    /// Hand a loan to the transport (sink pipes). The transport owns it on
    /// success; on failure it may finalize it, otherwise the caller does.
    ///
    /// `OutOfResources` means no source pipe received the sample; the
    /// writer then delivers it to the readers behind this instance itself.
    fn write(&self, loan: LoanRef) -> Result<()>;

    /// Next delivered loan (source pipes).
    fn take(&self) -> Option<LoanRef>;

    /// Register an arrival callback. Returns `false` if unsupported, in which
    /// case the reader polls with [`take`](Self::take).
    fn on_data_available(&self, _callback: DataAvailableFn) -> bool {
        false
    }

    /// Receive the memory of a finalized loan that originated here.
    fn release_loan(&self, sample: &LoanedSample, buffer: Box<[u8]>);

    /// Runs before a loan from this pipe gains a reference; an error vetoes.
    fn loan_incref(&self, _sample: &LoanedSample) -> Result<()> {
        Ok(())
    }

    /// Runs before a loan from this pipe loses a reference; an error vetoes
    /// and leaves the count unchanged.
    fn loan_decref(&self, _sample: &LoanedSample) -> Result<()> {
        Ok(())
    }
}

/// Attach `topic` to `instance`.
pub fn topic_add(instance: &dyn PsmxInstance, topic: Arc<dyn PsmxTopic>) -> NodeHandle {
    log::debug!(
        "[psmx] {}: topic '{}' attached",
        instance.name(),
        topic.topic_name()
    );
    instance.topic_list().insert(topic)
}

/// Run the instance's topic destructor, then detach. `false` keeps it attached.
pub fn topic_remove(instance: &dyn PsmxInstance, topic: &Arc<dyn PsmxTopic>) -> bool {
    instance
        .topic_list()
        .remove_with(topic, |t| instance.delete_topic(t))
}

/// Attach `endpoint` to `topic`.
pub fn endpoint_add(topic: &dyn PsmxTopic, endpoint: Arc<dyn PsmxEndpoint>) -> NodeHandle {
    topic.endpoint_list().insert(endpoint)
}

/// Run the topic's endpoint destructor, then detach. `false` keeps it attached.
pub fn endpoint_remove(topic: &dyn PsmxTopic, endpoint: &Arc<dyn PsmxEndpoint>) -> bool {
    topic
        .endpoint_list()
        .remove_with(endpoint, |ep| topic.delete_endpoint(ep))
}

/// Tear down an instance: every endpoint of every topic, every topic, then
/// the instance itself. Stops at the first refused removal.
pub fn instance_fini(instance: &dyn PsmxInstance) -> Result<()> {
    for topic in instance.topic_list().snapshot() {
        for endpoint in topic.endpoint_list().snapshot() {
            if !endpoint_remove(topic.as_ref(), &endpoint) {
                return Err(Error::Transport(format!(
                    "{}: endpoint of topic '{}' refused removal",
                    instance.name(),
                    topic.topic_name()
                )));
            }
        }
        if !topic_remove(instance, &topic) {
            return Err(Error::Transport(format!(
                "{}: topic '{}' refused removal",
                instance.name(),
                topic.topic_name()
            )));
        }
    }
    instance.deinit()
}
