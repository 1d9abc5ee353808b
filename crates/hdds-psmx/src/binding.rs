// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binding of a reader or writer to PSMX pipes.
//!
//! At endpoint creation every catalog instance is offered the endpoint (in
//! priority order). An instance is skipped when the QoS allow-list excludes
//! it or when it declines the type or the QoS. Otherwise the endpoint joins
//! the instance's topic with the same name and fingerprint (creating it if
//! needed) and gets its own pipe.
//!
//! Creation failures inside a plugin are logged and skip that instance; the
//! endpoint falls back to whatever bound, or to conventional delivery.

use crate::error::{Error, Result};
use crate::psmx::fingerprint::topic_name_hash;
use crate::psmx::{
    endpoint_add, endpoint_remove, topic_add, topic_remove, EndpointDirection, InstanceId,
    Locator, PsmxEndpoint, PsmxInstance, PsmxTopic, TopicDescriptor, TransportCatalog,
};
use crate::qos::{EndpointQos, PsmxPolicy};
use crate::types::TypeSupport;
use std::sync::Arc;

/// One pipe of an endpoint, with the topic and instance it lives in.
#[derive(Clone)]
pub struct BoundPipe {
    instance: Arc<dyn PsmxInstance>,
    topic: Arc<dyn PsmxTopic>,
    endpoint: Arc<dyn PsmxEndpoint>,
    priority: i32,
}

impl BoundPipe {
    #[must_use]
    pub fn instance(&self) -> &Arc<dyn PsmxInstance> {
        &self.instance
    }

    #[must_use]
    pub fn topic(&self) -> &Arc<dyn PsmxTopic> {
        &self.topic
    }

    #[must_use]
    pub fn endpoint(&self) -> &Arc<dyn PsmxEndpoint> {
        &self.endpoint
    }

    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.instance.instance_id()
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    #[must_use]
    pub fn supports_loans(&self) -> bool {
        self.instance.supports_loans() && self.endpoint.supports_loans()
    }

    #[must_use]
    pub fn locator(&self) -> Locator {
        Locator::for_instance(self.instance.as_ref())
    }
}

impl std::fmt::Debug for BoundPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundPipe")
            .field("instance", &self.instance.name())
            .field("topic", &self.topic.topic_name())
            .field("priority", &self.priority)
            .finish()
    }
}

/// Pipes of one reader or writer, highest priority first.
#[derive(Debug)]
pub struct EndpointBinding {
    direction: EndpointDirection,
    pipes: Vec<BoundPipe>,
}

impl EndpointBinding {
    /// Binding without pipes (conventional delivery only).
    #[must_use]
    pub fn empty(direction: EndpointDirection) -> Self {
        Self {
            direction,
            pipes: Vec::new(),
        }
    }

    /// Offer the endpoint to every eligible instance of `catalog`.
    ///
    /// Fails only for `PsmxPolicy::Require` when nothing bound.
    pub fn build(
        catalog: &TransportCatalog,
        topic_name: &str,
        type_support: &TypeSupport,
        qos: &EndpointQos,
        direction: EndpointDirection,
    ) -> Result<Self> {
        let mut binding = Self::empty(direction);
        if qos.psmx_policy == PsmxPolicy::Disable {
            return Ok(binding);
        }
        let properties = type_support.properties();
        let descriptor = TopicDescriptor {
            topic_name: topic_name.to_string(),
            topic_hash: topic_name_hash(topic_name),
            type_name: type_support.type_name().to_string(),
            fingerprint: type_support.fingerprint(),
        };

        for entry in catalog.instances() {
            let instance = entry.instance();
            if !qos.allows_instance(instance.name()) {
                continue;
            }
            if !instance.type_supported(properties) {
                log::debug!(
                    "[psmx] {}: type '{}' not supported",
                    instance.name(),
                    descriptor.type_name
                );
                continue;
            }
            if !instance.qos_supported(qos) {
                log::debug!("[psmx] {}: QoS not supported", instance.name());
                continue;
            }
            let (topic, created) = match find_or_create_topic(instance, &descriptor) {
                Ok(found) => found,
                Err(e) => {
                    log::warn!(
                        "[psmx] {}: topic '{}' creation failed: {}",
                        instance.name(),
                        topic_name,
                        e
                    );
                    continue;
                }
            };
            let endpoint = match topic.create_endpoint(qos, direction) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    log::warn!(
                        "[psmx] {}: {:?} pipe for '{}' failed: {}",
                        instance.name(),
                        direction,
                        topic_name,
                        e
                    );
                    if created && topic.endpoint_list().is_empty() {
                        topic_remove(instance.as_ref(), &topic);
                    }
                    continue;
                }
            };
            endpoint_add(topic.as_ref(), Arc::clone(&endpoint));
            binding.pipes.push(BoundPipe {
                instance: Arc::clone(instance),
                topic,
                endpoint,
                priority: entry.priority(),
            });
        }

        if binding.pipes.is_empty() && qos.psmx_policy == PsmxPolicy::Require {
            return Err(Error::PreconditionNotMet(format!(
                "PSMX required for '{}' but no transport accepted it",
                topic_name
            )));
        }
        log::debug!(
            "[psmx] '{}' {:?} bound to {} pipe(s)",
            topic_name,
            direction,
            binding.pipes.len()
        );
        Ok(binding)
    }

    #[must_use]
    pub fn direction(&self) -> EndpointDirection {
        self.direction
    }

    #[must_use]
    pub fn pipes(&self) -> &[BoundPipe] {
        &self.pipes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    /// Pipes able to hand out loans, in priority order.
    pub fn loan_pipes(&self) -> impl Iterator<Item = &BoundPipe> {
        self.pipes.iter().filter(|p| p.supports_loans())
    }

    #[must_use]
    pub fn pipe_for_instance(&self, id: InstanceId) -> Option<&BoundPipe> {
        self.pipes.iter().find(|p| p.instance_id() == id)
    }

    /// PSMX locators to announce in discovery.
    #[must_use]
    pub fn locators(&self) -> Vec<Locator> {
        self.pipes.iter().map(BoundPipe::locator).collect()
    }

    /// Highest-priority own instance that `peer_locators` also announces.
    #[must_use]
    pub fn common_instance(&self, peer_locators: &[Locator]) -> Option<InstanceId> {
        self.pipes
            .iter()
            .find(|p| peer_locators.contains(&p.locator()))
            .map(BoundPipe::instance_id)
    }

    /// Every own instance that `peer_locators` also announces.
    #[must_use]
    pub fn common_instances(&self, peer_locators: &[Locator]) -> Vec<InstanceId> {
        self.pipes
            .iter()
            .filter(|p| peer_locators.contains(&p.locator()))
            .map(BoundPipe::instance_id)
            .collect()
    }

    /// Detach every pipe; topics left without endpoints are removed too.
    pub fn release(&mut self) {
        for pipe in self.pipes.drain(..) {
            if !endpoint_remove(pipe.topic.as_ref(), &pipe.endpoint) {
                log::debug!(
                    "[psmx] {}: pipe on '{}' not detached",
                    pipe.instance.name(),
                    pipe.topic.topic_name()
                );
                continue;
            }
            if pipe.topic.endpoint_list().is_empty()
                && !topic_remove(pipe.instance.as_ref(), &pipe.topic)
            {
                log::debug!(
                    "[psmx] {}: topic '{}' kept",
                    pipe.instance.name(),
                    pipe.topic.topic_name()
                );
            }
        }
    }
}

impl Drop for EndpointBinding {
    fn drop(&mut self) {
        self.release();
    }
}

fn find_or_create_topic(
    instance: &Arc<dyn PsmxInstance>,
    descriptor: &TopicDescriptor,
) -> Result<(Arc<dyn PsmxTopic>, bool)> {
    let existing = instance.topic_list().find(|t| {
        t.topic_name() == descriptor.topic_name && t.fingerprint() == descriptor.fingerprint
    });
    if let Some(topic) = existing {
        return Ok((topic, false));
    }
    let topic = instance.create_topic(descriptor)?;
    topic_add(instance.as_ref(), Arc::clone(&topic));
    Ok((topic, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PsmxConfig, TransportConfig};
    use crate::psmx::loopback::LOOPBACK_NAME;

    fn catalog() -> TransportCatalog {
        TransportCatalog::from_config(
            &PsmxConfig::empty().with_transport(TransportConfig::new(LOOPBACK_NAME)),
        )
        .unwrap()
    }

    #[test]
    fn test_bind_and_share_topic() {
        let catalog = catalog();
        let ts = TypeSupport::fixed("Position", 8);
        let qos = EndpointQos::default();
        let w = EndpointBinding::build(&catalog, "Pos", &ts, &qos, EndpointDirection::Sink).unwrap();
        let r =
            EndpointBinding::build(&catalog, "Pos", &ts, &qos, EndpointDirection::Source).unwrap();
        assert_eq!(w.len(), 1);
        assert_eq!(r.len(), 1);
        assert!(Arc::ptr_eq(w.pipes()[0].topic(), r.pipes()[0].topic()));
        let instance = catalog.instance_by_name(LOOPBACK_NAME).unwrap();
        assert_eq!(instance.topic_list().len(), 1);
        assert_eq!(w.common_instance(&r.locators()), Some(instance.instance_id()));
    }

    #[test]
    fn test_unsupported_type_is_skipped() {
        let catalog = catalog();
        let ts = TypeSupport::variable("Text");
        let b = EndpointBinding::build(
            &catalog,
            "T",
            &ts,
            &EndpointQos::default(),
            EndpointDirection::Sink,
        )
        .unwrap();
        assert!(b.is_empty());

        let required = EndpointQos::default().psmx_policy(PsmxPolicy::Require);
        let err = EndpointBinding::build(&catalog, "T", &ts, &required, EndpointDirection::Sink);
        assert!(matches!(err, Err(Error::PreconditionNotMet(_))));
    }

    #[test]
    fn test_disable_and_allow_list() {
        let catalog = catalog();
        let ts = TypeSupport::fixed("P", 4);
        let disabled = EndpointQos::default().psmx_policy(PsmxPolicy::Disable);
        assert!(EndpointBinding::build(&catalog, "P", &ts, &disabled, EndpointDirection::Sink)
            .unwrap()
            .is_empty());
        let other = EndpointQos::default().psmx_instances(["iox"]);
        assert!(EndpointBinding::build(&catalog, "P", &ts, &other, EndpointDirection::Sink)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_release_removes_empty_topic() {
        let catalog = catalog();
        let ts = TypeSupport::fixed("P", 4);
        let qos = EndpointQos::default();
        let instance = Arc::clone(catalog.instance_by_name(LOOPBACK_NAME).unwrap());
        let mut w = EndpointBinding::build(&catalog, "P", &ts, &qos, EndpointDirection::Sink).unwrap();
        let r = EndpointBinding::build(&catalog, "P", &ts, &qos, EndpointDirection::Source).unwrap();
        w.release();
        assert!(w.is_empty());
        assert_eq!(instance.topic_list().len(), 1);
        drop(r);
        assert_eq!(instance.topic_list().len(), 0);
    }

    #[test]
    fn test_different_fingerprint_separate_topic() {
        let catalog = catalog();
        let qos = EndpointQos::default();
        let a = EndpointBinding::build(
            &catalog,
            "P",
            &TypeSupport::fixed("A", 4),
            &qos,
            EndpointDirection::Sink,
        )
        .unwrap();
        let b = EndpointBinding::build(
            &catalog,
            "P",
            &TypeSupport::fixed("B", 4),
            &qos,
            EndpointDirection::Source,
        )
        .unwrap();
        assert!(!Arc::ptr_eq(a.pipes()[0].topic(), b.pipes()[0].topic()));
        assert_eq!(
            catalog.instance_by_name(LOOPBACK_NAME).unwrap().topic_list().len(),
            2
        );
    }
}
