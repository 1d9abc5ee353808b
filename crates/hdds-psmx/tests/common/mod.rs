// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mock PSMX plugin with call counters and failure switches.

#![allow(dead_code)]

use hdds_psmx::config::TransportConfig;
use hdds_psmx::loan::{LoanRef, LoanedSample};
use hdds_psmx::psmx::{
    EndpointDirection, InstanceId, NodeId, NodeList, PsmxEndpoint, PsmxInstance, PsmxTopic,
    TopicDescriptor, TransportCatalog, TypeFingerprint, TypeProperties,
};
use hdds_psmx::qos::EndpointQos;
use hdds_psmx::{Error, PsmxConfig, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

pub const MOCK_NAME: &str = "mock";

/// Counters and switches shared by every object of one mock instance.
#[derive(Debug, Default)]
pub struct MockControl {
    /// Loans the sink pipes may still grant.
    pub loan_budget: AtomicUsize,
    pub loans_granted: AtomicUsize,
    pub loans_released: AtomicUsize,
    pub loan_requests: AtomicUsize,
    pub writes: AtomicUsize,
    pub takes: AtomicUsize,
    pub increfs: AtomicUsize,
    pub decrefs: AtomicUsize,
    pub topics_created: AtomicUsize,
    pub endpoints_created: AtomicUsize,
    pub fail_write: AtomicBool,
    pub veto_decref: AtomicBool,
    pub veto_topic_delete: AtomicBool,
}

impl MockControl {
    pub fn with_budget(loans: usize) -> Arc<Self> {
        let control = Self::default();
        control.loan_budget.store(loans, Ordering::SeqCst);
        Arc::new(control)
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Calls that move data (loans, writes, takes).
    pub fn data_calls(&self) -> usize {
        Self::get(&self.loan_requests) + Self::get(&self.writes) + Self::get(&self.takes)
    }

    pub fn outstanding(&self) -> usize {
        Self::get(&self.loans_granted) - Self::get(&self.loans_released)
    }
}

pub struct MockInstance {
    name: String,
    id: InstanceId,
    priority: i32,
    fixed_only: bool,
    control: Arc<MockControl>,
    topics: NodeList<dyn PsmxTopic>,
}

impl MockInstance {
    pub fn new(name: &str, id: InstanceId, priority: i32, control: Arc<MockControl>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            id,
            priority,
            fixed_only: true,
            control,
            topics: NodeList::new(),
        })
    }
}

impl PsmxInstance for MockInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn instance_id(&self) -> InstanceId {
        self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn supports_loans(&self) -> bool {
        true
    }

    fn type_supported(&self, properties: TypeProperties) -> bool {
        !self.fixed_only || properties.is_fixed_size()
    }

    fn qos_supported(&self, _qos: &EndpointQos) -> bool {
        true
    }

    fn create_topic(&self, descriptor: &TopicDescriptor) -> Result<Arc<dyn PsmxTopic>> {
        self.control.topics_created.fetch_add(1, Ordering::SeqCst);
        let topic = Arc::new(MockTopic {
            name: descriptor.topic_name.clone(),
            fingerprint: descriptor.fingerprint,
            instance_id: self.id,
            control: Arc::clone(&self.control),
            endpoints: NodeList::new(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
        });
        Ok(topic as Arc<dyn PsmxTopic>)
    }

    fn delete_topic(&self, _topic: &Arc<dyn PsmxTopic>) -> Result<()> {
        if self.control.veto_topic_delete.load(Ordering::SeqCst) {
            return Err(Error::Transport("mock refuses topic deletion".into()));
        }
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        Ok(())
    }

    fn node_identifier(&self) -> NodeId {
        NodeId::local()
    }

    fn topic_list(&self) -> &NodeList<dyn PsmxTopic> {
        &self.topics
    }
}

struct MockTopic {
    name: String,
    fingerprint: TypeFingerprint,
    instance_id: InstanceId,
    control: Arc<MockControl>,
    endpoints: NodeList<dyn PsmxEndpoint>,
    /// Loans written by any sink, taken by any source.
    queue: Arc<Mutex<VecDeque<LoanRef>>>,
}

impl PsmxTopic for MockTopic {
    fn topic_name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> TypeFingerprint {
        self.fingerprint
    }

    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn create_endpoint(
        &self,
        _qos: &EndpointQos,
        direction: EndpointDirection,
    ) -> Result<Arc<dyn PsmxEndpoint>> {
        self.control.endpoints_created.fetch_add(1, Ordering::SeqCst);
        let endpoint = Arc::new_cyclic(|me| MockEndpoint {
            me: me.clone(),
            direction,
            instance_id: self.instance_id,
            control: Arc::clone(&self.control),
            queue: Arc::clone(&self.queue),
        });
        Ok(endpoint as Arc<dyn PsmxEndpoint>)
    }

    fn delete_endpoint(&self, _endpoint: &Arc<dyn PsmxEndpoint>) -> Result<()> {
        Ok(())
    }

    fn endpoint_list(&self) -> &NodeList<dyn PsmxEndpoint> {
        &self.endpoints
    }
}

struct MockEndpoint {
    me: Weak<MockEndpoint>,
    direction: EndpointDirection,
    instance_id: InstanceId,
    control: Arc<MockControl>,
    queue: Arc<Mutex<VecDeque<LoanRef>>>,
}

impl PsmxEndpoint for MockEndpoint {
    fn direction(&self) -> EndpointDirection {
        self.direction
    }

    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn supports_loans(&self) -> bool {
        true
    }

    fn request_loan(&self, size: usize) -> Option<LoanRef> {
        self.control.loan_requests.fetch_add(1, Ordering::SeqCst);
        let budget = &self.control.loan_budget;
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()?;
        let me: Arc<dyn PsmxEndpoint> = self.me.upgrade()?;
        self.control.loans_granted.fetch_add(1, Ordering::SeqCst);
        Some(LoanedSample::from_chunk(
            vec![0u8; size].into_boxed_slice(),
            size,
            me,
        ))
    }

    fn write(&self, loan: LoanRef) -> Result<()> {
        self.control.writes.fetch_add(1, Ordering::SeqCst);
        if self.control.fail_write.load(Ordering::SeqCst) {
            return Err(Error::Transport("mock write failure".into()));
        }
        self.queue.lock().push_back(loan);
        Ok(())
    }

    fn take(&self) -> Option<LoanRef> {
        self.control.takes.fetch_add(1, Ordering::SeqCst);
        if self.direction != EndpointDirection::Source {
            return None;
        }
        self.queue.lock().pop_front()
    }

    fn release_loan(&self, _sample: &LoanedSample, _buffer: Box<[u8]>) {
        self.control.loans_released.fetch_add(1, Ordering::SeqCst);
    }

    fn loan_incref(&self, _sample: &LoanedSample) -> Result<()> {
        self.control.increfs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn loan_decref(&self, _sample: &LoanedSample) -> Result<()> {
        self.control.decrefs.fetch_add(1, Ordering::SeqCst);
        if self.control.veto_decref.load(Ordering::SeqCst) {
            return Err(Error::PreconditionNotMet("mock chunk still in use".into()));
        }
        Ok(())
    }
}

/// Catalog with one mock transport named `name`.
pub fn mock_catalog(name: &str, priority: i32, control: &Arc<MockControl>) -> TransportCatalog {
    let control = Arc::clone(control);
    TransportCatalog::builder()
        .register_builtin(name, move |id, config: &TransportConfig| {
            Ok(MockInstance::new(&config.name, id, priority, Arc::clone(&control))
                as Arc<dyn PsmxInstance>)
        })
        .load(&PsmxConfig::empty().with_transport(TransportConfig::new(name)))
        .expect("mock catalog")
}
