// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process loopback PSMX transport.
//!
//! Loans come from a bounded chunk pool shared by all pipes of an instance.
//! A sink write hands the loan itself to the first source pipe of the topic
//! and copies it into fresh chunks for the others. Without enough chunks for
//! every copy nothing is queued and the write fails with `OutOfResources`,
//! leaving the loan with the writer. Each source pipe queues up to `depth`
//! loans and drops the oldest on overflow.
//!
//! # Options
//!
//! `key=value` pairs separated by `;` (see [`parse_config_string`]):
//!
//! | key | default | meaning |
//! |-----|---------|---------|
//! | `max_chunks` | 64 | pool size |
//! | `chunk_size` | 4096 | bytes per chunk |
//! | `loans` | 1 | pipes hand out loans |
//! | `fixed_only` | 1 | reject variable-size types |
//! | `best_effort_only` | 0 | reject reliable endpoints |
//! | `depth` | 16 | per-source queue length |

use super::catalog::create_interface_with;
use super::metrics::global_metrics;
use super::{
    DataAvailableFn, EndpointDirection, InstanceId, NodeId, NodeList, PsmxEndpoint, PsmxInstance,
    PsmxTopic, TopicDescriptor, TypeFingerprint, TypeProperties,
};
use crate::config::{parse_config_string, TransportConfig};
use crate::error::{Error, Result};
use crate::loan::{LoanRef, LoanedSample, SampleState};
use crate::qos::EndpointQos;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::{c_char, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Transport name of the builtin loopback plugin.
pub const LOOPBACK_NAME: &str = "loopback";

/// Loopback plugin options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackOptions {
    pub max_chunks: usize,
    pub chunk_size: usize,
    pub loans: bool,
    pub fixed_only: bool,
    pub best_effort_only: bool,
    pub depth: usize,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            max_chunks: 64,
            chunk_size: 4096,
            loans: true,
            fixed_only: true,
            best_effort_only: false,
            depth: 16,
        }
    }
}

impl LoopbackOptions {
    /// Parse a plugin configuration string. Unknown keys are ignored.
    pub fn parse(config: &str) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in parse_config_string(config) {
            match key.as_str() {
                "max_chunks" => options.max_chunks = parse_count(&key, &value)?,
                "chunk_size" => options.chunk_size = parse_count(&key, &value)?,
                "depth" => options.depth = parse_count(&key, &value)?,
                "loans" => options.loans = parse_flag(&key, &value)?,
                "fixed_only" => options.fixed_only = parse_flag(&key, &value)?,
                "best_effort_only" => options.best_effort_only = parse_flag(&key, &value)?,
                _ => log::debug!("[psmx] loopback: ignoring option '{}'", key),
            }
        }
        options.validate()?;
        Ok(options)
    }

    /// Pool size, chunk size and queue depth must be non-zero.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("max_chunks", self.max_chunks),
            ("chunk_size", self.chunk_size),
            ("depth", self.depth),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("loopback option {key} must be > 0")));
            }
        }
        Ok(())
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!(
            "loopback option {key}={value}: expected a positive integer"
        ))),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(Error::Config(format!(
            "loopback option {key}={value}: expected a boolean"
        ))),
    }
}

/// Bounded pool of equally sized chunks, allocated lazily.
struct ChunkPool {
    free: ArrayQueue<Box<[u8]>>,
    chunk_size: usize,
    max_chunks: usize,
    allocated: AtomicUsize,
    in_use: AtomicUsize,
}

impl ChunkPool {
    fn new(max_chunks: usize, chunk_size: usize) -> Self {
        Self {
            free: ArrayQueue::new(max_chunks),
            chunk_size,
            max_chunks,
            allocated: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) -> Option<Box<[u8]>> {
        if let Some(chunk) = self.free.pop() {
            self.in_use.fetch_add(1, Ordering::AcqRel);
            return Some(chunk);
        }
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            if current >= self.max_chunks {
                return None;
            }
            match self.allocated.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Some(vec![0u8; self.chunk_size].into_boxed_slice())
    }

    fn release(&self, chunk: Box<[u8]>) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        if self.free.push(chunk).is_err() {
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

/// Loopback transport instance.
pub struct LoopbackInstance {
    name: String,
    id: InstanceId,
    options: LoopbackOptions,
    node: NodeId,
    pool: Arc<ChunkPool>,
    topics: NodeList<dyn PsmxTopic>,
}

impl LoopbackInstance {
    /// Builtin factory entry point.
    pub fn create(id: InstanceId, config: &TransportConfig) -> Result<Arc<dyn PsmxInstance>> {
        let options = LoopbackOptions::parse(&config.config)?;
        let instance: Arc<dyn PsmxInstance> = Self::with_name(&config.name, id, options)?;
        Ok(instance)
    }

    pub fn new(id: InstanceId, options: LoopbackOptions) -> Result<Arc<Self>> {
        Self::with_name(LOOPBACK_NAME, id, options)
    }

    /// Instance registered under another transport name. Invalid options
    /// are `Error::Config`.
    pub fn with_name(name: &str, id: InstanceId, options: LoopbackOptions) -> Result<Arc<Self>> {
        options.validate()?;
        log::debug!(
            "[psmx] loopback '{}' up: {} x {} bytes, loans={}",
            name,
            options.max_chunks,
            options.chunk_size,
            options.loans
        );
        Ok(Arc::new(Self {
            name: name.to_string(),
            id,
            options,
            node: NodeId::local(),
            pool: Arc::new(ChunkPool::new(options.max_chunks, options.chunk_size)),
            topics: NodeList::new(),
        }))
    }

    #[must_use]
    pub fn options(&self) -> &LoopbackOptions {
        &self.options
    }

    /// Chunks currently lent out (by sinks or sitting in source queues).
    #[must_use]
    pub fn chunks_in_use(&self) -> usize {
        self.pool.in_use()
    }
}

impl PsmxInstance for LoopbackInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn instance_id(&self) -> InstanceId {
        self.id
    }

    fn supports_loans(&self) -> bool {
        self.options.loans
    }

    fn type_supported(&self, properties: TypeProperties) -> bool {
        !self.options.fixed_only || properties.is_fixed_size()
    }

    fn qos_supported(&self, qos: &EndpointQos) -> bool {
        !(self.options.best_effort_only && qos.is_reliable())
    }

    fn create_topic(&self, descriptor: &TopicDescriptor) -> Result<Arc<dyn PsmxTopic>> {
        let topic = Arc::new_cyclic(|me| LoopbackTopic {
            me: me.clone(),
            descriptor: descriptor.clone(),
            instance_id: self.id,
            options: self.options,
            pool: Arc::clone(&self.pool),
            endpoints: NodeList::new(),
            sources: Mutex::new(Vec::new()),
        });
        Ok(topic as Arc<dyn PsmxTopic>)
    }

    fn delete_topic(&self, topic: &Arc<dyn PsmxTopic>) -> Result<()> {
        if !topic.endpoint_list().is_empty() {
            return Err(Error::PreconditionNotMet(format!(
                "topic '{}' still has {} endpoints",
                topic.topic_name(),
                topic.endpoint_list().len()
            )));
        }
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        if !self.topics.is_empty() {
            return Err(Error::PreconditionNotMet(format!(
                "{} topics still attached",
                self.topics.len()
            )));
        }
        log::debug!(
            "[psmx] loopback '{}' down ({} chunks in use)",
            self.name,
            self.pool.in_use()
        );
        Ok(())
    }

    fn node_identifier(&self) -> NodeId {
        self.node
    }

    fn topic_list(&self) -> &NodeList<dyn PsmxTopic> {
        &self.topics
    }
}

struct LoopbackTopic {
    me: Weak<LoopbackTopic>,
    descriptor: TopicDescriptor,
    instance_id: InstanceId,
    options: LoopbackOptions,
    pool: Arc<ChunkPool>,
    endpoints: NodeList<dyn PsmxEndpoint>,
    sources: Mutex<Vec<Weak<LoopbackEndpoint>>>,
}

impl LoopbackTopic {
    fn live_sources(&self) -> Vec<Arc<LoopbackEndpoint>> {
        self.sources.lock().iter().filter_map(Weak::upgrade).collect()
    }
}

impl PsmxTopic for LoopbackTopic {
    fn topic_name(&self) -> &str {
        &self.descriptor.topic_name
    }

    fn fingerprint(&self) -> TypeFingerprint {
        self.descriptor.fingerprint
    }

    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn create_endpoint(
        &self,
        _qos: &EndpointQos,
        direction: EndpointDirection,
    ) -> Result<Arc<dyn PsmxEndpoint>> {
        let endpoint = Arc::new_cyclic(|me| LoopbackEndpoint {
            me: me.clone(),
            direction,
            instance_id: self.instance_id,
            topic: self.me.clone(),
            pool: Arc::clone(&self.pool),
            loans: self.options.loans,
            depth: self.options.depth,
            queue: Mutex::new(VecDeque::new()),
            listener: Mutex::new(None),
        });
        if direction == EndpointDirection::Source {
            self.sources.lock().push(Arc::downgrade(&endpoint));
        }
        Ok(endpoint as Arc<dyn PsmxEndpoint>)
    }

    fn delete_endpoint(&self, endpoint: &Arc<dyn PsmxEndpoint>) -> Result<()> {
        let removed = {
            let mut sources = self.sources.lock();
            sources
                .iter()
                .position(|w| std::ptr::addr_eq(w.as_ptr(), Arc::as_ptr(endpoint)))
                .map(|pos| sources.remove(pos))
        };
        if let Some(source) = removed.and_then(|w| w.upgrade()) {
            source.drain();
        }
        Ok(())
    }

    fn endpoint_list(&self) -> &NodeList<dyn PsmxEndpoint> {
        &self.endpoints
    }
}

struct LoopbackEndpoint {
    me: Weak<LoopbackEndpoint>,
    direction: EndpointDirection,
    instance_id: InstanceId,
    topic: Weak<LoopbackTopic>,
    pool: Arc<ChunkPool>,
    loans: bool,
    depth: usize,
    queue: Mutex<VecDeque<LoanRef>>,
    listener: Mutex<Option<DataAvailableFn>>,
}

impl LoopbackEndpoint {
    fn new_loan(&self, len: usize) -> Option<LoanRef> {
        let me: Arc<dyn PsmxEndpoint> = self.me.upgrade()?;
        let Some(chunk) = self.pool.acquire() else {
            global_metrics().inc_loan_exhausted();
            return None;
        };
        global_metrics().inc_transport_loans();
        Some(LoanedSample::from_chunk(chunk, len, me))
    }

    /// Fresh chunk holding a copy of `loan` (content, metadata, state).
    fn copy_of(&self, loan: &LoanRef) -> Option<LoanRef> {
        let copy = self.new_loan(loan.len())?;
        loan.with_buffer(|data| copy.copy_from(data)).ok()?.ok()?;
        copy.set_metadata(loan.metadata()).ok()?;
        let state = loan.state();
        if state != SampleState::Uninitialized {
            copy.set_state(state).ok()?;
        }
        Some(copy)
    }

    fn enqueue(&self, loan: LoanRef) {
        let overflow = {
            let mut queue = self.queue.lock();
            let dropped = if queue.len() >= self.depth {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(loan);
            dropped
        };
        if let Some(old) = overflow {
            log::debug!("[psmx] loopback: source queue full, dropping oldest");
            discard_logged(&old);
        }
        let listener = self.listener.lock().clone();
        if let Some(callback) = listener {
            callback();
        }
    }

    fn drain(&self) {
        let pending: Vec<LoanRef> = self.queue.lock().drain(..).collect();
        for loan in &pending {
            discard_logged(loan);
        }
    }
}

impl PsmxEndpoint for LoopbackEndpoint {
    fn direction(&self) -> EndpointDirection {
        self.direction
    }

    fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    fn supports_loans(&self) -> bool {
        self.loans
    }

    fn request_loan(&self, size: usize) -> Option<LoanRef> {
        if !self.loans
            || self.direction != EndpointDirection::Sink
            || size == 0
            || size > self.pool.chunk_size
        {
            return None;
        }
        self.new_loan(size)
    }

    fn write(&self, loan: LoanRef) -> Result<()> {
        if self.direction != EndpointDirection::Sink {
            discard_logged(&loan);
            return Err(Error::IllegalOperation("write on a source pipe".into()));
        }
        let Some(topic) = self.topic.upgrade() else {
            discard_logged(&loan);
            return Err(Error::Transport("loopback topic deleted".into()));
        };
        let readers = topic.live_sources();
        let Some((first, rest)) = readers.split_first() else {
            discard_logged(&loan);
            return Ok(());
        };
        let mut copies = Vec::with_capacity(rest.len());
        for _ in rest {
            let Some(copy) = self.copy_of(&loan) else {
                log::debug!(
                    "[psmx] loopback: no chunks for {} reader copies, write refused",
                    rest.len()
                );
                for copy in &copies {
                    discard_logged(copy);
                }
                return Err(Error::OutOfResources);
            };
            copies.push(copy);
        }
        for (reader, copy) in rest.iter().zip(copies) {
            reader.enqueue(copy);
        }
        first.enqueue(loan);
        Ok(())
    }

    fn take(&self) -> Option<LoanRef> {
        if self.direction != EndpointDirection::Source {
            return None;
        }
        let loan = self.queue.lock().pop_front();
        if loan.is_some() {
            global_metrics().inc_pipe_takes();
        }
        loan
    }

    fn on_data_available(&self, callback: DataAvailableFn) -> bool {
        if self.direction != EndpointDirection::Source {
            return false;
        }
        *self.listener.lock() = Some(callback);
        true
    }

    fn release_loan(&self, _sample: &LoanedSample, buffer: Box<[u8]>) {
        self.pool.release(buffer);
    }
}

fn discard_logged(loan: &LoanRef) {
    if let Err(e) = loan.discard(None) {
        log::warn!("[psmx] loopback: dropping loan failed: {}", e);
    }
}

/// Dynamic-plugin entry point for the loopback transport.
///
/// # Safety
///
/// See [`create_interface_with`].
#[no_mangle]
pub unsafe extern "C" fn loopback_create_virtual_interface(
    out: *mut *mut c_void,
    identifier: u32,
    config: *const c_char,
) -> bool {
    // SAFETY: forwarded caller contract.
    unsafe {
        create_interface_with(out, identifier, config, |id, cfg| {
            LoopbackInstance::create(id, &TransportConfig::new(LOOPBACK_NAME).with_config(cfg))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psmx::fingerprint::topic_name_hash;
    use crate::psmx::{endpoint_add, topic_add, topic_remove};
    use std::sync::atomic::AtomicBool;

    fn descriptor() -> TopicDescriptor {
        TopicDescriptor {
            topic_name: "Square".into(),
            topic_hash: topic_name_hash("Square"),
            type_name: "Shape".into(),
            fingerprint: TypeFingerprint::new("Shape", TypeProperties::fixed_struct(), 8),
        }
    }

    fn options(max_chunks: usize, depth: usize) -> LoopbackOptions {
        LoopbackOptions {
            max_chunks,
            chunk_size: 64,
            depth,
            ..LoopbackOptions::default()
        }
    }

    #[test]
    fn test_parse_options() {
        let opts = LoopbackOptions::parse("max_chunks=2;CHUNK_SIZE=128;loans=0;depth=4").unwrap();
        assert_eq!(opts.max_chunks, 2);
        assert_eq!(opts.chunk_size, 128);
        assert!(!opts.loans);
        assert_eq!(opts.depth, 4);
        assert!(opts.fixed_only);
        assert_eq!(LoopbackOptions::parse("").unwrap(), LoopbackOptions::default());
        assert!(LoopbackOptions::parse("max_chunks=0").is_err());
        assert!(LoopbackOptions::parse("loans=maybe").is_err());
        assert!(LoopbackOptions::parse("unknown=3").is_ok());
    }

    #[test]
    fn test_type_and_qos_predicates() {
        let inst = LoopbackInstance::new(1, LoopbackOptions::default()).unwrap();
        assert!(inst.type_supported(TypeProperties::fixed_struct()));
        assert!(!inst.type_supported(TypeProperties::empty().with(TypeProperties::CONTAINS_STRING)));

        let be = LoopbackInstance::new(
            1,
            LoopbackOptions {
                best_effort_only: true,
                ..LoopbackOptions::default()
            },
        )
        .unwrap();
        assert!(be.qos_supported(&EndpointQos::best_effort()));
        assert!(!be.qos_supported(&EndpointQos::reliable()));
    }

    #[test]
    fn test_loan_pool_exhaustion_and_release() {
        let inst = LoopbackInstance::new(1, options(2, 4)).unwrap();
        let topic = inst.create_topic(&descriptor()).unwrap();
        let sink = topic
            .create_endpoint(&EndpointQos::default(), EndpointDirection::Sink)
            .unwrap();
        let a = sink.request_loan(8).unwrap();
        let _b = sink.request_loan(8).unwrap();
        assert!(sink.request_loan(8).is_none());
        assert!(sink.request_loan(65).is_none());
        assert_eq!(inst.chunks_in_use(), 2);

        a.decref(None).unwrap();
        assert_eq!(inst.chunks_in_use(), 1);
        assert!(sink.request_loan(8).is_some());
    }

    #[test]
    fn test_write_moves_then_copies() {
        let inst = LoopbackInstance::new(1, options(8, 4)).unwrap();
        let topic = inst.create_topic(&descriptor()).unwrap();
        let sink = topic
            .create_endpoint(&EndpointQos::default(), EndpointDirection::Sink)
            .unwrap();
        let r1 = topic
            .create_endpoint(&EndpointQos::default(), EndpointDirection::Source)
            .unwrap();
        let r2 = topic
            .create_endpoint(&EndpointQos::default(), EndpointDirection::Source)
            .unwrap();

        let notified = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&notified);
        assert!(r1.on_data_available(Arc::new(move || flag.store(true, Ordering::Release))));
        assert!(!sink.on_data_available(Arc::new(|| {})));

        let loan = sink.request_loan(4).unwrap();
        loan.copy_from(&[1, 2, 3, 4]).unwrap();
        loan.set_state(SampleState::Raw).unwrap();
        let ptr = loan.sample_ptr();
        sink.write(loan).unwrap();

        assert!(notified.load(Ordering::Acquire));
        let got1 = r1.take().unwrap();
        let got2 = r2.take().unwrap();
        assert_eq!(got1.sample_ptr(), ptr);
        assert_ne!(got2.sample_ptr(), ptr);
        assert_eq!(got2.to_vec().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(got2.state(), SampleState::Raw);
        assert!(r1.take().is_none());

        got1.decref(None).unwrap();
        got2.decref(None).unwrap();
        assert_eq!(inst.chunks_in_use(), 0);
    }

    #[test]
    fn test_write_refused_without_chunks_for_copies() {
        let inst = LoopbackInstance::new(1, options(2, 4)).unwrap();
        let topic = inst.create_topic(&descriptor()).unwrap();
        let sink = topic
            .create_endpoint(&EndpointQos::default(), EndpointDirection::Sink)
            .unwrap();
        let sources: Vec<_> = (0..3)
            .map(|_| {
                topic
                    .create_endpoint(&EndpointQos::default(), EndpointDirection::Source)
                    .unwrap()
            })
            .collect();

        // one chunk left for two copies
        let loan = sink.request_loan(4).unwrap();
        assert!(matches!(
            sink.write(Arc::clone(&loan)),
            Err(Error::OutOfResources)
        ));
        assert!(!loan.is_finalized());
        assert!(sources.iter().all(|s| s.take().is_none()));
        assert_eq!(inst.chunks_in_use(), 1);
        loan.decref(None).unwrap();
        assert_eq!(inst.chunks_in_use(), 0);
    }

    #[test]
    fn test_zero_sized_options_rejected() {
        for bad in [options(0, 4), options(2, 0)] {
            assert!(matches!(
                LoopbackInstance::new(1, bad),
                Err(Error::Config(_))
            ));
        }
        let no_chunk_size = LoopbackOptions {
            chunk_size: 0,
            ..LoopbackOptions::default()
        };
        assert!(no_chunk_size.validate().is_err());
        assert!(LoopbackOptions::default().validate().is_ok());
    }

    #[test]
    fn test_write_without_sources_releases_loan() {
        let inst = LoopbackInstance::new(1, options(2, 4)).unwrap();
        let topic = inst.create_topic(&descriptor()).unwrap();
        let sink = topic
            .create_endpoint(&EndpointQos::default(), EndpointDirection::Sink)
            .unwrap();
        let loan = sink.request_loan(4).unwrap();
        sink.write(Arc::clone(&loan)).unwrap();
        assert!(loan.is_finalized());
        assert_eq!(inst.chunks_in_use(), 0);
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let inst = LoopbackInstance::new(1, options(8, 2)).unwrap();
        let topic = inst.create_topic(&descriptor()).unwrap();
        let sink = topic
            .create_endpoint(&EndpointQos::default(), EndpointDirection::Sink)
            .unwrap();
        let source = topic
            .create_endpoint(&EndpointQos::default(), EndpointDirection::Source)
            .unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..3 {
            let loan = sink.request_loan(4).unwrap();
            ptrs.push(loan.sample_ptr());
            sink.write(loan).unwrap();
        }
        assert_eq!(inst.chunks_in_use(), 2);
        assert_eq!(source.take().unwrap().sample_ptr(), ptrs[1]);
        assert_eq!(source.take().unwrap().sample_ptr(), ptrs[2]);
    }

    #[test]
    fn test_delete_topic_refused_while_endpoints_attached() {
        let inst = LoopbackInstance::new(1, options(2, 2)).unwrap();
        let topic = inst.create_topic(&descriptor()).unwrap();
        topic_add(inst.as_ref(), Arc::clone(&topic));
        let ep = topic
            .create_endpoint(&EndpointQos::default(), EndpointDirection::Source)
            .unwrap();
        endpoint_add(topic.as_ref(), Arc::clone(&ep));
        assert!(!topic_remove(inst.as_ref(), &topic));
        assert!(inst.deinit().is_err());

        assert!(crate::psmx::endpoint_remove(topic.as_ref(), &ep));
        assert!(topic_remove(inst.as_ref(), &topic));
        assert!(inst.deinit().is_ok());
    }

    #[test]
    fn test_exported_factory() {
        let mut out: *mut c_void = std::ptr::null_mut();
        let ok = unsafe { loopback_create_virtual_interface(&mut out, 9, std::ptr::null()) };
        assert!(ok);
        let inst = unsafe { *Box::from_raw(out.cast::<Arc<dyn PsmxInstance>>()) };
        assert_eq!(inst.name(), LOOPBACK_NAME);
        assert_eq!(inst.instance_id(), 9);
    }
}
