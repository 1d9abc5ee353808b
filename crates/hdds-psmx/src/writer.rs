// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writer: loan requests and the write path.
//!
//! # Write Path
//!
//! ```text
//! write(sample | loan)
//!   |
//!   +-- validate, topic filter
//!   +-- resolve a supplied loan against this writer's registry
//!   +-- (no transport loan yet) request one from the bound pipes
//!   +-- snapshot matched readers, stamp metadata, build serialized data
//!   +-- conventional delivery: network sink + local readers without a
//!   |   shared instance
//!   +-- PSMX delivery: deregister the loan, hand it to its pipe
//!       (pipe out of chunks: conventional delivery to the readers behind it)
//! ```
//!
//! A transport loan obtained during the write but never seen by the caller
//! is finalized on any failure. Once handed to a pipe the loan belongs to
//! the transport.

use crate::binding::{BoundPipe, EndpointBinding};
use crate::delivery::{deliver_local, NetworkSink};
use crate::entity::{EntityHandle, EntityKind, Guid};
use crate::error::{Error, Result};
use crate::loan::{current_time_ns, LoanManager, LoanRef, LoanedSample, SampleMetadata, SampleState};
use crate::psmx::fingerprint::fnv1a_32;
use crate::psmx::metrics::global_metrics;
use crate::psmx::{InstanceId, Locator};
use crate::qos::EndpointQos;
use crate::reader::Reader;
use crate::types::{SerDataKind, SerializedData, TypeSupport};
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::sync::Arc;

/// Content filter evaluated on the in-memory sample; `false` suppresses it.
pub type TopicFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

struct MatchedReader {
    reader: Arc<Reader>,
    /// Instances both endpoints are bound to.
    shared: Vec<InstanceId>,
}

struct WriterState {
    loans: LoanManager,
    local_readers: Vec<MatchedReader>,
    remote_readers: Vec<Guid>,
    next_sequence: u64,
    deleted: bool,
}

/// Sample source for one write.
#[derive(Clone, Copy)]
enum WriteInput<'a> {
    Sample(&'a [u8]),
    Loan(&'a LoanRef),
}

/// Loan carrying the sample through PSMX, and whether the caller saw it.
struct PipeLoan<'b> {
    loan: LoanRef,
    pipe: &'b BoundPipe,
    fresh: bool,
}

/// Local writer bound to zero or more PSMX pipes.
pub struct Writer {
    handle: EntityHandle,
    guid: Guid,
    topic_name: String,
    type_support: Arc<TypeSupport>,
    qos: EndpointQos,
    binding: RwLock<EndpointBinding>,
    filter: RwLock<Option<TopicFilter>>,
    network: RwLock<Option<Arc<dyn NetworkSink>>>,
    state: Mutex<WriterState>,
}

impl Writer {
    pub(crate) fn new(
        handle: EntityHandle,
        topic_name: &str,
        type_support: Arc<TypeSupport>,
        qos: EndpointQos,
        binding: EndpointBinding,
    ) -> Self {
        Self {
            handle,
            guid: Guid::generate(EntityKind::Writer),
            topic_name: topic_name.to_string(),
            type_support,
            qos,
            binding: RwLock::new(binding),
            filter: RwLock::new(None),
            network: RwLock::new(None),
            state: Mutex::new(WriterState {
                loans: LoanManager::new(),
                local_readers: Vec::new(),
                remote_readers: Vec::new(),
                next_sequence: 1,
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

    /// Number of bound PSMX pipes.
    #[must_use]
    pub fn pipe_count(&self) -> usize {
        self.binding.read().len()
    }

    #[must_use]
    pub fn locators(&self) -> Vec<Locator> {
        self.binding.read().locators()
    }

    /// Instances this writer shares with a peer announcing `peer_locators`.
    #[must_use]
    pub fn common_instances(&self, peer_locators: &[Locator]) -> Vec<InstanceId> {
        self.binding.read().common_instances(peer_locators)
    }

    /// Loan-capable pipe of the highest priority, for allocators.
    pub(crate) fn first_loan_pipe(&self) -> Option<BoundPipe> {
        self.binding.read().loan_pipes().next().cloned()
    }

    pub fn set_filter(&self, filter: TopicFilter) {
        *self.filter.write() = Some(filter);
    }

    pub fn clear_filter(&self) {
        *self.filter.write() = None;
    }

    pub fn set_network_sink(&self, sink: Arc<dyn NetworkSink>) {
        *self.network.write() = Some(sink);
    }

    /// Announce a remote reader reached through the network sink.
    pub fn match_remote_reader(&self, reader: Guid) {
        let mut state = self.state.lock();
        if !state.remote_readers.contains(&reader) {
            state.remote_readers.push(reader);
        }
    }

    pub fn unmatch_remote_reader(&self, reader: Guid) {
        self.state.lock().remote_readers.retain(|g| *g != reader);
    }

    #[must_use]
    pub fn remote_reader_count(&self) -> usize {
        self.state.lock().remote_readers.len()
    }

    #[must_use]
    pub fn local_reader_count(&self) -> usize {
        self.state.lock().local_readers.len()
    }

    pub(crate) fn match_local_reader(&self, reader: Arc<Reader>, shared: Vec<InstanceId>) {
        let mut state = self.state.lock();
        if state
            .local_readers
            .iter()
            .any(|m| Arc::ptr_eq(&m.reader, &reader))
        {
            return;
        }
        log::debug!(
            "[writer] {:?} matched local reader {:?} (shared instances: {})",
            self.guid,
            reader.guid(),
            shared.len()
        );
        state.local_readers.push(MatchedReader { reader, shared });
    }

    pub(crate) fn unmatch_local_reader(&self, reader: &Reader) {
        self.state
            .lock()
            .local_readers
            .retain(|m| !std::ptr::eq(m.reader.as_ref(), reader));
    }

    /// Loans held by the application or in flight.
    #[must_use]
    pub fn outstanding_loans(&self) -> usize {
        self.state.lock().loans.len()
    }

    /// Borrow a sample buffer.
    ///
    /// Tries loan-capable pipes in priority order; falls back to the heap
    /// only when no such pipe is bound. Requires a fixed-size type.
    pub fn request_loan(&self) -> Result<LoanRef> {
        let binding = self.binding.read();
        let mut state = self.state.lock();
        self.ensure_alive(&state)?;
        let loan = self.acquire_loan(&binding)?;
        if let Err(e) = state.loans.register(&loan) {
            discard_logged(&loan, None);
            return Err(e);
        }
        Ok(loan)
    }

    /// Borrow `count` buffers, all or nothing.
    pub fn request_loans(&self, count: usize) -> Result<Vec<LoanRef>> {
        if count == 0 {
            return Err(Error::BadParameter("loan count must be > 0".into()));
        }
        let binding = self.binding.read();
        let mut state = self.state.lock();
        self.ensure_alive(&state)?;
        let mut granted: Vec<LoanRef> = Vec::with_capacity(count);
        for _ in 0..count {
            let next = self
                .acquire_loan(&binding)
                .and_then(|loan| state.loans.register(&loan).map(|_| loan));
            match next {
                Ok(loan) => granted.push(loan),
                Err(e) => {
                    log::debug!(
                        "[writer] {:?} batch loan failed after {}/{}: {}",
                        self.guid,
                        granted.len(),
                        count,
                        e
                    );
                    for loan in &granted {
                        discard_logged(loan, Some(&mut state.loans));
                    }
                    return Err(e);
                }
            }
        }
        Ok(granted)
    }

    /// Give back a loan obtained from [`request_loan`](Self::request_loan)
    /// without writing it.
    pub fn return_loan(&self, loan: &LoanRef) -> Result<()> {
        let mut state = self.state.lock();
        if !state.loans.contains(loan) {
            return Err(Error::BadParameter(format!(
                "loan {:?} not held by this writer",
                loan.sample_ptr()
            )));
        }
        loan.decref(Some(&mut state.loans)).map(|_| ())
    }

    /// Write a sample given in its in-memory representation.
    pub fn write(&self, sample: &[u8]) -> Result<()> {
        self.write_impl(WriteInput::Sample(sample))
    }

    /// Write a loaned sample. The writer takes over the loan.
    pub fn write_loan(&self, loan: &LoanRef) -> Result<()> {
        self.write_impl(WriteInput::Loan(loan))
    }

    fn write_impl(&self, input: WriteInput<'_>) -> Result<()> {
        if let WriteInput::Sample(data) = input {
            self.type_support.validate_sample(data)?;
        }

        let filter = self.filter.read().clone();
        if let Some(filter) = filter {
            let accepted = match input {
                WriteInput::Sample(data) => filter(data),
                WriteInput::Loan(loan) => loan.with_buffer(|data| filter(data))?,
            };
            if !accepted {
                log::trace!("[writer] {:?} sample filtered out", self.guid);
                if let WriteInput::Loan(loan) = input {
                    self.return_loan(loan)?;
                }
                return Ok(());
            }
        }

        let binding = self.binding.read();
        let supplied = {
            let state = self.state.lock();
            self.ensure_alive(&state)?;
            match input {
                WriteInput::Loan(loan) if !state.loans.contains(loan) => {
                    return Err(Error::BadParameter(format!(
                        "loan {:?} not held by this writer",
                        loan.sample_ptr()
                    )));
                }
                WriteInput::Loan(loan) => Some(Arc::clone(loan)),
                WriteInput::Sample(_) => None,
            }
        };

        let result = self.deliver(&binding, input, supplied.as_ref());
        if result.is_err() {
            if let Some(loan) = &supplied {
                // the caller handed the loan over; it does not come back
                let mut state = self.state.lock();
                if state.loans.contains(loan) {
                    if let Err(e) = loan.decref(Some(&mut state.loans)) {
                        log::warn!("[writer] releasing failed loan: {}", e);
                    }
                }
            }
        }
        result
    }

    fn deliver(
        &self,
        binding: &EndpointBinding,
        input: WriteInput<'_>,
        supplied: Option<&LoanRef>,
    ) -> Result<()> {
        let properties = self.type_support.properties();

        // A supplied transport loan is used as is; everything else needs the
        // raw sample bytes.
        let supplied_pipe = supplied.and_then(|loan| {
            loan.origin()
                .instance_id()
                .and_then(|id| binding.pipe_for_instance(id))
                .map(|pipe| (loan, pipe))
        });
        let raw: Option<Cow<'_, [u8]>> = match (input, supplied_pipe) {
            (_, Some(_)) => None,
            (WriteInput::Sample(data), None) => Some(Cow::Borrowed(data)),
            (WriteInput::Loan(loan), None) => Some(Cow::Owned(loan.to_vec()?)),
        };

        let mut pipe_loan = match supplied_pipe {
            Some((loan, pipe)) => Some(PipeLoan {
                loan: Arc::clone(loan),
                pipe,
                fresh: false,
            }),
            None => raw
                .as_deref()
                .and_then(|sample| self.transport_loan_for(binding, sample)),
        };

        let (sequence, readers, remote) = {
            let mut state = self.state.lock();
            let via = pipe_loan.as_ref().map(|pl| pl.pipe.instance_id());
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let readers: Vec<Arc<Reader>> = state
                .local_readers
                .iter()
                .filter(|m| via.map_or(true, |id| !m.shared.contains(&id)))
                .map(|m| Arc::clone(&m.reader))
                .collect();
            (sequence, readers, !state.remote_readers.is_empty())
        };

        let built = self.build_serdata(raw.as_deref(), pipe_loan.as_ref(), properties, sequence);
        let serdata = match built {
            Ok(serdata) => serdata,
            Err(e) => {
                if let Some(pl) = pipe_loan.take() {
                    self.abandon(&pl);
                }
                return Err(e);
            }
        };

        // A supplied heap loan has been copied out and is done.
        if let Some(loan) = supplied {
            if pipe_loan.as_ref().map_or(true, |pl| !Arc::ptr_eq(&pl.loan, loan)) {
                let mut state = self.state.lock();
                loan.decref(Some(&mut state.loans))?;
            }
        }

        if let Some(pl) = pipe_loan.as_ref().filter(|pl| pl.fresh) {
            let mut state = self.state.lock();
            if let Err(e) = state.loans.register(&pl.loan) {
                drop(state);
                self.abandon(pl);
                return Err(e);
            }
        }

        if let Err(e) = self.deliver_conventional(&serdata, &readers, remote) {
            if let Some(pl) = pipe_loan.take() {
                self.abandon(&pl);
            }
            return Err(e);
        }

        if let Some(pl) = pipe_loan {
            let via = pl.pipe.instance_id();
            match self.hand_off(pl) {
                Err(Error::OutOfResources) => {
                    let bypassed = self.readers_behind(via);
                    log::debug!(
                        "[writer] {:?} transport {} out of chunks, {} reader(s) served conventionally",
                        self.guid,
                        via,
                        bypassed.len()
                    );
                    self.deliver_conventional(&serdata, &bypassed, false)?;
                }
                result => result?,
            }
        }
        Ok(())
    }

    /// Local readers reached through instance `via`.
    fn readers_behind(&self, via: InstanceId) -> Vec<Arc<Reader>> {
        self.state
            .lock()
            .local_readers
            .iter()
            .filter(|m| m.shared.contains(&via))
            .map(|m| Arc::clone(&m.reader))
            .collect()
    }

    /// Loan from the highest-priority pipe that has one for `sample`.
    fn transport_loan_for<'b>(
        &self,
        binding: &'b EndpointBinding,
        sample: &[u8],
    ) -> Option<PipeLoan<'b>> {
        let properties = self.type_support.properties();
        for pipe in binding.loan_pipes() {
            let serialize = pipe.topic().serialization_required(properties);
            let Some(size) = self.type_support.required_buffer_size(sample, serialize) else {
                continue;
            };
            match pipe.endpoint().request_loan(size) {
                Some(loan) => {
                    return Some(PipeLoan {
                        loan,
                        pipe,
                        fresh: true,
                    })
                }
                None => log::debug!(
                    "[writer] {:?} no loan from {} ({} bytes)",
                    self.guid,
                    pipe.instance().name(),
                    size
                ),
            }
        }
        None
    }

    fn build_serdata(
        &self,
        raw: Option<&[u8]>,
        pipe_loan: Option<&PipeLoan<'_>>,
        properties: crate::psmx::TypeProperties,
        sequence: u64,
    ) -> Result<SerializedData> {
        let serializer = self.type_support.serializer();
        let mut metadata = SampleMetadata {
            source: self.guid,
            timestamp_ns: current_time_ns(),
            sequence,
            encoding: serializer.encoding(),
            ..SampleMetadata::default()
        };

        let Some(pl) = pipe_loan else {
            let raw = raw.ok_or_else(|| Error::BadParameter("no sample".into()))?;
            metadata.key_hash = serializer.key_hash(raw);
            metadata.hash = fnv1a_32(&metadata.key_hash);
            metadata.sample_size = raw.len();
            global_metrics().inc_conventional_writes();
            return self
                .type_support
                .from_sample(SerDataKind::Data, raw, metadata);
        };

        if pl.fresh {
            let raw = raw.ok_or_else(|| Error::BadParameter("no sample".into()))?;
            metadata.key_hash = serializer.key_hash(raw);
            let serialize = pl.pipe.topic().serialization_required(properties);
            metadata.sample_size = self.type_support.fill_loan(&pl.loan, raw, serialize)?;
        } else {
            if pl.loan.state() == SampleState::Uninitialized {
                pl.loan.set_state(SampleState::Raw)?;
            }
            metadata.key_hash = pl.loan.with_buffer(|data| serializer.key_hash(data))?;
            metadata.sample_size = pl.loan.len();
        }
        metadata.hash = fnv1a_32(&metadata.key_hash);
        pl.loan.set_metadata(metadata)?;
        self.type_support
            .from_loaned_sample(SerDataKind::Data, &pl.loan)
    }

    fn deliver_conventional(
        &self,
        serdata: &SerializedData,
        readers: &[Arc<Reader>],
        remote: bool,
    ) -> Result<()> {
        if remote {
            let sink = self.network.read().clone();
            match sink {
                Some(sink) => sink.send(self.guid, serdata)?,
                None => {
                    global_metrics().inc_network_unsent();
                    log::warn!(
                        "[writer] {:?} has remote readers but no network sink, sample {} not sent",
                        self.guid,
                        serdata.metadata.sequence
                    );
                }
            }
        }
        for reader in readers {
            deliver_local(
                reader,
                serdata,
                self.qos.reliability,
                self.qos.max_blocking_time,
            )?;
        }
        Ok(())
    }

    /// Transfer a loan to its pipe. A refused write finalizes the loan
    /// unless the plugin already did, and is returned as is; `deliver` falls
    /// back to conventional delivery on `OutOfResources`.
    fn hand_off(&self, pl: PipeLoan<'_>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if let Err(e) = state.loans.deregister(&pl.loan) {
                drop(state);
                discard_logged(&pl.loan, None);
                return Err(e);
            }
        }
        global_metrics().inc_pipe_writes();
        if let Err(e) = pl.pipe.endpoint().write(Arc::clone(&pl.loan)) {
            global_metrics().inc_pipe_write_failures();
            log::debug!("[writer] {:?} pipe write failed: {}", self.guid, e);
            // plugin refused ownership
            if !pl.loan.is_finalized() {
                discard_logged(&pl.loan, None);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Failure before hand-off: fresh loans are finalized; supplied loans
    /// are released by the caller of `deliver`.
    fn abandon(&self, pl: &PipeLoan<'_>) {
        if pl.fresh {
            let mut state = self.state.lock();
            let manager = state.loans.contains(&pl.loan).then_some(&mut state.loans);
            discard_logged(&pl.loan, manager);
        }
    }

    fn acquire_loan(&self, binding: &EndpointBinding) -> Result<LoanRef> {
        if !self.type_support.is_fixed_size() {
            return Err(Error::PreconditionNotMet(format!(
                "loans need a fixed-size type, '{}' is not",
                self.type_support.type_name()
            )));
        }
        let size = self.type_support.sample_size();
        let mut any_loan_pipe = false;
        for pipe in binding.loan_pipes() {
            any_loan_pipe = true;
            if let Some(loan) = pipe.endpoint().request_loan(size) {
                return Ok(loan);
            }
        }
        if any_loan_pipe {
            return Err(Error::OutOfResources);
        }
        LoanedSample::heap(size).ok_or(Error::OutOfResources)
    }

    fn ensure_alive(&self, state: &WriterState) -> Result<()> {
        if state.deleted {
            return Err(Error::PreconditionNotMet(format!(
                "writer {:?} deleted",
                self.guid
            )));
        }
        Ok(())
    }

    /// Release loans and pipes; later operations fail.
    pub(crate) fn shutdown(&self) {
        let released = {
            let mut state = self.state.lock();
            state.deleted = true;
            state.local_readers.clear();
            state.remote_readers.clear();
            state.loans.fini()
        };
        self.binding.write().release();
        log::debug!(
            "[writer] {:?} on '{}' deleted ({} loans released)",
            self.guid,
            self.topic_name,
            released
        );
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("guid", &self.guid)
            .field("topic", &self.topic_name)
            .field("type", &self.type_support.type_name())
            .finish()
    }
}

fn discard_logged(loan: &LoanRef, manager: Option<&mut LoanManager>) {
    if let Err(e) = loan.discard(manager) {
        log::warn!("[writer] discarding loan failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_writer(ts: TypeSupport) -> Writer {
        Writer::new(
            EntityHandle::from_raw(1),
            "T",
            Arc::new(ts),
            EndpointQos::default(),
            EndpointBinding::empty(crate::psmx::EndpointDirection::Sink),
        )
    }

    #[test]
    fn test_heap_loan_without_pipes() {
        let writer = heap_writer(TypeSupport::fixed("P", 8));
        let loan = writer.request_loan().unwrap();
        assert!(loan.origin().is_heap());
        assert_eq!(loan.len(), 8);
        assert_eq!(writer.outstanding_loans(), 1);
        writer.return_loan(&loan).unwrap();
        assert_eq!(writer.outstanding_loans(), 0);
        assert!(loan.is_finalized());
    }

    #[test]
    fn test_loan_needs_fixed_size_type() {
        let writer = heap_writer(TypeSupport::variable("Text"));
        assert!(matches!(writer.request_loan(), Err(Error::PreconditionNotMet(_))));
    }

    #[test]
    fn test_write_validates_size() {
        let writer = heap_writer(TypeSupport::fixed("P", 4));
        assert!(matches!(writer.write(&[0; 3]), Err(Error::BadParameter(_))));
        assert!(matches!(writer.write(&[]), Err(Error::BadParameter(_))));
        assert!(writer.write(&[0; 4]).is_ok());
    }

    #[test]
    fn test_write_heap_loan_consumes_it() {
        let writer = heap_writer(TypeSupport::fixed("P", 4));
        let loan = writer.request_loan().unwrap();
        loan.copy_from(&[1, 2, 3, 4]).unwrap();
        writer.write_loan(&loan).unwrap();
        assert!(loan.is_finalized());
        assert_eq!(writer.outstanding_loans(), 0);
        assert!(matches!(writer.write_loan(&loan), Err(Error::BadParameter(_))));
    }

    #[test]
    fn test_foreign_loan_rejected() {
        let writer = heap_writer(TypeSupport::fixed("P", 4));
        let foreign = LoanedSample::heap(4).unwrap();
        assert!(matches!(writer.write_loan(&foreign), Err(Error::BadParameter(_))));
        assert!(matches!(writer.return_loan(&foreign), Err(Error::BadParameter(_))));
        assert!(!foreign.is_finalized());
    }

    #[test]
    fn test_request_loans_zero() {
        let writer = heap_writer(TypeSupport::fixed("P", 4));
        assert!(writer.request_loans(0).is_err());
        let loans = writer.request_loans(3).unwrap();
        assert_eq!(loans.len(), 3);
        assert_eq!(writer.outstanding_loans(), 3);
    }

    #[test]
    fn test_shutdown_releases_loans() {
        let writer = heap_writer(TypeSupport::fixed("P", 4));
        let loan = writer.request_loan().unwrap();
        writer.shutdown();
        assert!(loan.is_finalized());
        assert!(writer.request_loan().is_err());
        assert!(matches!(writer.write(&[0; 4]), Err(Error::PreconditionNotMet(_))));
    }
}
