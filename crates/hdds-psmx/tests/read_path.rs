// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic

//! Read path integration tests: loaned read/take, loan return and
//! reclaim, pipe draining and reader teardown.

mod common;

use common::{mock_catalog, MockControl, MOCK_NAME};
use hdds_psmx::config::{PsmxConfig, TransportConfig};
use hdds_psmx::loan::{LoanRef, LoanedSample};
use hdds_psmx::psmx::loopback::LOOPBACK_NAME;
use hdds_psmx::{
    AllocatorKind, AllocatorTarget, DataAllocator, Domain, EndpointQos, Error, Reader,
    TransportCatalog, TypeSupport, Writer,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn conventional_pair() -> (Domain, Arc<Writer>, Arc<Reader>) {
    let domain = Domain::new(0, Arc::new(TransportCatalog::empty()));
    let ts = Arc::new(TypeSupport::fixed("P", 1));
    let reader = domain
        .create_reader("T", Arc::clone(&ts), EndpointQos::default())
        .unwrap();
    let writer = domain.create_writer("T", ts, EndpointQos::default()).unwrap();
    (domain, writer, reader)
}

fn loopback_pair(config: &str, size: usize) -> (Domain, Arc<Writer>, Arc<Reader>) {
    let domain = Domain::with_config(
        0,
        &PsmxConfig::empty().with_transport(TransportConfig::new(LOOPBACK_NAME).with_config(config)),
    )
    .unwrap();
    let ts = Arc::new(TypeSupport::fixed("P", size));
    let reader = domain
        .create_reader("T", Arc::clone(&ts), EndpointQos::default())
        .unwrap();
    let writer = domain.create_writer("T", ts, EndpointQos::default()).unwrap();
    (domain, writer, reader)
}

fn values(buf: &[Option<LoanRef>]) -> Vec<u8> {
    buf.iter()
        .flatten()
        .map(|loan| loan.to_vec().unwrap()[0])
        .collect()
}

#[test]
fn test_second_return_is_rejected_without_side_effects() {
    let (_domain, writer, reader) = conventional_pair();
    writer.write(&[1]).unwrap();
    writer.write(&[2]).unwrap();

    let mut buf = vec![None; 4];
    assert_eq!(reader.read(&mut buf).unwrap(), 2);
    let mut stale = buf.clone();
    reader.return_loan(&mut buf).unwrap();
    assert!(buf.iter().all(Option::is_none));
    assert_eq!(reader.lent_count(), 0);

    let first = stale[0].clone().unwrap();
    assert_eq!(first.refcount(), 1);
    let result = reader.return_loan(&mut stale);
    assert!(matches!(result, Err(Error::BadParameter(_))));
    // untouched: still cached, still referenced once, slots kept
    assert_eq!(first.refcount(), 1);
    assert!(stale[..2].iter().all(Option::is_some));
    assert!(stale[2..].iter().all(Option::is_none));
    assert_eq!(reader.cached_len(), 2);
}

#[test]
fn test_return_of_taken_samples_finalizes() {
    let (_domain, writer, reader) = conventional_pair();
    writer.write(&[5]).unwrap();
    let mut buf = vec![None; 2];
    assert_eq!(reader.take(&mut buf).unwrap(), 1);
    let loan = buf[0].clone().unwrap();
    assert_eq!(reader.cached_len(), 0);
    reader.return_loan(&mut buf).unwrap();
    assert!(loan.is_finalized());

    let mut again = vec![Some(loan)];
    assert!(matches!(reader.return_loan(&mut again), Err(Error::BadParameter(_))));
}

#[test]
fn test_foreign_loan_is_rejected() {
    let (_domain, writer, reader) = conventional_pair();
    writer.write(&[1]).unwrap();
    let mut buf = vec![None; 2];
    reader.take(&mut buf).unwrap();

    buf[1] = LoanedSample::heap(1);
    assert!(matches!(reader.return_loan(&mut buf), Err(Error::BadParameter(_))));
    assert_eq!(reader.lent_count(), 1);
    // a bad slot also blocks reclaim on the next take
    assert!(matches!(reader.take(&mut buf), Err(Error::BadParameter(_))));
    buf[1] = None;
    reader.return_loan(&mut buf).unwrap();
    assert_eq!(reader.lent_count(), 0);
}

#[test]
fn test_filled_buffer_is_reclaimed_by_next_take() {
    let (_domain, writer, reader) = conventional_pair();
    for i in 1..=4u8 {
        writer.write(&[i]).unwrap();
    }
    let mut buf = vec![None; 2];
    assert_eq!(reader.take(&mut buf).unwrap(), 2);
    assert_eq!(values(&buf), vec![1, 2]);
    let previous: Vec<LoanRef> = buf.iter().flatten().cloned().collect();

    assert_eq!(reader.take(&mut buf).unwrap(), 2);
    assert_eq!(values(&buf), vec![3, 4]);
    assert!(previous.iter().all(|l| l.is_finalized()));
    assert_eq!(reader.lent_count(), 2);

    assert_eq!(reader.take(&mut buf).unwrap(), 0);
    assert!(buf.iter().all(Option::is_none));
    assert_eq!(reader.lent_count(), 0);
}

#[test]
fn test_read_shares_cached_sample() {
    let (_domain, writer, reader) = conventional_pair();
    writer.write(&[9]).unwrap();

    let mut a = vec![None; 1];
    let mut b = vec![None; 1];
    assert_eq!(reader.read(&mut a).unwrap(), 1);
    assert_eq!(reader.read(&mut b).unwrap(), 1);
    let loan = a[0].clone().unwrap();
    assert!(Arc::ptr_eq(&loan, b[0].as_ref().unwrap()));
    assert_eq!(loan.refcount(), 3);
    assert_eq!(reader.lent_count(), 2);

    reader.return_loan(&mut a).unwrap();
    assert_eq!(loan.refcount(), 2);
    reader.return_loan(&mut b).unwrap();
    assert_eq!(loan.refcount(), 1);
    assert!(!loan.is_registered());

    let mut c = vec![None; 1];
    assert_eq!(reader.take(&mut c).unwrap(), 1);
    assert_eq!(loan.refcount(), 1);
    reader.return_loan(&mut c).unwrap();
    assert!(loan.is_finalized());
}

#[test]
fn test_taken_read_sample_outlives_cache() {
    let (_domain, writer, reader) = conventional_pair();
    writer.write(&[4]).unwrap();
    let mut read = vec![None; 1];
    let mut taken = vec![None; 1];
    reader.read(&mut read).unwrap();
    assert_eq!(reader.take(&mut taken).unwrap(), 1);
    let loan = taken[0].clone().unwrap();
    assert_eq!(loan.refcount(), 2);
    assert_eq!(reader.lent_count(), 2);

    reader.return_loan(&mut taken).unwrap();
    assert!(!loan.is_finalized());
    reader.return_loan(&mut read).unwrap();
    assert!(loan.is_finalized());
}

#[test]
fn test_deleted_reader_refuses_reads() {
    let (domain, writer, reader) = conventional_pair();
    writer.write(&[1]).unwrap();
    let mut buf = vec![None; 1];
    reader.take(&mut buf).unwrap();
    let loan = buf[0].clone().unwrap();

    domain.delete_reader(&reader).unwrap();
    assert!(loan.is_finalized());
    assert!(matches!(reader.take(&mut buf), Err(Error::PreconditionNotMet(_))));
    assert!(matches!(domain.delete_reader(&reader), Err(Error::BadParameter(_))));
    // writer keeps working with nobody listening
    writer.write(&[2]).unwrap();
}

#[test]
fn test_loopback_queue_drops_oldest() {
    let (_domain, writer, reader) = loopback_pair("depth=2;max_chunks=8;chunk_size=16", 1);
    for i in 1..=3u8 {
        writer.write(&[i]).unwrap();
    }
    let mut buf = vec![None; 4];
    assert_eq!(reader.take(&mut buf).unwrap(), 2);
    assert_eq!(values(&buf), vec![2, 3]);
    assert!(buf.iter().flatten().all(|l| !l.origin().is_heap()));
    reader.return_loan(&mut buf).unwrap();
}

#[test]
fn test_reader_delete_returns_transport_chunks() {
    let (domain, writer, reader) = loopback_pair("max_chunks=1;chunk_size=16", 8);
    let loan = writer.request_loan().unwrap();
    loan.copy_from(&[1; 8]).unwrap();
    writer.write_loan(&loan).unwrap();

    let mut buf = vec![None; 1];
    assert_eq!(reader.take(&mut buf).unwrap(), 1);
    assert!(Arc::ptr_eq(buf[0].as_ref().unwrap(), &loan));
    assert!(matches!(writer.request_loan(), Err(Error::OutOfResources)));

    domain.delete_reader(&reader).unwrap();
    assert!(loan.is_finalized());
    let next = writer.request_loan().unwrap();
    writer.return_loan(&next).unwrap();
}

#[test]
fn test_read_without_data_returns_zero() {
    let (_domain, _writer, reader) = loopback_pair("", 4);
    let mut buf = vec![None; 3];
    assert_eq!(reader.read(&mut buf).unwrap(), 0);
    assert_eq!(reader.take(&mut buf).unwrap(), 0);
    assert!(matches!(reader.take(&mut []), Err(Error::BadParameter(_))));
}

#[test]
fn test_refused_release_keeps_only_that_slot() {
    let control = MockControl::with_budget(1);
    let domain = Domain::new(0, Arc::new(mock_catalog(MOCK_NAME, 0, &control)));
    let ts = Arc::new(TypeSupport::fixed("P", 1));
    let reader = domain
        .create_reader("T", Arc::clone(&ts), EndpointQos::default())
        .unwrap();
    let writer = domain.create_writer("T", ts, EndpointQos::default()).unwrap();
    // first through the transport, second on the heap (budget spent)
    writer.write(&[1]).unwrap();
    writer.write(&[2]).unwrap();

    let mut buf = vec![None; 2];
    assert_eq!(reader.take(&mut buf).unwrap(), 2);
    assert_eq!(values(&buf), vec![2, 1]);
    let heap = buf[0].clone().unwrap();
    assert!(heap.origin().is_heap());
    assert!(!buf[1].as_ref().unwrap().origin().is_heap());

    control.veto_decref.store(true, Ordering::SeqCst);
    assert!(matches!(
        reader.return_loan(&mut buf),
        Err(Error::PreconditionNotMet(_))
    ));
    assert!(buf[0].is_none());
    assert!(heap.is_finalized());
    assert!(buf[1].is_some());
    assert_eq!(reader.lent_count(), 1);

    control.veto_decref.store(false, Ordering::SeqCst);
    reader.return_loan(&mut buf).unwrap();
    assert!(buf.iter().all(Option::is_none));
    assert_eq!(reader.lent_count(), 0);
    assert_eq!(control.outstanding(), 0);
}

#[test]
fn test_full_keep_all_reader_leaves_pipe_data_queued() {
    let domain = Domain::with_config(
        0,
        &PsmxConfig::empty().with_transport(TransportConfig::new(LOOPBACK_NAME)),
    )
    .unwrap();
    let ts = Arc::new(TypeSupport::fixed("P", 1));
    let reader = domain
        .create_reader(
            "T",
            Arc::clone(&ts),
            EndpointQos::reliable().keep_all().max_samples(1),
        )
        .unwrap();
    let writer = domain.create_writer("T", ts, EndpointQos::reliable()).unwrap();
    assert_eq!(reader.pipe_count(), 1);
    for i in 1..=3u8 {
        writer.write(&[i]).unwrap();
    }

    let mut buf = vec![None; 4];
    for expected in 1..=3u8 {
        assert_eq!(reader.take(&mut buf).unwrap(), 1);
        assert_eq!(values(&buf), vec![expected]);
    }
    assert_eq!(reader.take(&mut buf).unwrap(), 0);
}

#[test]
fn test_subscriber_allocator_returns_read_buffers() {
    let (domain, writer, reader) = loopback_pair("", 4);
    writer.write(&[1, 2, 3, 4]).unwrap();
    let mut buf = vec![None; 1];
    assert_eq!(reader.take(&mut buf).unwrap(), 1);
    let loan = buf[0].take().unwrap();
    assert!(!loan.origin().is_heap());

    let mut sub =
        DataAllocator::bind(domain.registry(), AllocatorTarget::Entity(reader.handle())).unwrap();
    assert!(matches!(sub.kind(), AllocatorKind::Subscriber(_)));
    sub.release(&loan).unwrap();
    assert!(loan.is_finalized());
    assert_eq!(reader.lent_count(), 0);
    assert!(matches!(sub.release(&loan), Err(Error::PreconditionNotMet(_))));
}
