// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # hdds-psmx - Zero-copy sample loans and pluggable PSMX transports
//!
//! Sample memory for HDDS readers and writers comes either from the heap or
//! from a PSMX transport plugin. This crate tracks those buffers
//! ("loans") through their reference counts, routes them through the
//! transports an endpoint is bound to, and releases them back to where they
//! came from exactly once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hdds_psmx::{Domain, EndpointQos, PsmxConfig, Result, TransportConfig, TypeSupport};
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let config = PsmxConfig::empty().with_transport(TransportConfig::new("loopback"));
//!     let domain = Domain::with_config(0, &config)?;
//!
//!     let ts = Arc::new(TypeSupport::fixed("Position", 16));
//!     let reader = domain.create_reader("pos", Arc::clone(&ts), EndpointQos::default())?;
//!     let writer = domain.create_writer("pos", ts, EndpointQos::default())?;
//!
//!     // Fill a transport chunk in place and hand it over
//!     let loan = writer.request_loan()?;
//!     loan.copy_from(&[0u8; 16])?;
//!     writer.write_loan(&loan)?;
//!
//!     let mut samples = vec![None; 8];
//!     let n = reader.take(&mut samples)?;
//!     println!("received {} sample(s)", n);
//!     reader.return_loan(&mut samples)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |   Writer (request_loan / write)      Reader (read / take / return)  |
//! +---------------------------------------------------------------------+
//! |   EndpointBinding: pipes per endpoint, priority ordered             |
//! |   DataAllocator:   heap | publisher pipe | subscriber pipe          |
//! +---------------------------------------------------------------------+
//! |   PSMX: Instance -> Topic -> Endpoint (pipe)                        |
//! |   TransportCatalog: builtin + dlopen'ed plugins                     |
//! +---------------------------------------------------------------------+
//! |   LoanedSample (refcount, origin, state) + LoanManager (registry)   |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`loan`] - loaned samples and the per-endpoint loan registry
//! - [`psmx`] - plugin traits, catalog, loopback reference plugin
//! - [`writer`] / [`reader`] - the two call sites that acquire and release loans
//! - [`allocator`] - raw-buffer allocation facade

// Clippy: No blanket suppressions. Fix issues properly or use inline #[allow] with justification.

/// Raw-buffer allocator bound to the heap or an entity's pipe.
pub mod allocator;
/// Endpoint to PSMX pipe binding.
pub mod binding;
/// Reader sample cache.
pub mod cache;
/// Constants and transport configuration.
pub mod config;
/// Conventional delivery (network sink, local readers).
pub mod delivery;
/// Endpoint creation and intra-process matching.
pub mod domain;
/// Entity identities and handle registry.
pub mod entity;
/// Error types.
pub mod error;
/// Loaned samples and loan managers.
pub mod loan;
/// PSMX plugin model.
pub mod psmx;
/// Endpoint QoS relevant to transport selection and delivery.
pub mod qos;
/// Read/take path.
pub mod reader;
/// Type support and serializer seam.
pub mod types;
/// Write path.
pub mod writer;

pub use allocator::{AllocatorKind, AllocatorTarget, DataAllocator};
pub use binding::{BoundPipe, EndpointBinding};
pub use config::{PsmxConfig, TransportConfig};
pub use delivery::NetworkSink;
pub use domain::{Domain, DomainId};
pub use entity::{EntityHandle, EntityKind, EntityRegistry, Guid};
pub use error::{Error, Result};
pub use loan::{LoanManager, LoanRef, LoanedSample, SampleMetadata, SampleState};
pub use psmx::{
    EndpointDirection, Locator, PsmxEndpoint, PsmxInstance, PsmxTopic, TransportCatalog,
};
pub use qos::{EndpointQos, History, PsmxPolicy, Reliability};
pub use reader::Reader;
pub use types::{SerializedData, Serializer, TypeSupport};
pub use writer::{TopicFilter, Writer};
