// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sample loans and their per-endpoint registry.

pub mod manager;
pub mod sample;

pub use manager::{LoanManager, ManagerId};
pub use sample::{
    current_time_ns, EncodingVersion, LoanOrigin, LoanRef, LoanedSample, Registration,
    SampleMetadata, SamplePtr, SampleState, STATUS_DISPOSED, STATUS_UNREGISTERED,
    STATUS_VALID_DATA,
};
