// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Type support: how samples of a topic type are sized, serialized and
//! turned into serialized-data objects.
//!
//! Samples cross this layer as byte slices holding the in-memory
//! representation. Fixed-size types (see [`TypeProperties::is_fixed_size`])
//! can travel raw in a transport loan; everything else is serialized first.

use crate::error::{Error, Result};
use crate::loan::{EncodingVersion, LoanRef, SampleMetadata, SampleState};
use crate::psmx::{TypeFingerprint, TypeProperties};
use std::sync::Arc;

/// CDR encapsulation header for PLAIN_CDR2 little-endian.
pub const CDR2_LE_HEADER: [u8; 4] = [0x00, 0x07, 0x00, 0x00];

/// Codec for one data type.
pub trait Serializer: Send + Sync {
    fn encoding(&self) -> EncodingVersion {
        EncodingVersion::Xcdr2
    }

    /// Exact serialized size of `sample`, `None` if it cannot be computed up
    /// front.
    fn serialized_size(&self, sample: &[u8]) -> Option<usize>;

    /// Encode into `out`; returns bytes written.
    fn serialize_into(&self, sample: &[u8], out: &mut [u8]) -> Result<usize>;

    /// Decode back to the in-memory representation.
    fn deserialize(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// 16-byte instance key hash (keyless types: zero).
    fn key_hash(&self, _sample: &[u8]) -> [u8; 16] {
        [0u8; 16]
    }
}

/// Wraps the in-memory bytes in a CDR2 encapsulation header.
#[derive(Debug, Clone, Copy, Default)]
pub struct CdrEnvelopeSerializer;

impl Serializer for CdrEnvelopeSerializer {
    fn serialized_size(&self, sample: &[u8]) -> Option<usize> {
        Some(CDR2_LE_HEADER.len() + sample.len())
    }

    fn serialize_into(&self, sample: &[u8], out: &mut [u8]) -> Result<usize> {
        let needed = CDR2_LE_HEADER.len() + sample.len();
        if out.len() < needed {
            return Err(Error::Serialization(format!(
                "buffer too small: {} < {}",
                out.len(),
                needed
            )));
        }
        out[..4].copy_from_slice(&CDR2_LE_HEADER);
        out[4..needed].copy_from_slice(sample);
        Ok(needed)
    }

    fn deserialize(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < CDR2_LE_HEADER.len() {
            return Err(Error::Serialization("truncated payload".into()));
        }
        let (header, body) = data.split_at(CDR2_LE_HEADER.len());
        if header != CDR2_LE_HEADER {
            return Err(Error::Serialization("unknown encapsulation".into()));
        }
        Ok(body.to_vec())
    }
}

/// Key-only or full-sample serialized data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerDataKind {
    Key,
    Data,
}

/// Serialized sample as delivered on the conventional path.
#[derive(Debug, Clone)]
pub struct SerializedData {
    pub kind: SerDataKind,
    pub metadata: SampleMetadata,
    pub payload: Vec<u8>,
    /// Loan the payload was built from, if any.
    pub loan: Option<LoanRef>,
}

/// Per-topic type information.
#[derive(Clone)]
pub struct TypeSupport {
    type_name: String,
    sample_size: usize,
    properties: TypeProperties,
    serializer: Arc<dyn Serializer>,
}

impl TypeSupport {
    /// Fixed-size type of `sample_size` bytes.
    #[must_use]
    pub fn fixed(type_name: impl Into<String>, sample_size: usize) -> Self {
        Self {
            type_name: type_name.into(),
            sample_size,
            properties: TypeProperties::fixed_struct(),
            serializer: Arc::new(CdrEnvelopeSerializer),
        }
    }

    /// Variable-size type (contains strings or sequences).
    #[must_use]
    pub fn variable(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            sample_size: 0,
            properties: TypeProperties::empty()
                .with(TypeProperties::CONTAINS_STRUCT)
                .with(TypeProperties::CONTAINS_SEQUENCE),
            serializer: Arc::new(CdrEnvelopeSerializer),
        }
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: TypeProperties) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// In-memory size (0 for variable-size types).
    #[must_use]
    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    #[must_use]
    pub fn properties(&self) -> TypeProperties {
        self.properties
    }

    #[must_use]
    pub fn is_fixed_size(&self) -> bool {
        self.properties.is_fixed_size() && self.sample_size > 0
    }

    #[must_use]
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    #[must_use]
    pub fn fingerprint(&self) -> TypeFingerprint {
        TypeFingerprint::new(&self.type_name, self.properties, self.sample_size)
    }

    /// Check a user-supplied sample.
    pub fn validate_sample(&self, sample: &[u8]) -> Result<()> {
        if sample.is_empty() {
            return Err(Error::BadParameter("empty sample".into()));
        }
        if self.is_fixed_size() && sample.len() != self.sample_size {
            return Err(Error::BadParameter(format!(
                "{} is {} bytes, got {}",
                self.type_name,
                self.sample_size,
                sample.len()
            )));
        }
        Ok(())
    }

    /// Loan size needed for `sample` in raw (`serialize == false`) or
    /// serialized form.
    #[must_use]
    pub fn required_buffer_size(&self, sample: &[u8], serialize: bool) -> Option<usize> {
        if !serialize && self.is_fixed_size() {
            Some(self.sample_size)
        } else if serialize {
            self.serializer.serialized_size(sample)
        } else {
            None
        }
    }

    /// Encode to a fresh vector.
    pub fn serialize(&self, sample: &[u8]) -> Result<Vec<u8>> {
        let size = self
            .serializer
            .serialized_size(sample)
            .ok_or_else(|| Error::Serialization("size not computable".into()))?;
        let mut out = vec![0u8; size];
        let written = self.serializer.serialize_into(sample, &mut out)?;
        out.truncate(written);
        Ok(out)
    }

    /// Write `sample` into a fresh loan; returns the number of meaningful
    /// bytes and sets the loan state.
    pub fn fill_loan(&self, loan: &LoanRef, sample: &[u8], serialize: bool) -> Result<usize> {
        if serialize {
            let written = loan.with_buffer_mut(|buf| self.serializer.serialize_into(sample, buf))??;
            loan.set_state(SampleState::SerializedData)?;
            Ok(written)
        } else {
            loan.copy_from(sample)?;
            loan.set_state(SampleState::Raw)?;
            Ok(sample.len())
        }
    }

    /// Serialized data from a plain sample.
    pub fn from_sample(
        &self,
        kind: SerDataKind,
        sample: &[u8],
        metadata: SampleMetadata,
    ) -> Result<SerializedData> {
        self.validate_sample(sample)?;
        let payload = match kind {
            SerDataKind::Data => self.serialize(sample)?,
            SerDataKind::Key => metadata.key_hash.to_vec(),
        };
        Ok(SerializedData {
            kind,
            metadata,
            payload,
            loan: None,
        })
    }

    /// Serialized data referencing `loan`, built from its current state.
    pub fn from_loaned_sample(&self, kind: SerDataKind, loan: &LoanRef) -> Result<SerializedData> {
        let metadata = loan.metadata();
        let payload = match loan.state() {
            SampleState::Raw => match kind {
                SerDataKind::Data => loan.with_buffer(|raw| self.serialize(raw))??,
                SerDataKind::Key => metadata.key_hash.to_vec(),
            },
            SampleState::SerializedData | SampleState::SerializedKey => {
                let used = if metadata.sample_size == 0 {
                    loan.len()
                } else {
                    metadata.sample_size.min(loan.len())
                };
                loan.with_buffer(|buf| buf[..used].to_vec())?
            }
            SampleState::Uninitialized => {
                return Err(Error::PreconditionNotMet(
                    "loaned sample was never written".into(),
                ))
            }
        };
        Ok(SerializedData {
            kind,
            metadata,
            payload,
            loan: Some(Arc::clone(loan)),
        })
    }

    /// In-memory sample from serialized data.
    pub fn sample_from_serialized(&self, data: &SerializedData) -> Result<Vec<u8>> {
        if data.kind != SerDataKind::Data {
            return Err(Error::BadParameter("key-only data has no sample".into()));
        }
        self.serializer.deserialize(&data.payload)
    }
}

impl std::fmt::Debug for TypeSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeSupport")
            .field("type_name", &self.type_name)
            .field("sample_size", &self.sample_size)
            .field("properties", &self.properties)
            .finish()
    }
}
