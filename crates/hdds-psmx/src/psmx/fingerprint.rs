// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Type fingerprints used to match PSMX topics.
//!
//! Two endpoints may share a PSMX topic only if the topic name and the
//! [`TypeFingerprint`] are equal. The fingerprint combines:
//! - an MD5-based type identifier (14 bytes, same truncation as the
//!   XTypes EquivalenceHash)
//! - the [`TypeProperties`] flags the plugins inspect in `type_supported`
//! - the in-memory sample size (0 for variable-size types)

/// Extensibility kind of the top-level type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Extensibility {
    #[default]
    Final,
    Appendable,
    Mutable,
}

/// Type-shape flags (bit set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct TypeProperties(pub u64);

impl TypeProperties {
    const EXTENSIBILITY_MASK: u64 = 0x0003;
    const APPENDABLE_BITS: u64 = 0x0001;
    const MUTABLE_BITS: u64 = 0x0002;

    pub const CONTAINS_UNION: Self = Self(1 << 2);
    pub const CONTAINS_BITMASK: Self = Self(1 << 3);
    pub const CONTAINS_ENUM: Self = Self(1 << 4);
    pub const CONTAINS_STRUCT: Self = Self(1 << 5);
    pub const CONTAINS_STRING: Self = Self(1 << 6);
    pub const CONTAINS_BSTRING: Self = Self(1 << 7);
    pub const CONTAINS_SEQUENCE: Self = Self(1 << 8);
    pub const CONTAINS_BSEQUENCE: Self = Self(1 << 9);
    pub const CONTAINS_ARRAY: Self = Self(1 << 10);
    pub const CONTAINS_OPTIONAL: Self = Self(1 << 11);
    pub const CONTAINS_EXTERNAL: Self = Self(1 << 12);
    /// Any member stored out of line (pointer in the in-memory layout).
    pub const CONTAINS_INDIRECTIONS: Self = Self(1 << 13);
    /// In-memory layout has a fixed size and no indirections.
    pub const IS_FIXED_SIZE: Self = Self(1 << 14);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags for a plain fixed-size struct.
    #[must_use]
    pub const fn fixed_struct() -> Self {
        Self(Self::CONTAINS_STRUCT.0 | Self::IS_FIXED_SIZE.0)
    }

    #[must_use]
    pub const fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0 && flag.0 != 0
    }

    #[must_use]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[must_use]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn extensibility(self) -> Extensibility {
        match self.0 & Self::EXTENSIBILITY_MASK {
            Self::APPENDABLE_BITS => Extensibility::Appendable,
            Self::MUTABLE_BITS => Extensibility::Mutable,
            _ => Extensibility::Final,
        }
    }

    #[must_use]
    pub fn with_extensibility(self, ext: Extensibility) -> Self {
        let bits = match ext {
            Extensibility::Final => 0,
            Extensibility::Appendable => Self::APPENDABLE_BITS,
            Extensibility::Mutable => Self::MUTABLE_BITS,
        };
        Self((self.0 & !Self::EXTENSIBILITY_MASK) | bits)
    }

    /// Fixed-size types can be exchanged in raw form through a loan.
    #[must_use]
    pub fn is_fixed_size(self) -> bool {
        self.contains(Self::IS_FIXED_SIZE) && !self.has_indirections()
    }

    #[must_use]
    pub fn has_indirections(self) -> bool {
        [
            Self::CONTAINS_INDIRECTIONS,
            Self::CONTAINS_STRING,
            Self::CONTAINS_SEQUENCE,
            Self::CONTAINS_OPTIONAL,
            Self::CONTAINS_EXTERNAL,
        ]
        .iter()
        .any(|flag| self.contains(*flag))
    }
}

/// Identity of a data type for PSMX topic matching.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeFingerprint {
    type_id: [u8; 14],
    properties: TypeProperties,
    sample_size: usize,
}

impl TypeFingerprint {
    #[must_use]
    pub fn new(type_name: &str, properties: TypeProperties, sample_size: usize) -> Self {
        Self {
            type_id: type_id_from_name(type_name),
            properties,
            sample_size,
        }
    }

    #[must_use]
    pub const fn type_id(&self) -> &[u8; 14] {
        &self.type_id
    }

    #[must_use]
    pub const fn properties(&self) -> TypeProperties {
        self.properties
    }

    #[must_use]
    pub const fn sample_size(&self) -> usize {
        self.sample_size
    }
}

impl std::fmt::Debug for TypeFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeFingerprint(")?;
        for byte in &self.type_id[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(
            f,
            "..., props={:#x}, size={})",
            self.properties.0, self.sample_size
        )
    }
}

/// MD5 of the type name, truncated to 14 bytes.
#[must_use]
pub fn type_id_from_name(type_name: &str) -> [u8; 14] {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(type_name.as_bytes());
    let result = hasher.finalize();
    let mut bytes = [0u8; 14];
    bytes.copy_from_slice(&result[..14]);
    bytes
}

/// 32-bit FNV-1a.
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Stable hash of a topic name, handed to plugins on topic creation.
#[must_use]
pub fn topic_name_hash(topic_name: &str) -> u32 {
    fnv1a_32(topic_name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_struct_flags() {
        let props = TypeProperties::fixed_struct();
        assert!(props.is_fixed_size());
        assert!(!props.has_indirections());
        assert_eq!(props.extensibility(), Extensibility::Final);
    }

    #[test]
    fn test_indirection_clears_fixed_size() {
        let props = TypeProperties::fixed_struct().with(TypeProperties::CONTAINS_STRING);
        assert!(props.has_indirections());
        assert!(!props.is_fixed_size());
    }

    #[test]
    fn test_extensibility_roundtrip() {
        let props = TypeProperties::empty().with_extensibility(Extensibility::Mutable);
        assert_eq!(props.extensibility(), Extensibility::Mutable);
        let props = props.with_extensibility(Extensibility::Appendable);
        assert_eq!(props.extensibility(), Extensibility::Appendable);
    }

    #[test]
    fn test_fingerprint_equality() {
        let a = TypeFingerprint::new("Position", TypeProperties::fixed_struct(), 24);
        let b = TypeFingerprint::new("Position", TypeProperties::fixed_struct(), 24);
        let c = TypeFingerprint::new("Velocity", TypeProperties::fixed_struct(), 24);
        let d = TypeFingerprint::new("Position", TypeProperties::fixed_struct(), 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_fnv_known_vector() {
        // FNV-1a("a") = 0xe40c292c
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(topic_name_hash(""), 2_166_136_261);
    }
}
