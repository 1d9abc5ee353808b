// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error type shared by the loan and PSMX layers.
//!
//! Every fallible operation returns [`Result`]. Negative answers from plugin
//! predicates (`type_supported`, `qos_supported`) and loan exhaustion on a
//! single transport are *not* errors; they are plain `bool`/`Option` results
//! consumed by the matching and write paths.

/// DDS return codes (DDS v1.4 Sec.2.2.1.1), used by [`Error::retcode`].
pub mod retcode {
    pub const OK: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const BAD_PARAMETER: i32 = 3;
    pub const PRECONDITION_NOT_MET: i32 = 4;
    pub const OUT_OF_RESOURCES: i32 = 5;
    pub const TIMEOUT: i32 = 10;
    pub const ILLEGAL_OPERATION: i32 = 12;
}

/// Errors returned by loan, allocator and transport operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Caller errors
    // ========================================================================
    /// Invalid or unknown sample pointer, loan handle or entity handle.
    BadParameter(String),
    /// Operation attempted on the wrong kind of entity.
    IllegalOperation(String),
    /// Operation on an uninitialized or already released allocator/loan.
    PreconditionNotMet(String),

    // ========================================================================
    // Resource errors
    // ========================================================================
    /// Loans exhausted on every eligible transport (and the heap, where allowed).
    OutOfResources,
    /// Local delivery could not complete within the reliability max-blocking-time.
    Timeout,

    // ========================================================================
    // Collaborator errors
    // ========================================================================
    /// Serializer failed to encode or decode a sample.
    Serialization(String),
    /// A transport plugin or the network path reported a failure.
    Transport(String),
    /// A configured transport plugin could not be loaded.
    PluginLoad { name: String, reason: String },
    /// Invalid transport configuration.
    Config(String),
    /// I/O error with underlying cause (config files).
    Io(std::io::Error),
}

impl Error {
    /// Map to the DDS return code used at the C boundary.
    #[must_use]
    pub fn retcode(&self) -> i32 {
        match self {
            Error::BadParameter(_) => retcode::BAD_PARAMETER,
            Error::IllegalOperation(_) => retcode::ILLEGAL_OPERATION,
            Error::PreconditionNotMet(_) => retcode::PRECONDITION_NOT_MET,
            Error::OutOfResources => retcode::OUT_OF_RESOURCES,
            Error::Timeout => retcode::TIMEOUT,
            Error::Serialization(_)
            | Error::Transport(_)
            | Error::PluginLoad { .. }
            | Error::Config(_)
            | Error::Io(_) => retcode::ERROR,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BadParameter(msg) => write!(f, "Bad parameter: {}", msg),
            Error::IllegalOperation(msg) => write!(f, "Illegal operation: {}", msg),
            Error::PreconditionNotMet(msg) => write!(f, "Precondition not met: {}", msg),
            Error::OutOfResources => write!(f, "Out of resources: no loan available"),
            Error::Timeout => write!(f, "Timeout: local delivery exceeded max_blocking_time"),
            Error::Serialization(msg) => write!(f, "Serialization failed: {}", msg),
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::PluginLoad { name, reason } => {
                write!(f, "Failed to load PSMX plugin '{}': {}", name, reason)
            }
            Error::Config(msg) => write!(f, "Invalid PSMX configuration: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for results using the crate `Error` type.
pub type Result<T> = core::result::Result<T, Error>;
