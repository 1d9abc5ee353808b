// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PSMX configuration: constants and per-transport configuration records.
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time constants (instance limit, loan pool
//!   sizing, locator kind, delivery retry bounds)
//! - **Level 2 (Dynamic)**: [`PsmxConfig`], the list of configured transports,
//!   loaded programmatically, from YAML, or from `HDDS_PSMX_CONFIG`
//!
//! # Example YAML
//!
//! ```yaml
//! transports:
//!   - name: loopback
//!     priority: 10
//!     config: "max_chunks=32;chunk_size=1024"
//!   - name: iox
//!     library: /opt/hdds/lib/libpsmx_iox.so
//!     priority: 20
//!     config: "SERVICE_NAME=hdds"
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of PSMX instances configured per process.
pub const MAX_PSMX_INSTANCES: usize = 8;

/// Initial slot count of a loan manager (grows by doubling).
pub const DEFAULT_LOAN_POOL_CAPACITY: usize = 4;

/// Reserved locator kind announcing PSMX reachability in discovery.
///
/// Never used for real I/O; only compared during matching.
pub const LOCATOR_KIND_PSMX: i32 = 0x4a00_0000;

/// Default reliability max-blocking-time (matches the SEDP default of 100 ms).
pub const DEFAULT_MAX_BLOCKING_TIME: Duration = Duration::from_millis(100);

/// First sleep of the local delivery retry loop.
pub const LOCAL_DELIVERY_RETRY_MIN: Duration = Duration::from_millis(1);

/// Upper bound of a single local delivery retry sleep.
pub const LOCAL_DELIVERY_RETRY_MAX: Duration = Duration::from_millis(10);

/// Environment variable pointing at a YAML transport configuration file.
pub const PSMX_CONFIG_ENV: &str = "HDDS_PSMX_CONFIG";

/// Configuration record for one transport plugin.
///
/// Consumed by the catalog; the `config` string is passed verbatim to the
/// plugin factory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransportConfig {
    /// Transport name (also the factory symbol prefix).
    pub name: String,
    /// Explicit library path; defaults to [`library_file_name`] of `name`.
    #[serde(default)]
    pub library: Option<PathBuf>,
    /// Tie-breaking priority (higher wins).
    #[serde(default)]
    pub priority: i32,
    /// Opaque plugin configuration string.
    #[serde(default)]
    pub config: String,
}

impl TransportConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            library: None,
            priority: 0,
            config: String::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }

    #[must_use]
    pub fn with_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.library = Some(path.into());
        self
    }

    /// Library path to load when no builtin factory is registered for `name`.
    #[must_use]
    pub fn library_path(&self) -> PathBuf {
        self.library
            .clone()
            .unwrap_or_else(|| PathBuf::from(library_file_name(&self.name)))
    }

    /// Name of the factory symbol the plugin library must export.
    #[must_use]
    pub fn factory_symbol(&self) -> String {
        factory_symbol(&self.name)
    }
}

/// Conventional shared library file name for a transport (`libpsmx_<name>.so`).
#[must_use]
pub fn library_file_name(name: &str) -> String {
    format!(
        "{}psmx_{}{}",
        std::env::consts::DLL_PREFIX,
        name,
        std::env::consts::DLL_SUFFIX
    )
}

/// Factory symbol exported by a plugin: `<name>_create_virtual_interface`.
#[must_use]
pub fn factory_symbol(name: &str) -> String {
    format!("{name}_create_virtual_interface")
}

/// Process-wide PSMX configuration (list of transports).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PsmxConfig {
    #[serde(default)]
    pub transports: Vec<TransportConfig>,
}

impl PsmxConfig {
    /// Configuration without any transport (conventional delivery only).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transports.push(transport);
        self
    }

    /// Check names, uniqueness and the instance limit.
    pub fn validate(&self) -> Result<()> {
        if self.transports.len() > MAX_PSMX_INSTANCES {
            return Err(Error::Config(format!(
                "{} transports configured, at most {} supported",
                self.transports.len(),
                MAX_PSMX_INSTANCES
            )));
        }
        for (idx, transport) in self.transports.iter().enumerate() {
            if transport.name.is_empty() {
                return Err(Error::Config(format!("transport #{idx} has an empty name")));
            }
            if !transport
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(Error::Config(format!(
                    "transport name '{}' is not a valid symbol prefix",
                    transport.name
                )));
            }
            if self.transports[..idx]
                .iter()
                .any(|other| other.name == transport.name)
            {
                return Err(Error::Config(format!(
                    "transport '{}' configured twice",
                    transport.name
                )));
            }
        }
        Ok(())
    }

    /// Parse a YAML document.
    #[cfg(feature = "yaml-config")]
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: PsmxConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file.
    #[cfg(feature = "yaml-config")]
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Load the file named by `HDDS_PSMX_CONFIG`, or return an empty config.
    #[cfg(feature = "yaml-config")]
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(PSMX_CONFIG_ENV) {
            Some(path) => {
                log::debug!("[config] loading PSMX config from {:?}", path);
                Self::from_yaml_file(std::path::Path::new(&path))
            }
            None => Ok(Self::empty()),
        }
    }
}

/// Parse a `key=value;key=value` plugin configuration string.
///
/// Keys are case-insensitive; empty segments are skipped. A segment without
/// `=` is treated as a boolean flag set to `"1"`.
#[must_use]
pub fn parse_config_string(config: &str) -> Vec<(String, String)> {
    config
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut kv = part.splitn(2, '=');
            let key = kv.next().unwrap_or_default().trim().to_ascii_lowercase();
            let value = kv.next().map_or_else(|| "1".to_string(), |v| v.trim().to_string());
            (key, value)
        })
        .collect()
}
