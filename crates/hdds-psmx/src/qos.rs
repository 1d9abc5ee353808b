// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint QoS relevant to loans and PSMX binding.
//!
//! # Supported Policies
//!
//! - **Reliability**: BestEffort / Reliable, plus `max_blocking_time` for
//!   local delivery
//! - **History**: KeepLast(n) (evicts oldest), KeepAll (bounded by
//!   `ResourceLimits::max_samples`)
//! - **PSMX**: [`PsmxPolicy`] and an optional instance allow-list
//!
//! # Examples
//!
//! ```
//! use hdds_psmx::qos::{EndpointQos, History, PsmxPolicy};
//!
//! let qos = EndpointQos::reliable()
//!     .keep_last(4)
//!     .psmx_policy(PsmxPolicy::Require)
//!     .psmx_instances(["loopback"]);
//! assert!(qos.validate().is_ok());
//! assert_eq!(qos.history, History::KeepLast(4));
//! ```

use crate::config::DEFAULT_MAX_BLOCKING_TIME;
use crate::error::{Error, Result};
use std::time::Duration;

/// Reliability policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Reliability {
    /// Fire-and-forget: a full reader cache drops the sample.
    #[default]
    BestEffort,
    /// A full local reader cache blocks the writer up to `max_blocking_time`.
    Reliable,
}

/// History policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum History {
    /// Keep last N samples (bounded queue, drops oldest).
    KeepLast(u32),
    /// Keep all samples within resource limits; inserts fail once full.
    KeepAll,
}

impl Default for History {
    fn default() -> Self {
        Self::KeepLast(10)
    }
}

/// Resource limits for readers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum samples held by a reader cache.
    pub max_samples: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { max_samples: 5000 }
    }
}

/// PSMX selection policy, mirrors the SHM transport policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PsmxPolicy {
    /// Bind to every eligible instance; no binding is fine (default).
    #[default]
    Prefer,
    /// Endpoint creation fails unless at least one instance binds.
    Require,
    /// Never bind; conventional delivery only.
    Disable,
}

/// QoS of one reader or writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointQos {
    pub reliability: Reliability,
    /// Upper bound for blocking in reliable local delivery.
    pub max_blocking_time: Duration,
    pub history: History,
    pub resource_limits: ResourceLimits,
    pub psmx_policy: PsmxPolicy,
    /// Restrict binding to these transport names (`None` = all).
    pub psmx_instances: Option<Vec<String>>,
}

impl Default for EndpointQos {
    fn default() -> Self {
        Self {
            reliability: Reliability::BestEffort,
            max_blocking_time: DEFAULT_MAX_BLOCKING_TIME,
            history: History::default(),
            resource_limits: ResourceLimits::default(),
            psmx_policy: PsmxPolicy::default(),
            psmx_instances: None,
        }
    }
}

impl EndpointQos {
    #[must_use]
    pub fn best_effort() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reliable() -> Self {
        Self {
            reliability: Reliability::Reliable,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn keep_last(mut self, depth: u32) -> Self {
        self.history = History::KeepLast(depth);
        self
    }

    #[must_use]
    pub fn keep_all(mut self) -> Self {
        self.history = History::KeepAll;
        self
    }

    #[must_use]
    pub fn max_samples(mut self, max_samples: usize) -> Self {
        self.resource_limits.max_samples = max_samples;
        self
    }

    #[must_use]
    pub fn max_blocking_time(mut self, timeout: Duration) -> Self {
        self.max_blocking_time = timeout;
        self
    }

    #[must_use]
    pub fn psmx_policy(mut self, policy: PsmxPolicy) -> Self {
        self.psmx_policy = policy;
        self
    }

    #[must_use]
    pub fn psmx_instances<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.psmx_instances = Some(names.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.reliability == Reliability::Reliable
    }

    /// Whether the allow-list admits the transport `name`.
    #[must_use]
    pub fn allows_instance(&self, name: &str) -> bool {
        self.psmx_instances
            .as_ref()
            .map_or(true, |names| names.iter().any(|n| n == name))
    }

    /// Number of samples a reader cache may hold.
    #[must_use]
    pub fn cache_capacity(&self) -> usize {
        match self.history {
            History::KeepLast(depth) => (depth as usize).min(self.resource_limits.max_samples),
            History::KeepAll => self.resource_limits.max_samples,
        }
    }

    /// Reject configurations no endpoint can run with.
    pub fn validate(&self) -> Result<()> {
        if let History::KeepLast(0) = self.history {
            return Err(Error::BadParameter("History::KeepLast depth must be > 0".into()));
        }
        if self.resource_limits.max_samples == 0 {
            return Err(Error::BadParameter(
                "ResourceLimits::max_samples must be > 0".into(),
            ));
        }
        if matches!(&self.psmx_instances, Some(names) if names.is_empty())
            && self.psmx_policy == PsmxPolicy::Require
        {
            return Err(Error::BadParameter(
                "PsmxPolicy::Require with an empty instance list".into(),
            ));
        }
        Ok(())
    }
}
