// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Conventional (non-PSMX) delivery: the network sink seam and local
//! reader delivery with reliable back-off.

use crate::config::{LOCAL_DELIVERY_RETRY_MAX, LOCAL_DELIVERY_RETRY_MIN};
use crate::entity::Guid;
use crate::error::{Error, Result};
use crate::qos::Reliability;
use crate::reader::Reader;
use crate::types::SerializedData;
use std::time::{Duration, Instant};

/// Network path for remote readers (RTPS writer, UDP, ...).
pub trait NetworkSink: Send + Sync {
    fn send(&self, writer: Guid, data: &SerializedData) -> Result<()>;
}

/// Deliver to a local reader.
///
/// Best-effort drops the sample when the reader cache is full. Reliable
/// retries with exponential back-off (1 ms doubling to 10 ms) until
/// `max_blocking_time`, then fails with `Timeout`. A `max_blocking_time`
/// too large to add to the current instant never times out.
pub(crate) fn deliver_local(
    reader: &Reader,
    data: &SerializedData,
    reliability: Reliability,
    max_blocking_time: Duration,
) -> Result<()> {
    if reader.try_deliver(data)? {
        return Ok(());
    }
    if reliability == Reliability::BestEffort {
        log::debug!(
            "[writer] reader {:?} cache full, sample dropped (best-effort)",
            reader.guid()
        );
        return Ok(());
    }
    // unrepresentable deadline (Duration::MAX): block until delivered
    let deadline = Instant::now().checked_add(max_blocking_time);
    let mut backoff = LOCAL_DELIVERY_RETRY_MIN;
    loop {
        let pause = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    log::debug!(
                        "[writer] reader {:?} still full after {:?}",
                        reader.guid(),
                        max_blocking_time
                    );
                    return Err(Error::Timeout);
                }
                backoff.min(deadline - now)
            }
            None => backoff,
        };
        std::thread::sleep(pause);
        if reader.try_deliver(data)? {
            return Ok(());
        }
        backoff = (backoff * 2).min(LOCAL_DELIVERY_RETRY_MAX);
    }
}
