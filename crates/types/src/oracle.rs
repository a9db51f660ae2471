// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Helpers for hybrid logical timestamps.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::Ts;

/// Number of bits reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 18;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

pub const fn compose_ts(physical_ms: u64, logical: u64) -> Ts {
    (physical_ms << LOGICAL_BITS) | (logical & LOGICAL_MASK)
}

/// Physical part of the timestamp, milliseconds since the unix epoch.
pub const fn extract_physical(ts: Ts) -> u64 {
    ts >> LOGICAL_BITS
}

pub const fn extract_logical(ts: Ts) -> u64 {
    ts & LOGICAL_MASK
}

pub fn ts_from_time(time: SystemTime) -> Ts {
    let physical = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    compose_ts(physical, 0)
}

pub fn time_from_ts(ts: Ts) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(extract_physical(ts))
}

/// Timestamp of the local wall clock. The logical part is always zero.
pub fn current_ts() -> Ts {
    ts_from_time(SystemTime::now())
}

/// Adds `duration` to the physical part of `ts`. The logical part of the result is zero.
pub fn ts_add_duration(ts: Ts, duration: Duration) -> Ts {
    compose_ts(extract_physical(ts) + duration.as_millis() as u64, 0)
}

/// Wall clock distance between two timestamps, zero if `later` is not after `earlier`.
pub fn physical_distance(earlier: Ts, later: Ts) -> Duration {
    Duration::from_millis(extract_physical(later).saturating_sub(extract_physical(earlier)))
}
