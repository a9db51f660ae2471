// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::retries::RetryPolicy;

/// # Owner options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct OwnerOptions {
    /// # Tick interval
    ///
    /// Interval between two reconciliation rounds over all changefeeds.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub tick_interval: humantime::Duration,

    /// # GC TTL
    ///
    /// Lifetime of the service safepoint registered in the upstream cluster. A checkpoint
    /// lagging behind the wall clock by more than this is considered lost.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub gc_ttl: humantime::Duration,

    /// Minimum interval between two safepoint updates unless forced.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub gc_safepoint_update_interval: humantime::Duration,

    /// TTL of the temporary safepoint which protects the start ts of a changefeed while it
    /// is being initialized.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub ensure_start_ts_ttl: humantime::Duration,

    /// Service id under which the safepoint is registered.
    pub gc_service_id: String,

    /// Buffered errors reported by background tasks of one changefeed. Errors reported while
    /// the channel is full are dropped; the first one already decides the outcome.
    pub error_channel_capacity: NonZeroUsize,

    /// # Sink close timeout
    ///
    /// Upper bound for waiting on the DDL sink to shut down. On timeout the close is
    /// retried on the next tick.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub sink_close_timeout: humantime::Duration,

    /// Interval at which the DDL sink forwards the checkpoint downstream.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub checkpoint_emit_interval: humantime::Duration,

    /// Number of DDL events which may be queued towards the sink.
    pub ddl_channel_capacity: NonZeroUsize,

    /// Retry policy for reactor state patches which lose against concurrent writers.
    pub patch_retry_policy: RetryPolicy,
}

impl OwnerOptions {
    pub fn tick_interval(&self) -> Duration {
        *self.tick_interval
    }

    pub fn gc_ttl(&self) -> Duration {
        *self.gc_ttl
    }

    pub fn sink_close_timeout(&self) -> Duration {
        *self.sink_close_timeout
    }

    pub fn checkpoint_emit_interval(&self) -> Duration {
        *self.checkpoint_emit_interval
    }
}

impl Default for OwnerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100).into(),
            gc_ttl: Duration::from_secs(24 * 60 * 60).into(),
            gc_safepoint_update_interval: Duration::from_secs(60).into(),
            ensure_start_ts_ttl: Duration::from_secs(10 * 60).into(),
            gc_service_id: "ticdc".to_owned(),
            error_channel_capacity: NonZeroUsize::new(1024).expect("1024 to be non zero"),
            sink_close_timeout: Duration::from_secs(5).into(),
            checkpoint_emit_interval: Duration::from_secs(1).into(),
            ddl_channel_capacity: NonZeroUsize::new(32).expect("32 to be non zero"),
            patch_retry_policy: RetryPolicy::exponential(
                Duration::from_millis(10),
                2.0,
                NonZeroUsize::new(10),
                Some(Duration::from_secs(1)),
            ),
        }
    }
}
