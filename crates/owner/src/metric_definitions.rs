// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

pub(crate) const CHANGEFEED_CHECKPOINT_TS: &str = "cdc.owner.changefeed.checkpoint_ts";
pub(crate) const CHANGEFEED_CHECKPOINT_LAG: &str = "cdc.owner.changefeed.checkpoint_lag.seconds";
pub(crate) const CHANGEFEED_RESOLVED_TS: &str = "cdc.owner.changefeed.resolved_ts";
pub(crate) const CHANGEFEED_TICK_DURATION: &str = "cdc.owner.changefeed.tick_duration.seconds";
pub(crate) const DDL_EXECUTED: &str = "cdc.owner.ddl_executed.total";
pub(crate) const DDL_PULLED: &str = "cdc.owner.ddl_pulled.total";
pub(crate) const SYNC_POINT_EMITTED: &str = "cdc.owner.sync_point_emitted.total";
pub(crate) const CHECKPOINT_EMITTED: &str = "cdc.owner.checkpoint_emitted.total";
pub(crate) const GC_SAFE_POINT: &str = "cdc.owner.gc_safe_point";
pub(crate) const OWNER_TICK_DURATION: &str = "cdc.owner.tick_duration.seconds";

pub fn describe_metrics() {
    describe_gauge!(
        CHANGEFEED_CHECKPOINT_TS,
        Unit::Milliseconds,
        "Physical part of the changefeed checkpoint ts"
    );
    describe_gauge!(
        CHANGEFEED_CHECKPOINT_LAG,
        Unit::Seconds,
        "Distance between the wall clock and the changefeed checkpoint"
    );
    describe_gauge!(
        CHANGEFEED_RESOLVED_TS,
        Unit::Milliseconds,
        "Physical part of the changefeed resolved ts"
    );
    describe_histogram!(
        CHANGEFEED_TICK_DURATION,
        Unit::Seconds,
        "Time spent in a single changefeed tick"
    );
    describe_counter!(
        DDL_EXECUTED,
        Unit::Count,
        "DDL events executed by the downstream, ignored ones included"
    );
    describe_counter!(
        DDL_PULLED,
        Unit::Count,
        "DDL jobs queued by the DDL puller"
    );
    describe_counter!(
        SYNC_POINT_EMITTED,
        Unit::Count,
        "Sync points handed to the DDL sink"
    );
    describe_counter!(
        CHECKPOINT_EMITTED,
        Unit::Count,
        "Checkpoints forwarded to the downstream"
    );
    describe_gauge!(
        GC_SAFE_POINT,
        Unit::Milliseconds,
        "Physical part of the service GC safepoint"
    );
    describe_histogram!(
        OWNER_TICK_DURATION,
        Unit::Seconds,
        "Time spent in a single owner tick over all changefeeds"
    );
}
