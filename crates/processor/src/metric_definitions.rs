// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{Unit, describe_counter, describe_gauge};

pub(crate) const SORTER_EVENTS_IN: &str = "cdc.processor.sorter.events_in.total";
pub(crate) const SORTER_RESOLVED_TS: &str = "cdc.processor.sorter.resolved_ts";
pub(crate) const SORTER_CLAMPED_RESOLVED: &str = "cdc.processor.sorter.clamped_resolved.total";

pub fn describe_metrics() {
    describe_counter!(
        SORTER_EVENTS_IN,
        Unit::Count,
        "Events received by sorter nodes, by kind"
    );
    describe_gauge!(
        SORTER_RESOLVED_TS,
        Unit::Count,
        "Last resolved ts received by a sorter node"
    );
    describe_counter!(
        SORTER_CLAMPED_RESOLVED,
        Unit::Count,
        "Resolved events lowered to the barrier ts before reaching the sorter"
    );
}
