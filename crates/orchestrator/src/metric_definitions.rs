// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{Unit, describe_counter};

pub(crate) const REACTOR_PATCHES_APPLIED: &str = "cdc.reactor.patches_applied.total";
pub(crate) const REACTOR_UNKNOWN_KEYS: &str = "cdc.reactor.unknown_keys.total";

pub fn describe_metrics() {
    describe_counter!(
        REACTOR_PATCHES_APPLIED,
        Unit::Count,
        "Reactor state patches which changed a stored value"
    );
    describe_counter!(
        REACTOR_UNKNOWN_KEYS,
        Unit::Count,
        "Keys under the reactor prefix which do not belong to the reactor layout"
    );
}
