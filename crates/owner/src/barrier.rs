// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use enum_map::{Enum, EnumMap};

use cdc_types::Ts;

/// Constraints which hold the checkpoint back. When two barriers share a ts, the one
/// declared first is handled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BarrierKind {
    /// Front of the DDL queue or the DDL puller's resolved ts.
    DdlJob,
    /// Next sync point.
    SyncPoint,
    /// Target ts of the changefeed.
    Finish,
}

#[derive(Debug, Default)]
pub struct Barriers {
    inner: EnumMap<BarrierKind, Option<Ts>>,
}

impl Barriers {
    pub fn update(&mut self, kind: BarrierKind, ts: Ts) {
        self.inner[kind] = Some(ts);
    }

    /// The binding barrier, if any.
    pub fn min(&self) -> Option<(BarrierKind, Ts)> {
        self.inner
            .iter()
            .filter_map(|(kind, ts)| ts.map(|ts| (kind, ts)))
            .min_by_key(|(_, ts)| *ts)
    }
}
