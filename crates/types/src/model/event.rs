// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;

use crate::{TableId, Ts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Put,
    Delete,
}

/// A single row mutation of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub table_id: TableId,
    pub start_ts: Ts,
    pub commit_ts: Ts,
    pub op: OpType,
    pub key: Bytes,
    pub value: Bytes,
}

/// Element of a table's event stream: a row or a watermark promising that no row with a
/// commit ts at or below it will follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolymorphicEvent {
    Row(RowChange),
    Resolved(Ts),
}

impl PolymorphicEvent {
    pub fn new_resolved(ts: Ts) -> Self {
        PolymorphicEvent::Resolved(ts)
    }

    /// Commit ts of a row, or the ts of a watermark.
    pub fn crts(&self) -> Ts {
        match self {
            PolymorphicEvent::Row(row) => row.commit_ts,
            PolymorphicEvent::Resolved(ts) => *ts,
        }
    }

    pub fn start_ts(&self) -> Ts {
        match self {
            PolymorphicEvent::Row(row) => row.start_ts,
            PolymorphicEvent::Resolved(ts) => *ts,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, PolymorphicEvent::Resolved(_))
    }
}
