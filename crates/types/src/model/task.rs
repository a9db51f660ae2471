// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::changefeed::{AdminJobType, RunningError};
use crate::{CaptureId, TableId, Ts};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableReplicaInfo {
    pub start_ts: Ts,
    /// Mark table used to tag rows written by this replica in cyclic replication.
    #[serde(default)]
    pub mark_table_id: TableId,
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    /// Written by the owner, not yet seen by the processor.
    #[default]
    Dispatched,
    /// The processor started working on it.
    Processed,
    /// The processor completed it. The owner cleans it up on its next tick.
    Finished,
}

/// In-flight add or remove of a table on one capture.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableOperation {
    pub delete: bool,
    /// Checkpoint at dispatch time. The changefeed's resolved ts does not pass it until the
    /// operation finished.
    pub boundary_ts: Ts,
    pub status: OperationStatus,
}

impl TableOperation {
    pub fn is_finished(&self) -> bool {
        self.status == OperationStatus::Finished
    }
}

/// Tables replicated by one capture for one changefeed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskStatus {
    #[serde(default)]
    pub tables: BTreeMap<TableId, TableReplicaInfo>,
    #[serde(default)]
    pub operation: BTreeMap<TableId, TableOperation>,
    #[serde(default)]
    pub admin_job_type: AdminJobType,
}

impl TaskStatus {
    /// Adds a table and dispatches an add operation. No-op if the table is already present.
    pub fn add_table(&mut self, table_id: TableId, replica: TableReplicaInfo, boundary_ts: Ts) {
        if self.tables.contains_key(&table_id) {
            return;
        }
        self.tables.insert(table_id, replica);
        debug!(table_id, boundary_ts, "add table");
        self.operation.insert(
            table_id,
            TableOperation {
                delete: false,
                boundary_ts,
                status: OperationStatus::Dispatched,
            },
        );
    }

    /// Removes a table and dispatches a delete operation. Returns the removed replica.
    pub fn remove_table(&mut self, table_id: TableId, boundary_ts: Ts) -> Option<TableReplicaInfo> {
        let replica = self.tables.remove(&table_id)?;
        debug!(table_id, boundary_ts, "remove table");
        self.operation.insert(
            table_id,
            TableOperation {
                delete: true,
                boundary_ts,
                status: OperationStatus::Dispatched,
            },
        );
        Some(replica)
    }

    /// Drops finished operations. Returns true if anything was dropped.
    pub fn clean_finished_operations(&mut self) -> bool {
        let before = self.operation.len();
        self.operation.retain(|_, op| !op.is_finished());
        self.operation.len() != before
    }
}

/// Progress reported by the processor of one capture.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskPosition {
    pub checkpoint_ts: Ts,
    pub resolved_ts: Ts,
    /// Number of rows replicated so far.
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub error: Option<RunningError>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub workload: u64,
}

/// Per table workload of one capture.
pub type TaskWorkload = BTreeMap<TableId, WorkloadInfo>;

/// A live capture process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureInfo {
    pub id: CaptureId,
    pub address: String,
    #[serde(default)]
    pub version: String,
}
