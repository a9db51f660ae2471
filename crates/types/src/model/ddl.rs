// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde::{Deserialize, Serialize};

use crate::{JobId, SchemaId, TableId, Ts};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DdlJobType {
    CreateSchema,
    DropSchema,
    ModifySchemaCharsetAndCollate,
    CreateTable,
    DropTable,
    TruncateTable,
    RenameTable,
    RecoverTable,
    AddColumn,
    DropColumn,
    ModifyColumn,
    AddIndex,
    DropIndex,
    ModifyTableOption,
    AddTablePartition,
    DropTablePartition,
    TruncateTablePartition,
    CreateView,
    DropView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDefinition {
    pub id: TableId,
    pub name: String,
}

/// Upstream table definition as carried by a DDL job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    /// Partitions of a partitioned table. Each one is replicated as its own physical table.
    #[serde(default)]
    pub partitions: Vec<PartitionDefinition>,
    /// Tables without a primary key or a not-null unique key cannot be replicated.
    #[serde(default = "default_true")]
    pub has_unique_key: bool,
    #[serde(default)]
    pub is_view: bool,
}

fn default_true() -> bool {
    true
}

impl TableInfo {
    pub fn new(id: TableId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            partitions: Vec::new(),
            has_unique_key: true,
            is_view: false,
        }
    }

    pub fn is_partitioned(&self) -> bool {
        !self.partitions.is_empty()
    }

    pub fn is_eligible(&self) -> bool {
        self.is_view || self.has_unique_key
    }

    /// Ids of the physical tables backing this table. Views have none.
    pub fn physical_table_ids(&self) -> Vec<TableId> {
        if self.is_view {
            Vec::new()
        } else if self.is_partitioned() {
            self.partitions.iter().map(|p| p.id).collect()
        } else {
            vec![self.id]
        }
    }
}

/// A finished upstream DDL job. Jobs are totally ordered by `finished_ts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DdlJob {
    pub id: JobId,
    pub job_type: DdlJobType,
    pub schema_id: SchemaId,
    /// For truncate jobs the id of the table before truncation.
    #[serde(default)]
    pub table_id: TableId,
    pub schema_name: String,
    #[serde(default)]
    pub table_name: String,
    pub query: String,
    pub start_ts: Ts,
    pub finished_ts: Ts,
    /// Table definition after the job, if it concerns a table.
    #[serde(default)]
    pub table_info: Option<TableInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleTableInfo {
    pub schema: String,
    pub table: String,
    pub table_id: TableId,
}

/// A DDL ready to be executed downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DdlEvent {
    pub start_ts: Ts,
    pub commit_ts: Ts,
    pub job_type: DdlJobType,
    pub query: String,
    pub table_info: Option<SimpleTableInfo>,
    /// Table before the job, for jobs changing or dropping an existing table.
    pub pre_table_info: Option<SimpleTableInfo>,
}
