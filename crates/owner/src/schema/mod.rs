// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod snapshot;

pub use snapshot::{SchemaInfo, SchemaSnapshot};

use async_trait::async_trait;
use tracing::{debug, warn};

use cdc_types::model::{DdlEvent, DdlJob, DdlJobType, SimpleTableInfo};
use cdc_types::{JobId, SchemaId, TableId, Ts};

use crate::filter::{is_system_schema, Filter};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema {0} not found")]
    SchemaNotFound(SchemaId),
    #[error("schema {0} already exists")]
    SchemaExists(SchemaId),
    #[error("table {0} not found")]
    TableNotFound(TableId),
    #[error("table {0} already exists")]
    TableExists(TableId),
    #[error("ddl job {job_id} ({job_type}) carries no table info")]
    MissingTableInfo { job_id: JobId, job_type: DdlJobType },
    #[error("failed loading schema snapshot: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Upstream schema history.
#[async_trait]
pub trait SchemaStorage: Send + Sync + 'static {
    /// Schemas and tables as visible at `ts`.
    async fn snapshot(&self, ts: Ts) -> Result<SchemaSnapshot, SchemaError>;
}

/// Schema of one changefeed at its checkpoint. DDL jobs are folded in as they are executed.
#[derive(Debug)]
pub struct SchemaCache {
    snapshot: SchemaSnapshot,
    filter: Filter,
    handled_ts: Ts,
    physical_tables: Option<Vec<TableId>>,
}

impl SchemaCache {
    pub fn new(snapshot: SchemaSnapshot, filter: Filter) -> Self {
        Self {
            handled_ts: snapshot.current_ts(),
            snapshot,
            filter,
            physical_tables: None,
        }
    }

    pub fn snapshot(&self) -> &SchemaSnapshot {
        &self.snapshot
    }

    pub fn handled_ts(&self) -> Ts {
        self.handled_ts
    }

    /// Physical tables to replicate, sorted. Filtered, ineligible and view tables are
    /// skipped.
    pub fn all_physical_tables(&mut self) -> &[TableId] {
        let Self {
            snapshot,
            filter,
            physical_tables,
            ..
        } = self;
        physical_tables.get_or_insert_with(|| {
            let mut tables = Vec::new();
            for (schema, info) in snapshot.tables() {
                if is_system_schema(schema) || filter.should_ignore_table(schema, &info.name) {
                    continue;
                }
                if !info.is_eligible() {
                    warn!(
                        table.schema = schema,
                        table.name = %info.name,
                        table.id = info.id,
                        "Skipping ineligible table"
                    );
                    continue;
                }
                tables.extend(info.physical_table_ids());
            }
            tables.sort_unstable();
            tables
        })
    }

    pub fn is_ineligible_table_id(&self, table_id: TableId) -> bool {
        self.snapshot.is_ineligible_table_id(table_id)
    }

    pub fn handle_ddl(&mut self, job: &DdlJob) -> Result<(), SchemaError> {
        if job.finished_ts <= self.handled_ts {
            debug!(
                ddl.job_id = job.id,
                ddl.finished_ts = job.finished_ts,
                handled_ts = self.handled_ts,
                "DDL job already folded into the schema"
            );
            return Ok(());
        }
        self.snapshot.handle_ddl(job)?;
        self.handled_ts = job.finished_ts;
        self.physical_tables = None;
        Ok(())
    }

    /// Builds the event sent downstream. Must be called before the job is folded in, so
    /// that the table as it was before the job can be looked up.
    pub fn build_ddl_event(&self, job: &DdlJob) -> Result<DdlEvent, SchemaError> {
        let (table_info, pre_table_info) = match job.job_type {
            DdlJobType::CreateSchema
            | DdlJobType::DropSchema
            | DdlJobType::ModifySchemaCharsetAndCollate => (
                SimpleTableInfo {
                    schema: job.schema_name.clone(),
                    table: String::new(),
                    table_id: 0,
                },
                None,
            ),
            job_type => {
                let (table, table_id) = match &job.table_info {
                    Some(info) => (info.name.clone(), info.id),
                    None => (job.table_name.clone(), job.table_id),
                };
                let pre_table_info = match job_type {
                    DdlJobType::CreateTable | DdlJobType::CreateView | DdlJobType::RecoverTable => {
                        None
                    }
                    DdlJobType::RenameTable => Some(self.pre_table_info(table_id)?),
                    _ => self.pre_table_info(job.table_id).ok(),
                };
                (
                    SimpleTableInfo {
                        schema: job.schema_name.clone(),
                        table,
                        table_id,
                    },
                    pre_table_info,
                )
            }
        };

        Ok(DdlEvent {
            start_ts: job.start_ts,
            commit_ts: job.finished_ts,
            job_type: job.job_type,
            query: job.query.clone(),
            table_info: Some(table_info),
            pre_table_info,
        })
    }

    fn pre_table_info(&self, table_id: TableId) -> Result<SimpleTableInfo, SchemaError> {
        let info = self
            .snapshot
            .table_by_id(table_id)
            .ok_or(SchemaError::TableNotFound(table_id))?;
        let schema = self
            .snapshot
            .schema_name_of(table_id)
            .ok_or(SchemaError::TableNotFound(table_id))?;
        Ok(SimpleTableInfo {
            schema: schema.to_owned(),
            table: info.name.clone(),
            table_id,
        })
    }
}
