// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};

use cdc_types::model::{DdlJob, DdlJobType, TableInfo};
use cdc_types::{SchemaId, TableId, Ts};

use super::SchemaError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaInfo {
    pub id: SchemaId,
    pub name: String,
    tables: BTreeSet<TableId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableEntry {
    schema_id: SchemaId,
    info: TableInfo,
}

/// Schemas and tables of the upstream cluster as of [`SchemaSnapshot::current_ts`].
#[derive(Debug, Clone, Default)]
pub struct SchemaSnapshot {
    schemas: BTreeMap<SchemaId, SchemaInfo>,
    tables: BTreeMap<TableId, TableEntry>,
    /// Physical partition id to the id of its logical table.
    partitions: BTreeMap<TableId, TableId>,
    current_ts: Ts,
}

impl SchemaSnapshot {
    pub fn new(current_ts: Ts) -> Self {
        Self {
            current_ts,
            ..Default::default()
        }
    }

    pub fn current_ts(&self) -> Ts {
        self.current_ts
    }

    pub fn schema_by_id(&self, id: SchemaId) -> Option<&SchemaInfo> {
        self.schemas.get(&id)
    }

    pub fn schema_by_name(&self, name: &str) -> Option<&SchemaInfo> {
        self.schemas.values().find(|schema| schema.name == name)
    }

    pub fn table_by_id(&self, id: TableId) -> Option<&TableInfo> {
        self.tables.get(&id).map(|entry| &entry.info)
    }

    /// Looks up a table by its id or the id of one of its partitions.
    pub fn table_by_physical_id(&self, id: TableId) -> Option<&TableInfo> {
        let logical = self.partitions.get(&id).copied().unwrap_or(id);
        self.table_by_id(logical)
    }

    pub fn table_by_name(&self, schema: &str, table: &str) -> Option<&TableInfo> {
        let schema = self.schema_by_name(schema)?;
        schema
            .tables
            .iter()
            .filter_map(|id| self.table_by_id(*id))
            .find(|info| info.name == table)
    }

    /// Name of the schema holding the table.
    pub fn schema_name_of(&self, table_id: TableId) -> Option<&str> {
        let entry = self.tables.get(&table_id)?;
        self.schemas
            .get(&entry.schema_id)
            .map(|schema| schema.name.as_str())
    }

    /// Every table with the name of its schema.
    pub fn tables(&self) -> impl Iterator<Item = (&str, &TableInfo)> {
        self.tables.values().filter_map(|entry| {
            self.schemas
                .get(&entry.schema_id)
                .map(|schema| (schema.name.as_str(), &entry.info))
        })
    }

    pub fn is_ineligible_table_id(&self, id: TableId) -> bool {
        self.table_by_physical_id(id)
            .is_some_and(|info| !info.is_eligible())
    }

    fn insert_table(&mut self, schema_id: SchemaId, info: TableInfo) -> Result<(), SchemaError> {
        let schema = self
            .schemas
            .get_mut(&schema_id)
            .ok_or(SchemaError::SchemaNotFound(schema_id))?;
        schema.tables.insert(info.id);
        for partition in &info.partitions {
            self.partitions.insert(partition.id, info.id);
        }
        self.tables.insert(info.id, TableEntry { schema_id, info });
        Ok(())
    }

    fn remove_table(&mut self, id: TableId) -> Result<TableEntry, SchemaError> {
        let entry = self
            .tables
            .remove(&id)
            .ok_or(SchemaError::TableNotFound(id))?;
        if let Some(schema) = self.schemas.get_mut(&entry.schema_id) {
            schema.tables.remove(&id);
        }
        for partition in &entry.info.partitions {
            self.partitions.remove(&partition.id);
        }
        Ok(entry)
    }

    /// Folds a finished DDL job into the snapshot.
    pub fn handle_ddl(&mut self, job: &DdlJob) -> Result<(), SchemaError> {
        let table_info = || {
            job.table_info
                .clone()
                .ok_or(SchemaError::MissingTableInfo {
                    job_id: job.id,
                    job_type: job.job_type,
                })
        };

        match job.job_type {
            DdlJobType::CreateSchema => {
                if self.schemas.contains_key(&job.schema_id) {
                    return Err(SchemaError::SchemaExists(job.schema_id));
                }
                self.schemas.insert(
                    job.schema_id,
                    SchemaInfo {
                        id: job.schema_id,
                        name: job.schema_name.clone(),
                        tables: BTreeSet::new(),
                    },
                );
            }
            DdlJobType::DropSchema => {
                let schema = self
                    .schemas
                    .remove(&job.schema_id)
                    .ok_or(SchemaError::SchemaNotFound(job.schema_id))?;
                for table_id in schema.tables {
                    if let Some(entry) = self.tables.remove(&table_id) {
                        for partition in &entry.info.partitions {
                            self.partitions.remove(&partition.id);
                        }
                    }
                }
            }
            DdlJobType::ModifySchemaCharsetAndCollate => {}
            DdlJobType::CreateTable | DdlJobType::CreateView | DdlJobType::RecoverTable => {
                let info = table_info()?;
                if self.tables.contains_key(&info.id) {
                    return Err(SchemaError::TableExists(info.id));
                }
                self.insert_table(job.schema_id, info)?;
            }
            DdlJobType::DropTable | DdlJobType::DropView => {
                self.remove_table(job.table_id)?;
            }
            DdlJobType::TruncateTable => {
                let info = table_info()?;
                let old = self.remove_table(job.table_id)?;
                self.insert_table(old.schema_id, info)?;
            }
            DdlJobType::RenameTable => {
                let info = table_info()?;
                self.remove_table(info.id)?;
                self.insert_table(job.schema_id, info)?;
            }
            _ => {
                let info = table_info()?;
                let old = self.remove_table(info.id)?;
                self.insert_table(old.schema_id, info)?;
            }
        }

        self.current_ts = job.finished_ts;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;

    use cdc_types::model::PartitionDefinition;

    fn job(id: i64, job_type: DdlJobType, schema_id: SchemaId, table: Option<TableInfo>) -> DdlJob {
        DdlJob {
            id,
            job_type,
            schema_id,
            table_id: table.as_ref().map(|t| t.id).unwrap_or_default(),
            schema_name: "test".to_owned(),
            table_name: table.as_ref().map(|t| t.name.clone()).unwrap_or_default(),
            query: String::new(),
            start_ts: id as Ts * 10,
            finished_ts: id as Ts * 10 + 1,
            table_info: table,
        }
    }

    #[test]
    fn create_and_drop() {
        let mut snapshot = SchemaSnapshot::default();
        snapshot
            .handle_ddl(&job(1, DdlJobType::CreateSchema, 1, None))
            .unwrap();
        snapshot
            .handle_ddl(&job(2, DdlJobType::CreateTable, 1, Some(TableInfo::new(10, "t"))))
            .unwrap();
        assert_that!(snapshot.current_ts(), eq(21));
        assert_that!(snapshot.schema_name_of(10), some(eq("test")));
        assert_that!(snapshot.table_by_name("test", "t").is_some(), eq(true));

        let err = snapshot
            .handle_ddl(&job(3, DdlJobType::CreateTable, 1, Some(TableInfo::new(10, "t"))))
            .unwrap_err();
        assert!(matches!(err, SchemaError::TableExists(10)));

        snapshot
            .handle_ddl(&job(4, DdlJobType::DropTable, 1, Some(TableInfo::new(10, "t"))))
            .unwrap();
        assert_that!(snapshot.tables().count(), eq(0));
        assert!(matches!(
            snapshot.handle_ddl(&job(5, DdlJobType::DropTable, 1, Some(TableInfo::new(10, "t")))),
            Err(SchemaError::TableNotFound(10))
        ));
    }

    #[test]
    fn truncate_replaces_physical_id() {
        let mut snapshot = SchemaSnapshot::default();
        snapshot
            .handle_ddl(&job(1, DdlJobType::CreateSchema, 1, None))
            .unwrap();
        snapshot
            .handle_ddl(&job(2, DdlJobType::CreateTable, 1, Some(TableInfo::new(10, "t"))))
            .unwrap();

        let mut truncate = job(3, DdlJobType::TruncateTable, 1, Some(TableInfo::new(11, "t")));
        truncate.table_id = 10;
        snapshot.handle_ddl(&truncate).unwrap();

        assert_that!(snapshot.table_by_id(10).is_none(), eq(true));
        assert_that!(snapshot.table_by_id(11).map(|t| t.id), some(eq(11)));
    }

    #[test]
    fn rename_moves_between_schemas() {
        let mut snapshot = SchemaSnapshot::default();
        snapshot
            .handle_ddl(&job(1, DdlJobType::CreateSchema, 1, None))
            .unwrap();
        let mut other = job(2, DdlJobType::CreateSchema, 2, None);
        other.schema_name = "other".to_owned();
        snapshot.handle_ddl(&other).unwrap();
        snapshot
            .handle_ddl(&job(3, DdlJobType::CreateTable, 1, Some(TableInfo::new(10, "t"))))
            .unwrap();

        snapshot
            .handle_ddl(&job(4, DdlJobType::RenameTable, 2, Some(TableInfo::new(10, "t2"))))
            .unwrap();
        assert_that!(snapshot.table_by_name("test", "t").is_none(), eq(true));
        assert_that!(snapshot.schema_name_of(10), some(eq("other")));
        assert_that!(
            snapshot.table_by_name("other", "t2").map(|t| t.id),
            some(eq(10))
        );
    }

    #[test]
    fn partitions_and_drop_schema() {
        let mut snapshot = SchemaSnapshot::default();
        snapshot
            .handle_ddl(&job(1, DdlJobType::CreateSchema, 1, None))
            .unwrap();
        let mut partitioned = TableInfo::new(10, "p");
        partitioned.partitions = vec![PartitionDefinition {
            id: 11,
            name: "p0".to_owned(),
        }];
        snapshot
            .handle_ddl(&job(2, DdlJobType::CreateTable, 1, Some(partitioned.clone())))
            .unwrap();
        assert_that!(snapshot.table_by_physical_id(11).map(|t| t.id), some(eq(10)));

        partitioned.partitions.push(PartitionDefinition {
            id: 12,
            name: "p1".to_owned(),
        });
        snapshot
            .handle_ddl(&job(3, DdlJobType::AddTablePartition, 1, Some(partitioned)))
            .unwrap();
        assert_that!(snapshot.table_by_physical_id(12).map(|t| t.id), some(eq(10)));

        snapshot
            .handle_ddl(&job(4, DdlJobType::DropSchema, 1, None))
            .unwrap();
        assert_that!(snapshot.tables().count(), eq(0));
        assert_that!(snapshot.table_by_physical_id(11).is_none(), eq(true));
        assert_that!(snapshot.schema_by_id(1).is_none(), eq(true));
    }

    #[test]
    fn table_jobs_need_table_info() {
        let mut snapshot = SchemaSnapshot::default();
        snapshot
            .handle_ddl(&job(1, DdlJobType::CreateSchema, 1, None))
            .unwrap();
        assert!(matches!(
            snapshot.handle_ddl(&job(2, DdlJobType::AddColumn, 1, None)),
            Err(SchemaError::MissingTableInfo { job_id: 2, .. })
        ));
        assert!(matches!(
            snapshot.handle_ddl(&job(3, DdlJobType::CreateSchema, 1, None)),
            Err(SchemaError::SchemaExists(1))
        ));
    }
}
