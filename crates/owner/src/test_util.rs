// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Test doubles for the collaborators of the changefeed controller.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cdc_types::model::{ChangeFeedInfo, DdlEvent, DdlJob, DdlJobType, TableInfo};
use cdc_types::oracle;
use cdc_types::{ChangeFeedId, SchemaId, TableId, Ts};

use crate::ddl_puller::{DdlPuller, DdlPullerFactory, PullerError};
use crate::ddl_sink::{DdlSink, DdlSinkError, DdlSinkFactory};
use crate::error::ErrorSender;
use crate::filter::Filter;
use crate::gc::PdClient;
use crate::schema::{SchemaError, SchemaSnapshot, SchemaStorage};

#[derive(Debug, Default)]
struct MockPullerState {
    resolved_ts: Ts,
    queue: VecDeque<DdlJob>,
    closed: bool,
}

/// Controls the DDL puller handed out by [`MockDdlPullerHandle::factory`].
#[derive(Debug, Clone, Default)]
pub struct MockDdlPullerHandle {
    inner: Arc<Mutex<MockPullerState>>,
}

impl MockDdlPullerHandle {
    pub fn resolved_ts(&self) -> Ts {
        self.inner.lock().resolved_ts
    }

    pub fn set_resolved_ts(&self, ts: Ts) {
        self.inner.lock().resolved_ts = ts;
    }

    pub fn push_job(&self, job: DdlJob) {
        self.inner.lock().queue.push_back(job);
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Every created puller starts with its resolved ts at the requested start ts.
    pub fn factory(&self) -> Arc<dyn DdlPullerFactory> {
        let handle = self.clone();
        Arc::new(
            move |_: &ChangeFeedId, start_ts: Ts, _: Filter| -> Result<Box<dyn DdlPuller>, PullerError> {
                {
                    let mut state = handle.inner.lock();
                    state.resolved_ts = start_ts;
                    state.closed = false;
                }
                Ok(Box::new(MockDdlPuller {
                    handle: handle.clone(),
                }))
            },
        )
    }
}

pub struct MockDdlPuller {
    handle: MockDdlPullerHandle,
}

#[async_trait]
impl DdlPuller for MockDdlPuller {
    fn run(&mut self, _cancel: CancellationToken, _errors: ErrorSender) -> Result<(), PullerError> {
        Ok(())
    }

    fn front_ddl(&self) -> (Ts, Option<DdlJob>) {
        let state = self.handle.inner.lock();
        match state.queue.front() {
            Some(job) => (job.finished_ts, Some(job.clone())),
            None => (state.resolved_ts, None),
        }
    }

    fn pop_front_ddl(&mut self) -> (Ts, Option<DdlJob>) {
        let mut state = self.handle.inner.lock();
        match state.queue.pop_front() {
            Some(job) => (job.finished_ts, Some(job)),
            None => (state.resolved_ts, None),
        }
    }

    async fn close(&mut self) {
        self.handle.inner.lock().closed = true;
    }
}

#[derive(Debug, Default)]
struct MockSinkState {
    ddl_executing: Option<DdlEvent>,
    ddl_done: bool,
    checkpoint_ts: Ts,
    sync_point: Option<Ts>,
    sync_point_history: Vec<Ts>,
    closed: bool,
}

/// Controls the DDL sink handed out by [`MockDdlSinkHandle::factory`].
#[derive(Debug, Clone, Default)]
pub struct MockDdlSinkHandle {
    inner: Arc<Mutex<MockSinkState>>,
}

impl MockDdlSinkHandle {
    /// Whether the next submission of a DDL event reports it as executed. Reset after
    /// every submission.
    pub fn set_ddl_done(&self, done: bool) {
        self.inner.lock().ddl_done = done;
    }

    pub fn ddl_executing(&self) -> Option<DdlEvent> {
        self.inner.lock().ddl_executing.clone()
    }

    pub fn checkpoint_ts(&self) -> Ts {
        self.inner.lock().checkpoint_ts
    }

    pub fn sync_point_history(&self) -> Vec<Ts> {
        self.inner.lock().sync_point_history.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn factory(&self) -> Arc<dyn DdlSinkFactory> {
        let handle = self.clone();
        Arc::new(move || -> Box<dyn DdlSink> {
            Box::new(MockDdlSink {
                handle: handle.clone(),
                task: None,
            })
        })
    }
}

pub struct MockDdlSink {
    handle: MockDdlSinkHandle,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl DdlSink for MockDdlSink {
    fn run(
        &mut self,
        _changefeed: &ChangeFeedId,
        _info: &ChangeFeedInfo,
        cancel: CancellationToken,
        _errors: ErrorSender,
    ) -> Result<(), DdlSinkError> {
        self.task = Some(tokio::spawn(cancel.cancelled_owned()));
        Ok(())
    }

    fn emit_ddl_event(&mut self, event: &DdlEvent) -> Result<bool, DdlSinkError> {
        let mut state = self.handle.inner.lock();
        state.ddl_executing = Some(event.clone());
        Ok(std::mem::take(&mut state.ddl_done))
    }

    fn emit_sync_point(&mut self, ts: Ts) -> Result<(), DdlSinkError> {
        let mut state = self.handle.inner.lock();
        if state.sync_point == Some(ts) {
            return Ok(());
        }
        state.sync_point = Some(ts);
        state.sync_point_history.push(ts);
        Ok(())
    }

    fn emit_checkpoint_ts(&mut self, ts: Ts) {
        self.handle.inner.lock().checkpoint_ts = ts;
    }

    async fn close(&mut self) -> Result<(), DdlSinkError> {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.handle.inner.lock().closed = true;
        Ok(())
    }

    async fn barrier(&self) -> Result<(), DdlSinkError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HelperState {
    jobs: Vec<DdlJob>,
    next_id: i64,
    last_ts: Ts,
}

impl HelperState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn next_ts(&mut self) -> Ts {
        let ts = oracle::current_ts().max(self.last_ts + 1);
        self.last_ts = ts;
        ts
    }

    fn snapshot(&self, ts: Ts) -> Result<SchemaSnapshot, SchemaError> {
        let mut snapshot = SchemaSnapshot::new(0);
        for job in self.jobs.iter().filter(|job| job.finished_ts <= ts) {
            snapshot.handle_ddl(job)?;
        }
        Ok(snapshot)
    }

    fn schema_id(&self, schema: &str) -> SchemaId {
        self.snapshot(Ts::MAX)
            .ok()
            .and_then(|snapshot| snapshot.schema_by_name(schema).map(|info| info.id))
            .unwrap_or_else(|| panic!("schema {schema} to exist"))
    }

    fn push(
        &mut self,
        job_type: DdlJobType,
        schema_id: SchemaId,
        schema_name: &str,
        table_info: Option<TableInfo>,
        query: String,
    ) -> DdlJob {
        let id = self.next_id();
        let start_ts = self.next_ts();
        let finished_ts = self.next_ts();
        let job = DdlJob {
            id,
            job_type,
            schema_id,
            table_id: table_info.as_ref().map(|info| info.id).unwrap_or_default(),
            schema_name: schema_name.to_owned(),
            table_name: table_info
                .as_ref()
                .map(|info| info.name.clone())
                .unwrap_or_default(),
            query,
            start_ts,
            finished_ts,
            table_info,
        };
        self.jobs.push(job.clone());
        job
    }
}

/// In-memory upstream schema history. Every DDL gets a fresh finished ts from the wall
/// clock.
#[derive(Debug, Clone, Default)]
pub struct SchemaTestHelper {
    inner: Arc<Mutex<HelperState>>,
}

impl SchemaTestHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_database(&self, name: &str) -> DdlJob {
        let mut state = self.inner.lock();
        let schema_id = state.next_id();
        state.push(
            DdlJobType::CreateSchema,
            schema_id,
            name,
            None,
            format!("CREATE DATABASE `{name}`"),
        )
    }

    pub fn drop_database(&self, name: &str) -> DdlJob {
        let mut state = self.inner.lock();
        let schema_id = state.schema_id(name);
        state.push(
            DdlJobType::DropSchema,
            schema_id,
            name,
            None,
            format!("DROP DATABASE `{name}`"),
        )
    }

    pub fn create_table(&self, schema: &str, table: &str) -> DdlJob {
        let mut state = self.inner.lock();
        let schema_id = state.schema_id(schema);
        let table_id = state.next_id();
        state.push(
            DdlJobType::CreateTable,
            schema_id,
            schema,
            Some(TableInfo::new(table_id, table)),
            format!("CREATE TABLE `{schema}`.`{table}` (`id` INT PRIMARY KEY)"),
        )
    }

    pub fn drop_table(&self, schema: &str, table: &str) -> DdlJob {
        let mut state = self.inner.lock();
        let schema_id = state.schema_id(schema);
        let info = state
            .snapshot(Ts::MAX)
            .ok()
            .and_then(|snapshot| snapshot.table_by_name(schema, table).cloned())
            .unwrap_or_else(|| panic!("table {schema}.{table} to exist"));
        state.push(
            DdlJobType::DropTable,
            schema_id,
            schema,
            Some(info),
            format!("DROP TABLE `{schema}`.`{table}`"),
        )
    }

    /// Replaces the most recent job, e.g. after changing its table info or finished ts.
    pub fn replace_last_job(&self, job: DdlJob) {
        if let Some(last) = self.inner.lock().jobs.last_mut() {
            *last = job;
        }
    }

    /// Finished ts of the most recent job.
    pub fn current_ts(&self) -> Ts {
        self.inner.lock().last_ts
    }

    pub fn table_id(&self, schema: &str, table: &str) -> Option<TableId> {
        self.inner
            .lock()
            .snapshot(Ts::MAX)
            .ok()?
            .table_by_name(schema, table)
            .map(|info| info.id)
    }
}

#[async_trait]
impl SchemaStorage for SchemaTestHelper {
    async fn snapshot(&self, ts: Ts) -> Result<SchemaSnapshot, SchemaError> {
        self.inner.lock().snapshot(ts)
    }
}

#[derive(Debug, Default)]
struct MockPdState {
    calls: Vec<(String, Ts)>,
    fail_updates: bool,
    min_safe_point: Option<Ts>,
}

/// Records safepoint updates. Unless configured otherwise the cluster safepoint is the
/// one just registered.
#[derive(Debug, Default)]
pub struct MockPdClient {
    state: Mutex<MockPdState>,
}

impl MockPdClient {
    pub fn calls(&self) -> Vec<(String, Ts)> {
        self.state.lock().calls.clone()
    }

    pub fn fail_updates(&self, fail: bool) {
        self.state.lock().fail_updates = fail;
    }

    /// Minimum safepoint of the other services of the cluster.
    pub fn set_min_safe_point(&self, safe_point: Option<Ts>) {
        self.state.lock().min_safe_point = safe_point;
    }
}

#[async_trait]
impl PdClient for MockPdClient {
    async fn update_service_gc_safe_point(
        &self,
        service_id: &str,
        _ttl: Duration,
        safe_point: Ts,
    ) -> anyhow::Result<Ts> {
        let mut state = self.state.lock();
        if state.fail_updates {
            anyhow::bail!("injected safepoint update failure");
        }
        state.calls.push((service_id.to_owned(), safe_point));
        Ok(state.min_safe_point.unwrap_or(safe_point))
    }
}
