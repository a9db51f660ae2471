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

use tracing::{debug, warn};

use cdc_orchestrator::ChangefeedReactorState;
use cdc_types::model::{CaptureInfo, TableReplicaInfo};
use cdc_types::{CaptureId, TableId, Ts};

use crate::error::OwnerError;

/// Workload assumed for a table which was just dispatched.
const DEFAULT_TABLE_WORKLOAD: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    AddTable,
    RemoveTable,
}

#[derive(Debug, Clone)]
struct SchedulerJob {
    kind: JobKind,
    table_id: TableId,
    boundary_ts: Ts,
    target: Option<CaptureId>,
}

/// Keeps the tables replicated by the captures in line with the tables of the schema.
#[derive(Debug, Default)]
pub struct TableScheduler;

impl TableScheduler {
    /// Dispatches add and remove operations. Returns whether the changefeed status may be
    /// advanced on this tick, which is only the case if nothing was dispatched.
    pub fn tick(
        &mut self,
        state: &mut ChangefeedReactorState,
        current_tables: &[TableId],
        captures: &BTreeMap<CaptureId, CaptureInfo>,
    ) -> Result<bool, OwnerError> {
        let Some(checkpoint_ts) = state.status.map(|status| status.checkpoint_ts) else {
            return Ok(false);
        };

        Self::clean_up_finished_operations(state);
        let mut jobs = Self::sync_tables(state, current_tables, checkpoint_ts)?;
        if jobs.is_empty() {
            return Ok(true);
        }

        Self::dispatch_to_target_captures(state, captures, &mut jobs);
        debug!(changefeed = %state.id, jobs = jobs.len(), "Dispatching table operations");
        Self::handle_jobs(state, jobs);
        Ok(false)
    }

    fn clean_up_finished_operations(state: &mut ChangefeedReactorState) {
        let captures: Vec<CaptureId> = state.task_statuses.keys().cloned().collect();
        for capture in captures {
            state.patch_task_status(capture, |status| match status {
                Some(mut status) => {
                    let changed = status.clean_finished_operations();
                    Ok((Some(status), changed))
                }
                None => Ok((None, false)),
            });
        }
    }

    /// Which capture replicates which table, including tables with in-flight operations.
    fn table_to_capture(
        state: &ChangefeedReactorState,
    ) -> Result<BTreeMap<TableId, CaptureId>, OwnerError> {
        let mut index = BTreeMap::new();
        for (capture, status) in &state.task_statuses {
            for table_id in status.tables.keys().chain(status.operation.keys()) {
                match index.get(table_id) {
                    Some(owner) if owner != capture => {
                        warn!(
                            changefeed = %state.id,
                            table_id,
                            %capture,
                            other_capture = %owner,
                            "Table is replicated by two captures"
                        );
                        return Err(OwnerError::TableListenReplicated {
                            table_id: *table_id,
                        });
                    }
                    _ => {
                        index.insert(*table_id, capture.clone());
                    }
                }
            }
        }
        Ok(index)
    }

    fn sync_tables(
        state: &ChangefeedReactorState,
        current_tables: &[TableId],
        checkpoint_ts: Ts,
    ) -> Result<Vec<SchedulerJob>, OwnerError> {
        let mut listening = Self::table_to_capture(state)?;
        let mut jobs = Vec::new();

        for table_id in current_tables {
            if listening.remove(table_id).is_some() {
                continue;
            }
            jobs.push(SchedulerJob {
                kind: JobKind::AddTable,
                table_id: *table_id,
                boundary_ts: checkpoint_ts,
                target: None,
            });
        }

        // whatever is left must not be replicated anymore
        for (table_id, capture) in listening {
            let being_removed = state
                .task_statuses
                .get(&capture)
                .and_then(|status| status.operation.get(&table_id))
                .is_some_and(|operation| operation.delete);
            if being_removed {
                continue;
            }
            jobs.push(SchedulerJob {
                kind: JobKind::RemoveTable,
                table_id,
                boundary_ts: checkpoint_ts,
                target: Some(capture),
            });
        }
        Ok(jobs)
    }

    fn dispatch_to_target_captures(
        state: &ChangefeedReactorState,
        captures: &BTreeMap<CaptureId, CaptureInfo>,
        jobs: &mut [SchedulerJob],
    ) {
        let mut workloads: BTreeMap<CaptureId, u64> = captures
            .keys()
            .map(|capture| {
                let workload = state
                    .workloads
                    .get(capture)
                    .map(|tables| tables.values().map(|info| info.workload).sum())
                    .unwrap_or_default();
                (capture.clone(), workload)
            })
            .collect();

        for job in jobs.iter_mut() {
            match (&job.target, job.kind) {
                (None, kind) => {
                    let target = workloads
                        .iter()
                        .min_by_key(|(_, workload)| **workload)
                        .map(|(capture, _)| capture.clone());
                    if let (Some(target), JobKind::AddTable) = (&target, kind) {
                        if let Some(workload) = workloads.get_mut(target) {
                            *workload += DEFAULT_TABLE_WORKLOAD;
                        }
                    }
                    job.target = target;
                }
                (Some(target), JobKind::AddTable) => {
                    if let Some(workload) = workloads.get_mut(target) {
                        *workload += DEFAULT_TABLE_WORKLOAD;
                    }
                }
                (Some(target), JobKind::RemoveTable) => {
                    if let Some(workload) = workloads.get_mut(target) {
                        *workload = workload.saturating_sub(DEFAULT_TABLE_WORKLOAD);
                    }
                }
            }
        }
    }

    fn handle_jobs(state: &mut ChangefeedReactorState, jobs: Vec<SchedulerJob>) {
        for job in jobs {
            let Some(target) = job.target else {
                warn!(changefeed = %state.id, table_id = job.table_id, "No capture to dispatch the table to");
                continue;
            };
            let changefeed = state.id.clone();
            let capture = target.clone();
            state.patch_task_status(target, move |status| {
                let Some(mut status) = status else {
                    // the table is dispatched again on the next tick
                    warn!(%changefeed, %capture, table_id = job.table_id, "Task status not found, skipping table operation");
                    return Ok((None, false));
                };
                match job.kind {
                    JobKind::AddTable => status.add_table(
                        job.table_id,
                        TableReplicaInfo {
                            start_ts: job.boundary_ts,
                            mark_table_id: 0,
                        },
                        job.boundary_ts,
                    ),
                    JobKind::RemoveTable => {
                        status.remove_table(job.table_id, job.boundary_ts);
                    }
                }
                Ok((Some(status), true))
            });
        }
    }
}
