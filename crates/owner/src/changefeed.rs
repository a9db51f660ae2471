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
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use cdc_orchestrator::ChangefeedReactorState;
use cdc_types::config::OwnerOptions;
use cdc_types::errors::{ErrorCode, GenericError};
use cdc_types::model::{
    AdminJob, CaptureInfo, ChangeFeedInfo, ChangeFeedStatus, DdlEvent, DdlJob, RunningError,
    TaskStatus,
};
use cdc_types::oracle;
use cdc_types::{CaptureId, ChangeFeedId, Ts};

use crate::barrier::{BarrierKind, Barriers};
use crate::ddl_comment::add_special_comment;
use crate::ddl_puller::{DdlPuller, DdlPullerFactory};
use crate::ddl_sink::{DdlSink, DdlSinkFactory};
use crate::error::{error_channel, ErrorSender, OwnerError, MIN_SYNC_POINT_INTERVAL};
use crate::feed_state_manager::FeedStateManager;
use crate::filter::Filter;
use crate::gc::GcManager;
use crate::metric_definitions::{
    CHANGEFEED_CHECKPOINT_LAG, CHANGEFEED_CHECKPOINT_TS, CHANGEFEED_RESOLVED_TS,
    CHANGEFEED_TICK_DURATION, DDL_EXECUTED, SYNC_POINT_EMITTED,
};
use crate::redo::RedoManager;
use crate::scheduler::TableScheduler;
use crate::schema::{SchemaCache, SchemaStorage};

/// Services shared by all changefeeds of an owner.
#[derive(Clone)]
pub struct OwnerContext {
    pub capture: CaptureInfo,
    pub options: OwnerOptions,
    pub gc: Arc<GcManager>,
    pub schema_storage: Arc<dyn SchemaStorage>,
    pub ddl_puller_factory: Arc<dyn DdlPullerFactory>,
    pub ddl_sink_factory: Arc<dyn DdlSinkFactory>,
}

/// Resources of an initialized changefeed.
struct Running {
    cancel: CancellationToken,
    ddl_puller: Box<dyn DdlPuller>,
    sink: Box<dyn DdlSink>,
    schema: SchemaCache,
    barriers: Barriers,
    redo: RedoManager,
    /// Event of the DDL job currently executing.
    ddl_event_cache: Option<DdlEvent>,
}

impl Running {
    /// Handles the binding barrier and returns its ts.
    async fn handle_barrier(
        &mut self,
        state: &ChangefeedReactorState,
        status: ChangeFeedStatus,
        info: &ChangeFeedInfo,
        feed_state_manager: &FeedStateManager,
    ) -> Result<Ts, OwnerError> {
        let Some((kind, barrier_ts)) = self.barriers.min() else {
            return Ok(status.checkpoint_ts);
        };
        let blocked = barrier_ts == status.checkpoint_ts && barrier_ts == status.resolved_ts;

        match kind {
            BarrierKind::DdlJob => {
                let (ddl_resolved_ts, job) = self.ddl_puller.front_ddl();
                let Some(job) = job.filter(|_| ddl_resolved_ts == barrier_ts) else {
                    self.barriers.update(BarrierKind::DdlJob, ddl_resolved_ts);
                    return Ok(barrier_ts);
                };
                if !blocked {
                    return Ok(barrier_ts);
                }
                if !self.async_exec_ddl(&state.id, info, &job).await? {
                    return Ok(barrier_ts);
                }
                self.ddl_puller.pop_front_ddl();
                let (next_ts, _) = self.ddl_puller.front_ddl();
                self.barriers.update(BarrierKind::DdlJob, next_ts);
            }
            BarrierKind::SyncPoint => {
                if !blocked {
                    return Ok(barrier_ts);
                }
                self.sink.emit_sync_point(barrier_ts)?;
                counter!(SYNC_POINT_EMITTED).increment(1);
                debug!(changefeed = %state.id, sync_point_ts = barrier_ts, "Emitted sync point");
                let next_ts =
                    oracle::ts_add_duration(barrier_ts, info.config.sync_point_interval());
                self.barriers.update(BarrierKind::SyncPoint, next_ts);
            }
            BarrierKind::Finish => {
                if blocked {
                    feed_state_manager.mark_finished(state);
                }
            }
        }
        Ok(barrier_ts)
    }

    /// Submits the job to the sink. Returns true once it was executed.
    async fn async_exec_ddl(
        &mut self,
        changefeed: &ChangeFeedId,
        info: &ChangeFeedInfo,
        job: &DdlJob,
    ) -> Result<bool, OwnerError> {
        let cached = self
            .ddl_event_cache
            .as_ref()
            .is_some_and(|event| event.commit_ts == job.finished_ts);
        if !cached {
            let mut event = self.schema.build_ddl_event(job)?;
            self.schema.handle_ddl(job)?;
            event.query = add_special_comment(&event.query)?;
            if self.redo.enabled() {
                self.redo.emit_ddl_event(&event).await?;
            }
            info!(
                %changefeed,
                ddl.job_id = job.id,
                ddl.commit_ts = event.commit_ts,
                ddl.query = %event.query,
                "Executing DDL"
            );
            self.ddl_event_cache = Some(event);
        }

        let cyclic = &info.config.cyclic;
        if cyclic.is_enabled() && !cyclic.sync_ddl {
            debug!(%changefeed, ddl.job_id = job.id, "Cyclic replication without DDL sync, skipping DDL");
            self.ddl_event_cache = None;
            return Ok(true);
        }
        if job
            .table_info
            .as_ref()
            .is_some_and(|table| self.schema.is_ineligible_table_id(table.id))
        {
            warn!(%changefeed, ddl.job_id = job.id, ddl.query = %job.query, "Ignoring DDL of an ineligible table");
            self.ddl_event_cache = None;
            return Ok(true);
        }

        let Some(event) = self.ddl_event_cache.as_ref() else {
            return Ok(false);
        };
        let done = self.sink.emit_ddl_event(event)?;
        if done {
            counter!(DDL_EXECUTED).increment(1);
            self.ddl_event_cache = None;
        }
        Ok(done)
    }
}

/// Reconciles the reactor state of one changefeed with the resources running for it.
pub struct Changefeed {
    id: ChangeFeedId,
    ctx: OwnerContext,
    feed_state_manager: FeedStateManager,
    scheduler: TableScheduler,
    errors_tx: ErrorSender,
    errors_rx: mpsc::Receiver<GenericError>,
    running: Option<Running>,
    /// Sink whose close timed out or failed, retried on the next tick.
    closing_sink: Option<Box<dyn DdlSink>>,
    redo: Option<RedoManager>,
    is_removed: bool,
    removal_done: bool,
}

static_assertions::assert_impl_all!(Changefeed: Send, Sync);

impl Changefeed {
    pub fn new(id: ChangeFeedId, ctx: OwnerContext) -> Self {
        let (errors_tx, errors_rx) = error_channel(ctx.options.error_channel_capacity.get());
        Self {
            id,
            ctx,
            feed_state_manager: FeedStateManager::default(),
            scheduler: TableScheduler,
            errors_tx,
            errors_rx,
            running: None,
            closing_sink: None,
            redo: None,
            is_removed: false,
            removal_done: false,
        }
    }

    pub fn id(&self) -> &ChangeFeedId {
        &self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.running.is_some()
    }

    /// Whether the changefeed was removed and all of its resources released.
    pub fn is_removed(&self) -> bool {
        self.is_removed && self.removal_done
    }

    /// Reports errors of tasks running on behalf of this changefeed.
    pub fn error_sender(&self) -> ErrorSender {
        self.errors_tx.clone()
    }

    pub fn push_admin_job(&self, job: AdminJob) {
        self.feed_state_manager.push_admin_job(job);
    }

    #[instrument(level = "debug", skip_all, fields(changefeed = %self.id))]
    pub async fn tick(
        &mut self,
        state: &mut ChangefeedReactorState,
        captures: &BTreeMap<CaptureId, CaptureInfo>,
    ) {
        let start = Instant::now();
        if let Err(err) = self.try_tick(state, captures).await {
            let message = err.message();
            error!(changefeed = %self.id, code = err.code(), "Changefeed failed: {message}");
            let error = RunningError {
                addr: self.ctx.capture.address.clone(),
                code: err.code().to_owned(),
                message,
            };
            self.feed_state_manager.handle_error(state, &[error]);
        }
        histogram!(CHANGEFEED_TICK_DURATION).record(start.elapsed());
    }

    async fn try_tick(
        &mut self,
        state: &mut ChangefeedReactorState,
        captures: &BTreeMap<CaptureId, CaptureInfo>,
    ) -> Result<(), OwnerError> {
        self.feed_state_manager.tick(state);

        let Some(info) = state.info.clone() else {
            self.is_removed |= self.feed_state_manager.should_removed();
            self.release_resources_or_retry(state).await;
            return Ok(());
        };
        let checkpoint_ts = info.checkpoint_ts(state.status.as_ref());

        // a paused changefeed whose data was collected can never be resumed
        if !self.feed_state_manager.should_removed() {
            self.ctx
                .gc
                .check_stale_checkpoint_ts(&self.id, checkpoint_ts)?;
        }

        if !self.feed_state_manager.should_running() {
            self.is_removed = self.feed_state_manager.should_removed();
            self.release_resources_or_retry(state).await;
            return Ok(());
        }

        if !self.pre_check(state, &info, captures) {
            return Ok(());
        }
        self.initialize(state, &info).await?;

        if let Ok(err) = self.errors_rx.try_recv() {
            return Err(OwnerError::Upstream(err));
        }
        let (Some(running), Some(status)) = (self.running.as_mut(), state.status) else {
            return Ok(());
        };

        running.sink.emit_checkpoint_ts(checkpoint_ts);
        self.ctx.gc.pin(&self.id, checkpoint_ts);

        let barrier_ts = running
            .handle_barrier(state, status, &info, &self.feed_state_manager)
            .await?;
        if barrier_ts < checkpoint_ts {
            // the DDL puller has not caught up with the checkpoint yet
            return Ok(());
        }

        let tables = running.schema.all_physical_tables().to_vec();
        if self.scheduler.tick(state, &tables, captures)? {
            self.update_status(state, barrier_ts);
        }
        Ok(())
    }

    /// Makes sure the status and one task status per live capture exist, and drops the
    /// task entries of captures which are gone. Returns false if anything was patched.
    fn pre_check(
        &self,
        state: &mut ChangefeedReactorState,
        info: &ChangeFeedInfo,
        captures: &BTreeMap<CaptureId, CaptureInfo>,
    ) -> bool {
        let mut ok = true;
        if state.status.is_none() {
            let start_ts = info.start_ts;
            state.patch_status(move |status| match status {
                Some(status) => Ok((Some(status), false)),
                None => Ok((
                    Some(ChangeFeedStatus {
                        checkpoint_ts: start_ts,
                        resolved_ts: start_ts,
                        ..Default::default()
                    }),
                    true,
                )),
            });
            ok = false;
        }

        for capture in captures.keys() {
            if !state.task_statuses.contains_key(capture) {
                state.patch_task_status(capture.clone(), |status| match status {
                    Some(status) => Ok((Some(status), false)),
                    None => Ok((Some(TaskStatus::default()), true)),
                });
                ok = false;
            }
        }

        for capture in state.captures_with_tasks() {
            if !captures.contains_key(&capture) {
                debug!(changefeed = %self.id, %capture, "Cleaning up task entries of offline capture");
                state.clean_capture(&capture);
                ok = false;
            }
        }
        ok
    }

    async fn initialize(
        &mut self,
        state: &ChangefeedReactorState,
        info: &ChangeFeedInfo,
    ) -> Result<(), OwnerError> {
        if self.running.is_some() {
            return Ok(());
        }
        // errors of a previous run
        while self.errors_rx.try_recv().is_ok() {}

        let checkpoint_ts = info.checkpoint_ts(state.status.as_ref());
        info!(
            changefeed = %self.id,
            checkpoint_ts,
            sink_uri = %info.sink_uri,
            "Initializing changefeed"
        );
        if info.config.check_gc_safe_point {
            self.ctx
                .gc
                .ensure_start_ts_safety(&self.id, checkpoint_ts)
                .await?;
        }

        let sync_point_interval = info.config.sync_point_interval();
        if info.config.sync_point_enabled && sync_point_interval < MIN_SYNC_POINT_INTERVAL {
            return Err(OwnerError::InvalidSyncPointInterval(sync_point_interval));
        }

        // A DDL finished at the checkpoint may not have been executed yet, so the DDL
        // history is read from just below it.
        let ddl_start_ts = checkpoint_ts.saturating_sub(1);
        let mut barriers = Barriers::default();
        if info.config.sync_point_enabled {
            barriers.update(BarrierKind::SyncPoint, checkpoint_ts);
        }
        barriers.update(BarrierKind::DdlJob, ddl_start_ts);
        barriers.update(BarrierKind::Finish, info.target_ts());

        let filter = Filter::new(&info.config)?;
        let snapshot = self.ctx.schema_storage.snapshot(ddl_start_ts).await?;
        let schema = SchemaCache::new(snapshot, filter.clone());
        let redo = RedoManager::new(self.id.clone(), &info.config.consistent).await?;
        let mut ddl_puller =
            self.ctx
                .ddl_puller_factory
                .create(&self.id, ddl_start_ts, filter)?;
        let mut sink = self.ctx.ddl_sink_factory.create();

        let cancel = CancellationToken::new();
        sink.run(&self.id, info, cancel.clone(), self.errors_tx.clone())?;
        if let Err(err) = ddl_puller.run(cancel.clone(), self.errors_tx.clone()) {
            cancel.cancel();
            return Err(err.into());
        }

        self.running = Some(Running {
            cancel,
            ddl_puller,
            sink,
            schema,
            barriers,
            redo,
            ddl_event_cache: None,
        });
        self.redo = None;
        Ok(())
    }

    fn update_status(&self, state: &mut ChangefeedReactorState, barrier_ts: Ts) {
        let mut resolved_ts = barrier_ts;
        for position in state.task_positions.values() {
            resolved_ts = resolved_ts.min(position.resolved_ts);
        }
        // tables being added or removed start from their boundary
        for status in state.task_statuses.values() {
            for operation in status.operation.values() {
                resolved_ts = resolved_ts.min(operation.boundary_ts);
            }
        }
        let mut checkpoint_ts = resolved_ts;
        for position in state.task_positions.values() {
            checkpoint_ts = checkpoint_ts.min(position.checkpoint_ts);
        }

        state.patch_status(move |status| {
            let Some(mut status) = status else {
                return Ok((None, false));
            };
            let checkpoint_ts = checkpoint_ts.max(status.checkpoint_ts);
            let resolved_ts = resolved_ts.max(checkpoint_ts);
            let changed =
                status.checkpoint_ts != checkpoint_ts || status.resolved_ts != resolved_ts;
            status.checkpoint_ts = checkpoint_ts;
            status.resolved_ts = resolved_ts;
            Ok((Some(status), changed))
        });

        let changefeed = self.id.to_string();
        gauge!(CHANGEFEED_CHECKPOINT_TS, "changefeed" => changefeed.clone())
            .set(oracle::extract_physical(checkpoint_ts) as f64);
        gauge!(CHANGEFEED_RESOLVED_TS, "changefeed" => changefeed.clone())
            .set(oracle::extract_physical(resolved_ts) as f64);
        gauge!(CHANGEFEED_CHECKPOINT_LAG, "changefeed" => changefeed).set(
            oracle::physical_distance(checkpoint_ts, oracle::current_ts()).as_secs_f64(),
        );
    }

    async fn release_resources_or_retry(&mut self, state: &mut ChangefeedReactorState) {
        if let Err(err) = self.release_resources(state).await {
            warn!(
                changefeed = %self.id,
                "Failed releasing changefeed resources, retrying on the next tick: {}",
                err.message()
            );
        }
    }

    /// Stops every background task of the changefeed. A removed changefeed also drops its
    /// redo logs and its keys, once everything else was released.
    async fn release_resources(
        &mut self,
        state: &mut ChangefeedReactorState,
    ) -> Result<(), OwnerError> {
        self.close_running().await?;

        if self.is_removed && !self.removal_done {
            self.cleanup_redo(state).await?;
            state.patch_info(|info| Ok((None, info.is_some())));
            state.patch_status(|status| Ok((None, status.is_some())));
            for capture in state.captures_with_tasks() {
                state.clean_capture(&capture);
            }
            self.removal_done = true;
            info!(changefeed = %self.id, "Changefeed removed");
        }
        Ok(())
    }

    async fn close_running(&mut self) -> Result<(), OwnerError> {
        if let Some(running) = self.running.take() {
            info!(changefeed = %self.id, "Closing changefeed");
            let Running {
                cancel,
                mut ddl_puller,
                sink,
                redo,
                ..
            } = running;
            cancel.cancel();
            ddl_puller.close().await;
            self.closing_sink = Some(sink);
            self.redo = Some(redo);
            self.ctx.gc.release(&self.id);
        }

        if let Some(sink) = self.closing_sink.as_mut() {
            let timeout = self.ctx.options.sink_close_timeout();
            match tokio::time::timeout(timeout, sink.close()).await {
                Ok(result) => result?,
                Err(_) => return Err(OwnerError::SinkCloseTimeout(timeout)),
            }
            self.closing_sink = None;
        }
        Ok(())
    }

    async fn cleanup_redo(&mut self, state: &ChangefeedReactorState) -> Result<(), OwnerError> {
        let Some(info) = state.info.as_ref() else {
            warn!(changefeed = %self.id, "Changefeed is removed but its info is gone, skipping redo cleanup");
            return Ok(());
        };
        if !info.config.consistent.is_enabled() {
            return Ok(());
        }
        // a changefeed removed while paused was never initialized
        let redo = match self.redo.take() {
            Some(redo) => redo,
            None => RedoManager::new(self.id.clone(), &info.config.consistent).await?,
        };
        if let Err(err) = redo.cleanup().await {
            self.redo = Some(redo);
            return Err(err.into());
        }
        Ok(())
    }

    /// Stops the background tasks without touching the reactor state.
    pub async fn close(&mut self) {
        if let Err(err) = self.close_running().await {
            warn!(changefeed = %self.id, "Failed closing changefeed: {}", err.message());
        }
    }

    #[cfg(test)]
    fn physical_tables(&mut self) -> Vec<cdc_types::TableId> {
        self.running
            .as_mut()
            .map(|running| running.schema.all_physical_tables().to_vec())
            .unwrap_or_default()
    }
}
