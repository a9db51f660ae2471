// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use cdc_types::model::DdlJob;
use cdc_types::{ChangeFeedId, JobId, Ts};

use crate::error::ErrorSender;
use crate::filter::Filter;
use crate::metric_definitions::DDL_PULLED;

#[derive(Debug, thiserror::Error)]
pub enum PullerError {
    #[error("ddl puller is already running")]
    AlreadyRunning,
    #[error("failed pulling ddl jobs: {0}")]
    Source(#[source] anyhow::Error),
}

/// Output of the upstream DDL stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawDdlEvent {
    Job(DdlJob),
    /// No DDL job will finish at or below this ts anymore.
    Resolved(Ts),
}

#[async_trait]
pub trait DdlJobSource: Send + Sync + 'static {
    /// Next event of the stream. `None` once the stream ended.
    async fn next(&mut self) -> anyhow::Result<Option<RawDdlEvent>>;
}

/// Queue of DDL jobs ordered by their finished ts, plus the resolved ts of the DDL stream.
#[async_trait]
pub trait DdlPuller: Send + Sync {
    /// Starts pulling in the background. Failures are reported through `errors`.
    fn run(&mut self, cancel: CancellationToken, errors: ErrorSender) -> Result<(), PullerError>;

    /// The first pending job and its finished ts, or the resolved ts if nothing is pending.
    fn front_ddl(&self) -> (Ts, Option<DdlJob>);

    /// Like [`DdlPuller::front_ddl`] but removes the job.
    fn pop_front_ddl(&mut self) -> (Ts, Option<DdlJob>);

    async fn close(&mut self);
}

pub trait DdlPullerFactory: Send + Sync + 'static {
    fn create(
        &self,
        changefeed: &ChangeFeedId,
        start_ts: Ts,
        filter: Filter,
    ) -> Result<Box<dyn DdlPuller>, PullerError>;
}

impl<F> DdlPullerFactory for F
where
    F: Fn(&ChangeFeedId, Ts, Filter) -> Result<Box<dyn DdlPuller>, PullerError>
        + Send
        + Sync
        + 'static,
{
    fn create(
        &self,
        changefeed: &ChangeFeedId,
        start_ts: Ts,
        filter: Filter,
    ) -> Result<Box<dyn DdlPuller>, PullerError> {
        self(changefeed, start_ts, filter)
    }
}

#[derive(Debug)]
struct PullerState {
    pending: VecDeque<DdlJob>,
    resolved_ts: Ts,
    last_job_id: Option<JobId>,
}

impl PullerState {
    fn handle_event(&mut self, filter: &Filter, event: RawDdlEvent) {
        match event {
            RawDdlEvent::Resolved(ts) => {
                if ts > self.resolved_ts {
                    self.resolved_ts = ts;
                } else {
                    trace!(resolved_ts = self.resolved_ts, ts, "ignore stale resolved ts");
                }
            }
            RawDdlEvent::Job(job) => {
                if filter.should_ignore_ddl_job(&job) {
                    debug!(ddl.job_id = job.id, ddl.query = %job.query, "DDL job is filtered");
                    return;
                }
                if job.finished_ts <= self.resolved_ts {
                    debug!(
                        ddl.job_id = job.id,
                        ddl.finished_ts = job.finished_ts,
                        resolved_ts = self.resolved_ts,
                        "Discarding DDL job at or below the resolved ts"
                    );
                    return;
                }
                if self.last_job_id == Some(job.id) {
                    debug!(ddl.job_id = job.id, "Discarding duplicated DDL job");
                    return;
                }
                info!(ddl.job_id = job.id, ddl.query = %job.query, "Received DDL job");
                counter!(DDL_PULLED).increment(1);
                self.last_job_id = Some(job.id);
                self.pending.push_back(job);
            }
        }
    }

    fn front(&self) -> (Ts, Option<DdlJob>) {
        match self.pending.front() {
            Some(job) => (job.finished_ts, Some(job.clone())),
            None => (self.resolved_ts, None),
        }
    }
}

/// Pulls DDL jobs of one changefeed from a [`DdlJobSource`].
pub struct DdlPullerImpl<S> {
    changefeed: ChangeFeedId,
    filter: Filter,
    state: Arc<Mutex<PullerState>>,
    source: Option<S>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<S: DdlJobSource> DdlPullerImpl<S> {
    pub fn new(changefeed: ChangeFeedId, start_ts: Ts, filter: Filter, source: S) -> Self {
        Self {
            changefeed,
            filter,
            state: Arc::new(Mutex::new(PullerState {
                pending: VecDeque::new(),
                resolved_ts: start_ts,
                last_job_id: None,
            })),
            source: Some(source),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    async fn pull(
        changefeed: ChangeFeedId,
        mut source: S,
        filter: Filter,
        state: Arc<Mutex<PullerState>>,
        cancel: CancellationToken,
        errors: ErrorSender,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = source.next() => event,
            };
            match event {
                Ok(Some(event)) => state.lock().handle_event(&filter, event),
                Ok(None) => {
                    debug!(changefeed = %changefeed, "DDL stream ended");
                    break;
                }
                Err(err) => {
                    warn!(changefeed = %changefeed, "DDL puller failed: {err:#}");
                    errors.report(PullerError::Source(err));
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl<S: DdlJobSource> DdlPuller for DdlPullerImpl<S> {
    fn run(&mut self, cancel: CancellationToken, errors: ErrorSender) -> Result<(), PullerError> {
        let source = self.source.take().ok_or(PullerError::AlreadyRunning)?;
        self.cancel = cancel.child_token();
        self.task = Some(tokio::spawn(Self::pull(
            self.changefeed.clone(),
            source,
            self.filter.clone(),
            Arc::clone(&self.state),
            self.cancel.clone(),
            errors,
        )));
        Ok(())
    }

    fn front_ddl(&self) -> (Ts, Option<DdlJob>) {
        self.state.lock().front()
    }

    fn pop_front_ddl(&mut self) -> (Ts, Option<DdlJob>) {
        let mut state = self.state.lock();
        let front = state.front();
        state.pending.pop_front();
        front
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(changefeed = %self.changefeed, "DDL puller task failed: {err}");
            }
        }
    }
}
