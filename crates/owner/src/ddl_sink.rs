// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cdc_types::config::OwnerOptions;
use cdc_types::model::{ChangeFeedInfo, DdlEvent};
use cdc_types::{ChangeFeedId, Ts};

use crate::error::ErrorSender;
use crate::metric_definitions::CHECKPOINT_EMITTED;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The downstream decided not to apply the event. Counts as executed.
    #[error("ddl event ignored by the downstream")]
    DdlEventIgnored,
    #[error(transparent)]
    Downstream(#[from] anyhow::Error),
}

/// Downstream system receiving DDL events, checkpoints and sync points.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    async fn emit_ddl_event(&self, event: &DdlEvent) -> Result<(), SinkError>;

    async fn emit_checkpoint_ts(&self, ts: Ts) -> Result<(), SinkError>;

    /// Records a consistent snapshot point shared by upstream and downstream.
    async fn emit_sync_point(&self, changefeed: &ChangeFeedId, ts: Ts) -> Result<(), SinkError>;

    /// Waits until everything emitted so far is durable downstream.
    async fn barrier(&self) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError>;
}

/// Accepts and discards everything.
#[derive(Debug, Default)]
pub struct BlackHoleSink;

#[async_trait]
impl Sink for BlackHoleSink {
    async fn emit_ddl_event(&self, event: &DdlEvent) -> Result<(), SinkError> {
        debug!(ddl.commit_ts = event.commit_ts, ddl.query = %event.query, "BlackHoleSink: DDL event");
        Ok(())
    }

    async fn emit_checkpoint_ts(&self, ts: Ts) -> Result<(), SinkError> {
        debug!(checkpoint_ts = ts, "BlackHoleSink: checkpoint");
        Ok(())
    }

    async fn emit_sync_point(&self, changefeed: &ChangeFeedId, ts: Ts) -> Result<(), SinkError> {
        debug!(%changefeed, sync_point_ts = ts, "BlackHoleSink: sync point");
        Ok(())
    }

    async fn barrier(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DdlSinkError {
    #[error("ddl sink is not running")]
    NotRunning,
    #[error("ddl sink is already running")]
    AlreadyRunning,
    #[error("invalid sink uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("failed executing ddl '{query}': {source}")]
    Execute {
        query: String,
        #[source]
        source: SinkError,
    },
    #[error("failed writing sync point {ts}: {source}")]
    SyncPoint {
        ts: Ts,
        #[source]
        source: SinkError,
    },
    #[error("failed emitting checkpoint: {0}")]
    Checkpoint(#[source] SinkError),
    #[error("ddl sink barrier failed: {0}")]
    Barrier(#[source] SinkError),
    #[error("failed closing ddl sink: {0}")]
    Close(#[source] SinkError),
}

/// Downstream for `sink_uri`.
pub fn sink_from_uri(sink_uri: &str) -> Result<Arc<dyn Sink>, DdlSinkError> {
    let invalid = |reason: String| DdlSinkError::InvalidUri {
        uri: sink_uri.to_owned(),
        reason,
    };
    let uri = url::Url::parse(sink_uri).map_err(|err| invalid(err.to_string()))?;
    match uri.scheme() {
        "blackhole" => Ok(Arc::new(BlackHoleSink)),
        scheme => Err(invalid(format!("unsupported scheme '{scheme}'"))),
    }
}

/// Owner side of the downstream. DDL events are executed asynchronously; the controller
/// polls for completion by re-submitting the same event on every tick.
#[async_trait]
pub trait DdlSink: Send + Sync {
    fn run(
        &mut self,
        changefeed: &ChangeFeedId,
        info: &ChangeFeedInfo,
        cancel: CancellationToken,
        errors: ErrorSender,
    ) -> Result<(), DdlSinkError>;

    /// Returns true once the event was executed. Never blocks.
    fn emit_ddl_event(&mut self, event: &DdlEvent) -> Result<bool, DdlSinkError>;

    /// Emits a sync point. Emitting the same ts twice in a row is a no-op.
    fn emit_sync_point(&mut self, ts: Ts) -> Result<(), DdlSinkError>;

    fn emit_checkpoint_ts(&mut self, ts: Ts);

    async fn close(&mut self) -> Result<(), DdlSinkError>;

    async fn barrier(&self) -> Result<(), DdlSinkError>;
}

pub trait DdlSinkFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn DdlSink>;
}

impl<F> DdlSinkFactory for F
where
    F: Fn() -> Box<dyn DdlSink> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn DdlSink> {
        self()
    }
}

#[derive(Debug, Default)]
struct Progress {
    checkpoint_ts: AtomicU64,
    ddl_finished_ts: AtomicU64,
}

struct Running {
    ddl_tx: mpsc::Sender<DdlEvent>,
    sync_point_tx: mpsc::UnboundedSender<Ts>,
    downstream: Arc<dyn Sink>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DdlSinkImpl {
    ddl_channel_capacity: usize,
    checkpoint_emit_interval: Duration,
    downstream: Option<Arc<dyn Sink>>,
    progress: Arc<Progress>,
    ddl_sent_ts: Ts,
    last_sync_point: Option<Ts>,
    running: Option<Running>,
}

impl DdlSinkImpl {
    pub fn new(options: &OwnerOptions) -> Self {
        Self {
            ddl_channel_capacity: options.ddl_channel_capacity.get(),
            checkpoint_emit_interval: options.checkpoint_emit_interval(),
            downstream: None,
            progress: Arc::default(),
            ddl_sent_ts: 0,
            last_sync_point: None,
            running: None,
        }
    }

    /// Uses `downstream` instead of the sink described by the changefeed's sink uri.
    pub fn with_sink(mut self, downstream: Arc<dyn Sink>) -> Self {
        self.downstream = Some(downstream);
        self
    }
}

struct SinkLoop {
    changefeed: ChangeFeedId,
    downstream: Arc<dyn Sink>,
    progress: Arc<Progress>,
    ddl_rx: mpsc::Receiver<DdlEvent>,
    sync_point_rx: mpsc::UnboundedReceiver<Ts>,
    checkpoint_emit_interval: Duration,
    errors: ErrorSender,
}

impl SinkLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.checkpoint_emit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_checkpoint_ts = 0;

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(ts) = self.sync_point_rx.recv() => {
                    if let Err(source) = self.downstream.emit_sync_point(&self.changefeed, ts).await {
                        break Err(DdlSinkError::SyncPoint { ts, source });
                    }
                }
                Some(event) = self.ddl_rx.recv() => {
                    if let Err(err) = self.execute(&event).await {
                        break Err(err);
                    }
                }
                _ = ticker.tick() => {
                    let checkpoint_ts = self.progress.checkpoint_ts.load(Ordering::Acquire);
                    if checkpoint_ts <= last_checkpoint_ts {
                        continue;
                    }
                    if let Err(err) = self.downstream.emit_checkpoint_ts(checkpoint_ts).await {
                        break Err(DdlSinkError::Checkpoint(err));
                    }
                    last_checkpoint_ts = checkpoint_ts;
                    counter!(CHECKPOINT_EMITTED).increment(1);
                }
            }
        };

        if let Err(err) = result {
            warn!(changefeed = %self.changefeed, "DDL sink stopped: {err}");
            self.errors.report(err);
        }
    }

    async fn execute(&self, event: &DdlEvent) -> Result<(), DdlSinkError> {
        match self.downstream.emit_ddl_event(event).await {
            Ok(()) => {
                info!(
                    changefeed = %self.changefeed,
                    ddl.commit_ts = event.commit_ts,
                    ddl.query = %event.query,
                    "Executed DDL"
                );
            }
            Err(SinkError::DdlEventIgnored) => {
                info!(
                    changefeed = %self.changefeed,
                    ddl.commit_ts = event.commit_ts,
                    ddl.query = %event.query,
                    "DDL ignored by the downstream"
                );
            }
            Err(source) => {
                return Err(DdlSinkError::Execute {
                    query: event.query.clone(),
                    source,
                })
            }
        }
        self.progress
            .ddl_finished_ts
            .store(event.commit_ts, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl DdlSink for DdlSinkImpl {
    fn run(
        &mut self,
        changefeed: &ChangeFeedId,
        info: &ChangeFeedInfo,
        cancel: CancellationToken,
        errors: ErrorSender,
    ) -> Result<(), DdlSinkError> {
        if self.running.is_some() {
            return Err(DdlSinkError::AlreadyRunning);
        }
        let downstream = match &self.downstream {
            Some(downstream) => Arc::clone(downstream),
            None => sink_from_uri(&info.sink_uri)?,
        };

        let (ddl_tx, ddl_rx) = mpsc::channel(self.ddl_channel_capacity);
        let (sync_point_tx, sync_point_rx) = mpsc::unbounded_channel();
        let cancel = cancel.child_token();
        let sink_loop = SinkLoop {
            changefeed: changefeed.clone(),
            downstream: Arc::clone(&downstream),
            progress: Arc::clone(&self.progress),
            ddl_rx,
            sync_point_rx,
            checkpoint_emit_interval: self.checkpoint_emit_interval,
            errors,
        };
        let task = tokio::spawn(sink_loop.run(cancel.clone()));
        debug!(%changefeed, sink_uri = %info.sink_uri, "DDL sink started");

        self.running = Some(Running {
            ddl_tx,
            sync_point_tx,
            downstream,
            cancel,
            task,
        });
        Ok(())
    }

    fn emit_ddl_event(&mut self, event: &DdlEvent) -> Result<bool, DdlSinkError> {
        if event.commit_ts <= self.progress.ddl_finished_ts.load(Ordering::Acquire) {
            return Ok(true);
        }
        if event.commit_ts <= self.ddl_sent_ts {
            // still executing
            return Ok(false);
        }

        let running = self.running.as_ref().ok_or(DdlSinkError::NotRunning)?;
        match running.ddl_tx.try_send(event.clone()) {
            Ok(()) => {
                self.ddl_sent_ts = event.commit_ts;
                debug!(ddl.commit_ts = event.commit_ts, "DDL event sent to the sink");
            }
            Err(TrySendError::Full(_)) => {
                debug!(ddl.commit_ts = event.commit_ts, "DDL channel is full, retrying later");
            }
            Err(TrySendError::Closed(_)) => return Err(DdlSinkError::NotRunning),
        }
        Ok(false)
    }

    fn emit_sync_point(&mut self, ts: Ts) -> Result<(), DdlSinkError> {
        if self.last_sync_point == Some(ts) {
            return Ok(());
        }
        let running = self.running.as_ref().ok_or(DdlSinkError::NotRunning)?;
        running
            .sync_point_tx
            .send(ts)
            .map_err(|_| DdlSinkError::NotRunning)?;
        self.last_sync_point = Some(ts);
        Ok(())
    }

    fn emit_checkpoint_ts(&mut self, ts: Ts) {
        self.progress.checkpoint_ts.store(ts, Ordering::Release);
    }

    async fn close(&mut self) -> Result<(), DdlSinkError> {
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };
        running.cancel.cancel();
        if !running.task.is_finished() {
            if let Err(err) = (&mut running.task).await {
                warn!("DDL sink task failed: {err}");
            }
        }
        running.downstream.close().await.map_err(DdlSinkError::Close)?;
        self.running = None;
        Ok(())
    }

    async fn barrier(&self) -> Result<(), DdlSinkError> {
        match &self.running {
            Some(running) => running.downstream.barrier().await.map_err(DdlSinkError::Barrier),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    use googletest::assert_that;
    use googletest::matchers::{eq, len};
    use parking_lot::Mutex;
    use test_log::test;

    use cdc_types::config::OwnerOptionsBuilder;
    use cdc_types::model::DdlJobType;

    use crate::error::error_channel;

    #[derive(Default)]
    struct RecordingSink {
        ddls: Mutex<Vec<Ts>>,
        checkpoints: Mutex<Vec<Ts>>,
        sync_points: Mutex<Vec<Ts>>,
        fail_ddl: AtomicBool,
        ignore_ddl: AtomicBool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn emit_ddl_event(&self, event: &DdlEvent) -> Result<(), SinkError> {
            if self.fail_ddl.load(Ordering::Relaxed) {
                return Err(anyhow::anyhow!("table is locked").into());
            }
            self.ddls.lock().push(event.commit_ts);
            if self.ignore_ddl.load(Ordering::Relaxed) {
                return Err(SinkError::DdlEventIgnored);
            }
            Ok(())
        }

        async fn emit_checkpoint_ts(&self, ts: Ts) -> Result<(), SinkError> {
            self.checkpoints.lock().push(ts);
            Ok(())
        }

        async fn emit_sync_point(&self, _: &ChangeFeedId, ts: Ts) -> Result<(), SinkError> {
            self.sync_points.lock().push(ts);
            Ok(())
        }

        async fn barrier(&self) -> Result<(), SinkError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), SinkError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    fn ddl(commit_ts: Ts) -> DdlEvent {
        DdlEvent {
            start_ts: commit_ts - 1,
            commit_ts,
            job_type: DdlJobType::CreateSchema,
            query: format!("CREATE DATABASE `db{commit_ts}`"),
            table_info: None,
            pre_table_info: None,
        }
    }

    fn start(downstream: Arc<RecordingSink>) -> (DdlSinkImpl, mpsc::Receiver<cdc_types::errors::GenericError>) {
        let options = OwnerOptionsBuilder::default()
            .checkpoint_emit_interval(Duration::from_millis(10).into())
            .build()
            .unwrap();
        let mut sink = DdlSinkImpl::new(&options).with_sink(downstream);
        let (errors, errors_rx) = error_channel(4);
        sink.run(
            &"cf".into(),
            &ChangeFeedInfo::new("blackhole://", 1),
            CancellationToken::new(),
            errors,
        )
        .unwrap();
        (sink, errors_rx)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[test(tokio::test(start_paused = true))]
    async fn ddl_is_executed_once_and_polled_for_completion() {
        let downstream = Arc::new(RecordingSink::default());
        let (mut sink, _errors) = start(Arc::clone(&downstream));

        let event = ddl(100);
        assert_that!(sink.emit_ddl_event(&event).unwrap(), eq(false));
        wait_until(|| sink.emit_ddl_event(&event).unwrap()).await;
        // re-submitting a finished event does not execute it again
        assert_that!(sink.emit_ddl_event(&event).unwrap(), eq(true));
        assert_eq!(*downstream.ddls.lock(), vec![100]);

        downstream.ignore_ddl.store(true, Ordering::Relaxed);
        let ignored = ddl(200);
        sink.emit_ddl_event(&ignored).unwrap();
        wait_until(|| sink.emit_ddl_event(&ignored).unwrap()).await;

        sink.close().await.unwrap();
        assert_that!(downstream.closed.load(Ordering::Relaxed), eq(true));
        assert!(matches!(
            sink.emit_ddl_event(&ddl(300)),
            Err(DdlSinkError::NotRunning)
        ));
    }

    #[test(tokio::test(start_paused = true))]
    async fn checkpoint_is_emitted_only_when_advanced() {
        let downstream = Arc::new(RecordingSink::default());
        let (mut sink, _errors) = start(Arc::clone(&downstream));

        sink.emit_checkpoint_ts(5);
        tokio::time::sleep(Duration::from_millis(55)).await;
        assert_eq!(*downstream.checkpoints.lock(), vec![5]);

        sink.emit_checkpoint_ts(7);
        tokio::time::sleep(Duration::from_millis(55)).await;
        assert_eq!(*downstream.checkpoints.lock(), vec![5, 7]);
        sink.close().await.unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn sync_points_are_deduplicated() {
        let downstream = Arc::new(RecordingSink::default());
        let (mut sink, _errors) = start(Arc::clone(&downstream));

        sink.emit_sync_point(10).unwrap();
        sink.emit_sync_point(10).unwrap();
        sink.emit_sync_point(20).unwrap();
        wait_until(|| downstream.sync_points.lock().len() == 2).await;
        assert_eq!(*downstream.sync_points.lock(), vec![10, 20]);
        sink.close().await.unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn downstream_failures_are_reported() {
        let downstream = Arc::new(RecordingSink::default());
        downstream.fail_ddl.store(true, Ordering::Relaxed);
        let (mut sink, mut errors) = start(Arc::clone(&downstream));

        sink.emit_ddl_event(&ddl(100)).unwrap();
        let err = errors.recv().await.unwrap();
        assert_that!(err.is::<DdlSinkError>(), eq(true));
        assert_eq!(
            err.to_string(),
            "failed executing ddl 'CREATE DATABASE `db100`': table is locked"
        );
        sink.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn unsupported_sink_uri_is_rejected() {
        let mut sink = DdlSinkImpl::new(&OwnerOptions::default());
        let (errors, _rx) = error_channel(1);
        let result = sink.run(
            &"cf".into(),
            &ChangeFeedInfo::new("kafka://127.0.0.1:9092/topic", 1),
            CancellationToken::new(),
            errors,
        );
        assert!(matches!(result, Err(DdlSinkError::InvalidUri { .. })));
        assert_that!(sink_from_uri("blackhole://").is_ok(), eq(true));
    }
}
