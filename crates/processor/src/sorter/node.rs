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

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cdc_types::config::{ConsistentLevel, ReplicaConfig, SortEngine, SorterOptions};
use cdc_types::model::PolymorphicEvent;
use cdc_types::{ChangeFeedId, TableId, Ts};

use super::{EventSorter, MemorySorter, SortDir, SorterError};
use crate::metric_definitions::{SORTER_CLAMPED_RESOLVED, SORTER_RESOLVED_TS};
use crate::pipeline::{Message, Node, NodeContext};

/// Pipeline node feeding a table's events through an [`EventSorter`].
///
/// Resolved events above the barrier ts are lowered to the barrier before they reach the
/// sorter, so nothing downstream gets ahead of a pending DDL or sync point. The excess is
/// released once the barrier moves. Eventual consistency skips the clamp since the redo
/// log already guards the downstream.
pub struct SorterNode {
    changefeed_id: ChangeFeedId,
    table_name: String,
    table_id: TableId,

    /// Highest resolved ts received.
    resolved_ts: Arc<AtomicU64>,
    /// Highest resolved ts that left the sorter.
    output_resolved_ts: Arc<AtomicU64>,
    /// Highest resolved ts handed to the sorter.
    sent_resolved_ts: Ts,
    barrier_ts: Ts,

    replica_config: ReplicaConfig,
    options: SorterOptions,
    sort_dir: Option<Arc<SortDir>>,
    sorter: Option<Box<dyn EventSorter>>,
    cancel: CancellationToken,
    output_task: Option<JoinHandle<()>>,
}

impl SorterNode {
    pub fn new(
        changefeed_id: ChangeFeedId,
        table_name: impl Into<String>,
        table_id: TableId,
        start_ts: Ts,
        replica_config: ReplicaConfig,
        options: SorterOptions,
    ) -> Self {
        Self {
            changefeed_id,
            table_name: table_name.into(),
            table_id,
            resolved_ts: Arc::new(AtomicU64::new(start_ts)),
            output_resolved_ts: Arc::new(AtomicU64::new(start_ts)),
            sent_resolved_ts: start_ts,
            barrier_ts: start_ts,
            replica_config,
            options,
            sort_dir: None,
            sorter: None,
            cancel: CancellationToken::new(),
            output_task: None,
        }
    }

    /// Uses the given sorter instead of building one from the sort engine on init.
    pub fn with_sorter(mut self, sorter: Box<dyn EventSorter>) -> Self {
        self.sorter = Some(sorter);
        self
    }

    /// Shares a sort dir reserved by the capture with the unified engine.
    pub fn with_sort_dir(mut self, sort_dir: Arc<SortDir>) -> Self {
        self.sort_dir = Some(sort_dir);
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn resolved_ts(&self) -> Ts {
        self.resolved_ts.load(Ordering::Acquire)
    }

    /// Resolved ts of the sorted output. Never above the barrier unless eventual
    /// consistency is enabled.
    pub fn output_resolved_ts(&self) -> Ts {
        self.output_resolved_ts.load(Ordering::Acquire)
    }

    pub fn barrier_ts(&self) -> Ts {
        self.barrier_ts
    }

    fn clamps_to_barrier(&self) -> bool {
        self.replica_config.consistent.level != ConsistentLevel::Eventual
    }

    fn build_sorter(&mut self) -> Result<Box<dyn EventSorter>, SorterError> {
        let sorter = MemorySorter::new(self.options.output_channel_capacity);
        match self.options.engine {
            SortEngine::Memory => Ok(Box::new(sorter)),
            SortEngine::Unified => {
                let sort_dir = match &self.sort_dir {
                    Some(sort_dir) => Arc::clone(sort_dir),
                    None => {
                        let sort_dir = Arc::new(SortDir::reserve(&self.options)?);
                        self.sort_dir = Some(Arc::clone(&sort_dir));
                        sort_dir
                    }
                };
                Ok(Box::new(sorter.with_sort_dir(sort_dir)))
            }
        }
    }

    async fn add_resolved(&mut self, ts: Ts) -> Result<(), SorterError> {
        let current = self.resolved_ts();
        if ts < current {
            return Err(SorterError::ResolvedTsRegressed {
                current,
                received: ts,
            });
        }
        self.resolved_ts.store(ts, Ordering::Release);
        gauge!(SORTER_RESOLVED_TS, "table" => self.table_id.to_string()).set(ts as f64);

        let mut to_send = ts;
        if ts > self.barrier_ts && self.clamps_to_barrier() {
            counter!(SORTER_CLAMPED_RESOLVED).increment(1);
            to_send = self.barrier_ts;
        }
        self.send_resolved(to_send).await
    }

    async fn send_resolved(&mut self, ts: Ts) -> Result<(), SorterError> {
        let sorter = self.sorter.as_ref().ok_or(SorterError::NotInitialized)?;
        sorter.add_entry(PolymorphicEvent::new_resolved(ts)).await?;
        self.sent_resolved_ts = self.sent_resolved_ts.max(ts);
        Ok(())
    }

    async fn advance_barrier(&mut self, ts: Ts) -> Result<(), SorterError> {
        if ts < self.barrier_ts {
            return Err(SorterError::BarrierTsRegressed {
                current: self.barrier_ts,
                received: ts,
            });
        }
        self.barrier_ts = ts;

        // release what was held back by the previous barrier
        let releasable = self.resolved_ts().min(ts);
        if self.clamps_to_barrier() && releasable > self.sent_resolved_ts {
            self.send_resolved(releasable).await?;
        }
        Ok(())
    }
}

async fn forward_output(
    mut output: mpsc::Receiver<PolymorphicEvent>,
    next: Option<mpsc::Sender<Message>>,
    output_resolved_ts: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = output.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if let PolymorphicEvent::Resolved(ts) = event {
            output_resolved_ts.fetch_max(ts, Ordering::AcqRel);
        }
        if let Some(next) = &next {
            if next.send(Message::PolymorphicEvent(event)).await.is_err() {
                debug!("Next node is gone, stop forwarding sorted events");
                break;
            }
        }
    }
}

#[async_trait]
impl Node for SorterNode {
    type Error = SorterError;

    async fn init(&mut self, ctx: &NodeContext) -> Result<(), SorterError> {
        let mut sorter = match self.sorter.take() {
            Some(sorter) => sorter,
            None => self.build_sorter()?,
        };
        sorter.run(self.cancel.child_token())?;

        if let Some(output) = sorter.take_output() {
            self.output_task = Some(tokio::spawn(forward_output(
                output,
                ctx.next_node().cloned(),
                Arc::clone(&self.output_resolved_ts),
                self.cancel.child_token(),
            )));
        }
        self.sorter = Some(sorter);

        debug!(
            changefeed = %self.changefeed_id,
            table = %self.table_name,
            table_id = self.table_id,
            engine = %self.options.engine,
            "Sorter node initialized"
        );
        Ok(())
    }

    async fn receive(&mut self, ctx: NodeContext) -> Result<(), SorterError> {
        match ctx.message() {
            Message::PolymorphicEvent(PolymorphicEvent::Resolved(ts)) => {
                self.add_resolved(*ts).await
            }
            Message::PolymorphicEvent(row) => {
                let sorter = self.sorter.as_ref().ok_or(SorterError::NotInitialized)?;
                sorter.add_entry(row.clone()).await
            }
            Message::Barrier(ts) => {
                let ts = *ts;
                self.advance_barrier(ts).await?;
                ctx.send_to_next_node(Message::Barrier(ts)).await?;
                Ok(())
            }
            Message::Tick => Ok(ctx.send_to_next_node(Message::Tick).await?),
        }
    }

    async fn destroy(&mut self) -> Result<(), SorterError> {
        self.cancel.cancel();
        if let Some(task) = self.output_task.take() {
            if let Err(err) = task.await {
                warn!(table_id = self.table_id, "Sorter output task failed: {err}");
            }
        }
        self.sorter = None;
        self.sort_dir = None;
        Ok(())
    }
}

impl Drop for SorterNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::assert_that;
    use googletest::matchers::eq;
    use test_log::test;

    /// Passes entries straight through a bounded channel.
    struct CheckSorter {
        tx: mpsc::Sender<PolymorphicEvent>,
        rx: Option<mpsc::Receiver<PolymorphicEvent>>,
    }

    impl CheckSorter {
        fn new() -> Self {
            let (tx, rx) = mpsc::channel(1);
            Self { tx, rx: Some(rx) }
        }
    }

    #[async_trait]
    impl EventSorter for CheckSorter {
        fn run(&mut self, _cancel: CancellationToken) -> Result<(), SorterError> {
            Ok(())
        }

        async fn add_entry(&self, event: PolymorphicEvent) -> Result<(), SorterError> {
            self.tx.send(event).await.map_err(|_| SorterError::Closed)
        }

        fn try_add_entry(&self, event: PolymorphicEvent) -> Result<bool, SorterError> {
            Ok(self.tx.try_send(event).is_ok())
        }

        fn take_output(&mut self) -> Option<mpsc::Receiver<PolymorphicEvent>> {
            self.rx.take()
        }
    }

    fn node(start_ts: Ts) -> SorterNode {
        SorterNode::new(
            "cf".into(),
            "tableName",
            1,
            start_ts,
            ReplicaConfig::default(),
            SorterOptions::default(),
        )
    }

    fn check_node(start_ts: Ts) -> (SorterNode, mpsc::Receiver<PolymorphicEvent>) {
        let mut sorter = CheckSorter::new();
        let output = sorter.take_output().unwrap();
        (node(start_ts).with_sorter(Box::new(sorter)), output)
    }

    #[test(tokio::test)]
    async fn resolved_ts_follows_input() {
        let mut node = node(1).with_sorter(Box::new(MemorySorter::new(16)));
        assert_that!(node.resolved_ts(), eq(1));

        node.receive(NodeContext::new(Message::resolved(2), None))
            .await
            .unwrap();
        assert_that!(node.resolved_ts(), eq(2));
    }

    #[test(tokio::test)]
    async fn resolved_ts_never_exceeds_barrier() {
        let (mut node, mut sorted) = check_node(1);
        let (next_tx, mut next_rx) = mpsc::channel(1);

        node.receive(NodeContext::new(Message::resolved(1), Some(next_tx.clone())))
            .await
            .unwrap();
        assert_eq!(sorted.recv().await, Some(PolymorphicEvent::new_resolved(1)));

        node.receive(NodeContext::new(Message::Barrier(2), Some(next_tx)))
            .await
            .unwrap();
        assert_that!(node.barrier_ts(), eq(2));
        // the barrier travels on to the next node
        assert_eq!(next_rx.recv().await, Some(Message::Barrier(2)));

        node.receive(NodeContext::new(Message::resolved(2), None))
            .await
            .unwrap();
        assert_eq!(sorted.recv().await, Some(PolymorphicEvent::new_resolved(2)));

        node.receive(NodeContext::new(Message::resolved(3), None))
            .await
            .unwrap();
        assert_eq!(sorted.recv().await, Some(PolymorphicEvent::new_resolved(2)));
        assert_that!(node.resolved_ts(), eq(3));

        node.replica_config.consistent.level = ConsistentLevel::Eventual;
        node.receive(NodeContext::new(Message::resolved(4), None))
            .await
            .unwrap();
        assert_eq!(sorted.recv().await, Some(PolymorphicEvent::new_resolved(4)));
    }

    #[test(tokio::test)]
    async fn held_back_resolved_ts_is_released_with_barrier() {
        let (mut node, mut sorted) = check_node(1);

        node.receive(NodeContext::new(Message::resolved(5), None))
            .await
            .unwrap();
        assert_eq!(sorted.recv().await, Some(PolymorphicEvent::new_resolved(1)));

        node.receive(NodeContext::new(Message::Barrier(3), None))
            .await
            .unwrap();
        assert_eq!(sorted.recv().await, Some(PolymorphicEvent::new_resolved(3)));

        node.receive(NodeContext::new(Message::Barrier(10), None))
            .await
            .unwrap();
        assert_eq!(sorted.recv().await, Some(PolymorphicEvent::new_resolved(5)));
    }

    #[test(tokio::test)]
    async fn regressions_are_rejected() {
        let (mut node, mut sorted) = check_node(5);

        let result = node
            .receive(NodeContext::new(Message::resolved(4), None))
            .await;
        assert!(matches!(
            result,
            Err(SorterError::ResolvedTsRegressed {
                current: 5,
                received: 4
            })
        ));

        // equal is fine
        node.receive(NodeContext::new(Message::resolved(5), None))
            .await
            .unwrap();
        assert_eq!(sorted.recv().await, Some(PolymorphicEvent::new_resolved(5)));

        let result = node
            .receive(NodeContext::new(Message::Barrier(4), None))
            .await;
        assert!(matches!(
            result,
            Err(SorterError::BarrierTsRegressed { .. })
        ));
        assert_that!(node.barrier_ts(), eq(5));
    }

    #[test(tokio::test)]
    async fn initialized_node_forwards_sorted_events() {
        let mut node = node(1);
        let (next_tx, mut next_rx) = mpsc::channel(8);
        node.init(&NodeContext::new(Message::Tick, Some(next_tx.clone())))
            .await
            .unwrap();

        node.receive(NodeContext::new(Message::Barrier(10), Some(next_tx)))
            .await
            .unwrap();
        assert_eq!(next_rx.recv().await, Some(Message::Barrier(10)));

        node.receive(NodeContext::new(Message::resolved(7), None))
            .await
            .unwrap();
        assert_eq!(next_rx.recv().await, Some(Message::resolved(7)));
        assert_that!(node.output_resolved_ts(), eq(7));

        node.destroy().await.unwrap();
    }

    #[test(tokio::test)]
    async fn unified_engine_sort_dir_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let options = SorterOptions {
            engine: SortEngine::Unified,
            sort_dir: dir.path().to_path_buf(),
            capture_addr: "0.0.0.0:0".to_owned(),
            ..Default::default()
        };

        // a previous owner of the sort dir went away without cleaning up
        std::mem::forget(SortDir::reserve(&options).unwrap());

        let mut node = SorterNode::new(
            "test-cf".into(),
            "test",
            0,
            1,
            ReplicaConfig::default(),
            options,
        );
        let err = node
            .init(&NodeContext::new(Message::Tick, None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("file lock conflict"));
    }
}
