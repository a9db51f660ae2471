// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use cdc_types::model::{OpType, PolymorphicEvent, RowChange};

use super::{EventSorter, SortDir, SorterError};
use crate::metric_definitions::SORTER_EVENTS_IN;

/// Buffers rows in memory. On every resolved event the buffered rows up to its ts are
/// emitted in commit order, followed by the resolved event itself.
pub struct MemorySorter {
    input_tx: mpsc::UnboundedSender<PolymorphicEvent>,
    input_rx: Option<mpsc::UnboundedReceiver<PolymorphicEvent>>,
    output_tx: Option<mpsc::Sender<PolymorphicEvent>>,
    output_rx: Option<mpsc::Receiver<PolymorphicEvent>>,
    /// Held so the directory stays reserved.
    _sort_dir: Option<Arc<SortDir>>,
}

impl MemorySorter {
    pub fn new(output_capacity: usize) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(output_capacity.max(1));
        Self {
            input_tx,
            input_rx: Some(input_rx),
            output_tx: Some(output_tx),
            output_rx: Some(output_rx),
            _sort_dir: None,
        }
    }

    /// Keeps the sort dir reserved for as long as the sorter lives.
    pub fn with_sort_dir(mut self, sort_dir: Arc<SortDir>) -> Self {
        self._sort_dir = Some(sort_dir);
        self
    }
}

fn sort_key(row: &RowChange) -> (u64, u64, bool) {
    // deletes go before puts of the same transaction
    (row.commit_ts, row.start_ts, row.op != OpType::Delete)
}

async fn sort_loop(
    mut input: mpsc::UnboundedReceiver<PolymorphicEvent>,
    output: mpsc::Sender<PolymorphicEvent>,
    cancel: CancellationToken,
) {
    let mut pending: Vec<RowChange> = Vec::new();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = input.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            PolymorphicEvent::Row(row) => pending.push(row),
            PolymorphicEvent::Resolved(ts) => {
                pending.sort_by_key(sort_key);
                let ready = pending.partition_point(|row| row.commit_ts <= ts);
                trace!(resolved_ts = ts, ready, buffered = pending.len(), "flush rows");
                for row in pending.drain(..ready) {
                    if output.send(PolymorphicEvent::Row(row)).await.is_err() {
                        return;
                    }
                }
                if output.send(PolymorphicEvent::Resolved(ts)).await.is_err() {
                    return;
                }
            }
        }
    }
    debug!(buffered = pending.len(), "Memory sorter stopped");
}

#[async_trait]
impl EventSorter for MemorySorter {
    fn run(&mut self, cancel: CancellationToken) -> Result<(), SorterError> {
        let (Some(input), Some(output)) = (self.input_rx.take(), self.output_tx.take()) else {
            return Err(SorterError::AlreadyRunning);
        };
        tokio::spawn(sort_loop(input, output, cancel));
        Ok(())
    }

    async fn add_entry(&self, event: PolymorphicEvent) -> Result<(), SorterError> {
        self.try_add_entry(event).map(|_| ())
    }

    fn try_add_entry(&self, event: PolymorphicEvent) -> Result<bool, SorterError> {
        let kind = if event.is_resolved() { "resolved" } else { "row" };
        counter!(SORTER_EVENTS_IN, "kind" => kind).increment(1);
        self.input_tx
            .send(event)
            .map(|()| true)
            .map_err(|_| SorterError::Closed)
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<PolymorphicEvent>> {
        self.output_rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use googletest::prelude::*;
    use test_log::test;

    use cdc_types::Ts;

    fn row(commit_ts: Ts, start_ts: Ts, op: OpType) -> PolymorphicEvent {
        PolymorphicEvent::Row(RowChange {
            table_id: 1,
            start_ts,
            commit_ts,
            op,
            key: Bytes::from_static(b"k"),
            value: Bytes::new(),
        })
    }

    #[test(tokio::test)]
    async fn rows_are_released_in_commit_order() {
        let mut sorter = MemorySorter::new(16);
        let mut output = sorter.take_output().unwrap();
        let cancel = CancellationToken::new();
        sorter.run(cancel.clone()).unwrap();

        sorter.add_entry(row(5, 4, OpType::Put)).await.unwrap();
        sorter.add_entry(row(3, 2, OpType::Put)).await.unwrap();
        sorter.add_entry(row(3, 2, OpType::Delete)).await.unwrap();
        sorter.add_entry(row(9, 8, OpType::Put)).await.unwrap();
        sorter
            .add_entry(PolymorphicEvent::new_resolved(5))
            .await
            .unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(output.recv().await.unwrap());
        }
        assert_eq!(
            received,
            vec![
                row(3, 2, OpType::Delete),
                row(3, 2, OpType::Put),
                row(5, 4, OpType::Put),
                PolymorphicEvent::new_resolved(5),
            ]
        );

        sorter
            .add_entry(PolymorphicEvent::new_resolved(10))
            .await
            .unwrap();
        assert_eq!(output.recv().await, Some(row(9, 8, OpType::Put)));
        assert_eq!(output.recv().await, Some(PolymorphicEvent::new_resolved(10)));

        cancel.cancel();
        assert_that!(output.recv().await.is_none(), eq(true));
    }

    #[test(tokio::test)]
    async fn runs_only_once() {
        let mut sorter = MemorySorter::new(1);
        sorter.run(CancellationToken::new()).unwrap();
        assert!(matches!(
            sorter.run(CancellationToken::new()),
            Err(SorterError::AlreadyRunning)
        ));
    }
}
