// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod lock;
mod memory;
mod node;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cdc_types::model::PolymorphicEvent;
use cdc_types::Ts;

use crate::pipeline::NextNodeClosed;

pub use lock::SortDir;
pub use memory::MemorySorter;
pub use node::SorterNode;

#[derive(Debug, thiserror::Error)]
pub enum SorterError {
    #[error("file lock conflict: {0} is held by another capture")]
    FileLockConflict(String),
    #[error("failed to prepare sort dir: {0}")]
    Io(#[from] std::io::Error),
    #[error("resolved ts regressed from {current} to {received}")]
    ResolvedTsRegressed { current: Ts, received: Ts },
    #[error("barrier ts regressed from {current} to {received}")]
    BarrierTsRegressed { current: Ts, received: Ts },
    #[error("sorter is already running")]
    AlreadyRunning,
    #[error("sorter is not initialized")]
    NotInitialized,
    #[error("sorter is closed")]
    Closed,
    #[error(transparent)]
    NextNode(#[from] NextNodeClosed),
}

/// Sorts the events of one table by commit ts. Rows are held back until a resolved event
/// covers them.
#[async_trait]
pub trait EventSorter: Send + Sync {
    /// Starts background processing.
    fn run(&mut self, cancel: CancellationToken) -> Result<(), SorterError>;

    async fn add_entry(&self, event: PolymorphicEvent) -> Result<(), SorterError>;

    /// Adds an entry without waiting. Returns false if the sorter is full.
    fn try_add_entry(&self, event: PolymorphicEvent) -> Result<bool, SorterError>;

    /// Hands out the sorted output. Only the first call returns the receiver.
    fn take_output(&mut self) -> Option<mpsc::Receiver<PolymorphicEvent>>;
}
