// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use cdc_types::model::PolymorphicEvent;
use cdc_types::Ts;

/// Message flowing between the nodes of a table pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    PolymorphicEvent(PolymorphicEvent),
    /// Upper bound for resolved timestamps emitted by downstream nodes.
    Barrier(Ts),
    Tick,
}

impl Message {
    pub fn resolved(ts: Ts) -> Self {
        Message::PolymorphicEvent(PolymorphicEvent::new_resolved(ts))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("next pipeline node is gone")]
pub struct NextNodeClosed;

/// Context handed to a node together with the message it has to process.
#[derive(Debug)]
pub struct NodeContext {
    message: Message,
    next: Option<mpsc::Sender<Message>>,
}

impl NodeContext {
    pub fn new(message: Message, next: Option<mpsc::Sender<Message>>) -> Self {
        Self { message, next }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn next_node(&self) -> Option<&mpsc::Sender<Message>> {
        self.next.as_ref()
    }

    /// Forwards a message to the next node. Messages of the last node are dropped.
    pub async fn send_to_next_node(&self, message: Message) -> Result<(), NextNodeClosed> {
        match &self.next {
            Some(next) => next.send(message).await.map_err(|_| NextNodeClosed),
            None => {
                trace!(?message, "no next node");
                Ok(())
            }
        }
    }
}

/// A stage of a table pipeline.
#[async_trait]
pub trait Node: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Prepares the node. `ctx` carries the link to the next node.
    async fn init(&mut self, ctx: &NodeContext) -> Result<(), Self::Error>;

    async fn receive(&mut self, ctx: NodeContext) -> Result<(), Self::Error>;

    async fn destroy(&mut self) -> Result<(), Self::Error>;
}
