// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The changefeed owner: one controller per changefeed coordinating the DDL puller, the DDL
//! sink and the table processors through timestamp barriers.

pub mod barrier;
mod changefeed;
pub mod ddl_comment;
pub mod ddl_puller;
pub mod ddl_sink;
mod error;
mod feed_state_manager;
pub mod filter;
pub mod gc;
mod metric_definitions;
mod owner;
pub mod redo;
mod scheduler;
pub mod schema;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use changefeed::{Changefeed, OwnerContext};
pub use error::{error_channel, ErrorSender, OwnerError};
pub use feed_state_manager::FeedStateManager;
pub use metric_definitions::describe_metrics;
pub use owner::Owner;
pub use scheduler::TableScheduler;
