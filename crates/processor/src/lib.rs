// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Processor side of the changefeed: the per-table pipeline nodes sorting row changes and
//! holding resolved timestamps back at the barrier set by the owner.

mod metric_definitions;
pub mod pipeline;
pub mod sorter;

pub use metric_definitions::describe_metrics;
pub use sorter::{SorterError, SorterNode};
