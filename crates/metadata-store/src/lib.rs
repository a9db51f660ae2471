// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Versioned key-value store holding the reactor state of all changefeeds.

mod metadata_store;
mod metric_definitions;
#[cfg(any(test, feature = "test-util"))]
mod test_util;

pub use metadata_store::*;
pub use metric_definitions::describe_metrics;
#[cfg(any(test, feature = "test-util"))]
pub use test_util::InMemoryMetadataStore;
