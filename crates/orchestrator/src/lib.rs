// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Reactor state of the changefeed owner and the optimistic patches writing it back.

mod keys;
mod metric_definitions;
mod patch;
mod state;
#[cfg(any(test, feature = "test-util"))]
mod tester;
mod worker;

pub use keys::{CdcKey, KeyParseError, CDC_PREFIX};
pub use metric_definitions::describe_metrics;
pub use patch::{PatchError, PatchFn, SingleDataPatch};
pub use state::{ChangefeedReactorState, GlobalReactorState, ReactorState};
#[cfg(any(test, feature = "test-util"))]
pub use tester::ReactorStateTester;
pub use worker::{ReactorError, ReactorWorker};
