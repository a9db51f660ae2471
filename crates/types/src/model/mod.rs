// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Data model of the reactor state and of the events flowing through a changefeed.

mod changefeed;
mod ddl;
mod event;
mod task;

pub use changefeed::*;
pub use ddl::*;
pub use event::*;
pub use task::*;
