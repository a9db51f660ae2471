// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Core types shared by the changefeed owner, the reactor state and the processor pipeline.

mod version;

pub mod config;
pub mod errors;
pub mod identifiers;
pub mod model;
pub mod oracle;
pub mod retries;

pub use identifiers::{CaptureId, ChangeFeedId, JobId, SchemaId, TableId};
pub use version::*;

/// A hybrid logical timestamp issued by the upstream timestamp oracle.
///
/// The upper bits hold the physical time in milliseconds, the lower
/// [`oracle::LOGICAL_BITS`] bits a logical counter. See [`oracle`] for helpers.
pub type Ts = u64;
