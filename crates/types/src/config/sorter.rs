// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SortEngine {
    /// Events are buffered in memory only.
    #[default]
    Memory,
    /// Sorters share a sort directory which is reserved exclusively for one capture.
    Unified,
}

/// # Sorter options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct SorterOptions {
    pub engine: SortEngine,
    /// Working directory of the unified engine. Holds the capture's lock file.
    pub sort_dir: PathBuf,
    /// Advertised address of the capture owning the sort directory.
    pub capture_addr: String,
    /// Capacity of the channel between a sorter and its consumer.
    pub output_channel_capacity: usize,
}

impl Default for SorterOptions {
    fn default() -> Self {
        Self {
            engine: SortEngine::Memory,
            sort_dir: PathBuf::from("/tmp/cdc_sort"),
            capture_addr: "127.0.0.1:8300".to_owned(),
            output_channel_capacity: 128,
        }
    }
}
