// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::Ts;

/// # Replica configuration
///
/// Per changefeed replication settings. Stored as part of the changefeed info.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct ReplicaConfig {
    /// Whether schema and table names are matched case sensitively by the filter.
    pub case_sensitive: bool,

    /// Fail the changefeed early when its checkpoint falls behind the GC safepoint.
    pub check_gc_safe_point: bool,

    /// # Sync points
    ///
    /// When enabled, a sync point is recorded downstream every `sync-point-interval` so
    /// that upstream and downstream snapshots can be compared.
    pub sync_point_enabled: bool,

    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub sync_point_interval: humantime::Duration,

    pub filter: FilterConfig,
    pub consistent: ConsistentConfig,
    pub cyclic: CyclicConfig,
}

impl ReplicaConfig {
    pub fn sync_point_interval(&self) -> Duration {
        *self.sync_point_interval
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            check_gc_safe_point: true,
            sync_point_enabled: false,
            sync_point_interval: Duration::from_secs(10 * 60).into(),
            filter: FilterConfig::default(),
            consistent: ConsistentConfig::default(),
            cyclic: CyclicConfig::default(),
        }
    }
}

/// Consistency guarantee of the downstream when the changefeed is interrupted.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConsistentLevel {
    /// Rows may be applied partially after a crash.
    #[default]
    None,
    /// Changes are recorded in a redo log before they reach the downstream, so the
    /// downstream can be brought to a consistent snapshot after a crash.
    Eventual,
}

/// # Consistent replication
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct ConsistentConfig {
    pub level: ConsistentLevel,

    /// Maximum size of a single redo log file in MiB.
    pub max_log_size: u64,

    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub flush_interval: humantime::Duration,

    /// Redo log storage uri, e.g. `local:///data/redo` or `nfs:///mnt/redo`.
    pub storage: String,
}

impl ConsistentConfig {
    pub fn is_enabled(&self) -> bool {
        self.level == ConsistentLevel::Eventual
    }
}

impl Default for ConsistentConfig {
    fn default() -> Self {
        Self {
            level: ConsistentLevel::None,
            max_log_size: 64,
            flush_interval: Duration::from_secs(2).into(),
            storage: String::new(),
        }
    }
}

/// # Table filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct FilterConfig {
    /// Rules of the form `schema.table` with `*` and `?` wildcards. A leading `!`
    /// excludes matching tables. The last matching rule wins.
    pub rules: Vec<String>,

    /// Transactions started at these timestamps are not replicated.
    pub ignore_txn_start_ts: Vec<Ts>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            rules: vec!["*.*".to_owned()],
            ignore_txn_start_ts: Vec::new(),
        }
    }
}

/// # Cyclic replication
///
/// Replication between clusters in both directions. Mark tables tag the rows written by
/// each replica so they are not replicated back.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default)]
pub struct CyclicConfig {
    pub enable: bool,
    pub replica_id: u64,
    pub filter_replica_ids: Vec<u64>,
    /// Replicate DDLs as well. When disabled DDLs are acknowledged without being executed.
    pub sync_ddl: bool,
}

impl CyclicConfig {
    pub fn is_enabled(&self) -> bool {
        self.enable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config: ReplicaConfig = serde_json::from_str(
            r#"{"sync-point-enabled": true, "sync-point-interval": "1s", "consistent": {"level": "eventual", "storage": "nfs:///tmp/redo"}}"#,
        )
        .unwrap();

        assert_that!(config.case_sensitive, eq(true));
        assert_that!(config.sync_point_interval(), eq(Duration::from_secs(1)));
        assert_that!(config.consistent.is_enabled(), eq(true));
        assert_that!(config.consistent.max_log_size, eq(64));
        assert_eq!(config.filter.rules, vec!["*.*".to_owned()]);
        assert_that!(config.cyclic.is_enabled(), eq(false));
    }

    #[test]
    fn builder_overrides() {
        let config = ReplicaConfigBuilder::default()
            .consistent(
                ConsistentConfigBuilder::default()
                    .level(ConsistentLevel::Eventual)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        assert_eq!(config.consistent.level.to_string(), "eventual");
        assert_that!(config.check_gc_safe_point, eq(true));
    }
}
