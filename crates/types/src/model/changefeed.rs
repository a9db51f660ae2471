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

use crate::config::ReplicaConfig;
use crate::{ChangeFeedId, Ts};

/// Errors older than this are dropped from [`ChangeFeedInfo::error_history`].
pub const ERROR_HISTORY_GC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Lifecycle state of a changefeed.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FeedState {
    #[default]
    Normal,
    /// Paused by an administrator.
    Stopped,
    /// Reached its target ts.
    Finished,
    /// Stopped by an error. Can be resumed.
    Failed,
    /// Removal was requested. The keys disappear once every resource is released.
    Removed,
}

impl FeedState {
    /// Whether the changefeed should not make progress in this state.
    pub fn is_terminated(self) -> bool {
        matches!(
            self,
            FeedState::Stopped | FeedState::Failed | FeedState::Removed | FeedState::Finished
        )
    }
}

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AdminJobType {
    #[default]
    None,
    Stop,
    Resume,
    Remove,
    Finish,
}

/// Administrative command targeting one changefeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminJob {
    pub changefeed_id: ChangeFeedId,
    pub job_type: AdminJobType,
}

impl AdminJob {
    pub fn new(changefeed_id: ChangeFeedId, job_type: AdminJobType) -> Self {
        Self {
            changefeed_id,
            job_type,
        }
    }
}

/// Error which stopped a changefeed, as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningError {
    /// Address of the capture which hit the error.
    pub addr: String,
    pub code: String,
    pub message: String,
}

/// Desired state of a changefeed. Written by administrators; the owner only changes the
/// lifecycle fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChangeFeedInfo {
    pub sink_uri: String,
    /// Creation time in unix milliseconds.
    #[serde(default)]
    pub create_time: u64,
    pub start_ts: Ts,
    /// Zero means the changefeed never finishes.
    #[serde(default)]
    pub target_ts: Ts,
    #[serde(default)]
    pub admin_job_type: AdminJobType,
    #[serde(default)]
    pub state: FeedState,
    #[serde(default)]
    pub error: Option<RunningError>,
    /// Times (unix milliseconds) at which errors were reported.
    #[serde(default)]
    pub error_history: Vec<u64>,
    #[serde(default)]
    pub config: ReplicaConfig,
    #[serde(default)]
    pub creator_version: String,
}

impl ChangeFeedInfo {
    pub fn new(sink_uri: impl Into<String>, start_ts: Ts) -> Self {
        Self {
            sink_uri: sink_uri.into(),
            create_time: 0,
            start_ts,
            target_ts: 0,
            admin_job_type: AdminJobType::None,
            state: FeedState::Normal,
            error: None,
            error_history: Vec::new(),
            config: ReplicaConfig::default(),
            creator_version: String::new(),
        }
    }

    /// Target ts, or [`Ts::MAX`] if the changefeed has none.
    pub fn target_ts(&self) -> Ts {
        if self.target_ts > 0 {
            self.target_ts
        } else {
            Ts::MAX
        }
    }

    /// Checkpoint recorded in `status`, falling back to the start ts.
    pub fn checkpoint_ts(&self, status: Option<&ChangeFeedStatus>) -> Ts {
        status.map(|s| s.checkpoint_ts).unwrap_or(self.start_ts)
    }

    /// Drops history entries older than [`ERROR_HISTORY_GC_INTERVAL`]. Returns true if
    /// anything was dropped.
    pub fn clean_up_outdated_error_history(&mut self, now_ms: u64) -> bool {
        let window = ERROR_HISTORY_GC_INTERVAL.as_millis() as u64;
        let before = self.error_history.len();
        self.error_history
            .retain(|reported| now_ms.saturating_sub(*reported) < window);
        self.error_history.len() != before
    }
}

/// Observed progress of a changefeed. Written by the owner only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChangeFeedStatus {
    /// Everything committed at or below this ts was written downstream.
    pub checkpoint_ts: Ts,
    /// Upper bound of change visibility handed to the processors.
    pub resolved_ts: Ts,
    #[serde(default)]
    pub admin_job_type: AdminJobType,
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;

    #[test]
    fn target_ts_zero_is_unbounded() {
        let mut info = ChangeFeedInfo::new("blackhole://", 10);
        assert_that!(info.target_ts(), eq(Ts::MAX));
        info.target_ts = 20;
        assert_that!(info.target_ts(), eq(20));
    }

    #[test]
    fn checkpoint_falls_back_to_start_ts() {
        let info = ChangeFeedInfo::new("blackhole://", 10);
        assert_that!(info.checkpoint_ts(None), eq(10));
        let status = ChangeFeedStatus {
            checkpoint_ts: 15,
            resolved_ts: 17,
            admin_job_type: AdminJobType::None,
        };
        assert_that!(info.checkpoint_ts(Some(&status)), eq(15));
    }

    #[test]
    fn outdated_error_history_is_dropped() {
        let mut info = ChangeFeedInfo::new("blackhole://", 10);
        let now = 100 * 60 * 1000;
        let window = ERROR_HISTORY_GC_INTERVAL.as_millis() as u64;
        info.error_history = vec![now - window - 1, now - window + 1, now];

        assert_that!(info.clean_up_outdated_error_history(now), eq(true));
        assert_eq!(info.error_history, vec![now - window + 1, now]);
        assert_that!(info.clean_up_outdated_error_history(now), eq(false));
    }

    #[test]
    fn info_json_uses_kebab_case() {
        let mut info = ChangeFeedInfo::new("blackhole://", 10);
        info.state = FeedState::Stopped;
        info.admin_job_type = AdminJobType::Stop;
        let json = serde_json::to_value(&info).unwrap();
        assert_that!(json["start-ts"].as_u64(), some(eq(10)));
        assert_that!(json["state"].as_str(), some(eq("stopped")));
        assert_that!(json["admin-job-type"].as_str(), some(eq("stop")));

        let parsed: ChangeFeedInfo =
            serde_json::from_str(r#"{"sink-uri": "blackhole://", "start-ts": 42}"#).unwrap();
        assert_that!(parsed.state, eq(FeedState::Normal));
        assert_that!(parsed.target_ts(), eq(Ts::MAX));
    }
}
