// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::str::FromStr;

use cdc_types::{CaptureId, ChangeFeedId};

/// Prefix shared by every key of the reactor state.
pub const CDC_PREFIX: &str = "/tidb/cdc";

const CAPTURE: &str = "capture";
const CHANGEFEED_INFO: &str = "changefeed/info";
const CHANGEFEED_STATUS: &str = "job";
const TASK_STATUS: &str = "task/status";
const TASK_POSITION: &str = "task/position";
const TASK_WORKLOAD: &str = "task/workload";

/// Key of one entry in the reactor state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CdcKey {
    Capture(CaptureId),
    ChangefeedInfo(ChangeFeedId),
    ChangefeedStatus(ChangeFeedId),
    TaskStatus {
        capture: CaptureId,
        changefeed: ChangeFeedId,
    },
    TaskPosition {
        capture: CaptureId,
        changefeed: ChangeFeedId,
    },
    TaskWorkload {
        capture: CaptureId,
        changefeed: ChangeFeedId,
    },
}

impl CdcKey {
    /// The changefeed the key belongs to. Capture keys belong to none.
    pub fn changefeed(&self) -> Option<&ChangeFeedId> {
        match self {
            CdcKey::Capture(_) => None,
            CdcKey::ChangefeedInfo(changefeed) | CdcKey::ChangefeedStatus(changefeed) => {
                Some(changefeed)
            }
            CdcKey::TaskStatus { changefeed, .. }
            | CdcKey::TaskPosition { changefeed, .. }
            | CdcKey::TaskWorkload { changefeed, .. } => Some(changefeed),
        }
    }
}

impl fmt::Display for CdcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CdcKey::Capture(capture) => write!(f, "{CDC_PREFIX}/{CAPTURE}/{capture}"),
            CdcKey::ChangefeedInfo(changefeed) => {
                write!(f, "{CDC_PREFIX}/{CHANGEFEED_INFO}/{changefeed}")
            }
            CdcKey::ChangefeedStatus(changefeed) => {
                write!(f, "{CDC_PREFIX}/{CHANGEFEED_STATUS}/{changefeed}")
            }
            CdcKey::TaskStatus {
                capture,
                changefeed,
            } => write!(f, "{CDC_PREFIX}/{TASK_STATUS}/{capture}/{changefeed}"),
            CdcKey::TaskPosition {
                capture,
                changefeed,
            } => write!(f, "{CDC_PREFIX}/{TASK_POSITION}/{capture}/{changefeed}"),
            CdcKey::TaskWorkload {
                capture,
                changefeed,
            } => write!(f, "{CDC_PREFIX}/{TASK_WORKLOAD}/{capture}/{changefeed}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown reactor key '{0}'")]
pub struct KeyParseError(String);

fn task_key(rest: &str) -> Option<(CaptureId, ChangeFeedId)> {
    let (capture, changefeed) = rest.split_once('/')?;
    if capture.is_empty() || changefeed.is_empty() || changefeed.contains('/') {
        return None;
    }
    Some((CaptureId::from(capture), ChangeFeedId::from(changefeed)))
}

fn single_id(rest: &str) -> Option<&str> {
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

impl FromStr for CdcKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = || {
            let rest = s.strip_prefix(CDC_PREFIX)?.strip_prefix('/')?;

            if let Some(rest) = rest.strip_prefix(TASK_STATUS).and_then(|r| r.strip_prefix('/')) {
                let (capture, changefeed) = task_key(rest)?;
                return Some(CdcKey::TaskStatus {
                    capture,
                    changefeed,
                });
            }
            if let Some(rest) = rest
                .strip_prefix(TASK_POSITION)
                .and_then(|r| r.strip_prefix('/'))
            {
                let (capture, changefeed) = task_key(rest)?;
                return Some(CdcKey::TaskPosition {
                    capture,
                    changefeed,
                });
            }
            if let Some(rest) = rest
                .strip_prefix(TASK_WORKLOAD)
                .and_then(|r| r.strip_prefix('/'))
            {
                let (capture, changefeed) = task_key(rest)?;
                return Some(CdcKey::TaskWorkload {
                    capture,
                    changefeed,
                });
            }
            if let Some(rest) = rest
                .strip_prefix(CHANGEFEED_INFO)
                .and_then(|r| r.strip_prefix('/'))
            {
                return single_id(rest).map(|id| CdcKey::ChangefeedInfo(id.into()));
            }
            if let Some(rest) = rest
                .strip_prefix(CHANGEFEED_STATUS)
                .and_then(|r| r.strip_prefix('/'))
            {
                return single_id(rest).map(|id| CdcKey::ChangefeedStatus(id.into()));
            }
            if let Some(rest) = rest.strip_prefix(CAPTURE).and_then(|r| r.strip_prefix('/')) {
                return single_id(rest).map(|id| CdcKey::Capture(id.into()));
            }
            None
        };

        parse().ok_or_else(|| KeyParseError(s.to_owned()))
    }
}
