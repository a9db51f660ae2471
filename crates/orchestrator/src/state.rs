// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use cdc_types::model::{
    CaptureInfo, ChangeFeedInfo, ChangeFeedStatus, TaskPosition, TaskStatus, TaskWorkload,
};
use cdc_types::{CaptureId, ChangeFeedId};

use crate::patch::decode;
use crate::{CdcKey, PatchError, SingleDataPatch};

/// In-memory view of the reactor state which queues patches instead of writing directly.
pub trait ReactorState {
    /// Applies an observed value. `None` means the key was deleted.
    fn update(&mut self, key: &CdcKey, value: Option<&[u8]>) -> Result<(), PatchError>;

    /// Drains the patches queued since the last call.
    fn take_patches(&mut self) -> Vec<SingleDataPatch>;
}

/// Reactor state of a single changefeed.
#[derive(Debug)]
pub struct ChangefeedReactorState {
    pub id: ChangeFeedId,
    pub info: Option<ChangeFeedInfo>,
    pub status: Option<ChangeFeedStatus>,
    pub task_statuses: BTreeMap<CaptureId, TaskStatus>,
    pub task_positions: BTreeMap<CaptureId, TaskPosition>,
    pub workloads: BTreeMap<CaptureId, TaskWorkload>,
    pending_patches: Vec<SingleDataPatch>,
}

impl ChangefeedReactorState {
    pub fn new(id: ChangeFeedId) -> Self {
        Self {
            id,
            info: None,
            status: None,
            task_statuses: BTreeMap::new(),
            task_positions: BTreeMap::new(),
            workloads: BTreeMap::new(),
            pending_patches: Vec::new(),
        }
    }

    /// Whether any key of the changefeed is still present.
    pub fn exists(&self) -> bool {
        self.info.is_some()
            || self.status.is_some()
            || !self.task_statuses.is_empty()
            || !self.task_positions.is_empty()
            || !self.workloads.is_empty()
    }

    /// Captures holding at least one task entry for this changefeed.
    pub fn captures_with_tasks(&self) -> Vec<CaptureId> {
        let mut captures: Vec<CaptureId> = self
            .task_statuses
            .keys()
            .chain(self.task_positions.keys())
            .chain(self.workloads.keys())
            .cloned()
            .collect();
        captures.sort();
        captures.dedup();
        captures
    }

    pub fn patch_info<F>(&mut self, func: F)
    where
        F: FnMut(Option<ChangeFeedInfo>) -> Result<(Option<ChangeFeedInfo>, bool), PatchError>
            + Send
            + Sync
            + 'static,
    {
        let key = CdcKey::ChangefeedInfo(self.id.clone());
        self.pending_patches.push(SingleDataPatch::typed(key, func));
    }

    pub fn patch_status<F>(&mut self, func: F)
    where
        F: FnMut(
                Option<ChangeFeedStatus>,
            ) -> Result<(Option<ChangeFeedStatus>, bool), PatchError>
            + Send
            + Sync
            + 'static,
    {
        let key = CdcKey::ChangefeedStatus(self.id.clone());
        self.pending_patches.push(SingleDataPatch::typed(key, func));
    }

    pub fn patch_task_status<F>(&mut self, capture: CaptureId, func: F)
    where
        F: FnMut(Option<TaskStatus>) -> Result<(Option<TaskStatus>, bool), PatchError>
            + Send
            + Sync
            + 'static,
    {
        let key = CdcKey::TaskStatus {
            capture,
            changefeed: self.id.clone(),
        };
        self.pending_patches.push(SingleDataPatch::typed(key, func));
    }

    pub fn patch_task_position<F>(&mut self, capture: CaptureId, func: F)
    where
        F: FnMut(Option<TaskPosition>) -> Result<(Option<TaskPosition>, bool), PatchError>
            + Send
            + Sync
            + 'static,
    {
        let key = CdcKey::TaskPosition {
            capture,
            changefeed: self.id.clone(),
        };
        self.pending_patches.push(SingleDataPatch::typed(key, func));
    }

    pub fn patch_task_workload<F>(&mut self, capture: CaptureId, func: F)
    where
        F: FnMut(Option<TaskWorkload>) -> Result<(Option<TaskWorkload>, bool), PatchError>
            + Send
            + Sync
            + 'static,
    {
        let key = CdcKey::TaskWorkload {
            capture,
            changefeed: self.id.clone(),
        };
        self.pending_patches.push(SingleDataPatch::typed(key, func));
    }

    /// Queues deletes of every task entry of `capture`.
    pub fn clean_capture(&mut self, capture: &CaptureId) {
        if self.task_statuses.contains_key(capture) {
            self.patch_task_status(capture.clone(), |status| Ok((None, status.is_some())));
        }
        if self.task_positions.contains_key(capture) {
            self.patch_task_position(capture.clone(), |position| {
                Ok((None, position.is_some()))
            });
        }
        if self.workloads.contains_key(capture) {
            self.patch_task_workload(capture.clone(), |workload| {
                Ok((None, workload.is_some()))
            });
        }
    }
}

fn apply_value<T: serde::de::DeserializeOwned>(
    key: &CdcKey,
    value: Option<&[u8]>,
) -> Result<Option<T>, PatchError> {
    value
        .map(|value| decode(&key.to_string(), value))
        .transpose()
}

fn set_entry<T>(map: &mut BTreeMap<CaptureId, T>, capture: &CaptureId, value: Option<T>) {
    match value {
        Some(value) => {
            map.insert(capture.clone(), value);
        }
        None => {
            map.remove(capture);
        }
    }
}

impl ReactorState for ChangefeedReactorState {
    fn update(&mut self, key: &CdcKey, value: Option<&[u8]>) -> Result<(), PatchError> {
        if key.changefeed() != Some(&self.id) {
            return Ok(());
        }
        trace!(changefeed = %self.id, %key, deleted = value.is_none(), "update reactor state");

        match key {
            CdcKey::ChangefeedInfo(_) => self.info = apply_value(key, value)?,
            CdcKey::ChangefeedStatus(_) => self.status = apply_value(key, value)?,
            CdcKey::TaskStatus { capture, .. } => {
                let value = apply_value(key, value)?;
                set_entry(&mut self.task_statuses, capture, value);
            }
            CdcKey::TaskPosition { capture, .. } => {
                let value = apply_value(key, value)?;
                set_entry(&mut self.task_positions, capture, value);
            }
            CdcKey::TaskWorkload { capture, .. } => {
                let value = apply_value(key, value)?;
                set_entry(&mut self.workloads, capture, value);
            }
            CdcKey::Capture(_) => {}
        }
        Ok(())
    }

    fn take_patches(&mut self) -> Vec<SingleDataPatch> {
        std::mem::take(&mut self.pending_patches)
    }
}

/// Reactor state of the whole cluster: live captures and all changefeeds.
#[derive(Debug, Default)]
pub struct GlobalReactorState {
    pub captures: BTreeMap<CaptureId, CaptureInfo>,
    pub changefeeds: BTreeMap<ChangeFeedId, ChangefeedReactorState>,
}

impl GlobalReactorState {
    pub fn live_captures(&self) -> impl Iterator<Item = &CaptureInfo> {
        self.captures.values()
    }
}

impl ReactorState for GlobalReactorState {
    fn update(&mut self, key: &CdcKey, value: Option<&[u8]>) -> Result<(), PatchError> {
        match key {
            CdcKey::Capture(capture) => {
                let info = apply_value(key, value)?;
                set_entry(&mut self.captures, capture, info);
            }
            other => {
                let Some(id) = other.changefeed() else {
                    return Ok(());
                };
                let changefeed = self
                    .changefeeds
                    .entry(id.clone())
                    .or_insert_with(|| ChangefeedReactorState::new(id.clone()));
                changefeed.update(key, value)?;
                if !changefeed.exists() {
                    debug!(changefeed = %id, "changefeed state is gone");
                    self.changefeeds.remove(id);
                }
            }
        }
        Ok(())
    }

    fn take_patches(&mut self) -> Vec<SingleDataPatch> {
        self.changefeeds
            .values_mut()
            .flat_map(|changefeed| changefeed.take_patches())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;

    fn json<T: serde::Serialize>(value: &T) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[test]
    fn changefeed_state_follows_updates() {
        let mut state = ChangefeedReactorState::new("cf".into());
        let info = ChangeFeedInfo::new("blackhole://", 10);
        state
            .update(&CdcKey::ChangefeedInfo("cf".into()), Some(&json(&info)))
            .unwrap();
        state
            .update(
                &CdcKey::TaskPosition {
                    capture: "c1".into(),
                    changefeed: "cf".into(),
                },
                Some(&json(&TaskPosition::default())),
            )
            .unwrap();
        // belongs to another changefeed
        state
            .update(&CdcKey::ChangefeedInfo("other".into()), Some(b"garbage"))
            .unwrap();

        assert_eq!(state.info, Some(info));
        assert_that!(state.task_positions, len(eq(1)));
        assert_eq!(state.captures_with_tasks(), vec![CaptureId::from("c1")]);

        state
            .update(
                &CdcKey::TaskPosition {
                    capture: "c1".into(),
                    changefeed: "cf".into(),
                },
                None,
            )
            .unwrap();
        assert_that!(state.task_positions, len(eq(0)));
    }

    #[test]
    fn patches_are_queued_until_taken() {
        let mut state = ChangefeedReactorState::new("cf".into());
        state.patch_status(|status| Ok((status, false)));
        state.patch_task_status("c1".into(), |status| Ok((status, false)));
        let patches = state.take_patches();
        assert_that!(patches, len(eq(2)));
        assert_eq!(patches[0].key, CdcKey::ChangefeedStatus("cf".into()));
        assert_that!(state.take_patches(), len(eq(0)));
    }

    #[test]
    fn global_state_drops_empty_changefeeds() {
        let mut state = GlobalReactorState::default();
        let capture = CaptureInfo {
            id: "c1".into(),
            address: "127.0.0.1:8300".to_owned(),
            version: String::new(),
        };
        state
            .update(&CdcKey::Capture("c1".into()), Some(&json(&capture)))
            .unwrap();
        let info_key = CdcKey::ChangefeedInfo("cf".into());
        state
            .update(&info_key, Some(&json(&ChangeFeedInfo::new("blackhole://", 1))))
            .unwrap();

        assert_that!(state.live_captures().count(), eq(1));
        assert_that!(state.changefeeds, len(eq(1)));

        state.update(&info_key, None).unwrap();
        assert_that!(state.changefeeds, len(eq(0)));
    }
}
