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

use bytes::Bytes;

use crate::{CdcKey, PatchError, ReactorState};

/// Synchronous stand-in for the metadata store. Keeps raw values next to a reactor state
/// and applies queued patches immediately.
pub struct ReactorStateTester<S> {
    state: S,
    kv: BTreeMap<CdcKey, Bytes>,
}

impl<S: ReactorState> ReactorStateTester<S> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            kv: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Raw value currently stored under `key`.
    pub fn value(&self, key: &CdcKey) -> Option<&Bytes> {
        self.kv.get(key)
    }

    /// Writes a value as if another component had put it, bypassing patches.
    pub fn update(&mut self, key: CdcKey, value: Option<Bytes>) -> Result<(), PatchError> {
        self.state.update(&key, value.as_deref())?;
        match value {
            Some(value) => {
                self.kv.insert(key, value);
            }
            None => {
                self.kv.remove(&key);
            }
        }
        Ok(())
    }

    pub fn must_update(&mut self, key: CdcKey, value: Option<Bytes>) {
        if let Err(err) = self.update(key, value) {
            panic!("failed updating reactor state: {err}");
        }
    }

    /// Runs every queued patch against the stored values and feeds the results back into
    /// the state.
    pub fn apply_patches(&mut self) -> Result<(), PatchError> {
        for mut patch in self.state.take_patches() {
            let (next, changed) = patch.apply(self.kv.get(&patch.key))?;
            if changed {
                self.update(patch.key, next)?;
            }
        }
        Ok(())
    }

    pub fn must_apply_patches(&mut self) {
        if let Err(err) = self.apply_patches() {
            panic!("failed applying patches: {err}");
        }
    }
}
