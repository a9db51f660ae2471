// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytestring::ByteString;
use metrics::counter;
use tracing::{debug, trace, warn};

use cdc_metadata_store::{
    MetadataStoreClient, Mutation, ReadError, ReadModifyWriteError, ReadWriteError,
};

use crate::keys::CDC_PREFIX;
use crate::metric_definitions::{REACTOR_PATCHES_APPLIED, REACTOR_UNKNOWN_KEYS};
use crate::{CdcKey, GlobalReactorState, PatchError, ReactorState, SingleDataPatch};

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    ReadWrite(#[from] ReadWriteError),
}

impl From<ReadModifyWriteError<PatchError>> for ReactorError {
    fn from(value: ReadModifyWriteError<PatchError>) -> Self {
        match value {
            ReadModifyWriteError::ReadWrite(err) => ReactorError::ReadWrite(err),
            ReadModifyWriteError::FailedOperation(err) => ReactorError::Patch(err),
        }
    }
}

/// Loads the reactor state from the metadata store and writes queued patches back.
#[derive(Clone)]
pub struct ReactorWorker {
    client: MetadataStoreClient,
}

impl ReactorWorker {
    pub fn new(client: MetadataStoreClient) -> Self {
        Self { client }
    }

    /// Reads every reactor key and builds a fresh snapshot. Keys not belonging to the
    /// reactor layout are skipped.
    pub async fn load(&self) -> Result<GlobalReactorState, ReactorError> {
        let mut state = GlobalReactorState::default();
        for (raw_key, value) in self.client.list(CDC_PREFIX).await? {
            match raw_key.parse::<CdcKey>() {
                Ok(key) => state.update(&key, Some(&value.value))?,
                Err(err) => {
                    trace!("Skipping key: {err}");
                    counter!(REACTOR_UNKNOWN_KEYS).increment(1);
                }
            }
        }
        Ok(state)
    }

    /// Applies the patches one key at a time. A conflicting concurrent update re-runs the
    /// patch function against the fresh value. Stops at the first failing patch.
    pub async fn apply_patches(&self, patches: Vec<SingleDataPatch>) -> Result<(), ReactorError> {
        for mut patch in patches {
            let key = ByteString::from(patch.key.to_string());
            let mut changed = false;
            let result = self
                .client
                .read_modify_write(key.clone(), |current| {
                    let (next, is_changed) = patch.apply(current.map(|value| &value.value))?;
                    changed = is_changed;
                    Ok::<_, PatchError>(match (is_changed, next) {
                        (false, _) => Mutation::Unchanged,
                        (true, Some(value)) => Mutation::Put(value),
                        (true, None) => Mutation::Delete,
                    })
                })
                .await;

            if let Err(err) = result {
                warn!(%key, "Failed applying patch: {err}");
                return Err(err.into());
            }
            if changed {
                debug!(%key, "applied patch");
                counter!(REACTOR_PATCHES_APPLIED).increment(1);
            }
        }
        Ok(())
    }
}

static_assertions::assert_impl_all!(ReactorWorker: Send, Sync, Clone);
