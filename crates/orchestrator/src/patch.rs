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

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::CdcKey;

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("failed decoding value of '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed encoding value of '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("patch of '{key}' rejected: {reason}")]
    Rejected { key: String, reason: String },
}

/// Raw patch function. Receives the currently stored value and returns the new value (`None`
/// deletes the key) plus whether anything changed. May be called more than once if the
/// value is concurrently modified.
pub type PatchFn =
    Box<dyn FnMut(Option<&Bytes>) -> Result<(Option<Bytes>, bool), PatchError> + Send + Sync>;

/// A pending optimistic update of a single key.
pub struct SingleDataPatch {
    pub key: CdcKey,
    pub func: PatchFn,
}

impl SingleDataPatch {
    pub fn new(key: CdcKey, func: PatchFn) -> Self {
        Self { key, func }
    }

    /// Wraps a patch function on the decoded value. Values are stored as JSON.
    pub fn typed<T, F>(key: CdcKey, mut func: F) -> Self
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> Result<(Option<T>, bool), PatchError> + Send + Sync + 'static,
    {
        let key_string = key.to_string();
        let raw = move |current: Option<&Bytes>| {
            let decoded = current
                .map(|value| decode::<T>(&key_string, value))
                .transpose()?;
            let (next, changed) = func(decoded)?;
            if !changed {
                return Ok((current.cloned(), false));
            }
            let encoded = next
                .map(|value| encode(&key_string, &value))
                .transpose()?;
            Ok((encoded, true))
        };
        Self::new(key, Box::new(raw))
    }

    pub fn apply(&mut self, current: Option<&Bytes>) -> Result<(Option<Bytes>, bool), PatchError> {
        (self.func)(current)
    }
}

impl fmt::Debug for SingleDataPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleDataPatch")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, value: &[u8]) -> Result<T, PatchError> {
    serde_json::from_slice(value).map_err(|source| PatchError::Decode {
        key: key.to_owned(),
        source,
    })
}

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> Result<Bytes, PatchError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| PatchError::Encode {
            key: key.to_owned(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;

    use cdc_types::model::ChangeFeedStatus;

    #[test]
    fn typed_patch_encodes_json() {
        let mut patch = SingleDataPatch::typed(
            CdcKey::ChangefeedStatus("cf".into()),
            |status: Option<ChangeFeedStatus>| {
                let mut status = status.unwrap_or_default();
                status.checkpoint_ts += 1;
                Ok((Some(status), true))
            },
        );

        let (first, changed) = patch.apply(None).unwrap();
        assert_that!(changed, eq(true));
        let first = first.unwrap();
        let (second, _) = patch.apply(Some(&first)).unwrap();
        let status: ChangeFeedStatus = serde_json::from_slice(&second.unwrap()).unwrap();
        assert_that!(status.checkpoint_ts, eq(2));
    }

    #[test]
    fn unchanged_patch_keeps_raw_value() {
        let mut patch = SingleDataPatch::typed(
            CdcKey::ChangefeedStatus("cf".into()),
            |status: Option<ChangeFeedStatus>| Ok((status, false)),
        );
        let raw = Bytes::from_static(br#"{"checkpoint-ts":1,"resolved-ts":2}"#);
        let (value, changed) = patch.apply(Some(&raw)).unwrap();
        assert_that!(changed, eq(false));
        assert_eq!(value, Some(raw));
    }

    #[test]
    fn garbage_value_fails_decoding() {
        let mut patch = SingleDataPatch::typed(
            CdcKey::ChangefeedStatus("cf".into()),
            |status: Option<ChangeFeedStatus>| Ok((status, true)),
        );
        let result = patch.apply(Some(&Bytes::from_static(b"not json")));
        assert!(matches!(result, Err(PatchError::Decode { .. })));
    }
}
