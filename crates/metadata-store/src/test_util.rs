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
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use bytestring::ByteString;
use parking_lot::Mutex;
use tracing::trace;

use cdc_types::Version;

use crate::{MetadataStore, Precondition, ReadError, VersionedValue, WriteError};

#[derive(Default)]
struct Inner {
    kv_pairs: BTreeMap<ByteString, VersionedValue>,
    pending_conflicts: usize,
}

/// In-memory [`MetadataStore`] honoring preconditions. Clones share the same key space.
#[derive(Default, Clone)]
pub struct InMemoryMetadataStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryMetadataStore {
    /// Fails the next `count` writes with a precondition failure, as if another writer had
    /// won the race.
    pub fn inject_conflicts(&self, count: usize) {
        self.inner.lock().pending_conflicts = count;
    }

    fn check_precondition(
        inner: &mut Inner,
        key: &ByteString,
        precondition: Precondition,
    ) -> Result<(), WriteError> {
        if inner.pending_conflicts > 0 {
            inner.pending_conflicts -= 1;
            return Err(WriteError::FailedPrecondition(format!(
                "injected conflict on '{key}'"
            )));
        }

        let current = inner.kv_pairs.get(key).map(|value| value.version);
        match (precondition, current) {
            (Precondition::None, _) => Ok(()),
            (Precondition::DoesNotExist, None) => Ok(()),
            (Precondition::DoesNotExist, Some(_)) => Err(WriteError::FailedPrecondition(
                format!("key '{key}' already exists"),
            )),
            (Precondition::MatchesVersion(expected), Some(actual)) if expected == actual => Ok(()),
            (Precondition::MatchesVersion(expected), actual) => {
                Err(WriteError::FailedPrecondition(format!(
                    "expected version '{expected}' but found '{}' for key '{key}'",
                    actual.unwrap_or(Version::INVALID)
                )))
            }
        }
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, key: ByteString) -> Result<Option<VersionedValue>, ReadError> {
        Ok(self.inner.lock().kv_pairs.get(&key).cloned())
    }

    async fn put(
        &self,
        key: ByteString,
        value: VersionedValue,
        precondition: Precondition,
    ) -> Result<(), WriteError> {
        let mut inner = self.inner.lock();
        Self::check_precondition(&mut inner, &key, precondition)?;
        trace!(%key, version = %value.version, "put");
        inner.kv_pairs.insert(key, value);
        Ok(())
    }

    async fn delete(&self, key: ByteString, precondition: Precondition) -> Result<(), WriteError> {
        let mut inner = self.inner.lock();
        Self::check_precondition(&mut inner, &key, precondition)?;
        trace!(%key, "delete");
        inner.kv_pairs.remove(&key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(ByteString, VersionedValue)>, ReadError> {
        let inner = self.inner.lock();
        Ok(inner
            .kv_pairs
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
