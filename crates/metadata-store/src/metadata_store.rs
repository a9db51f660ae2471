// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use bytestring::ByteString;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::debug;

use cdc_types::errors::{GenericError, MaybeRetryableError};
use cdc_types::retries::RetryPolicy;
use cdc_types::{Version, Versioned};

use crate::metric_definitions::{
    METADATA_CLIENT_CONFLICT_TOTAL, METADATA_CLIENT_DELETE_DURATION, METADATA_CLIENT_DELETE_TOTAL,
    METADATA_CLIENT_GET_DURATION, METADATA_CLIENT_GET_TOTAL, METADATA_CLIENT_LIST_DURATION,
    METADATA_CLIENT_LIST_TOTAL, METADATA_CLIENT_PUT_DURATION, METADATA_CLIENT_PUT_TOTAL,
    STATUS_COMPLETED, STATUS_FAILED,
};

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("network error: {0}")]
    Network(GenericError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl MaybeRetryableError for ReadError {
    fn retryable(&self) -> bool {
        matches!(self, ReadError::Network(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("network error: {0}")]
    Network(GenericError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl MaybeRetryableError for WriteError {
    fn retryable(&self) -> bool {
        matches!(
            self,
            WriteError::Network(_) | WriteError::FailedPrecondition(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadWriteError {
    #[error("network error: {0}")]
    Network(GenericError),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("retries for operation on key '{0}' exhausted")]
    RetriesExhausted(ByteString),
}

impl MaybeRetryableError for ReadWriteError {
    fn retryable(&self) -> bool {
        matches!(
            self,
            ReadWriteError::Network(_) | ReadWriteError::RetriesExhausted(_)
        )
    }
}

impl From<ReadError> for ReadWriteError {
    fn from(value: ReadError) -> Self {
        match value {
            ReadError::Network(err) => ReadWriteError::Network(err),
            ReadError::Internal(msg) => ReadWriteError::Internal(msg),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadModifyWriteError<E = String> {
    #[error(transparent)]
    ReadWrite(#[from] ReadWriteError),
    #[error("failed read-modify-write operation: {0}")]
    FailedOperation(E),
}

impl<E> ReadModifyWriteError<E>
where
    E: From<ReadWriteError>,
{
    pub fn transpose(self) -> E {
        match self {
            ReadModifyWriteError::ReadWrite(err) => err.into(),
            ReadModifyWriteError::FailedOperation(err) => err,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub version: Version,
    pub value: Bytes,
}

impl VersionedValue {
    pub fn new(version: Version, value: Bytes) -> Self {
        Self { version, value }
    }
}

impl Versioned for VersionedValue {
    fn version(&self) -> Version {
        self.version
    }
}

/// Preconditions for the write operations of the [`MetadataStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// No precondition
    None,
    /// Key-value pair must not exist for the write operation to succeed.
    DoesNotExist,
    /// Key-value pair must have the provided [`Version`] for the write operation to succeed.
    MatchesVersion(Version),
}

impl Precondition {
    fn for_current(current: Option<&VersionedValue>) -> Self {
        current
            .map(|value| Precondition::MatchesVersion(value.version))
            .unwrap_or(Precondition::DoesNotExist)
    }
}

/// Outcome of the modify step of [`MetadataStoreClient::read_modify_write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<T> {
    /// Leave the stored value as it is. Nothing is written.
    Unchanged,
    Put(T),
    Delete,
}

/// Metadata store abstraction. Implementations need to support linearizable reads and atomic
/// compare and swap operations.
#[async_trait]
pub trait MetadataStore {
    /// Gets the value and its current version for the given key. If key-value pair is not present,
    /// then return [`None`].
    async fn get(&self, key: ByteString) -> Result<Option<VersionedValue>, ReadError>;

    /// Puts the versioned value under the given key following the provided precondition. If the
    /// precondition is not met, then the operation returns a [`WriteError::FailedPrecondition`].
    async fn put(
        &self,
        key: ByteString,
        value: VersionedValue,
        precondition: Precondition,
    ) -> Result<(), WriteError>;

    /// Deletes the key-value pair for the given key following the provided precondition. If the
    /// precondition is not met, then the operation returns a [`WriteError::FailedPrecondition`].
    async fn delete(&self, key: ByteString, precondition: Precondition) -> Result<(), WriteError>;

    /// Lists all key-value pairs whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(ByteString, VersionedValue)>, ReadError>;
}

/// Client used by the owner to read and update the reactor state.
#[derive(Clone)]
pub struct MetadataStoreClient {
    inner: Arc<dyn MetadataStore + Send + Sync>,
    backoff_policy: Option<RetryPolicy>,
}

impl MetadataStoreClient {
    pub fn new<S>(metadata_store: S, backoff_policy: Option<RetryPolicy>) -> Self
    where
        S: MetadataStore + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(metadata_store),
            backoff_policy,
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn new_in_memory() -> Self {
        MetadataStoreClient::new(
            crate::test_util::InMemoryMetadataStore::default(),
            None, // not needed since no concurrent modifications happening
        )
    }

    pub async fn get(&self, key: ByteString) -> Result<Option<VersionedValue>, ReadError> {
        let start_time = Instant::now();
        let result = self.inner.get(key).await;

        let status = if result.is_ok() {
            STATUS_COMPLETED
        } else {
            STATUS_FAILED
        };
        histogram!(METADATA_CLIENT_GET_DURATION).record(start_time.elapsed());
        counter!(METADATA_CLIENT_GET_TOTAL, "status" => status).increment(1);

        result
    }

    /// Writes `value` under `key`. The stored version is derived from the precondition, so
    /// callers never pick versions themselves.
    pub async fn put(
        &self,
        key: ByteString,
        value: Bytes,
        precondition: Precondition,
    ) -> Result<Version, WriteError> {
        let start_time = Instant::now();
        let result = async {
            let version = match precondition {
                Precondition::DoesNotExist => Version::MIN,
                Precondition::MatchesVersion(version) => version.next(),
                Precondition::None => self
                    .inner
                    .get(key.clone())
                    .await
                    .map_err(|err| WriteError::Internal(err.to_string()))?
                    .map(|current| current.version.next())
                    .unwrap_or(Version::MIN),
            };
            self.inner
                .put(key, VersionedValue::new(version, value), precondition)
                .await
                .map(|()| version)
        }
        .await;

        let status = if result.is_ok() {
            STATUS_COMPLETED
        } else {
            STATUS_FAILED
        };
        histogram!(METADATA_CLIENT_PUT_DURATION).record(start_time.elapsed());
        counter!(METADATA_CLIENT_PUT_TOTAL, "status" => status).increment(1);

        result
    }

    pub async fn delete(
        &self,
        key: ByteString,
        precondition: Precondition,
    ) -> Result<(), WriteError> {
        let start_time = Instant::now();
        let result = self.inner.delete(key, precondition).await;

        let status = if result.is_ok() {
            STATUS_COMPLETED
        } else {
            STATUS_FAILED
        };
        histogram!(METADATA_CLIENT_DELETE_DURATION).record(start_time.elapsed());
        counter!(METADATA_CLIENT_DELETE_TOTAL, "status" => status).increment(1);

        result
    }

    pub async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<(ByteString, VersionedValue)>, ReadError> {
        let start_time = Instant::now();
        let result = self.inner.list(prefix).await;

        let status = if result.is_ok() {
            STATUS_COMPLETED
        } else {
            STATUS_FAILED
        };
        histogram!(METADATA_CLIENT_LIST_DURATION).record(start_time.elapsed());
        counter!(METADATA_CLIENT_LIST_TOTAL, "status" => status).increment(1);

        result
    }

    /// Reads the value under the given key, lets `modify` decide on a [`Mutation`] and writes
    /// the result back. The write only succeeds if the stored value has not been modified in
    /// the meantime. Otherwise the cycle is retried according to the backoff policy, calling
    /// `modify` again with the fresh value.
    ///
    /// Returns the value stored after the operation.
    pub async fn read_modify_write<F, E>(
        &self,
        key: ByteString,
        mut modify: F,
    ) -> Result<Option<VersionedValue>, ReadModifyWriteError<E>>
    where
        F: FnMut(Option<&VersionedValue>) -> Result<Mutation<Bytes>, E>,
    {
        let mut backoff_policy = self.backoff_policy.as_ref().map(|p| p.iter());

        loop {
            let old_value = self
                .get(key.clone())
                .await
                .map_err(ReadWriteError::from)?;
            let precondition = Precondition::for_current(old_value.as_ref());

            let write_result = match modify(old_value.as_ref()) {
                Ok(Mutation::Unchanged) => return Ok(old_value),
                Ok(Mutation::Put(new_value)) => self
                    .put(key.clone(), new_value.clone(), precondition)
                    .await
                    .map(|version| Some(VersionedValue::new(version, new_value))),
                Ok(Mutation::Delete) if old_value.is_none() => return Ok(None),
                Ok(Mutation::Delete) => self
                    .delete(key.clone(), precondition)
                    .await
                    .map(|()| None),
                Err(err) => return Err(ReadModifyWriteError::FailedOperation(err)),
            };

            match write_result {
                Ok(new_value) => return Ok(new_value),
                Err(WriteError::FailedPrecondition(msg)) => {
                    counter!(METADATA_CLIENT_CONFLICT_TOTAL).increment(1);
                    if let Some(backoff) = backoff_policy.as_mut().and_then(|p| p.next()) {
                        debug!(
                            "Concurrent value update: {msg}; retrying in '{}'",
                            humantime::format_duration(backoff)
                        );
                        tokio::time::sleep(backoff).await;
                    } else {
                        return Err(ReadWriteError::RetriesExhausted(key).into());
                    }
                }
                Err(WriteError::Network(err)) => {
                    return Err(ReadWriteError::Network(err).into());
                }
                Err(WriteError::Internal(msg)) => {
                    return Err(ReadWriteError::Internal(msg).into());
                }
            }
        }
    }
}

static_assertions::assert_impl_all!(MetadataStoreClient: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;

    use std::num::NonZeroUsize;
    use std::time::Duration;

    use googletest::prelude::*;
    use test_log::test;

    use crate::InMemoryMetadataStore;

    fn key(name: &str) -> ByteString {
        ByteString::from(name.to_owned())
    }

    #[test(tokio::test)]
    async fn put_assigns_versions_from_precondition() {
        let client = MetadataStoreClient::new_in_memory();

        let v1 = client
            .put(key("a"), Bytes::from_static(b"1"), Precondition::DoesNotExist)
            .await
            .unwrap();
        assert_that!(v1, eq(Version::MIN));

        let v2 = client
            .put(
                key("a"),
                Bytes::from_static(b"2"),
                Precondition::MatchesVersion(v1),
            )
            .await
            .unwrap();
        assert_that!(v2, eq(Version::MIN.next()));

        let stale = client
            .put(
                key("a"),
                Bytes::from_static(b"3"),
                Precondition::MatchesVersion(v1),
            )
            .await;
        assert!(matches!(stale, Err(WriteError::FailedPrecondition(_))));

        let v3 = client
            .put(key("a"), Bytes::from_static(b"4"), Precondition::None)
            .await
            .unwrap();
        assert_that!(v3, eq(v2.next()));
    }

    #[test(tokio::test)]
    async fn list_filters_by_prefix() {
        let client = MetadataStoreClient::new_in_memory();
        for name in ["/x/b", "/x/a", "/y/a"] {
            client
                .put(key(name), Bytes::new(), Precondition::None)
                .await
                .unwrap();
        }

        let listed = client.list("/x/").await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|(k, _)| &**k).collect();
        assert_eq!(keys, vec!["/x/a", "/x/b"]);
    }

    #[test(tokio::test)]
    async fn read_modify_write_mutations() {
        let client = MetadataStoreClient::new_in_memory();

        let created = client
            .read_modify_write(key("k"), |current| {
                assert!(current.is_none());
                Ok::<_, String>(Mutation::Put(Bytes::from_static(b"v1")))
            })
            .await
            .unwrap();
        assert_that!(created.map(|v| v.version), some(eq(Version::MIN)));

        let unchanged = client
            .read_modify_write(key("k"), |_| Ok::<_, String>(Mutation::Unchanged))
            .await
            .unwrap();
        assert_eq!(unchanged.map(|v| v.value), Some(Bytes::from_static(b"v1")));

        let failed = client
            .read_modify_write(key("k"), |_| Err::<Mutation<Bytes>, _>("nope".to_owned()))
            .await;
        assert!(matches!(
            failed,
            Err(ReadModifyWriteError::FailedOperation(msg)) if msg == "nope"
        ));

        let deleted = client
            .read_modify_write(key("k"), |_| Ok::<_, String>(Mutation::Delete))
            .await
            .unwrap();
        assert!(deleted.is_none());
        assert!(client.get(key("k")).await.unwrap().is_none());
    }

    #[test(tokio::test(start_paused = true))]
    async fn read_modify_write_retries_on_conflict() {
        let store = InMemoryMetadataStore::default();
        store.inject_conflicts(2);
        let client = MetadataStoreClient::new(
            store,
            Some(RetryPolicy::fixed_delay(
                Duration::from_millis(10),
                NonZeroUsize::new(3),
            )),
        );

        let mut calls = 0;
        let result = client
            .read_modify_write(key("k"), |_| {
                calls += 1;
                Ok::<_, String>(Mutation::Put(Bytes::from_static(b"v")))
            })
            .await
            .unwrap();

        assert_that!(calls, eq(3));
        assert!(result.is_some());
    }

    #[test(tokio::test(start_paused = true))]
    async fn read_modify_write_gives_up() {
        let store = InMemoryMetadataStore::default();
        store.inject_conflicts(5);
        let client = MetadataStoreClient::new(
            store,
            Some(RetryPolicy::fixed_delay(
                Duration::from_millis(10),
                NonZeroUsize::new(1),
            )),
        );

        let result = client
            .read_modify_write(key("k"), |_| {
                Ok::<_, String>(Mutation::Put(Bytes::from_static(b"v")))
            })
            .await;
        assert!(matches!(
            result,
            Err(ReadModifyWriteError::ReadWrite(
                ReadWriteError::RetriesExhausted(_)
            ))
        ));
    }
}
