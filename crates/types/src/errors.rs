// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt::{Debug, Display, Formatter};

/// Error type which abstracts away the actual [`std::error::Error`] type. Use this type
/// if you don't know the actual error type or if it is not important.
pub type GenericError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Tells whether an error should be retried by upper layers or not.
pub trait MaybeRetryableError: std::error::Error + 'static {
    fn retryable(&self) -> bool {
        false
    }
}

static_assertions::assert_obj_safe!(MaybeRetryableError);

/// Stable, user visible code of an error. Recorded next to the message when an error
/// stops a changefeed, e.g. `CDC:ErrSnapshotLostByGC`.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

/// Code used for errors which don't carry one.
pub const UNKNOWN_ERROR_CODE: &str = "CDC:ErrOwnerUnknown";

pub trait IntoMaybeRetryable: Sized {
    fn into_retryable(self) -> RetryableError<Self> {
        RetryableError(self)
    }

    fn into_terminal(self) -> TerminalError<Self> {
        TerminalError(self)
    }
}

impl<T> IntoMaybeRetryable for T where T: Debug + Display + Send + Sync + std::error::Error + 'static
{}

/// Wraps any source error and marks it as retryable
#[derive(Debug, thiserror::Error, derive_more::Deref)]
pub struct RetryableError<T>(#[source] T);

/// Wraps any source error and marks it as non-retryable
#[derive(Debug, thiserror::Error, derive_more::Deref)]
pub struct TerminalError<T>(#[source] T);

impl<T: std::error::Error + 'static> MaybeRetryableError for RetryableError<T> {
    fn retryable(&self) -> bool {
        true
    }
}

impl<T: std::error::Error + 'static> MaybeRetryableError for TerminalError<T> {}

impl<T: Display> Display for RetryableError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[retryable] {}", self.0)
    }
}

impl<T: Display> Display for TerminalError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[terminal] {}", self.0)
    }
}

/// Flattens an error and its sources into one line, outermost first.
pub fn error_chain_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_message = cause.to_string();
        // thiserror's transparent wrappers repeat their source verbatim
        if !message.ends_with(&cause_message) {
            message.push_str(": ");
            message.push_str(&cause_message);
        }
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk is full")]
    struct DiskFull;

    #[derive(Debug, thiserror::Error)]
    #[error("cannot write redo log")]
    struct WriteFailed(#[source] DiskFull);

    #[test]
    fn retryability_markers() {
        assert_that!(DiskFull.into_retryable().retryable(), eq(true));
        assert_that!(DiskFull.into_terminal().retryable(), eq(false));
        assert_that!(
            DiskFull.into_retryable().to_string(),
            eq("[retryable] disk is full")
        );
    }

    #[test]
    fn chain_message_includes_sources() {
        assert_that!(
            error_chain_message(&WriteFailed(DiskFull)),
            eq("cannot write redo log: disk is full")
        );
    }
}
