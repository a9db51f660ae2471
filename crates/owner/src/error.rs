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

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use cdc_orchestrator::ReactorError;
use cdc_types::errors::{error_chain_message, ErrorCode, GenericError, UNKNOWN_ERROR_CODE};
use cdc_types::TableId;

use crate::ddl_comment::DdlCommentError;
use crate::ddl_puller::PullerError;
use crate::ddl_sink::DdlSinkError;
use crate::filter::FilterError;
use crate::gc::GcError;
use crate::redo::RedoError;
use crate::schema::SchemaError;

/// Sync points are spaced in whole milliseconds of physical time.
pub const MIN_SYNC_POINT_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum OwnerError {
    #[error(transparent)]
    Gc(#[from] GcError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Sink(#[from] DdlSinkError),
    #[error(transparent)]
    Puller(#[from] PullerError),
    #[error(transparent)]
    Redo(#[from] RedoError),
    #[error(transparent)]
    DdlComment(#[from] DdlCommentError),
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error("table {table_id} is replicated by more than one capture")]
    TableListenReplicated { table_id: TableId },
    #[error(
        "sync point interval {} is below the minimum of {}",
        humantime::format_duration(*.0),
        humantime::format_duration(MIN_SYNC_POINT_INTERVAL)
    )]
    InvalidSyncPointInterval(Duration),
    #[error("timed out closing the ddl sink after {}", humantime::format_duration(*.0))]
    SinkCloseTimeout(Duration),
    /// Reported by a background task of the changefeed.
    #[error("{0}")]
    Upstream(GenericError),
}

impl ErrorCode for OwnerError {
    fn code(&self) -> &'static str {
        match self {
            OwnerError::Gc(err) => err.code(),
            OwnerError::Schema(_) => "CDC:ErrSchemaStorage",
            OwnerError::Filter(_) => "CDC:ErrFilterRuleInvalid",
            OwnerError::Sink(_) => "CDC:ErrDDLSink",
            OwnerError::Puller(_) => "CDC:ErrDDLPuller",
            OwnerError::Redo(_) => "CDC:ErrRedo",
            OwnerError::DdlComment(_) => "CDC:ErrDDLComment",
            OwnerError::Reactor(_) => "CDC:ErrReactorState",
            OwnerError::TableListenReplicated { .. } => "CDC:ErrTableListenReplicated",
            OwnerError::InvalidSyncPointInterval(_) => "CDC:ErrInvalidReplicaConfig",
            OwnerError::SinkCloseTimeout(_) => "CDC:ErrDDLSink",
            OwnerError::Upstream(err) => upstream_code(err.as_ref()),
        }
    }
}

fn upstream_code(err: &(dyn std::error::Error + Send + Sync + 'static)) -> &'static str {
    if err.is::<DdlSinkError>() {
        "CDC:ErrDDLSink"
    } else if err.is::<PullerError>() {
        "CDC:ErrDDLPuller"
    } else {
        UNKNOWN_ERROR_CODE
    }
}

impl OwnerError {
    /// Message recorded in the changefeed info, including the error's sources.
    pub fn message(&self) -> String {
        match self {
            OwnerError::Upstream(err) => error_chain_message(err.as_ref()),
            other => error_chain_message(other),
        }
    }
}

/// Reporting side of a changefeed's error channel. Background tasks report here and the
/// controller picks the errors up on its next tick.
#[derive(Debug, Clone)]
pub struct ErrorSender {
    inner: mpsc::Sender<GenericError>,
}

impl ErrorSender {
    pub fn report(&self, err: impl Into<GenericError>) {
        match self.inner.try_send(err.into()) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                warn!("Error channel is full, dropping error: {err}");
            }
            Err(TrySendError::Closed(err)) => {
                warn!("Changefeed is gone, dropping error: {err}");
            }
        }
    }
}

pub fn error_channel(capacity: usize) -> (ErrorSender, mpsc::Receiver<GenericError>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ErrorSender { inner: tx }, rx)
}
