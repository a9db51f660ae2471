// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use cdc_types::config::ConsistentConfig;
use cdc_types::model::DdlEvent;
use cdc_types::ChangeFeedId;

#[derive(Debug, thiserror::Error)]
pub enum RedoError {
    #[error("invalid redo storage uri '{uri}': {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported redo storage scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("redo log io error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed encoding redo log record: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RedoError + '_ {
    move |source| RedoError::Io {
        path: path.to_owned(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RedoStorage {
    /// A directory on a local or network mounted file system.
    Dir(PathBuf),
    BlackHole,
}

impl RedoStorage {
    fn parse(storage: &str) -> Result<Self, RedoError> {
        let uri = url::Url::parse(storage).map_err(|source| RedoError::InvalidUri {
            uri: storage.to_owned(),
            source,
        })?;
        match uri.scheme() {
            "local" | "nfs" => {
                // `local://data/redo` is relative to the working directory
                let host = uri.host_str().unwrap_or_default();
                Ok(RedoStorage::Dir(PathBuf::from(format!("{host}{}", uri.path()))))
            }
            "blackhole" => Ok(RedoStorage::BlackHole),
            scheme => Err(RedoError::UnsupportedScheme(scheme.to_owned())),
        }
    }
}

#[derive(Serialize)]
struct RedoLogRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    ddl: &'a DdlEvent,
}

/// Redo log of one changefeed. Only active when eventual consistency is configured.
#[derive(Debug)]
pub struct RedoManager {
    changefeed: ChangeFeedId,
    storage: Option<RedoStorage>,
}

impl RedoManager {
    pub async fn new(changefeed: ChangeFeedId, config: &ConsistentConfig) -> Result<Self, RedoError> {
        if !config.is_enabled() {
            return Ok(Self {
                changefeed,
                storage: None,
            });
        }

        let storage = RedoStorage::parse(&config.storage)?;
        if let RedoStorage::Dir(dir) = &storage {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(io_error(dir))?;
        }
        info!(%changefeed, storage = %config.storage, "Redo log enabled");
        Ok(Self {
            changefeed,
            storage: Some(storage),
        })
    }

    pub fn enabled(&self) -> bool {
        self.storage.is_some()
    }

    /// File receiving the DDL events, if the storage is a directory.
    pub fn ddl_log_path(&self) -> Option<PathBuf> {
        match &self.storage {
            Some(RedoStorage::Dir(dir)) => Some(dir.join(format!("{}.ddl.log", self.changefeed))),
            _ => None,
        }
    }

    /// Appends the event to the DDL log before it is handed to the sink.
    pub async fn emit_ddl_event(&self, event: &DdlEvent) -> Result<(), RedoError> {
        let Some(path) = self.ddl_log_path() else {
            return Ok(());
        };

        let mut line = serde_json::to_vec(&RedoLogRecord { kind: "ddl", ddl: event })?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_error(&path))?;
        file.write_all(&line).await.map_err(io_error(&path))?;
        file.flush().await.map_err(io_error(&path))?;
        debug!(changefeed = %self.changefeed, ddl.commit_ts = event.commit_ts, "DDL written to redo log");
        Ok(())
    }

    /// Deletes the redo storage of the changefeed. Missing storage is not an error.
    pub async fn cleanup(&self) -> Result<(), RedoError> {
        let Some(RedoStorage::Dir(dir)) = &self.storage else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                info!(changefeed = %self.changefeed, dir = %dir.display(), "Removed redo log");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(dir)(err)),
        }
    }
}
