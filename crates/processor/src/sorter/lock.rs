// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use cdc_types::config::SorterOptions;

use super::SorterError;

/// Exclusive reservation of a sort directory by one capture. The reservation is a lock file
/// created next to the sorted data and removed when the reservation is dropped.
#[derive(Debug)]
pub struct SortDir {
    dir: PathBuf,
    lock_file: PathBuf,
}

impl SortDir {
    pub fn reserve(options: &SorterOptions) -> Result<Self, SorterError> {
        std::fs::create_dir_all(&options.sort_dir)?;
        let lock_file = options.sort_dir.join(lock_file_name(&options.capture_addr));

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_file)
        {
            Ok(mut file) => {
                writeln!(file, "{}", options.capture_addr)?;
                debug!(path = %lock_file.display(), "Reserved sort dir");
                Ok(Self {
                    dir: options.sort_dir.clone(),
                    lock_file,
                })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(
                SorterError::FileLockConflict(lock_file.display().to_string()),
            ),
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for SortDir {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.lock_file) {
            warn!(path = %self.lock_file.display(), "Failed removing sort dir lock: {err}");
        }
    }
}

fn lock_file_name(capture_addr: &str) -> String {
    let sanitized: String = capture_addr
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect();
    format!("sort-{sanitized}.lock")
}
