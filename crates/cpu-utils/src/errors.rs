/*
 * Copyright 2024 Fluence Labs Limited
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::path::Path;
use std::path::PathBuf;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum CPUTopologyError {
    #[error("reading topology file {path:?} failed: {io_error}")]
    ReadFailed {
        path: PathBuf,
        io_error: std::io::Error,
    },

    #[error("topology file {path:?} has unexpected content '{content}'")]
    MalformedContent { path: PathBuf, content: String },

    #[error("no online logical cores found under {path:?}")]
    NoOnlineCores { path: PathBuf },
}

impl CPUTopologyError {
    pub fn read_failed(path: &Path, io_error: std::io::Error) -> Self {
        Self::ReadFailed {
            path: path.to_path_buf(),
            io_error,
        }
    }

    pub fn malformed_content(path: &Path, content: impl Into<String>) -> Self {
        Self::MalformedContent {
            path: path.to_path_buf(),
            content: content.into(),
        }
    }

    pub fn no_online_cores(path: &Path) -> Self {
        Self::NoOnlineCores {
            path: path.to_path_buf(),
        }
    }
}
