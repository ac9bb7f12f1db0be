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

use nix::errno::Errno;
use thiserror::Error as ThisError;

use pqos_cpu_utils::CPUTopologyError;
use pqos_msr::MSRError;

/// Status codes every public call maps its outcome onto, stable across releases.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Error = 1,
    Param = 2,
    Resource = 3,
    Init = 4,
    Transport = 5,
    PerfCtr = 6,
    Busy = 7,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::Error => "ERROR",
            Status::Param => "PARAM",
            Status::Resource => "RESOURCE",
            Status::Init => "INIT",
            Status::Transport => "TRANSPORT",
            Status::PerfCtr => "PERF_CTR",
            Status::Busy => "BUSY",
        };
        write!(f, "{name}")
    }
}

#[derive(ThisError, Debug)]
pub enum PqosError {
    #[error("invalid parameter: {0}")]
    Param(String),

    /// The feature is absent or every slot of it is taken.
    #[error("resource not available: {0}")]
    Resource(String),

    #[error("library state: {0}")]
    Init(String),

    #[error("requested interface is not supported: {0}")]
    Interface(String),

    #[error("performance counters are already in use on core {core_id}")]
    PerfCountersInUse { core_id: u32 },

    #[error("resctrl group '{path}' can't be created: {io_error}")]
    Busy {
        path: PathBuf,
        io_error: std::io::Error,
    },

    #[error(transparent)]
    Msr(#[from] MSRError),

    #[error(transparent)]
    Topology(#[from] CPUTopologyError),

    #[error("{context} '{path}' failed: {io_error}")]
    Io {
        context: &'static str,
        path: PathBuf,
        io_error: std::io::Error,
    },

    #[error("{context} failed: {errno}")]
    Sys { context: &'static str, errno: Errno },

    #[error("malformed content in '{path}': {content:?}")]
    Malformed { path: PathBuf, content: String },

    #[error("{0}")]
    Failed(String),
}

impl PqosError {
    pub fn param(message: impl Into<String>) -> Self {
        Self::Param(message.into())
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource(message.into())
    }

    pub fn init(message: impl Into<String>) -> Self {
        Self::Init(message.into())
    }

    pub fn interface(message: impl Into<String>) -> Self {
        Self::Interface(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn busy(path: impl AsRef<Path>, io_error: std::io::Error) -> Self {
        Self::Busy {
            path: path.as_ref().to_path_buf(),
            io_error,
        }
    }

    pub fn io(context: &'static str, path: impl AsRef<Path>, io_error: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.as_ref().to_path_buf(),
            io_error,
        }
    }

    pub fn sys(context: &'static str, errno: Errno) -> Self {
        Self::Sys { context, errno }
    }

    pub fn malformed(path: impl AsRef<Path>, content: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.as_ref().to_path_buf(),
            content: content.into(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            PqosError::Param(_) => Status::Param,
            PqosError::Resource(_) => Status::Resource,
            PqosError::Init(_) => Status::Init,
            PqosError::Interface(_) => Status::Transport,
            PqosError::PerfCountersInUse { .. } => Status::PerfCtr,
            PqosError::Busy { .. } => Status::Busy,
            PqosError::Msr(_)
            | PqosError::Topology(_)
            | PqosError::Io { .. }
            | PqosError::Sys { .. }
            | PqosError::Malformed { .. }
            | PqosError::Failed(_) => Status::Error,
        }
    }
}
