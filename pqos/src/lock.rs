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

use std::fs::File;
use std::fs::OpenOptions;
use std::ops::Deref;
use std::ops::DerefMut;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::fcntl::flock;
use nix::fcntl::FlockArg;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::errors::PqosError;
use crate::PqosResult;

const LOCK_FILE_MODE: u32 = 0o600;

/// Serializes library calls between threads with a mutex and between
/// processes with an advisory lock on a file.
pub(crate) struct ApiLock<T> {
    value: Mutex<T>,
    file: File,
}

impl<T> ApiLock<T> {
    pub(crate) fn new(path: &Path, value: T) -> PqosResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(LOCK_FILE_MODE)
            .open(path)
            .map_err(|error| PqosError::io("opening lock file", path, error))?;

        Ok(Self {
            value: Mutex::new(value),
            file,
        })
    }

    /// Blocks until both locks are held, there is no timeout.
    pub(crate) fn lock(&self) -> PqosResult<ApiGuard<'_, T>> {
        let guard = self.value.lock();
        flock(self.file.as_raw_fd(), FlockArg::LockExclusive).map_err(|errno| {
            tracing::error!("can't lock the API lock file: {errno}");
            PqosError::sys("locking the API lock file", errno)
        })?;

        Ok(ApiGuard { guard, file: &self.file })
    }
}

/// Releases the file lock first, then the mutex.
pub(crate) struct ApiGuard<'l, T> {
    guard: MutexGuard<'l, T>,
    file: &'l File,
}

impl<T> Drop for ApiGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(errno) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            tracing::error!("can't unlock the API lock file: {errno}");
        }
    }
}

impl<T> Deref for ApiGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ApiGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests;
