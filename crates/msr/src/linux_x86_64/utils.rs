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
use std::io;
use std::path::Path;
use std::path::PathBuf;

use pqos_cpu_utils::LogicalCoreId;

use crate::MSRError;
use crate::MSRResult;

const MSR_VALUE_SIZE: usize = std::mem::size_of::<u64>();

enum MSRFileOpMode {
    MSRRead,
    MSRWrite,
}

pub(crate) fn read_msr(
    dev_cpu_root: &Path,
    register_id: u32,
    core_id: LogicalCoreId,
) -> MSRResult<u64> {
    use nix::sys::uio::pread;

    let path = msr_path(dev_cpu_root, core_id);
    let file = open_msr(&path, MSRFileOpMode::MSRRead)
        .map_err(|error| MSRError::open_for_read(&path, error))?;

    let mut value = [0u8; MSR_VALUE_SIZE];
    let transferred = pread(&file, &mut value, register_id as i64)
        .map_err(|errno| MSRError::read_w_no_err(register_id, core_id, errno))?;
    if transferred != MSR_VALUE_SIZE {
        return Err(MSRError::short_transfer(register_id, core_id, transferred));
    }
    let result = u64::from_le_bytes(value);

    tracing::debug!("Read MSR register_id {register_id:#X} value {result:#X} at core id {core_id}");

    Ok(result)
}

pub(crate) fn write_msr(
    dev_cpu_root: &Path,
    register_id: u32,
    value: u64,
    core_id: LogicalCoreId,
) -> MSRResult<()> {
    use nix::sys::uio::pwrite;

    let path = msr_path(dev_cpu_root, core_id);
    let file = open_msr(&path, MSRFileOpMode::MSRWrite)
        .map_err(|error| MSRError::open_for_write(&path, error))?;

    tracing::debug!("Write MSR register_id {register_id:#X} value {value:#X} at core id {core_id}");

    let value_as_bytes = value.to_le_bytes();
    let transferred = pwrite(&file, &value_as_bytes, register_id as i64)
        .map_err(|errno| MSRError::write_w_no_err(value, register_id, core_id, errno))?;
    if transferred != MSR_VALUE_SIZE {
        return Err(MSRError::short_transfer(register_id, core_id, transferred));
    }

    Ok(())
}

fn msr_path(dev_cpu_root: &Path, core_id: LogicalCoreId) -> PathBuf {
    dev_cpu_root.join(core_id.to_string()).join("msr")
}

fn open_msr(path: &Path, mode: MSRFileOpMode) -> io::Result<File> {
    use std::fs::OpenOptions;

    match mode {
        MSRFileOpMode::MSRRead => OpenOptions::new().read(true).open(path),
        MSRFileOpMode::MSRWrite => OpenOptions::new().write(true).open(path),
    }
}
