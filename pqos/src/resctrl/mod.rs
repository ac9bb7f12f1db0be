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

mod cpumask;
mod schemata;

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use nix::mount::MsFlags;

pub(crate) use cpumask::CpuMask;
pub(crate) use schemata::Schemata;

use crate::errors::PqosError;
use crate::types::ClassId;
use crate::types::Pid;
use crate::PqosResult;

/// Mounting and unmounting the resctrl filesystem.
pub trait ResctrlMount: Send + Sync {
    fn mount(&self, root: &Path, cdp: bool) -> PqosResult<()>;

    fn unmount(&self, root: &Path) -> PqosResult<()>;
}

/// Calls mount(2) and umount(2).
#[derive(Clone, Copy, Debug, Default)]
pub struct SysResctrlMount;

impl ResctrlMount for SysResctrlMount {
    fn mount(&self, root: &Path, cdp: bool) -> PqosResult<()> {
        let options = if cdp { Some("cdp") } else { None };
        tracing::info!("mounting resctrl at {}, options {options:?}", root.display());
        nix::mount::mount(
            Some("resctrl"),
            root,
            Some("resctrl"),
            MsFlags::empty(),
            options,
        )
        .map_err(|errno| PqosError::sys("mounting resctrl", errno))
    }

    fn unmount(&self, root: &Path) -> PqosResult<()> {
        tracing::info!("unmounting resctrl at {}", root.display());
        nix::mount::umount(root).map_err(|errno| PqosError::sys("unmounting resctrl", errno))
    }
}

/// A mounted resctrl tree: class 0 is the root group, class `n` lives in `COS<n>`.
#[derive(Clone, Debug)]
pub(crate) struct Resctrl {
    root: PathBuf,
}

impl Resctrl {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn is_mounted(&self) -> bool {
        self.root.join("cpus").exists()
    }

    pub(crate) fn group_dir(&self, class_id: ClassId) -> PathBuf {
        match class_id {
            0 => self.root.clone(),
            class_id => self.root.join(format!("COS{class_id}")),
        }
    }

    /// Creates groups `1..num_groups`, existing ones are kept.
    pub(crate) fn create_groups(&self, num_groups: u32) -> PqosResult<()> {
        for class_id in 1..num_groups {
            let dir = self.group_dir(class_id);
            match std::fs::create_dir(&dir) {
                Ok(()) => tracing::info!("created resctrl group {}", dir.display()),
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(error) => {
                    tracing::error!("can't create resctrl group {}: {error}", dir.display());
                    return Err(PqosError::busy(dir, error));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn read_schemata(&self, class_id: ClassId) -> PqosResult<Schemata> {
        let path = self.group_dir(class_id).join("schemata");
        let content = read_file(&path)?;
        Schemata::parse(&content).ok_or_else(|| PqosError::malformed(&path, content))
    }

    pub(crate) fn write_schemata(&self, class_id: ClassId, schemata: &Schemata) -> PqosResult<()> {
        let path = self.group_dir(class_id).join("schemata");
        write_file(&path, &schemata.to_string())
    }

    pub(crate) fn read_cpumask(&self, class_id: ClassId) -> PqosResult<CpuMask> {
        let path = self.group_dir(class_id).join("cpus");
        let content = read_file(&path)?;
        CpuMask::parse(&content).ok_or_else(|| PqosError::malformed(&path, content))
    }

    pub(crate) fn write_cpumask(&self, class_id: ClassId, mask: &CpuMask) -> PqosResult<()> {
        let path = self.group_dir(class_id).join("cpus");
        write_file(&path, &format!("{mask}\n"))
    }

    pub(crate) fn read_tasks(&self, class_id: ClassId) -> PqosResult<Vec<Pid>> {
        let path = self.group_dir(class_id).join("tasks");
        let content = read_file(&path)?;
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.parse::<Pid>().ok())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| PqosError::malformed(&path, content.clone()))
    }

    /// The kernel takes one task per write.
    pub(crate) fn add_task(&self, class_id: ClassId, pid: Pid) -> PqosResult<()> {
        let path = self.group_dir(class_id).join("tasks");
        tracing::debug!("writing task {pid} to {}", path.display());
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|error| PqosError::io("opening", &path, error))?;
        file.write_all(format!("{pid}\n").as_bytes())
            .map_err(|error| PqosError::io("writing", &path, error))
    }

    /// A numeric file below `info/<resource>`, `None` when it doesn't exist.
    pub(crate) fn info_u32(&self, resource: &str, name: &str) -> PqosResult<Option<u32>> {
        let path = self.root.join("info").join(resource).join(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = read_file(&path)?;
        content
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| PqosError::malformed(&path, content))
    }

    pub(crate) fn has_info(&self, resource: &str) -> bool {
        self.root.join("info").join(resource).is_dir()
    }
}

fn read_file(path: &Path) -> PqosResult<String> {
    std::fs::read_to_string(path).map_err(|error| PqosError::io("reading", path, error))
}

fn write_file(path: &Path, content: &str) -> PqosResult<()> {
    tracing::debug!("writing {:?} to {}", content.trim_end(), path.display());
    std::fs::write(path, content).map_err(|error| PqosError::io("writing", path, error))
}
