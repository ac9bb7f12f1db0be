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

use std::sync::Arc;

use pqos_config::Interface;
use pqos_config::PqosConfig;
use pqos_cpu_utils::CpuInfo;
use pqos_cpu_utils::LogicalCoreId;

use crate::backend::Backend;
use crate::cap;
use crate::cap::Capabilities;
use crate::cap::OsSupport;
use crate::errors::PqosError;
use crate::hw::HwBackend;
use crate::lock::ApiLock;
use crate::mon_group::MonGroup;
use crate::os::OsBackend;
use crate::os::OsBackendPaths;
use crate::perf::PerfRdt;
use crate::platform::Platform;
use crate::types::*;
use crate::utils::is_contiguous;
use crate::utils::ways_mask;
use crate::PqosResult;

/// Environment variable pinning the interface, `MSR` or `OS`.
pub const RDT_IFACE_ENV: &str = "RDT_IFACE";

struct Session {
    cap: Capabilities,
    backend: Box<dyn Backend>,
}

/// An initialized library instance. Every call is serialized against other
/// threads and processes using the same lock file.
pub struct Pqos {
    interface: Interface,
    cpu: Arc<CpuInfo>,
    session: ApiLock<Option<Session>>,
}

impl Pqos {
    /// Initializes the library on the running machine.
    pub fn init(config: &PqosConfig) -> PqosResult<Self> {
        let platform = Platform::native(config)?;
        Self::with_platform(config, platform)
    }

    pub fn with_platform(config: &PqosConfig, platform: Platform) -> PqosResult<Self> {
        let interface = check_iface_env(config.interface, std::env::var(RDT_IFACE_ENV).ok())?;
        let session = ApiLock::new(&config.lock_file, None)?;

        {
            let mut guard = session.lock()?;
            *guard = Some(start_session(config, interface, &platform)?);
        }
        tracing::info!("library initialized with the {interface} interface");

        Ok(Self {
            interface,
            cpu: platform.cpu,
            session,
        })
    }

    /// Every later call fails with an init error.
    pub fn fini(&self) -> PqosResult<()> {
        let mut guard = self.session.lock()?;
        if guard.take().is_none() {
            return Err(not_initialized());
        }
        tracing::info!("library finalized");
        Ok(())
    }

    fn locked<R>(&self, call: impl FnOnce(&mut Session) -> PqosResult<R>) -> PqosResult<R> {
        let mut guard = self.session.lock()?;
        let session = guard.as_mut().ok_or_else(not_initialized)?;
        call(session)
    }

    pub fn interface(&self) -> Interface {
        self.interface
    }

    pub fn cap_get(&self) -> PqosResult<Capabilities> {
        self.locked(|session| Ok(session.cap.clone()))
    }

    pub fn cpuinfo(&self) -> PqosResult<Arc<CpuInfo>> {
        self.locked(|_| Ok(self.cpu.clone()))
    }

    pub fn l3ca_set(&self, socket: u32, cas: &[L3Ca]) -> PqosResult<()> {
        if cas.is_empty() {
            return Err(PqosError::param("no L3 classes to set"));
        }
        for ca in cas {
            if !ca.mask.masks().all(is_contiguous) {
                return Err(PqosError::param(format!(
                    "L3 mask of class {} is not contiguous",
                    ca.class_id
                )));
            }
        }

        self.locked(|session| {
            let l3ca = session
                .cap
                .l3ca()
                .ok_or_else(|| PqosError::resource("L3 CAT is not supported"))?;
            for ca in cas {
                check_class_bound(ca.class_id, l3ca.num_classes)?;
                for mask in ca.mask.masks() {
                    check_mask_width(mask, l3ca.num_ways)?;
                }
            }
            session.backend.l3ca_set(&session.cap, socket, cas)
        })
    }

    pub fn l3ca_get(&self, socket: u32) -> PqosResult<Vec<L3Ca>> {
        self.locked(|session| session.backend.l3ca_get(&session.cap, socket))
    }

    pub fn l3ca_get_min_cbm_bits(&self) -> PqosResult<u32> {
        self.locked(|session| session.backend.l3ca_get_min_cbm_bits(&session.cap))
    }

    pub fn l2ca_set(&self, l2_id: u32, cas: &[L2Ca]) -> PqosResult<()> {
        if cas.is_empty() {
            return Err(PqosError::param("no L2 classes to set"));
        }
        for ca in cas {
            if !is_contiguous(ca.ways_mask) {
                return Err(PqosError::param(format!(
                    "L2 mask of class {} is not contiguous",
                    ca.class_id
                )));
            }
        }

        self.locked(|session| {
            let l2ca = session
                .cap
                .l2ca()
                .ok_or_else(|| PqosError::resource("L2 CAT is not supported"))?;
            for ca in cas {
                check_class_bound(ca.class_id, l2ca.num_classes)?;
                check_mask_width(ca.ways_mask, l2ca.num_ways)?;
            }
            session.backend.l2ca_set(&session.cap, l2_id, cas)
        })
    }

    pub fn l2ca_get(&self, l2_id: u32) -> PqosResult<Vec<L2Ca>> {
        self.locked(|session| session.backend.l2ca_get(&session.cap, l2_id))
    }

    pub fn l2ca_get_min_cbm_bits(&self) -> PqosResult<u32> {
        self.locked(|session| session.backend.l2ca_get_min_cbm_bits(&session.cap))
    }

    /// Returns the rates the platform actually applied.
    pub fn mba_set(&self, socket: u32, requested: &[Mba]) -> PqosResult<Vec<Mba>> {
        if requested.is_empty() {
            return Err(PqosError::param("no MBA classes to set"));
        }
        if let Some(entry) = requested
            .iter()
            .find(|entry| entry.mb_rate == 0 || entry.mb_rate > 100)
        {
            return Err(PqosError::param(format!(
                "MBA rate {} of class {} is outside 1-100",
                entry.mb_rate, entry.class_id
            )));
        }

        self.locked(|session| {
            let mba = session
                .cap
                .mba()
                .ok_or_else(|| PqosError::resource("MBA is not supported"))?;
            for entry in requested {
                check_class_bound(entry.class_id, mba.num_classes)?;
            }
            session.backend.mba_set(&session.cap, socket, requested)
        })
    }

    pub fn mba_get(&self, socket: u32) -> PqosResult<Vec<Mba>> {
        self.locked(|session| session.backend.mba_get(&session.cap, socket))
    }

    pub fn alloc_assoc_set(&self, core_id: LogicalCoreId, class_id: ClassId) -> PqosResult<()> {
        self.locked(|session| {
            session
                .backend
                .alloc_assoc_set(&session.cap, core_id, class_id)
        })
    }

    pub fn alloc_assoc_get(&self, core_id: LogicalCoreId) -> PqosResult<ClassId> {
        self.locked(|session| session.backend.alloc_assoc_get(&session.cap, core_id))
    }

    /// Picks the highest class nobody uses and associates `cores` with it.
    pub fn alloc_assign(
        &self,
        technology: Technology,
        cores: &[LogicalCoreId],
    ) -> PqosResult<ClassId> {
        check_technology(technology)?;
        if cores.is_empty() {
            return Err(PqosError::param("no cores to assign"));
        }
        self.locked(|session| {
            session
                .backend
                .alloc_assign(&session.cap, technology, cores)
        })
    }

    pub fn alloc_release(&self, cores: &[LogicalCoreId]) -> PqosResult<()> {
        if cores.is_empty() {
            return Err(PqosError::param("no cores to release"));
        }
        self.locked(|session| session.backend.alloc_release(&session.cap, cores))
    }

    pub fn alloc_reset(&self, l3_cdp: CdpConfig) -> PqosResult<()> {
        self.locked(|session| session.backend.alloc_reset(&mut session.cap, l3_cdp))
    }

    pub fn alloc_assoc_set_pid(&self, pid: Pid, class_id: ClassId) -> PqosResult<()> {
        self.locked(|session| {
            session
                .backend
                .alloc_assoc_set_pid(&session.cap, pid, class_id)
        })
    }

    pub fn alloc_assoc_get_pid(&self, pid: Pid) -> PqosResult<ClassId> {
        self.locked(|session| session.backend.alloc_assoc_get_pid(&session.cap, pid))
    }

    pub fn alloc_assign_pid(&self, technology: Technology, pids: &[Pid]) -> PqosResult<ClassId> {
        check_technology(technology)?;
        if pids.is_empty() {
            return Err(PqosError::param("no tasks to assign"));
        }
        self.locked(|session| {
            session
                .backend
                .alloc_assign_pid(&session.cap, technology, pids)
        })
    }

    pub fn alloc_release_pid(&self, pids: &[Pid]) -> PqosResult<()> {
        if pids.is_empty() {
            return Err(PqosError::param("no tasks to release"));
        }
        self.locked(|session| session.backend.alloc_release_pid(&session.cap, pids))
    }

    /// Puts every core back on RMID 0.
    pub fn mon_reset(&self) -> PqosResult<()> {
        self.locked(|session| session.backend.mon_reset(&session.cap))
    }

    pub fn mon_assoc_get(&self, core_id: LogicalCoreId) -> PqosResult<Rmid> {
        self.locked(|session| session.backend.mon_assoc_get(core_id))
    }

    pub fn mon_start(
        &self,
        cores: &[LogicalCoreId],
        event: MonEvent,
        group: &mut MonGroup,
    ) -> PqosResult<()> {
        check_mon_event(event)?;
        if cores.is_empty() {
            return Err(PqosError::param("no cores to monitor"));
        }
        if group.is_valid() {
            return Err(PqosError::param("group is already started"));
        }
        self.locked(|session| {
            session
                .backend
                .mon_start(&session.cap, cores, event, group)
        })
    }

    pub fn mon_start_pid(&self, pid: Pid, event: MonEvent, group: &mut MonGroup) -> PqosResult<()> {
        check_mon_event(event)?;
        if group.is_valid() {
            return Err(PqosError::param("group is already started"));
        }
        self.locked(|session| {
            session
                .backend
                .mon_start_pid(&session.cap, pid, event, group)
        })
    }

    pub fn mon_stop(&self, group: &mut MonGroup) -> PqosResult<()> {
        if !group.is_valid() {
            return Err(PqosError::param("group is not started"));
        }
        self.locked(|session| session.backend.mon_stop(group))
    }

    /// Refreshes the values of every group.
    pub fn mon_poll(&self, groups: &mut [&mut MonGroup]) -> PqosResult<()> {
        if groups.is_empty() {
            return Err(PqosError::param("no groups to poll"));
        }
        if groups.iter().any(|group| !group.is_valid()) {
            return Err(PqosError::param("group is not started"));
        }
        self.locked(|session| {
            for group in groups.iter_mut() {
                session.backend.mon_poll(&session.cap, group)?;
            }
            Ok(())
        })
    }
}

fn start_session(
    config: &PqosConfig,
    interface: Interface,
    platform: &Platform,
) -> PqosResult<Session> {
    let msr = match interface {
        Interface::Msr => Some(platform.msr.as_ref()),
        Interface::Os => None,
    };
    let mut cap = cap::discover(platform.cpuid.as_ref(), msr, &platform.cpu)?;

    let support = OsSupport::detect(&config.paths.proc);
    let perf_rdt = PerfRdt::discover(&config.paths.perf_rdt)?;
    let perf_events = perf_rdt
        .as_ref()
        .map_or(MonEvent::empty(), PerfRdt::supported_events);
    cap::apply_os_support(&mut cap, &support, perf_events);

    let backend: Box<dyn Backend> = match interface {
        Interface::Msr => Box::new(HwBackend::new(
            platform.msr.clone(),
            platform.cpu.clone(),
            config.monitoring.perf_counters_in_use,
        )),
        Interface::Os => {
            if !support.resctrl {
                tracing::error!("the kernel has no resctrl filesystem");
                return Err(PqosError::interface("resctrl is not available"));
            }
            let paths = OsBackendPaths {
                resctrl: &config.paths.resctrl,
                proc: &config.paths.proc,
            };
            Box::new(OsBackend::init(
                &mut cap,
                paths,
                platform.cpu.clone(),
                platform.mounter.clone(),
                platform.perf.clone(),
                perf_rdt,
            )?)
        }
    };

    Ok(Session { cap, backend })
}

/// `RDT_IFACE`, when set, has to agree with the configured interface.
pub(crate) fn check_iface_env(configured: Interface, env: Option<String>) -> PqosResult<Interface> {
    let Some(value) = env else {
        return Ok(configured);
    };

    let pinned = value
        .parse::<Interface>()
        .map_err(|error| PqosError::init(format!("{RDT_IFACE_ENV}: {error}")))?;
    if pinned != configured {
        tracing::error!("{RDT_IFACE_ENV}={value} conflicts with the {configured} interface");
        return Err(PqosError::init(format!(
            "{RDT_IFACE_ENV} requires the {pinned} interface, {configured} requested"
        )));
    }
    Ok(configured)
}

fn not_initialized() -> PqosError {
    PqosError::init("library is not initialized")
}

fn check_class_bound(class_id: ClassId, num_classes: u32) -> PqosResult<()> {
    if class_id < num_classes {
        Ok(())
    } else {
        Err(PqosError::param(format!(
            "class {class_id} is out of range, {num_classes} classes available"
        )))
    }
}

fn check_mask_width(mask: u64, num_ways: u32) -> PqosResult<()> {
    if mask & !ways_mask(num_ways) == 0 {
        Ok(())
    } else {
        Err(PqosError::param(format!(
            "mask {mask:#x} is wider than {num_ways} ways"
        )))
    }
}

fn check_technology(technology: Technology) -> PqosResult<()> {
    if technology.is_empty() {
        return Err(PqosError::param("no allocation technology selected"));
    }
    Ok(())
}

/// At least one RDT event is needed, IPC and LLC misses only ride along.
fn check_mon_event(event: MonEvent) -> PqosResult<()> {
    if event.bits() & !MonEvent::all().bits() != 0 {
        return Err(PqosError::param(format!(
            "unknown monitoring events {:#x}",
            event.bits() & !MonEvent::all().bits()
        )));
    }
    if !event.intersects(MonEvent::RDT) {
        return Err(PqosError::param(
            "performance events can't be monitored without an RDT event",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
