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
use std::sync::Arc;

use pqos_cpu_utils::CpuInfo;
use pqos_cpu_utils::LogicalCoreId;

use crate::backend::check_assign_scope;
use crate::backend::check_cdp_request;
use crate::backend::class_limit;
use crate::backend::highest_unused_class;
use crate::cap::Capabilities;
use crate::cap::L2CaCap;
use crate::cap::L3CaCap;
use crate::cap::MbaCap;
use crate::errors::PqosError;
use crate::resctrl::CpuMask;
use crate::resctrl::Resctrl;
use crate::resctrl::ResctrlMount;
use crate::types::*;
use crate::PqosResult;

/// Class of service programming through the resctrl filesystem. L3 and MBA
/// domains are sockets, L2 domains are L2 cluster ids.
pub(crate) struct OsAllocation {
    resctrl: Resctrl,
    cpu: Arc<CpuInfo>,
    mounter: Arc<dyn ResctrlMount>,
}

impl OsAllocation {
    pub(crate) fn new(
        resctrl_root: &Path,
        cpu: Arc<CpuInfo>,
        mounter: Arc<dyn ResctrlMount>,
    ) -> Self {
        Self {
            resctrl: Resctrl::new(resctrl_root),
            cpu,
            mounter,
        }
    }

    /// Mounts resctrl when needed, takes class counts and the CDP state from
    /// it and creates one group per usable class.
    pub(crate) fn init(&self, cap: &mut Capabilities) -> PqosResult<()> {
        if num_groups(cap) == 0 {
            tracing::debug!("no allocation technology is driven by the kernel");
            return Ok(());
        }

        if !self.resctrl.is_mounted() {
            let cdp = cap.l3ca().map_or(false, |l3ca| l3ca.cdp_on);
            self.mounter.mount(self.resctrl.root(), cdp)?;
        }
        self.refresh_caps(cap)?;
        self.resctrl.create_groups(num_groups(cap))
    }

    fn refresh_caps(&self, cap: &mut Capabilities) -> PqosResult<()> {
        if cap.l3ca().map_or(false, |l3ca| l3ca.os_support) {
            let cdp_on = self.resctrl.has_info("L3CODE");
            cap.l3_cdp_change(cdp_on);
            let resource = if cdp_on { "L3CODE" } else { "L3" };
            if let (Some(num_closids), Some(l3ca)) = (
                self.resctrl.info_u32(resource, "num_closids")?,
                cap.l3ca_mut(),
            ) {
                l3ca.num_classes = num_closids;
            }
        }

        if cap.l2ca().map_or(false, |l2ca| l2ca.os_support) {
            if let (Some(num_closids), Some(l2ca)) =
                (self.resctrl.info_u32("L2", "num_closids")?, cap.l2ca_mut())
            {
                l2ca.num_classes = num_closids;
            }
        }

        if cap.mba().map_or(false, |mba| mba.os_support) {
            if let (Some(num_closids), Some(mba)) =
                (self.resctrl.info_u32("MB", "num_closids")?, cap.mba_mut())
            {
                mba.num_classes = num_closids;
            }
        }

        tracing::debug!("{} resctrl groups usable", num_groups(cap));
        Ok(())
    }

    fn check_socket(&self, socket: u32) -> PqosResult<()> {
        if self.cpu.sockets().contains(&socket) {
            Ok(())
        } else {
            Err(PqosError::param(format!("socket {socket} doesn't exist")))
        }
    }

    fn check_l2_id(&self, l2_id: u32) -> PqosResult<()> {
        if self.cpu.l2_ids().contains(&l2_id) {
            Ok(())
        } else {
            Err(PqosError::param(format!("L2 cluster {l2_id} doesn't exist")))
        }
    }

    fn check_core(&self, core_id: LogicalCoreId) -> PqosResult<()> {
        if self.cpu.check_core(core_id) {
            Ok(())
        } else {
            Err(PqosError::param(format!("core {core_id} doesn't exist")))
        }
    }

    pub(crate) fn l3ca_set(&self, cap: &Capabilities, socket: u32, cas: &[L3Ca]) -> PqosResult<()> {
        let l3ca = l3ca_cap(cap)?;
        self.check_socket(socket)?;

        for ca in cas {
            check_class(cap, ca.class_id)?;
            if ca.mask.is_cdp() != l3ca.cdp_on {
                tracing::error!(
                    "class {} mask doesn't match the L3 CDP state, CDP is {}",
                    ca.class_id,
                    if l3ca.cdp_on { "on" } else { "off" }
                );
                return Err(PqosError::failed("L3 mask doesn't match the CDP state"));
            }

            let mut schemata = self.resctrl.read_schemata(ca.class_id)?;
            schemata.l3.insert(socket, ca.mask);
            self.resctrl.write_schemata(ca.class_id, &schemata)?;
        }
        Ok(())
    }

    pub(crate) fn l3ca_get(&self, cap: &Capabilities, socket: u32) -> PqosResult<Vec<L3Ca>> {
        let l3ca = l3ca_cap(cap)?;
        self.check_socket(socket)?;

        (0..l3ca.num_classes.min(num_groups(cap)))
            .map(|class_id| {
                let schemata = self.resctrl.read_schemata(class_id)?;
                let mask = schemata.l3.get(&socket).copied().ok_or_else(|| {
                    missing_domain("L3", class_id, socket, &self.resctrl)
                })?;
                Ok(L3Ca { class_id, mask })
            })
            .collect()
    }

    pub(crate) fn l3ca_get_min_cbm_bits(&self, cap: &Capabilities) -> PqosResult<u32> {
        let l3ca = l3ca_cap(cap)?;
        let resource = if l3ca.cdp_on { "L3CODE" } else { "L3" };
        self.resctrl
            .info_u32(resource, "min_cbm_bits")?
            .ok_or_else(|| PqosError::resource("resctrl doesn't report the L3 minimum mask width"))
    }

    pub(crate) fn l2ca_set(&self, cap: &Capabilities, l2_id: u32, cas: &[L2Ca]) -> PqosResult<()> {
        l2ca_cap(cap)?;
        self.check_l2_id(l2_id)?;

        for ca in cas {
            check_class(cap, ca.class_id)?;
            let mut schemata = self.resctrl.read_schemata(ca.class_id)?;
            schemata.l2.insert(l2_id, ca.ways_mask);
            self.resctrl.write_schemata(ca.class_id, &schemata)?;
        }
        Ok(())
    }

    pub(crate) fn l2ca_get(&self, cap: &Capabilities, l2_id: u32) -> PqosResult<Vec<L2Ca>> {
        let l2ca = l2ca_cap(cap)?;
        self.check_l2_id(l2_id)?;

        (0..l2ca.num_classes.min(num_groups(cap)))
            .map(|class_id| {
                let schemata = self.resctrl.read_schemata(class_id)?;
                let ways_mask = schemata.l2.get(&l2_id).copied().ok_or_else(|| {
                    missing_domain("L2", class_id, l2_id, &self.resctrl)
                })?;
                Ok(L2Ca {
                    class_id,
                    ways_mask,
                })
            })
            .collect()
    }

    pub(crate) fn l2ca_get_min_cbm_bits(&self, cap: &Capabilities) -> PqosResult<u32> {
        l2ca_cap(cap)?;
        self.resctrl
            .info_u32("L2", "min_cbm_bits")?
            .ok_or_else(|| PqosError::resource("resctrl doesn't report the L2 minimum mask width"))
    }

    /// The kernel rounds the rate to its granularity, the rounded rate is reported back.
    pub(crate) fn mba_set(
        &self,
        cap: &Capabilities,
        socket: u32,
        requested: &[Mba],
    ) -> PqosResult<Vec<Mba>> {
        mba_cap(cap)?;
        self.check_socket(socket)?;

        let mut applied = Vec::with_capacity(requested.len());
        for entry in requested {
            check_class(cap, entry.class_id)?;
            let mut schemata = self.resctrl.read_schemata(entry.class_id)?;
            schemata.mba.insert(socket, entry.mb_rate);
            self.resctrl.write_schemata(entry.class_id, &schemata)?;

            let schemata = self.resctrl.read_schemata(entry.class_id)?;
            let mb_rate = schemata.mba.get(&socket).copied().ok_or_else(|| {
                missing_domain("MB", entry.class_id, socket, &self.resctrl)
            })?;
            applied.push(Mba {
                class_id: entry.class_id,
                mb_rate,
            });
        }
        Ok(applied)
    }

    pub(crate) fn mba_get(&self, cap: &Capabilities, socket: u32) -> PqosResult<Vec<Mba>> {
        let mba = mba_cap(cap)?;
        self.check_socket(socket)?;

        (0..mba.num_classes.min(num_groups(cap)))
            .map(|class_id| {
                let schemata = self.resctrl.read_schemata(class_id)?;
                let mb_rate = schemata.mba.get(&socket).copied().ok_or_else(|| {
                    missing_domain("MB", class_id, socket, &self.resctrl)
                })?;
                Ok(Mba { class_id, mb_rate })
            })
            .collect()
    }

    /// Adds `cores` to the group of `class_id`. The kernel takes them out of
    /// their previous groups, stale bits left in other groups are cleared too.
    fn move_cores(
        &self,
        cap: &Capabilities,
        cores: &[LogicalCoreId],
        class_id: ClassId,
    ) -> PqosResult<()> {
        let mut moving = CpuMask::new();
        for core_id in cores {
            moving.set(core_id.get());
        }

        let mut mask = self.resctrl.read_cpumask(class_id)?;
        for lcore in moving.cores() {
            mask.set(lcore);
        }
        self.resctrl.write_cpumask(class_id, &mask)?;

        for other in (1..num_groups(cap)).filter(|other| *other != class_id) {
            let mut other_mask = self.resctrl.read_cpumask(other)?;
            let stale = other_mask
                .cores()
                .filter(|lcore| moving.is_set(*lcore))
                .collect::<Vec<_>>();
            if stale.is_empty() {
                continue;
            }
            for lcore in stale {
                other_mask.unset(lcore);
            }
            self.resctrl.write_cpumask(other, &other_mask)?;
        }
        Ok(())
    }

    pub(crate) fn assoc_set(
        &self,
        cap: &Capabilities,
        core_id: LogicalCoreId,
        class_id: ClassId,
    ) -> PqosResult<()> {
        self.check_core(core_id)?;
        check_class(cap, class_id)?;
        self.move_cores(cap, &[core_id], class_id)
    }

    pub(crate) fn assoc_get(&self, cap: &Capabilities, core_id: LogicalCoreId) -> PqosResult<ClassId> {
        self.check_core(core_id)?;
        for class_id in (0..num_groups(cap)).rev() {
            if self.resctrl.read_cpumask(class_id)?.is_set(core_id.get()) {
                return Ok(class_id);
            }
        }
        Err(PqosError::failed(format!(
            "core {core_id} is not in any resctrl group"
        )))
    }

    /// Classes with cores or tasks in them, on any socket.
    fn used_classes(&self, limit: u32) -> PqosResult<Vec<bool>> {
        let mut used = vec![false; limit as usize];
        for class_id in 1..limit {
            used[class_id as usize] = !self.resctrl.read_cpumask(class_id)?.is_empty()
                || !self.resctrl.read_tasks(class_id)?.is_empty();
        }
        Ok(used)
    }

    fn assign_limit(&self, cap: &Capabilities, technology: Technology) -> PqosResult<u32> {
        check_technology(cap, technology)?;
        Ok(class_limit(cap, technology)?.min(num_groups(cap)))
    }

    pub(crate) fn assign(
        &self,
        cap: &Capabilities,
        technology: Technology,
        cores: &[LogicalCoreId],
    ) -> PqosResult<ClassId> {
        check_assign_scope(&self.cpu, technology, cores)?;
        let limit = self.assign_limit(cap, technology)?;
        let class_id = highest_unused_class(&self.used_classes(limit)?, limit)?;

        self.move_cores(cap, cores, class_id)?;
        tracing::info!("assigned class {class_id} to cores {cores:?}");
        Ok(class_id)
    }

    pub(crate) fn release(&self, cap: &Capabilities, cores: &[LogicalCoreId]) -> PqosResult<()> {
        for core_id in cores {
            self.check_core(*core_id)?;
        }
        self.move_cores(cap, cores, 0)
    }

    pub(crate) fn assoc_set_pid(&self, cap: &Capabilities, pid: Pid, class_id: ClassId) -> PqosResult<()> {
        check_class(cap, class_id)?;
        self.resctrl.add_task(class_id, pid)
    }

    /// Tasks the kernel has not seen in any group, including the root one, are rejected.
    pub(crate) fn assoc_get_pid(&self, cap: &Capabilities, pid: Pid) -> PqosResult<ClassId> {
        for class_id in (0..num_groups(cap)).rev() {
            if self.resctrl.read_tasks(class_id)?.contains(&pid) {
                return Ok(class_id);
            }
        }
        Err(PqosError::param(format!("task {pid} is not in any resctrl group")))
    }

    pub(crate) fn assign_pid(
        &self,
        cap: &Capabilities,
        technology: Technology,
        pids: &[Pid],
    ) -> PqosResult<ClassId> {
        if pids.is_empty() {
            return Err(PqosError::param("no tasks to assign"));
        }
        let limit = self.assign_limit(cap, technology)?;
        let class_id = highest_unused_class(&self.used_classes(limit)?, limit)?;

        for pid in pids {
            self.resctrl.add_task(class_id, *pid)?;
        }
        tracing::info!("assigned class {class_id} to tasks {pids:?}");
        Ok(class_id)
    }

    pub(crate) fn release_pid(&self, pids: &[Pid]) -> PqosResult<()> {
        for pid in pids {
            self.resctrl.add_task(0, *pid)?;
        }
        Ok(())
    }

    /// Moves every core back to the root group and remounts resctrl, which
    /// drops all groups and restores default schemata.
    pub(crate) fn reset(&self, cap: &mut Capabilities, l3_cdp: CdpConfig) -> PqosResult<()> {
        check_cdp_request(cap, l3_cdp)?;
        if num_groups(cap) == 0 {
            return Err(PqosError::resource(
                "no allocation technology is driven by the kernel",
            ));
        }

        let cdp_on = match (l3_cdp, cap.l3ca()) {
            (CdpConfig::On, _) => true,
            (CdpConfig::Off, _) => false,
            (CdpConfig::Any, l3ca) => l3ca.map_or(false, |l3ca| l3ca.cdp_on),
        };

        let mut all_cores = CpuMask::new();
        for core in self.cpu.cores() {
            all_cores.set(core.lcore.get());
        }
        self.resctrl.write_cpumask(0, &all_cores)?;

        self.mounter.unmount(self.resctrl.root())?;
        self.mounter.mount(self.resctrl.root(), cdp_on)?;
        self.refresh_caps(cap)?;
        self.resctrl.create_groups(num_groups(cap))?;

        tracing::info!(
            "resctrl remounted, L3 CDP {}",
            if cdp_on { "on" } else { "off" }
        );
        Ok(())
    }
}

/// Groups usable by every kernel driven technology, 0 when there is none.
fn num_groups(cap: &Capabilities) -> u32 {
    [
        cap.l3ca()
            .filter(|l3ca| l3ca.os_support)
            .map(|l3ca| l3ca.num_classes),
        cap.l2ca()
            .filter(|l2ca| l2ca.os_support)
            .map(|l2ca| l2ca.num_classes),
        cap.mba()
            .filter(|mba| mba.os_support)
            .map(|mba| mba.num_classes),
    ]
    .into_iter()
    .flatten()
    .min()
    .unwrap_or(0)
}

fn check_class(cap: &Capabilities, class_id: ClassId) -> PqosResult<()> {
    let groups = num_groups(cap);
    if class_id < groups {
        Ok(())
    } else {
        Err(PqosError::param(format!(
            "class {class_id} is out of range, {groups} resctrl groups available"
        )))
    }
}

fn check_technology(cap: &Capabilities, technology: Technology) -> PqosResult<()> {
    if technology.contains(Technology::L3CA) {
        l3ca_cap(cap)?;
    }
    if technology.contains(Technology::L2CA) {
        l2ca_cap(cap)?;
    }
    if technology.contains(Technology::MBA) {
        mba_cap(cap)?;
    }
    Ok(())
}

fn l3ca_cap(cap: &Capabilities) -> PqosResult<&L3CaCap> {
    cap.l3ca()
        .filter(|l3ca| l3ca.os_support)
        .ok_or_else(|| PqosError::resource("L3 CAT is not supported by the kernel"))
}

fn l2ca_cap(cap: &Capabilities) -> PqosResult<&L2CaCap> {
    cap.l2ca()
        .filter(|l2ca| l2ca.os_support)
        .ok_or_else(|| PqosError::resource("L2 CAT is not supported by the kernel"))
}

fn mba_cap(cap: &Capabilities) -> PqosResult<&MbaCap> {
    cap.mba()
        .filter(|mba| mba.os_support)
        .ok_or_else(|| PqosError::resource("MBA is not supported by the kernel"))
}

fn missing_domain(label: &str, class_id: ClassId, domain: u32, resctrl: &Resctrl) -> PqosError {
    PqosError::malformed(
        resctrl.group_dir(class_id).join("schemata"),
        format!("no {label} entry for domain {domain}"),
    )
}
