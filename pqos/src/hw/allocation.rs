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

use pqos_cpu_utils::CoreInfo;
use pqos_cpu_utils::CpuInfo;
use pqos_cpu_utils::LogicalCoreId;
use pqos_msr::MsrAccess;

use super::registers::*;
use crate::backend::check_assign_scope;
use crate::backend::check_cdp_request;
use crate::backend::class_limit;
use crate::backend::highest_unused_class;
use crate::cap::Capabilities;
use crate::cap::L2CaCap;
use crate::cap::L3CaCap;
use crate::cap::MbaCap;
use crate::errors::PqosError;
use crate::types::*;
use crate::utils::ways_mask;
use crate::PqosResult;

/// Class of service programming through model specific registers.
pub(crate) struct HwAllocation {
    msr: Arc<dyn MsrAccess>,
    cpu: Arc<CpuInfo>,
}

impl HwAllocation {
    pub(crate) fn new(msr: Arc<dyn MsrAccess>, cpu: Arc<CpuInfo>) -> Self {
        Self { msr, cpu }
    }

    fn socket_core(&self, socket: u32) -> PqosResult<LogicalCoreId> {
        self.cpu
            .one_core_on_socket(socket)
            .ok_or_else(|| PqosError::param(format!("socket {socket} doesn't exist")))
    }

    fn l2_core(&self, l2_id: u32) -> PqosResult<LogicalCoreId> {
        self.cpu
            .one_core_on_l2(l2_id)
            .ok_or_else(|| PqosError::param(format!("L2 cluster {l2_id} doesn't exist")))
    }

    fn check_core(&self, core_id: LogicalCoreId) -> PqosResult<()> {
        if self.cpu.check_core(core_id) {
            Ok(())
        } else {
            Err(PqosError::param(format!("core {core_id} doesn't exist")))
        }
    }

    fn write_l3_class(&self, core_id: LogicalCoreId, l3ca: &L3CaCap, ca: &L3Ca) -> PqosResult<()> {
        match (l3ca.cdp_on, ca.mask) {
            (true, L3Mask::Cdp { code, data }) => {
                let data_register = L3_MASK_BASE + ca.class_id * 2;
                self.msr.write(core_id, data_register, data)?;
                self.msr.write(core_id, data_register + 1, code)?;
            }
            (false, L3Mask::Ways(ways)) => {
                self.msr.write(core_id, L3_MASK_BASE + ca.class_id, ways)?;
            }
            (true, L3Mask::Ways(_)) => {
                tracing::error!("L3 CDP is on, class {} needs code and data masks", ca.class_id);
                return Err(PqosError::failed("L3 CDP is on, code and data masks are required"));
            }
            (false, L3Mask::Cdp { .. }) => {
                tracing::error!("attempting to set CDP class {} while L3 CDP is off", ca.class_id);
                return Err(PqosError::failed("L3 CDP is off, code and data masks are not allowed"));
            }
        }
        Ok(())
    }

    fn read_l3_class(
        &self,
        core_id: LogicalCoreId,
        l3ca: &L3CaCap,
        class_id: ClassId,
    ) -> PqosResult<L3Ca> {
        let mask = if l3ca.cdp_on {
            let data_register = L3_MASK_BASE + class_id * 2;
            let data = self.msr.read(core_id, data_register)?;
            let code = self.msr.read(core_id, data_register + 1)?;
            L3Mask::Cdp { code, data }
        } else {
            L3Mask::Ways(self.msr.read(core_id, L3_MASK_BASE + class_id)?)
        };
        Ok(L3Ca { class_id, mask })
    }

    pub(crate) fn l3ca_set(&self, cap: &Capabilities, socket: u32, cas: &[L3Ca]) -> PqosResult<()> {
        let l3ca = l3ca_cap(cap)?;
        let core_id = self.socket_core(socket)?;
        for ca in cas {
            self.write_l3_class(core_id, l3ca, ca)?;
        }
        Ok(())
    }

    pub(crate) fn l3ca_get(&self, cap: &Capabilities, socket: u32) -> PqosResult<Vec<L3Ca>> {
        let l3ca = l3ca_cap(cap)?;
        let core_id = self.socket_core(socket)?;
        (0..l3ca.num_classes)
            .map(|class_id| self.read_l3_class(core_id, l3ca, class_id))
            .collect()
    }

    pub(crate) fn l2ca_set(&self, cap: &Capabilities, l2_id: u32, cas: &[L2Ca]) -> PqosResult<()> {
        l2ca_cap(cap)?;
        let core_id = self.l2_core(l2_id)?;
        for ca in cas {
            self.msr
                .write(core_id, L2_MASK_BASE + ca.class_id, ca.ways_mask)?;
        }
        Ok(())
    }

    pub(crate) fn l2ca_get(&self, cap: &Capabilities, l2_id: u32) -> PqosResult<Vec<L2Ca>> {
        let l2ca = l2ca_cap(cap)?;
        let core_id = self.l2_core(l2_id)?;
        (0..l2ca.num_classes)
            .map(|class_id| {
                let ways_mask = self.msr.read(core_id, L2_MASK_BASE + class_id)?;
                Ok(L2Ca {
                    class_id,
                    ways_mask,
                })
            })
            .collect()
    }

    pub(crate) fn mba_set(
        &self,
        cap: &Capabilities,
        socket: u32,
        requested: &[Mba],
    ) -> PqosResult<Vec<Mba>> {
        let mba = mba_cap(cap)?;
        let core_id = self.socket_core(socket)?;

        let mut applied = Vec::with_capacity(requested.len());
        for entry in requested {
            let register_id = MBA_BASE + entry.class_id;
            self.msr
                .write(core_id, register_id, mba_throttle(mba, entry.mb_rate))?;
            let throttle = self.msr.read(core_id, register_id)?;
            applied.push(Mba {
                class_id: entry.class_id,
                mb_rate: mba_rate(throttle),
            });
        }
        Ok(applied)
    }

    pub(crate) fn mba_get(&self, cap: &Capabilities, socket: u32) -> PqosResult<Vec<Mba>> {
        let mba = mba_cap(cap)?;
        let core_id = self.socket_core(socket)?;
        (0..mba.num_classes)
            .map(|class_id| {
                let throttle = self.msr.read(core_id, MBA_BASE + class_id)?;
                Ok(Mba {
                    class_id,
                    mb_rate: mba_rate(throttle),
                })
            })
            .collect()
    }

    fn read_class(&self, core_id: LogicalCoreId) -> PqosResult<ClassId> {
        let assoc = self.msr.read(core_id, PQR_ASSOC)?;
        Ok((assoc >> PQR_ASSOC_COS_SHIFT) as ClassId)
    }

    /// The RMID half of the register is kept.
    fn write_class(&self, core_id: LogicalCoreId, class_id: ClassId) -> PqosResult<()> {
        let assoc = self.msr.read(core_id, PQR_ASSOC)?;
        let assoc = (assoc & PQR_ASSOC_RMID_MASK) | ((class_id as u64) << PQR_ASSOC_COS_SHIFT);
        self.msr.write(core_id, PQR_ASSOC, assoc)?;
        Ok(())
    }

    pub(crate) fn assoc_set(
        &self,
        cap: &Capabilities,
        core_id: LogicalCoreId,
        class_id: ClassId,
    ) -> PqosResult<()> {
        self.check_core(core_id)?;
        let num_classes = max_classes(cap)?;
        if class_id >= num_classes {
            return Err(PqosError::param(format!(
                "class {class_id} is out of range, {num_classes} classes available"
            )));
        }
        self.write_class(core_id, class_id)
    }

    pub(crate) fn assoc_get(&self, core_id: LogicalCoreId) -> PqosResult<ClassId> {
        self.check_core(core_id)?;
        self.read_class(core_id)
    }

    /// Highest class in `1..limit` that no core in `scope` uses.
    fn unused_class(&self, scope: &[LogicalCoreId], limit: u32) -> PqosResult<ClassId> {
        let mut used = vec![false; limit as usize];
        for core_id in scope {
            let class_id = self.read_class(*core_id)?;
            if let Some(slot) = used.get_mut(class_id as usize) {
                *slot = true;
            }
        }
        highest_unused_class(&used, limit)
    }

    pub(crate) fn assign(
        &self,
        cap: &Capabilities,
        technology: Technology,
        cores: &[LogicalCoreId],
    ) -> PqosResult<ClassId> {
        check_assign_scope(&self.cpu, technology, cores)?;
        let limit = class_limit(cap, technology)?;

        let Some(first) = cores.first().and_then(|core_id| self.cpu.core(*core_id)) else {
            return Err(PqosError::param("no cores to assign"));
        };
        let scope = if technology.contains(Technology::L2CA) {
            self.cpu
                .cores_on_l2(first.l2_id)
                .map(|core| core.lcore)
                .collect::<Vec<_>>()
        } else {
            self.cpu
                .cores_on_socket(first.socket)
                .map(|core| core.lcore)
                .collect::<Vec<_>>()
        };

        let class_id = self.unused_class(&scope, limit)?;

        let previous = cores
            .iter()
            .map(|core_id| Ok((*core_id, self.read_class(*core_id)?)))
            .collect::<PqosResult<Vec<_>>>()?;

        for (position, core_id) in cores.iter().enumerate() {
            if let Err(error) = self.write_class(*core_id, class_id) {
                tracing::error!("associating core {core_id} with class {class_id} failed: {error}");
                for (done_core, previous_class) in &previous[..position] {
                    if let Err(rollback_error) = self.write_class(*done_core, *previous_class) {
                        tracing::error!("restoring class of core {done_core} failed: {rollback_error}");
                    }
                }
                return Err(error);
            }
        }

        tracing::info!("assigned class {class_id} to cores {cores:?}");
        Ok(class_id)
    }

    pub(crate) fn release(&self, cores: &[LogicalCoreId]) -> PqosResult<()> {
        for core_id in cores {
            self.check_core(*core_id)?;
        }
        for core_id in cores {
            self.write_class(*core_id, 0)?;
        }
        Ok(())
    }

    /// Grants every class all ways and full bandwidth, moves every core to
    /// class 0 and optionally switches L3 CDP.
    pub(crate) fn reset(&self, cap: &mut Capabilities, l3_cdp: CdpConfig) -> PqosResult<()> {
        check_cdp_request(cap, l3_cdp)?;

        let sockets = self.cpu.sockets();
        if let Some(l3ca) = cap.l3ca().copied() {
            let registers = if l3ca.cdp_on {
                l3ca.num_classes * 2
            } else {
                l3ca.num_classes
            };
            for socket in &sockets {
                let core_id = self.socket_core(*socket)?;
                for register in 0..registers {
                    self.msr
                        .write(core_id, L3_MASK_BASE + register, ways_mask(l3ca.num_ways))?;
                }
            }
        }

        if let Some(l2ca) = cap.l2ca().copied() {
            for l2_id in self.cpu.l2_ids() {
                let core_id = self.l2_core(l2_id)?;
                for class_id in 0..l2ca.num_classes {
                    self.msr
                        .write(core_id, L2_MASK_BASE + class_id, ways_mask(l2ca.num_ways))?;
                }
            }
        }

        if let Some(mba) = cap.mba().copied() {
            for socket in &sockets {
                let core_id = self.socket_core(*socket)?;
                for class_id in 0..mba.num_classes {
                    self.msr.write(core_id, MBA_BASE + class_id, 0)?;
                }
            }
        }

        for core in self.cpu.cores() {
            self.write_class(core.lcore, 0)?;
        }

        if let Some(l3ca) = cap.l3ca().copied() {
            let cdp_on = match l3_cdp {
                CdpConfig::On => true,
                CdpConfig::Off => false,
                CdpConfig::Any => l3ca.cdp_on,
            };
            if cdp_on != l3ca.cdp_on {
                for socket in &sockets {
                    self.set_l3_cdp(self.socket_core(*socket)?, cdp_on)?;
                }
                tracing::info!("L3 CDP turned {}", if cdp_on { "on" } else { "off" });
                cap.l3_cdp_change(cdp_on);
            }
        }

        Ok(())
    }

    fn set_l3_cdp(&self, core_id: LogicalCoreId, enable: bool) -> PqosResult<()> {
        let qos_cfg = self.msr.read(core_id, L3_QOS_CFG)?;
        let qos_cfg = if enable {
            qos_cfg | L3_QOS_CFG_CDP_ENABLE
        } else {
            qos_cfg & !L3_QOS_CFG_CDP_ENABLE
        };
        self.msr.write(core_id, L3_QOS_CFG, qos_cfg)?;
        Ok(())
    }

    /// A class no core of the domain uses, for the first domain that has one.
    fn probe_slot<'c>(
        &self,
        domains: impl IntoIterator<Item = (u32, Vec<&'c CoreInfo>)>,
        limit: u32,
    ) -> PqosResult<(u32, ClassId)> {
        for (domain, cores) in domains {
            let scope = cores.iter().map(|core| core.lcore).collect::<Vec<_>>();
            match self.unused_class(&scope, limit) {
                Ok(class_id) => return Ok((domain, class_id)),
                Err(PqosError::Resource(_)) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(PqosError::resource(
            "no free class to probe the minimum mask width",
        ))
    }

    /// Tries masks of 1, 2, .. ways on a free class until the hardware keeps
    /// one as written. The class definition is restored afterwards.
    pub(crate) fn l3ca_get_min_cbm_bits(&self, cap: &Capabilities) -> PqosResult<u32> {
        let l3ca = *l3ca_cap(cap)?;
        let sockets = self
            .cpu
            .sockets()
            .into_iter()
            .map(|socket| (socket, self.cpu.cores_on_socket(socket).collect()));
        let (socket, class_id) = self.probe_slot(sockets, l3ca.num_classes)?;
        let core_id = self.socket_core(socket)?;
        let original = self.read_l3_class(core_id, &l3ca, class_id)?;

        let min_bits = (1..=l3ca.num_ways).find(|ways| {
            let mask = ways_mask(*ways);
            let probe = L3Ca {
                class_id,
                mask: if l3ca.cdp_on {
                    L3Mask::Cdp {
                        code: mask,
                        data: mask,
                    }
                } else {
                    L3Mask::Ways(mask)
                },
            };
            self.write_l3_class(core_id, &l3ca, &probe).is_ok()
                && self
                    .read_l3_class(core_id, &l3ca, class_id)
                    .map_or(false, |read| read == probe)
        });

        self.write_l3_class(core_id, &l3ca, &original)?;
        min_bits.ok_or_else(|| PqosError::failed("no L3 mask was accepted by the hardware"))
    }

    pub(crate) fn l2ca_get_min_cbm_bits(&self, cap: &Capabilities) -> PqosResult<u32> {
        let l2ca = *l2ca_cap(cap)?;
        let clusters = self
            .cpu
            .l2_ids()
            .into_iter()
            .map(|l2_id| (l2_id, self.cpu.cores_on_l2(l2_id).collect()));
        let (l2_id, class_id) = self.probe_slot(clusters, l2ca.num_classes)?;
        let core_id = self.l2_core(l2_id)?;
        let register_id = L2_MASK_BASE + class_id;
        let original = self.msr.read(core_id, register_id)?;

        let min_bits = (1..=l2ca.num_ways).find(|ways| {
            let mask = ways_mask(*ways);
            self.msr.write(core_id, register_id, mask).is_ok()
                && self
                    .msr
                    .read(core_id, register_id)
                    .map_or(false, |read| read == mask)
        });

        self.msr.write(core_id, register_id, original)?;
        min_bits.ok_or_else(|| PqosError::failed("no L2 mask was accepted by the hardware"))
    }
}

fn l3ca_cap(cap: &Capabilities) -> PqosResult<&L3CaCap> {
    cap.l3ca()
        .ok_or_else(|| PqosError::resource("L3 CAT is not supported"))
}

fn l2ca_cap(cap: &Capabilities) -> PqosResult<&L2CaCap> {
    cap.l2ca()
        .ok_or_else(|| PqosError::resource("L2 CAT is not supported"))
}

fn mba_cap(cap: &Capabilities) -> PqosResult<&MbaCap> {
    cap.mba()
        .ok_or_else(|| PqosError::resource("MBA is not supported"))
}

/// The largest class count among the allocation technologies present.
fn max_classes(cap: &Capabilities) -> PqosResult<u32> {
    [
        cap.l3ca().map(|l3ca| l3ca.num_classes),
        cap.l2ca().map(|l2ca| l2ca.num_classes),
        cap.mba().map(|mba| mba.num_classes),
    ]
    .into_iter()
    .flatten()
    .max()
    .ok_or_else(|| PqosError::resource("no allocation technology is supported"))
}

/// Throttling register value for a requested rate, rounded to the step.
pub(crate) fn mba_throttle(mba: &MbaCap, mb_rate: u32) -> u64 {
    let step = mba.throttle_step.max(1);
    let rounded = ((mb_rate + step / 2) / step) * step;
    let throttle = 100u32.saturating_sub(rounded).min(mba.throttle_max);
    throttle as u64
}

fn mba_rate(throttle: u64) -> u32 {
    100u32.saturating_sub(throttle.min(100) as u32)
}
