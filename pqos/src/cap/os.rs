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

use super::types::Capabilities;
use crate::types::MonEvent;

/// What the running kernel exposes, read from `/proc`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct OsSupport {
    pub(crate) cqm: bool,
    pub(crate) cat_l3: bool,
    pub(crate) cat_l2: bool,
    pub(crate) mba: bool,
    pub(crate) resctrl: bool,
}

impl OsSupport {
    /// Missing or unreadable files mean no support.
    pub(crate) fn detect(proc_root: &Path) -> Self {
        let flags = std::fs::read_to_string(proc_root.join("cpuinfo")).unwrap_or_default();
        let has_flag = |name: &str| cpu_flag_present(&flags, name);

        let filesystems =
            std::fs::read_to_string(proc_root.join("filesystems")).unwrap_or_default();
        let resctrl = filesystems
            .lines()
            .filter_map(|line| line.split_whitespace().last())
            .any(|fs| fs == "resctrl");

        let support = Self {
            cqm: has_flag("cqm"),
            cat_l3: has_flag("cat_l3"),
            cat_l2: has_flag("cat_l2"),
            mba: has_flag("mba"),
            resctrl,
        };
        tracing::debug!("OS support: {support:?}");
        support
    }
}

/// `name` or one of its `name_*` variants is among the cpu flags.
fn cpu_flag_present(cpuinfo: &str, name: &str) -> bool {
    cpuinfo
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(key, _)| key.trim() == "flags")
        .flat_map(|(_, flags)| flags.split_whitespace())
        .any(|flag| {
            flag == name
                || flag
                    .strip_prefix(name)
                    .map_or(false, |rest| rest.starts_with('_'))
        })
}

/// Marks what the kernel can drive. `perf_events` are the monitoring events
/// the perf RDT pmu offers.
pub(crate) fn apply_os_support(caps: &mut Capabilities, support: &OsSupport, perf_events: MonEvent) {
    if let Some(l3ca) = caps.l3ca_mut() {
        l3ca.os_support = support.cat_l3 && support.resctrl;
    }
    if let Some(l2ca) = caps.l2ca_mut() {
        l2ca.os_support = support.cat_l2 && support.resctrl;
    }
    if let Some(mba) = caps.mba_mut() {
        mba.os_support = support.mba && support.resctrl;
    }
    if let Some(mon) = caps.mon_mut() {
        for event in mon.events.iter_mut() {
            event.os_support = if MonEvent::PERF.contains(event.event) {
                true
            } else {
                support.cqm && perf_events.contains(event.event)
            };
        }
    }
}
