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

use std::collections::BTreeMap;
use std::path::Path;

use super::PerfEventConfig;
use super::PerfEventKind;
use crate::errors::PqosError;
use crate::types::MonEvent;
use crate::PqosResult;

const RDT_EVENTS: [(PerfEventKind, &str); 3] = [
    (PerfEventKind::LlcOccupancy, "llc_occupancy"),
    (PerfEventKind::LocalBytes, "local_bytes"),
    (PerfEventKind::TotalBytes, "total_bytes"),
];

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct RdtEvent {
    pub(crate) config: PerfEventConfig,
    pub(crate) scale: f64,
}

/// The RDT perf pmu, `/sys/devices/intel_cqm` on kernels that have it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PerfRdt {
    events: BTreeMap<PerfEventKind, RdtEvent>,
}

impl PerfRdt {
    /// `None` when the kernel has no such pmu.
    pub(crate) fn discover(root: &Path) -> PqosResult<Option<Self>> {
        let type_path = root.join("type");
        if !type_path.exists() {
            tracing::debug!("no RDT perf pmu at {}", root.display());
            return Ok(None);
        }
        let content = read(&type_path)?;
        let perf_type = content
            .trim()
            .parse::<u32>()
            .map_err(|_| PqosError::malformed(&type_path, content))?;

        let mut events = BTreeMap::new();
        for (kind, name) in RDT_EVENTS {
            let event_path = root.join("events").join(name);
            if !event_path.exists() {
                continue;
            }
            let content = read(&event_path)?;
            let config = parse_event_config(&content)
                .ok_or_else(|| PqosError::malformed(&event_path, content.clone()))?;

            let scale_path = root.join("events").join(format!("{name}.scale"));
            let scale = if scale_path.exists() {
                let content = read(&scale_path)?;
                content
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| PqosError::malformed(&scale_path, content))?
            } else {
                1.0
            };

            events.insert(
                kind,
                RdtEvent {
                    config: PerfEventConfig { perf_type, config },
                    scale,
                },
            );
        }

        tracing::debug!("RDT perf pmu type {perf_type}, events {events:?}");
        Ok(Some(Self { events }))
    }

    pub(crate) fn event(&self, kind: PerfEventKind) -> Option<&RdtEvent> {
        self.events.get(&kind)
    }

    /// Monitoring events the pmu can count.
    pub(crate) fn supported_events(&self) -> MonEvent {
        let mut supported = MonEvent::empty();
        if self.events.contains_key(&PerfEventKind::LlcOccupancy) {
            supported |= MonEvent::L3_OCCUP;
        }
        if self.events.contains_key(&PerfEventKind::LocalBytes) {
            supported |= MonEvent::LMEM_BW;
        }
        if self.events.contains_key(&PerfEventKind::TotalBytes) {
            supported |= MonEvent::TMEM_BW;
        }
        if supported.contains(MonEvent::LMEM_BW | MonEvent::TMEM_BW) {
            supported |= MonEvent::RMEM_BW;
        }
        supported
    }
}

/// `event=0x02` possibly followed by more `,term=value` pairs.
fn parse_event_config(content: &str) -> Option<u64> {
    content
        .trim()
        .split(',')
        .find_map(|term| term.trim().strip_prefix("event="))
        .and_then(|value| {
            let value = value.trim();
            match value.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => value.parse::<u64>().ok(),
            }
        })
}

fn read(path: &Path) -> PqosResult<String> {
    std::fs::read_to_string(path).map_err(|error| PqosError::io("reading", path, error))
}
