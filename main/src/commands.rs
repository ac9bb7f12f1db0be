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

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr as _;
use itertools::Itertools;

use pqos::Capabilities;
use pqos::Capability;
use pqos::L2Ca;
use pqos::L3Ca;
use pqos::L3Mask;
use pqos::LogicalCoreId;
use pqos::Mba;
use pqos::MonEvent;
use pqos::MonGroup;
use pqos::MonValues;
use pqos::Pqos;

use crate::args::Command;
use crate::args::MonitorTarget;
use crate::args::Target;
use crate::parse::CoreList;
use crate::parse::PidList;

pub(crate) fn run_command(pqos: &Pqos, command: Command) -> eyre::Result<()> {
    match command {
        Command::Caps => {
            println!("interface: {}", pqos.interface());
            print!("{}", format_caps(&pqos.cap_get()?));
        }
        Command::L3caGet { socket } => {
            for ca in pqos.l3ca_get(socket)? {
                println!("{}", format_l3ca(&ca));
            }
        }
        Command::L3caSet { socket, classes } => {
            pqos.l3ca_set(socket, &classes)?;
            tracing::info!("{} L3 classes set on socket {socket}", classes.len());
        }
        Command::L2caGet { l2_id } => {
            for ca in pqos.l2ca_get(l2_id)? {
                println!("{}", format_l2ca(&ca));
            }
        }
        Command::L2caSet { l2_id, classes } => {
            pqos.l2ca_set(l2_id, &classes)?;
            tracing::info!("{} L2 classes set on cluster {l2_id}", classes.len());
        }
        Command::MbaGet { socket } => {
            for mba in pqos.mba_get(socket)? {
                println!("{}", format_mba(&mba));
            }
        }
        Command::MbaSet { socket, classes } => {
            for actual in pqos.mba_set(socket, &classes)? {
                println!("{} (applied)", format_mba(&actual));
            }
        }
        Command::AssocSet { class, target } => match target {
            Target {
                cores: Some(CoreList(cores)),
                ..
            } => {
                for core in cores {
                    pqos.alloc_assoc_set(core, class)?;
                }
            }
            Target {
                pids: Some(PidList(pids)),
                ..
            } => {
                for pid in pids {
                    pqos.alloc_assoc_set_pid(pid, class)?;
                }
            }
            _ => eyre::bail!("either cores or pids are required"),
        },
        Command::AssocGet { target } => match target {
            Target {
                cores: Some(CoreList(cores)),
                ..
            } => {
                for core in cores {
                    println!("core {core} => class {}", pqos.alloc_assoc_get(core)?);
                }
            }
            Target {
                pids: Some(PidList(pids)),
                ..
            } => {
                for pid in pids {
                    println!("pid {pid} => class {}", pqos.alloc_assoc_get_pid(pid)?);
                }
            }
            _ => eyre::bail!("either cores or pids are required"),
        },
        Command::Assign { tech, target } => {
            let class_id = match target {
                Target {
                    cores: Some(CoreList(cores)),
                    ..
                } => pqos.alloc_assign(tech, &cores)?,
                Target {
                    pids: Some(PidList(pids)),
                    ..
                } => pqos.alloc_assign_pid(tech, &pids)?,
                _ => eyre::bail!("either cores or pids are required"),
            };
            println!("assigned class {class_id}");
        }
        Command::Release { target } => match target {
            Target {
                cores: Some(CoreList(cores)),
                ..
            } => pqos.alloc_release(&cores)?,
            Target {
                pids: Some(PidList(pids)),
                ..
            } => pqos.alloc_release_pid(&pids)?,
            _ => eyre::bail!("either cores or pids are required"),
        },
        Command::Reset { l3_cdp } => pqos.alloc_reset(l3_cdp.into())?,
        Command::MonReset => pqos.mon_reset()?,
        Command::Monitor {
            target,
            events,
            interval_ms,
            count,
        } => monitor(
            pqos,
            target,
            events,
            Duration::from_millis(interval_ms),
            count,
        )?,
    }

    Ok(())
}

fn monitor(
    pqos: &Pqos,
    target: MonitorTarget,
    events: MonEvent,
    interval: Duration,
    count: Option<u64>,
) -> eyre::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .wrap_err("setting Ctrl-C handler failed")?;

    let mut group = MonGroup::new();
    let label = match target {
        MonitorTarget {
            cores: Some(CoreList(cores)),
            ..
        } => {
            pqos.mon_start(&cores, events, &mut group)?;
            format_cores(&cores)
        }
        MonitorTarget { pid: Some(pid), .. } => {
            pqos.mon_start_pid(pid, events, &mut group)?;
            format!("pid {pid}")
        }
        _ => eyre::bail!("either cores or a pid is required"),
    };
    tracing::info!("monitoring {events:?} on {label}");

    println!("{}", format_header(events));
    let result = poll_loop(pqos, &mut group, &label, interval, count, &shutdown);

    // the group has to be stopped even when polling failed
    let stopped = pqos.mon_stop(&mut group);
    result?;
    stopped?;
    Ok(())
}

fn poll_loop(
    pqos: &Pqos,
    group: &mut MonGroup,
    label: &str,
    interval: Duration,
    count: Option<u64>,
    shutdown: &AtomicBool,
) -> eyre::Result<()> {
    let mut reports = 0u64;
    while !shutdown.load(Ordering::Relaxed) && count.map_or(true, |count| reports < count) {
        std::thread::sleep(interval);
        pqos.mon_poll(&mut [&mut *group])?;
        println!("{}", format_row(label, group.event(), group.values()));
        reports += 1;
    }
    Ok(())
}

fn format_mask(mask: u64) -> String {
    format!("{mask:#x}")
}

pub(crate) fn format_l3ca(ca: &L3Ca) -> String {
    match ca.mask {
        L3Mask::Ways(ways) => format!("L3 class {} => {}", ca.class_id, format_mask(ways)),
        L3Mask::Cdp { code, data } => format!(
            "L3 class {} => code {} data {}",
            ca.class_id,
            format_mask(code),
            format_mask(data)
        ),
    }
}

pub(crate) fn format_l2ca(ca: &L2Ca) -> String {
    format!("L2 class {} => {}", ca.class_id, format_mask(ca.ways_mask))
}

pub(crate) fn format_mba(mba: &Mba) -> String {
    format!("MBA class {} => {}%", mba.class_id, mba.mb_rate)
}

pub(crate) fn format_cores(cores: &[LogicalCoreId]) -> String {
    format!("cores {}", cores.iter().join(","))
}

pub(crate) fn format_caps(caps: &Capabilities) -> String {
    let mut out = String::new();
    for cap in caps.iter() {
        let line = match cap {
            Capability::Mon(mon) => format!(
                "monitoring: {} RMIDs, events {}",
                mon.max_rmid,
                mon.events
                    .iter()
                    .map(|event| event_name(event.event))
                    .join(",")
            ),
            Capability::L3ca(l3) => format!(
                "L3 CAT: {} classes, {} ways of {} bytes, CDP {}",
                l3.num_classes,
                l3.num_ways,
                l3.way_size,
                match (l3.cdp, l3.cdp_on) {
                    (false, _) => "unsupported",
                    (true, false) => "off",
                    (true, true) => "on",
                }
            ),
            Capability::L2ca(l2) => format!(
                "L2 CAT: {} classes, {} ways of {} bytes",
                l2.num_classes, l2.num_ways, l2.way_size
            ),
            Capability::Mba(mba) => format!(
                "MBA: {} classes, max {}%, step {}%{}",
                mba.num_classes,
                mba.throttle_max,
                mba.throttle_step,
                if mba.is_linear { "" } else { ", non-linear" }
            ),
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Every event with its short name and column header, in table order.
const EVENTS: [(MonEvent, &str, &str); 6] = [
    (MonEvent::IPC, "ipc", "IPC"),
    (MonEvent::LLC_MISS, "llc-miss", "MISSES"),
    (MonEvent::L3_OCCUP, "llc", "LLC[KB]"),
    (MonEvent::LMEM_BW, "mbl", "MBL[MB]"),
    (MonEvent::RMEM_BW, "mbr", "MBR[MB]"),
    (MonEvent::TMEM_BW, "mbt", "MBT[MB]"),
];

fn event_name(event: MonEvent) -> &'static str {
    EVENTS
        .iter()
        .find(|(known, _, _)| *known == event)
        .map_or("?", |(_, name, _)| name)
}

fn columns(
    events: MonEvent,
) -> impl Iterator<Item = &'static (MonEvent, &'static str, &'static str)> {
    EVENTS
        .iter()
        .filter(move |(event, _, _)| events.contains(*event))
}

pub(crate) fn format_header(events: MonEvent) -> String {
    let names = columns(events).map(|(_, _, header)| header);
    format!("TARGET\t{}", names.format("\t"))
}

/// Bandwidth columns show the bytes transferred since the previous poll.
pub(crate) fn format_row(label: &str, events: MonEvent, values: &MonValues) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;

    let cells = columns(events).map(|(event, _, _)| {
        if *event == MonEvent::IPC {
            format!("{:.2}", values.ipc)
        } else if *event == MonEvent::LLC_MISS {
            format!("{}", values.llc_misses_delta)
        } else if *event == MonEvent::L3_OCCUP {
            format!("{:.1}", values.llc as f64 / KB)
        } else if *event == MonEvent::LMEM_BW {
            format!("{:.1}", values.mbm_local_delta as f64 / MB)
        } else if *event == MonEvent::RMEM_BW {
            format!("{:.1}", values.mbm_remote_delta as f64 / MB)
        } else {
            format!("{:.1}", values.mbm_total_delta as f64 / MB)
        }
    });
    format!("{label}\t{}", cells.format("\t"))
}

#[cfg(test)]
mod tests;
