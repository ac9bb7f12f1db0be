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

use std::path::PathBuf;

use clap::Args as ClapArgs;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;

use pqos::CdpConfig;
use pqos::Interface;
use pqos::L2Ca;
use pqos::L3Ca;
use pqos::Mba;
use pqos::MonEvent;
use pqos::Pid;
use pqos::Technology;

use crate::parse::*;

#[derive(Parser, Debug)]
#[command(name = "pqos", version, about = "Intel RDT cache and memory bandwidth control")]
pub(crate) struct Args {
    /// TOML config, built-in defaults are used without one.
    #[arg(short, long)]
    pub(crate) config_path: Option<PathBuf>,

    /// Overrides the interface from the config.
    #[arg(short = 'I', long, value_enum)]
    pub(crate) iface: Option<IfaceArg>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum IfaceArg {
    Msr,
    Os,
}

impl From<IfaceArg> for Interface {
    fn from(value: IfaceArg) -> Self {
        match value {
            IfaceArg::Msr => Interface::Msr,
            IfaceArg::Os => Interface::Os,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum CdpArg {
    On,
    Off,
    Any,
}

impl From<CdpArg> for CdpConfig {
    fn from(value: CdpArg) -> Self {
        match value {
            CdpArg::On => CdpConfig::On,
            CdpArg::Off => CdpConfig::Off,
            CdpArg::Any => CdpConfig::Any,
        }
    }
}

/// Cores or tasks a command applies to.
#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
pub(crate) struct Target {
    /// Logical cores, e.g. `0-3,8`.
    #[arg(long, value_parser = parse_core_list)]
    pub(crate) cores: Option<CoreList>,

    /// Task ids, OS interface only.
    #[arg(long, value_parser = parse_pid_list)]
    pub(crate) pids: Option<PidList>,
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
pub(crate) struct MonitorTarget {
    #[arg(long, value_parser = parse_core_list)]
    pub(crate) cores: Option<CoreList>,

    /// Monitors every thread of the task, OS interface only.
    #[arg(long)]
    pub(crate) pid: Option<Pid>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Prints the detected RDT capabilities.
    Caps,

    /// Prints the L3 classes of a socket.
    L3caGet {
        #[arg(long, default_value_t = 0)]
        socket: u32,
    },

    /// Defines L3 classes as `<class>=<mask>`, or `<class>=<code>,<data>` with CDP on.
    L3caSet {
        #[arg(long)]
        socket: u32,
        #[arg(required = true, value_parser = parse_l3_class)]
        classes: Vec<L3Ca>,
    },

    L2caGet {
        #[arg(long, default_value_t = 0)]
        l2_id: u32,
    },

    /// Defines L2 classes as `<class>=<mask>`.
    L2caSet {
        #[arg(long)]
        l2_id: u32,
        #[arg(required = true, value_parser = parse_l2_class)]
        classes: Vec<L2Ca>,
    },

    MbaGet {
        #[arg(long, default_value_t = 0)]
        socket: u32,
    },

    /// Defines bandwidth limits as `<class>=<percent>`.
    MbaSet {
        #[arg(long)]
        socket: u32,
        #[arg(required = true, value_parser = parse_mba_class)]
        classes: Vec<Mba>,
    },

    /// Associates cores or tasks with a class.
    AssocSet {
        #[arg(long)]
        class: u32,
        #[command(flatten)]
        target: Target,
    },

    AssocGet {
        #[command(flatten)]
        target: Target,
    },

    /// Associates cores or tasks with the highest unused class.
    Assign {
        /// Technologies the class is needed for, e.g. `l3ca,mba`.
        #[arg(long, value_parser = parse_technology, default_value = "l3ca")]
        tech: Technology,
        #[command(flatten)]
        target: Target,
    },

    /// Moves cores or tasks back to class 0.
    Release {
        #[command(flatten)]
        target: Target,
    },

    /// Restores the default allocation configuration.
    Reset {
        #[arg(long, value_enum, default_value_t = CdpArg::Any)]
        l3_cdp: CdpArg,
    },

    /// Puts every core back on RMID 0.
    MonReset,

    /// Polls monitoring counters until interrupted or `count` reports are printed.
    Monitor {
        #[command(flatten)]
        target: MonitorTarget,
        /// Any of llc, mbl, mbt, mbr, ipc, llc-miss, or all.
        #[arg(long, value_parser = parse_events, default_value = "llc,mbl,mbt")]
        events: MonEvent,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        #[arg(long)]
        count: Option<u64>,
    },
}
