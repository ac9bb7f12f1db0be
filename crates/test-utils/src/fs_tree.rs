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

use std::fs;
use std::path::Path;
use std::path::PathBuf;

/// Writes `content` creating all parent directories, panics on failure.
pub fn write_file(path: impl AsRef<Path>, content: &str) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

#[derive(Clone, Debug)]
struct CacheResource {
    num_closids: u32,
    num_ways: u32,
    domains: Vec<u32>,
    min_cbm_bits: u32,
}

/// A mounted resctrl filesystem as the kernel lays it out: root group files,
/// `info/` and pre-created `COS<n>` groups with default schemata.
#[derive(Clone, Debug)]
pub struct ResctrlTree {
    root: PathBuf,
    num_cores: u32,
    groups: u32,
    cdp: bool,
    l3: Option<CacheResource>,
    l2: Option<CacheResource>,
    mba: Option<(u32, Vec<u32>)>,
}

impl ResctrlTree {
    pub fn new(root: impl Into<PathBuf>, num_cores: u32) -> Self {
        Self {
            root: root.into(),
            num_cores,
            groups: 1,
            cdp: false,
            l3: None,
            l2: None,
            mba: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn with_l3(mut self, num_closids: u32, num_ways: u32, domains: &[u32]) -> Self {
        self.l3 = Some(CacheResource {
            num_closids,
            num_ways,
            domains: domains.to_vec(),
            min_cbm_bits: 1,
        });
        self
    }

    pub fn with_l2(mut self, num_closids: u32, num_ways: u32, domains: &[u32]) -> Self {
        self.l2 = Some(CacheResource {
            num_closids,
            num_ways,
            domains: domains.to_vec(),
            min_cbm_bits: 1,
        });
        self
    }

    pub fn with_mba(mut self, num_closids: u32, domains: &[u32]) -> Self {
        self.mba = Some((num_closids, domains.to_vec()));
        self
    }

    pub fn with_l3_min_cbm_bits(mut self, bits: u32) -> Self {
        if let Some(l3) = self.l3.as_mut() {
            l3.min_cbm_bits = bits;
        }
        self
    }

    /// Number of groups including the root one.
    pub fn with_groups(mut self, groups: u32) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_cdp(mut self, cdp: bool) -> Self {
        self.cdp = cdp;
        self
    }

    pub fn group_dir(&self, class_id: u32) -> PathBuf {
        match class_id {
            0 => self.root.clone(),
            class_id => self.root.join(format!("COS{class_id}")),
        }
    }

    pub fn schemata(&self, class_id: u32) -> String {
        fs::read_to_string(self.group_dir(class_id).join("schemata")).unwrap()
    }

    pub fn cpus(&self, class_id: u32) -> String {
        fs::read_to_string(self.group_dir(class_id).join("cpus")).unwrap()
    }

    pub fn tasks(&self, class_id: u32) -> String {
        fs::read_to_string(self.group_dir(class_id).join("tasks")).unwrap()
    }

    pub fn set_cpus(&self, class_id: u32, mask: &str) {
        write_file(self.group_dir(class_id).join("cpus"), mask);
    }

    /// Writes the whole tree, as it looks right after mounting.
    pub fn build(&self) {
        fs::create_dir_all(&self.root).unwrap();
        self.build_info();

        let all_cores = cpumask_of(0..self.num_cores);
        for class_id in 0..self.groups {
            let dir = self.group_dir(class_id);
            let cpus = if class_id == 0 {
                all_cores.clone()
            } else {
                cpumask_of(0..0)
            };
            write_file(dir.join("cpus"), &cpus);
            write_file(dir.join("tasks"), "");
            write_file(dir.join("schemata"), &self.default_schemata());
        }
    }

    /// Removes everything below the mount point.
    pub fn clear(&self) {
        if !self.root.exists() {
            return;
        }
        for entry in fs::read_dir(&self.root).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                fs::remove_dir_all(path).unwrap();
            } else {
                fs::remove_file(path).unwrap();
            }
        }
    }

    fn build_info(&self) {
        let info = self.root.join("info");
        if let Some(l3) = &self.l3 {
            let names: &[&str] = if self.cdp {
                &["L3CODE", "L3DATA"]
            } else {
                &["L3"]
            };
            let closids = if self.cdp {
                l3.num_closids / 2
            } else {
                l3.num_closids
            };
            for name in names {
                write_cache_info(&info.join(name), closids, l3);
            }
        }
        if let Some(l2) = &self.l2 {
            write_cache_info(&info.join("L2"), l2.num_closids, l2);
        }
        if let Some((num_closids, _)) = &self.mba {
            write_file(info.join("MB/num_closids"), &format!("{num_closids}\n"));
            write_file(info.join("MB/min_bandwidth"), "10\n");
            write_file(info.join("MB/bandwidth_gran"), "10\n");
        }
    }

    fn default_schemata(&self) -> String {
        let mut lines = Vec::new();
        if let Some(l3) = &self.l3 {
            let mask = full_mask(l3.num_ways);
            let line = domain_list(&l3.domains, |_| format!("{mask:x}"));
            if self.cdp {
                lines.push(format!("L3CODE:{line}"));
                lines.push(format!("L3DATA:{line}"));
            } else {
                lines.push(format!("L3:{line}"));
            }
        }
        if let Some(l2) = &self.l2 {
            let mask = full_mask(l2.num_ways);
            lines.push(format!(
                "L2:{}",
                domain_list(&l2.domains, |_| format!("{mask:x}"))
            ));
        }
        if let Some((_, domains)) = &self.mba {
            lines.push(format!("MB:{}", domain_list(domains, |_| "100".to_string())));
        }

        let mut schemata = lines.join("\n");
        schemata.push('\n');
        schemata
    }
}

fn write_cache_info(dir: &Path, num_closids: u32, resource: &CacheResource) {
    write_file(dir.join("num_closids"), &format!("{num_closids}\n"));
    write_file(
        dir.join("cbm_mask"),
        &format!("{:x}\n", full_mask(resource.num_ways)),
    );
    write_file(
        dir.join("min_cbm_bits"),
        &format!("{}\n", resource.min_cbm_bits),
    );
}

fn full_mask(num_ways: u32) -> u64 {
    if num_ways >= 64 {
        u64::MAX
    } else {
        (1u64 << num_ways) - 1
    }
}

fn domain_list(domains: &[u32], value: impl Fn(u32) -> String) -> String {
    domains
        .iter()
        .map(|id| format!("{id}={}", value(*id)))
        .collect::<Vec<_>>()
        .join(";")
}

/// Kernel cpumask text for the given cores, e.g. `ff` or `1,00000000`.
fn cpumask_of(cores: std::ops::Range<u32>) -> String {
    let words = cores.end.div_ceil(32).max(1) as usize;
    let mut mask = vec![0u32; words];
    for core in cores {
        mask[(core / 32) as usize] |= 1 << (core % 32);
    }

    let mut groups = mask.iter().rev().map(|word| format!("{word:08x}"));
    let mut text = groups.next().unwrap_or_default();
    for group in groups {
        text.push(',');
        text.push_str(&group);
    }
    text.push('\n');
    text
}

/// The pieces of `/proc` the library looks at.
#[derive(Clone, Debug, Default)]
pub struct ProcTree {
    flags: Vec<String>,
    filesystems: Vec<String>,
    processes: Vec<(u32, Vec<u32>)>,
}

impl ProcTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpu_flags(mut self, flags: &[&str]) -> Self {
        self.flags = flags.iter().map(|flag| flag.to_string()).collect();
        self
    }

    pub fn with_filesystems(mut self, filesystems: &[&str]) -> Self {
        self.filesystems = filesystems.iter().map(|fs| fs.to_string()).collect();
        self
    }

    pub fn with_process(mut self, pid: u32, tids: &[u32]) -> Self {
        self.processes.push((pid, tids.to_vec()));
        self
    }

    pub fn build(&self, root: &Path) {
        let flags = format!(
            "processor\t: 0\nvendor_id\t: GenuineIntel\nflags\t\t: fpu vme {}\n\n",
            self.flags.join(" ")
        );
        write_file(root.join("cpuinfo"), &flags);

        let filesystems = self
            .filesystems
            .iter()
            .map(|fs| format!("nodev\t{fs}\n"))
            .collect::<String>();
        write_file(root.join("filesystems"), &format!("\text4\n{filesystems}"));

        for (pid, tids) in &self.processes {
            let task_dir = root.join(pid.to_string()).join("task");
            fs::create_dir_all(&task_dir).unwrap();
            for tid in tids {
                fs::create_dir_all(task_dir.join(tid.to_string())).unwrap();
            }
        }
    }
}

/// The perf RDT pmu directory, `/sys/devices/intel_cqm` on real systems.
#[derive(Clone, Debug, Default)]
pub struct PerfRdtTree {
    perf_type: u32,
    events: Vec<(String, u32, f64)>,
}

impl PerfRdtTree {
    pub fn new(perf_type: u32) -> Self {
        Self {
            perf_type,
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, name: &str, config: u32, scale: f64) -> Self {
        self.events.push((name.to_string(), config, scale));
        self
    }

    pub fn build(&self, root: &Path) {
        write_file(root.join("type"), &format!("{}\n", self.perf_type));
        let events = root.join("events");
        fs::create_dir_all(&events).unwrap();
        for (name, config, scale) in &self.events {
            write_file(events.join(name), &format!("event=0x{config:02x}\n"));
            write_file(events.join(format!("{name}.scale")), &format!("{scale}\n"));
        }
    }
}
