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

use tracing_subscriber::filter::LevelFilter;

use crate::config_loader::load_config;
use crate::Interface;
use crate::Logs;
use crate::Monitoring;
use crate::Paths;
use crate::PerfCounterPolicy;
use crate::PqosConfig;

fn fixture(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("src/tests");
    path.push(name);
    path
}

#[test]
fn parse_full_config() {
    let path = fixture("full.toml");
    let config_dir = path.parent().unwrap().to_path_buf();

    let actual_config = load_config(path.to_str().unwrap()).unwrap();

    let expected_config = PqosConfig {
        interface: Interface::Os,
        lock_file: config_dir.join("lock/libpqos"),
        paths: Paths {
            resctrl: "/mnt/resctrl".into(),
            proc: config_dir.join("fake/proc"),
            sysfs_cpu: "/sys/devices/system/cpu".into(),
            perf_rdt: "/sys/devices/intel_cqm".into(),
            dev_cpu: "/dev/cpu".into(),
        },
        monitoring: Monitoring {
            perf_counters_in_use: PerfCounterPolicy::Fail,
        },
        logs: Logs {
            log_level: LevelFilter::DEBUG,
        },
    };

    assert_eq!(actual_config, expected_config);
}

#[test]
fn parse_minimal_config_uses_defaults() {
    let path = fixture("minimal.toml");

    let actual_config = load_config(path.to_str().unwrap()).unwrap();

    assert_eq!(actual_config.interface, Interface::Msr);
    assert_eq!(actual_config.paths, Paths::default());
    assert_eq!(actual_config.monitoring, Monitoring::default());
    assert_eq!(actual_config.logs, Logs::default());
    assert_eq!(actual_config.lock_file, PathBuf::from("/var/lock/libpqos"));
}

#[test]
fn missing_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    assert!(load_config(path.to_str().unwrap()).is_err());
}

#[test]
fn interface_from_str() {
    assert_eq!("OS".parse::<Interface>().unwrap(), Interface::Os);
    assert_eq!(" msr ".parse::<Interface>().unwrap(), Interface::Msr);
    assert!("resctrl".parse::<Interface>().is_err());
}
