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

#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![deny(
    dead_code,
    nonstandard_style,
    unused_imports,
    unused_mut,
    unused_variables,
    unused_unsafe,
    unreachable_patterns
)]

mod args;
mod commands;
mod parse;

use std::process::ExitCode;

use clap::Parser;
use eyre::WrapErr as _;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use pqos::Pqos;
use pqos::PqosError;
use pqos::Status;
use pqos_config::load_config;
use pqos_config::PqosConfig;

use crate::args::Args;

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("Error: {report:?}");
            // library failures keep their status code, everything else is a generic error
            let status = report
                .downcast_ref::<PqosError>()
                .map_or(Status::Error, PqosError::status);
            ExitCode::from(status.code())
        }
    }
}

fn run(args: Args) -> eyre::Result<()> {
    let mut config = match &args.config_path {
        Some(path) => {
            let path = path
                .to_str()
                .ok_or_else(|| eyre::eyre!("config path {path:?} is not valid UTF-8"))?;
            load_config(path)?
        }
        None => PqosConfig::default(),
    };
    if let Some(iface) = args.iface {
        config.interface = iface.into();
    }

    let filter = EnvFilter::builder()
        .with_env_var("RUST_LOG")
        .with_default_directive(Directive::from(config.logs.log_level))
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .wrap_err("setting global tracing subscriber failed")?;
    tracing_log::LogTracer::init()?;

    tracing::debug!("starting with config {config:?}");
    let pqos = Pqos::init(&config)?;
    let result = commands::run_command(&pqos, args.command);
    let finished = pqos.fini();
    result?;
    finished?;
    Ok(())
}
