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

use thiserror::Error as ThisError;

use pqos::ClassId;
use pqos::L2Ca;
use pqos::L3Ca;
use pqos::L3Mask;
use pqos::LogicalCoreId;
use pqos::Mba;
use pqos::MonEvent;
use pqos::Pid;
use pqos::Technology;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub(crate) enum ArgError {
    #[error("'{0}' is not a number")]
    Number(String),

    #[error("'{0}' is not a valid range, expected <first>-<last> with first <= last")]
    Range(String),

    #[error("'{0}' is not a class definition, expected <class>=<value>")]
    ClassDefinition(String),

    #[error("unknown allocation technology '{0}', expected l3ca, l2ca or mba")]
    Technology(String),

    #[error("unknown monitoring event '{0}'")]
    Event(String),

    #[error("empty list")]
    Empty,
}

/// Cores as `0-3,8,10-11`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CoreList(pub(crate) Vec<LogicalCoreId>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PidList(pub(crate) Vec<Pid>);

fn parse_u32(text: &str) -> Result<u32, ArgError> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    };
    parsed.map_err(|_| ArgError::Number(text.to_string()))
}

/// Cache way masks are hexadecimal, with or without the `0x` prefix.
fn parse_mask(text: &str) -> Result<u64, ArgError> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(|_| ArgError::Number(text.to_string()))
}

fn parse_list(text: &str) -> Result<Vec<u32>, ArgError> {
    let mut items = Vec::new();
    for token in text.split(',').map(str::trim).filter(|token| !token.is_empty()) {
        match token.split_once('-') {
            Some((first, last)) => {
                let (first, last) = (parse_u32(first)?, parse_u32(last)?);
                if first > last {
                    return Err(ArgError::Range(token.to_string()));
                }
                items.extend(first..=last);
            }
            None => items.push(parse_u32(token)?),
        }
    }

    if items.is_empty() {
        return Err(ArgError::Empty);
    }
    items.sort_unstable();
    items.dedup();
    Ok(items)
}

pub(crate) fn parse_core_list(text: &str) -> Result<CoreList, ArgError> {
    let cores = parse_list(text)?
        .into_iter()
        .map(LogicalCoreId::new)
        .collect();
    Ok(CoreList(cores))
}

pub(crate) fn parse_pid_list(text: &str) -> Result<PidList, ArgError> {
    parse_list(text).map(PidList)
}

fn split_class(text: &str) -> Result<(ClassId, &str), ArgError> {
    let (class_id, value) = text
        .split_once('=')
        .ok_or_else(|| ArgError::ClassDefinition(text.to_string()))?;
    Ok((parse_u32(class_id)?, value))
}

/// `<class>=<mask>`, or `<class>=<code mask>,<data mask>` while L3 CDP is on.
pub(crate) fn parse_l3_class(text: &str) -> Result<L3Ca, ArgError> {
    let (class_id, value) = split_class(text)?;
    let mask = match value.split_once(',') {
        Some((code, data)) => L3Mask::Cdp {
            code: parse_mask(code)?,
            data: parse_mask(data)?,
        },
        None => L3Mask::Ways(parse_mask(value)?),
    };
    Ok(L3Ca { class_id, mask })
}

pub(crate) fn parse_l2_class(text: &str) -> Result<L2Ca, ArgError> {
    let (class_id, value) = split_class(text)?;
    Ok(L2Ca {
        class_id,
        ways_mask: parse_mask(value)?,
    })
}

/// `<class>=<percent>`.
pub(crate) fn parse_mba_class(text: &str) -> Result<Mba, ArgError> {
    let (class_id, value) = split_class(text)?;
    Ok(Mba {
        class_id,
        mb_rate: parse_u32(value)?,
    })
}

pub(crate) fn parse_technology(text: &str) -> Result<Technology, ArgError> {
    let mut technology = Technology::empty();
    for name in text.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        technology |= match name.to_ascii_lowercase().as_str() {
            "l3ca" | "l3" => Technology::L3CA,
            "l2ca" | "l2" => Technology::L2CA,
            "mba" => Technology::MBA,
            _ => return Err(ArgError::Technology(name.to_string())),
        };
    }
    if technology.is_empty() {
        return Err(ArgError::Empty);
    }
    Ok(technology)
}

/// Comma separated event names, `all` selects every RDT and perf event.
pub(crate) fn parse_events(text: &str) -> Result<MonEvent, ArgError> {
    let mut event = MonEvent::empty();
    for name in text.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        event |= match name.to_ascii_lowercase().as_str() {
            "all" => MonEvent::all(),
            "llc" => MonEvent::L3_OCCUP,
            "mbl" => MonEvent::LMEM_BW,
            "mbt" => MonEvent::TMEM_BW,
            "mbr" => MonEvent::RMEM_BW,
            "ipc" => MonEvent::IPC,
            "llc-miss" | "llc_miss" => MonEvent::LLC_MISS,
            _ => return Err(ArgError::Event(name.to_string())),
        };
    }
    if event.is_empty() {
        return Err(ArgError::Empty);
    }
    Ok(event)
}
