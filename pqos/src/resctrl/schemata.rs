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

use crate::types::L3Mask;

/// One class's `schemata` file, keyed by resctrl domain id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Schemata {
    pub(crate) l3: BTreeMap<u32, L3Mask>,
    pub(crate) l2: BTreeMap<u32, u64>,
    pub(crate) mba: BTreeMap<u32, u32>,
}

impl Schemata {
    /// Lines with unknown labels are skipped, a CODE line without its DATA
    /// counterpart is malformed.
    pub(crate) fn parse(text: &str) -> Option<Self> {
        let mut schemata = Self::default();
        let mut code = BTreeMap::new();
        let mut data = BTreeMap::new();

        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let (label, domains) = line.split_once(':')?;
            match label.trim() {
                "L3" => {
                    for (id, ways) in parse_domains(domains, 16)? {
                        schemata.l3.insert(id, L3Mask::Ways(ways));
                    }
                }
                "L3CODE" => code.extend(parse_domains(domains, 16)?),
                "L3DATA" => data.extend(parse_domains(domains, 16)?),
                "L2" => schemata.l2.extend(parse_domains(domains, 16)?),
                "MB" => {
                    for (id, rate) in parse_domains(domains, 10)? {
                        schemata.mba.insert(id, u32::try_from(rate).ok()?);
                    }
                }
                label => tracing::trace!("skipping schemata line with label {label}"),
            }
        }

        if code.len() != data.len() {
            return None;
        }
        for (id, code) in code {
            let data = *data.get(&id)?;
            schemata.l3.insert(id, L3Mask::Cdp { code, data });
        }

        Some(schemata)
    }
}

fn parse_domains(domains: &str, radix: u32) -> Option<Vec<(u32, u64)>> {
    domains
        .split(';')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            let (id, value) = token.split_once('=')?;
            let id = id.trim().parse::<u32>().ok()?;
            let value = u64::from_str_radix(value.trim(), radix).ok()?;
            Some((id, value))
        })
        .collect()
}

fn domain_line<T>(
    label: &str,
    domains: impl Iterator<Item = (u32, T)>,
    value: impl Fn(T) -> String,
) -> String {
    let domains = domains
        .map(|(id, item)| format!("{id}={}", value(item)))
        .collect::<Vec<_>>()
        .join(";");
    format!("{label}:{domains}\n")
}

impl std::fmt::Display for Schemata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cdp = self.l3.values().any(L3Mask::is_cdp);
        if cdp {
            let split = |mask: &L3Mask| match *mask {
                L3Mask::Ways(ways) => (ways, ways),
                L3Mask::Cdp { code, data } => (code, data),
            };
            let code = self.l3.iter().map(|(id, mask)| (*id, split(mask).0));
            write!(f, "{}", domain_line("L3CODE", code, |ways| format!("{ways:x}")))?;
            let data = self.l3.iter().map(|(id, mask)| (*id, split(mask).1));
            write!(f, "{}", domain_line("L3DATA", data, |ways| format!("{ways:x}")))?;
        } else if !self.l3.is_empty() {
            let ways = self.l3.iter().map(|(id, mask)| {
                let ways = match *mask {
                    L3Mask::Ways(ways) => ways,
                    L3Mask::Cdp { data, .. } => data,
                };
                (*id, ways)
            });
            write!(f, "{}", domain_line("L3", ways, |ways| format!("{ways:x}")))?;
        }

        if !self.l2.is_empty() {
            let l2 = self.l2.iter().map(|(id, ways)| (*id, *ways));
            write!(f, "{}", domain_line("L2", l2, |ways| format!("{ways:x}")))?;
        }
        if !self.mba.is_empty() {
            let mba = self.mba.iter().map(|(id, rate)| (*id, *rate));
            write!(f, "{}", domain_line("MB", mba, |rate| rate.to_string()))?;
        }
        Ok(())
    }
}
