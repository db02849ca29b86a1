// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Interface-description parsing (§4.G) — the sole evidence the matcher uses
//! to infer topology.

use chrono::Datelike;
use regex::Regex;

use crate::config::MatcherConfig;
use crate::model::ParsedRemote;
use crate::timestamp::Timestamp;

lazy_static::lazy_static! {
    static ref INTERFACE_SHAPE: Regex = Regex::new(r"^\d+/.*$").unwrap();
    static ref YEAR: Regex = Regex::new(r"^\d{4}$").unwrap();
}

/// The numeric interface id portion of a token, starting at the first digit,
/// only when what follows has the "digit, slash, digits" shape required by
/// §4.G step 2 (e.g. `te1/1` → `1/1`; `port5` does not qualify).
fn extract_interface_id(token: &str) -> Option<String> {
    let idx = token.find(|c: char| c.is_ascii_digit())?;
    let candidate = &token[idx..];
    if INTERFACE_SHAPE.is_match(candidate) {
        Some(candidate.to_string())
    } else {
        None
    }
}

fn is_recent_year(token: &str, now: Timestamp) -> bool {
    if !YEAR.is_match(token) {
        return false;
    }
    let Ok(year) = token.parse::<i32>() else {
        return false;
    };
    let current = now.as_datetime().year();
    year <= current && current - year < 15
}

/// Tokenizes `description` on `_`, lowercases, and walks right-to-left
/// looking for an interface-id-shaped token followed by a node token not on
/// the exclude-list. Returns `None` if either half could not be recovered.
pub fn parse_description(
    description: &str,
    config: &MatcherConfig,
    now: Timestamp,
) -> Option<ParsedRemote> {
    let lowered = description.to_lowercase();
    let tokens: Vec<&str> = lowered.split('_').collect();

    let mut interface: Option<String> = None;
    let mut node: Option<String> = None;

    for token in tokens.iter().rev() {
        if token.is_empty() {
            continue;
        }
        if is_recent_year(token, now) {
            continue;
        }
        if interface.is_none() {
            if let Some(id) = extract_interface_id(token) {
                interface = Some(id);
            }
            continue;
        }
        if node.is_none() {
            if !config.node_excludelist.contains(*token) {
                node = Some(token.to_string());
            }
            continue;
        }
        break;
    }

    match (node, interface) {
        (Some(node), Some(interface)) => Some(ParsedRemote { node, interface }),
        _ => None,
    }
}

/// Rejects `Loopback`/`Bundle` interfaces and sub-interfaces (final
/// dot-separated segment all digits), unless `int_check` is disabled for
/// remote-link enumeration where bundle members still matter.
pub fn check_interface_name(name: &str, int_check: bool) -> bool {
    if !int_check {
        return true;
    }
    let lowered = name.to_lowercase();
    if lowered.starts_with("loopback") || lowered.starts_with("bundle") {
        return false;
    }
    if let Some(last) = name.rsplit('.').next() {
        if name.contains('.') && !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    true
}

/// Rejects empty descriptions and any configured excluded prefix.
pub fn check_description(description: &str, config: &MatcherConfig) -> bool {
    if description.is_empty() {
        return false;
    }
    !config
        .description_prefix_excludelist
        .iter()
        .any(|prefix| description.starts_with(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn now() -> Timestamp {
        Timestamp::from_datetime(Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap())
    }

    #[test]
    fn parses_node_and_interface_skipping_year() {
        let config = MatcherConfig::default();
        let parsed = parse_description("DC_link_id_node-b_Te1/1_2020", &config, now()).unwrap();
        assert_eq!(parsed.node, "node-b");
        assert_eq!(parsed.interface, "1/1");
    }

    #[test]
    fn unparsable_description_returns_none() {
        let config = MatcherConfig::default();
        assert!(parse_description("DC_node-b_deadbeef", &config, now()).is_none());
    }

    #[test]
    fn year_token_insertion_does_not_change_result() {
        let config = MatcherConfig::default();
        let without = parse_description("DC_node-b_Te1/1", &config, now()).unwrap();
        let with = parse_description("DC_node-b_Te1/1_2019", &config, now()).unwrap();
        assert_eq!(without, with);
    }

    #[test]
    fn digit_without_slash_does_not_count_as_an_interface() {
        let config = MatcherConfig::default();
        // "port5" has a digit but not the required digit/slash/digits shape,
        // so it must not be mistaken for an interface id (§4.G step 2).
        assert!(parse_description("DC_node-b_port5_2020", &config, now()).is_none());
    }

    #[test]
    fn excluded_node_token_is_skipped() {
        let config = MatcherConfig::default();
        let parsed = parse_description("DC_the_node-b_Te1/1", &config, now()).unwrap();
        assert_eq!(parsed.node, "node-b");
    }

    #[test]
    fn loopback_and_bundle_are_rejected() {
        assert!(!check_interface_name("Loopback0", true));
        assert!(!check_interface_name("Bundle-Ether1", true));
        assert!(check_interface_name("Bundle-Ether1", false));
    }

    #[test]
    fn sub_interface_is_rejected() {
        assert!(!check_interface_name("TenGigabitEth1/1.100", true));
        assert!(check_interface_name("TenGigabitEth1/1", true));
    }

    #[test]
    fn excluded_description_prefix_is_rejected() {
        let config = MatcherConfig::default();
        assert!(!check_description("BRDG_node-b_Te1/1", &config));
        assert!(check_description("DC_node-b_Te1/1", &config));
        assert!(!check_description("", &config));
    }

    use crate::arb::{ArbInterfaceId, ArbToken};

    /// §8: "For any description, the parser's (node, interface) result is
    /// unchanged by inserting or removing a valid year token among the
    /// trailing segments."
    #[quickcheck_macros::quickcheck]
    fn prop_year_token_insertion_is_a_no_op(node: ArbToken, interface: ArbInterfaceId) -> bool {
        let config = MatcherConfig::default();
        if config.node_excludelist.contains(&node.0.to_lowercase()) {
            return true;
        }
        let without = format!("DC_{}_{}", node.0, interface.0);
        let with = format!("DC_{}_{}_2021", node.0, interface.0);
        parse_description(&without, &config, now()) == parse_description(&with, &config, now())
    }
}
