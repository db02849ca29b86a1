// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Two-sided link verification and candidate matching (§4.H).
//!
//! This is the only place a candidate pair of interfaces becomes a verified
//! [`Link`]: both descriptions must parse, neither side may name itself, and
//! each side's parsed remote must substring-match the other side's actual
//! node/interface. Everything that fails is folded into a deduplicated,
//! process-wide error set for later CSV export rather than being thrown.

use std::collections::HashSet;
use std::sync::Mutex;

use log::warn;

use crate::config::MatcherConfig;
use crate::error::VerificationError;
use crate::model::{Interface, Link};
use crate::parser::{check_description, check_interface_name, parse_description};
use crate::stats;
use crate::timestamp::Timestamp;

/// Process-wide, deduplicated store of verification failures (§9 Globals).
///
/// Kept as explicit owned state on [`crate::engine::Engine`] rather than a
/// module-level static, but the insertion discipline mirrors the source's
/// `self.verification_errors` set: callers never see duplicate messages.
#[derive(Default)]
pub struct VerificationErrors {
    messages: Mutex<HashSet<String>>,
}

impl VerificationErrors {
    pub fn new() -> Self {
        VerificationErrors::default()
    }

    /// Records `err`'s message if it hasn't been seen before; returns `true`
    /// if this was a new, previously-unseen failure.
    fn record(&self, err: &VerificationError) -> bool {
        let mut guard = self.messages.lock().expect("verification error set poisoned");
        let inserted = guard.insert(err.message().to_string());
        if inserted {
            stats::record_verification_error(err);
            warn!("{}", err.message());
        }
        inserted
    }

    pub fn snapshot(&self) -> Vec<String> {
        let guard = self.messages.lock().expect("verification error set poisoned");
        let mut messages: Vec<String> = guard.iter().cloned().collect();
        messages.sort();
        messages
    }

    pub fn reset(&self) {
        self.messages.lock().expect("verification error set poisoned").clear();
    }
}

/// Verifies that `local` and `remote` are two ends of the same physical
/// link, per the four-clause cross-check in §4.H. On success both
/// `verify_link(local, remote)` and `verify_link(remote, local)` hold.
pub fn verify_link(
    local: &Interface,
    remote: &Interface,
    config: &MatcherConfig,
    now: Timestamp,
) -> Result<(), VerificationError> {
    let local_parsed = parse_description(&local.description, config, now);
    let remote_parsed = parse_description(&remote.description, config, now);

    let Some(local_parsed) = local_parsed else {
        return Err(VerificationError::Unparsable(format!(
            "Verification error: description for {local} could not be parsed (remote side: {remote})"
        )));
    };
    let Some(remote_parsed) = remote_parsed else {
        return Err(VerificationError::Unparsable(format!(
            "Verification error: description for {remote} could not be parsed (remote side: {local})"
        )));
    };
    if local.node == remote.node {
        return Err(VerificationError::Loop(format!(
            "Verification error: local and remote device are both {}",
            local.node
        )));
    }
    if !local.interface.contains(&remote_parsed.interface) {
        return Err(VerificationError::MismatchInterface(format!(
            "Verification error: description from {remote} does not match {local} (parsed: {remote_parsed})"
        )));
    }
    if !remote.interface.contains(&local_parsed.interface) {
        return Err(VerificationError::MismatchInterface(format!(
            "Verification error: description from {local} does not match {remote} (parsed: {local_parsed})"
        )));
    }
    if !local.node.contains(&remote_parsed.node) {
        return Err(VerificationError::MismatchNode(format!(
            "Verification error: routername from {remote} does not match {local} (parsed: {remote_parsed})"
        )));
    }
    if !remote.node.contains(&local_parsed.node) {
        return Err(VerificationError::MismatchNode(format!(
            "Verification error: routername from {local} does not match {remote} (parsed: {local_parsed})"
        )));
    }
    Ok(())
}

/// Searches `candidates` for the interface that `interface`'s description
/// names as its remote end, verifying the match. Failed verifications are
/// recorded (deduplicated) rather than propagated, matching the matcher's
/// tolerance for noisy descriptions across a large inventory.
fn search_by_description<'a>(
    candidates: &'a [Interface],
    interface: &Interface,
    config: &MatcherConfig,
    now: Timestamp,
    errors: &VerificationErrors,
) -> Option<&'a Interface> {
    let remote_parsed = parse_description(&interface.description, config, now)?;

    for candidate in candidates {
        if !candidate.node.contains(&remote_parsed.node) {
            continue;
        }
        if !candidate.interface.contains(&remote_parsed.interface) {
            continue;
        }
        if interface.node == candidate.node {
            continue;
        }
        match verify_link(interface, candidate, config, now) {
            Ok(()) => return Some(candidate),
            Err(err) => {
                errors.record(&err);
            }
        }
    }
    None
}

/// Gathers candidate interfaces across `nodes`, applying the interface-name
/// filter (unless `int_check` is false, for remote-link enumeration where
/// bundle members still matter) and the description filter.
pub fn gather_candidate_interfaces(
    all_interfaces: &[Interface],
    config: &MatcherConfig,
    int_check: bool,
) -> Vec<Interface> {
    let mut out: Vec<Interface> = all_interfaces
        .iter()
        .filter(|iface| check_interface_name(&iface.interface, int_check))
        .filter(|iface| check_description(&iface.description, config))
        .cloned()
        .collect();
    out.sort();
    out
}

/// Matches verified links out of an already-filtered candidate list, pairing
/// each interface with its first unconsumed counterpart (§4.H step 4).
fn match_links(
    candidates: &[Interface],
    config: &MatcherConfig,
    now: Timestamp,
    errors: &VerificationErrors,
) -> Vec<Link> {
    let mut links = Vec::new();
    let mut consumed: HashSet<Interface> = HashSet::new();

    for candidate in candidates {
        if consumed.contains(candidate) {
            continue;
        }
        if let Some(found) = search_by_description(candidates, candidate, config, now, errors) {
            if !consumed.contains(found) {
                consumed.insert(candidate.clone());
                consumed.insert(found.clone());
                links.push(Link::new_pair(candidate.clone(), found.clone()));
                stats::LINKS_EMITTED.inc();
            }
        }
    }
    links
}

/// Enumerates verified links between members of `nodes` (§4.H
/// `get_links_between`). A candidate only participates if its owner node
/// contains one of the `nodes` filter strings, its description contains the
/// same filter string (and none of `DESCRIPTION_EXCLUDELIST`), and — when
/// `skip_self` is set — the filter string doesn't match both owner and
/// description of the same candidate (which would otherwise self-pair a
/// node's two interfaces describing each other).
pub fn get_links_between(
    all_interfaces: &[Interface],
    nodes: &[String],
    skip_self: bool,
    config: &MatcherConfig,
    now: Timestamp,
    errors: &VerificationErrors,
) -> Vec<Link> {
    let gathered = gather_candidate_interfaces(all_interfaces, config, true);

    let mut matched = Vec::new();
    for iface in &gathered {
        if !nodes.iter().any(|n| iface.node.contains(n.as_str())) {
            continue;
        }
        for filter in nodes {
            if skip_self && iface.description.contains(filter.as_str()) && iface.node.contains(filter.as_str()) {
                continue;
            }
            if iface.description.contains(filter.as_str())
                && !config
                    .description_excludelist
                    .iter()
                    .any(|exc| iface.description.contains(exc.as_str()))
            {
                matched.push(iface.clone());
                break;
            }
        }
    }

    match_links(&matched, config, now, errors)
}

/// A label-only reference to a peer outside the managed inventory (§3
/// `Remote`, §4.H `get_links_remote`). No verification is performed, since
/// there is no second endpoint to cross-check against.
pub fn get_links_remote(
    all_interfaces: &[Interface],
    nodes: &[String],
    remotes: &[String],
    config: &MatcherConfig,
) -> Vec<Link> {
    let gathered = gather_candidate_interfaces(all_interfaces, config, false);

    let mut matched: Vec<(Interface, String)> = Vec::new();
    for iface in &gathered {
        let description_lower = iface.description.to_lowercase();
        if !config
            .remote_includelist
            .iter()
            .any(|tok| description_lower.contains(tok.as_str()))
        {
            continue;
        }
        if !nodes.iter().any(|n| iface.node.contains(n.as_str())) {
            continue;
        }
        for remote in remotes {
            let remote_orig = remote.clone();
            let (needle, locality) = match remote.split_once("--") {
                Some((left, right)) if !right.contains("--") => (left, Some(right)),
                _ => (remote.as_str(), None),
            };
            if let Some(locality) = locality {
                if !iface.node.contains(locality) {
                    continue;
                }
            }
            if description_lower.contains(&needle.to_lowercase()) {
                matched.push((iface.clone(), remote_orig));
            }
        }
    }

    matched.sort_by(|a, b| (a.0.clone(), a.1.clone()).cmp(&(b.0.clone(), b.1.clone())));
    matched
        .into_iter()
        .map(|(iface, label)| Link::new_remote(iface, label))
        .collect()
}

/// The shape the HTTP discovery surface renders (§4.H `discover_nodes`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveredNode {
    pub id: String,
    pub group: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveredLink {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, serde::Serialize, Default)]
pub struct DiscoveryResult {
    pub nodes: Vec<DiscoveredNode>,
    pub links: Vec<DiscoveredLink>,
}

fn node_prefix(node: &str, config: &MatcherConfig) -> String {
    node.split(config.node_separator.as_str())
        .take(config.node_num_segments)
        .collect::<Vec<_>>()
        .join(config.node_separator.as_str())
}

/// Autogenerates a node/link map from all known nodes (§4.H
/// `discover_nodes`), with the added concession that a candidate's parsed
/// remote may match the local node's first `node_num_segments` separator
/// segments, not just the full node name.
pub fn discover_nodes(
    all_interfaces: &[Interface],
    node_filter: &str,
    include_orphans: bool,
    config: &MatcherConfig,
    now: Timestamp,
    errors: &VerificationErrors,
) -> DiscoveryResult {
    let gathered = gather_candidate_interfaces(all_interfaces, config, true);

    let mut node_set: Vec<String> = gathered.iter().map(|i| i.node.clone()).collect();
    node_set.sort();
    node_set.dedup();
    if !node_filter.is_empty() {
        node_set.retain(|n| n.contains(node_filter));
    }

    let mut matched = Vec::new();
    for iface in &gathered {
        for node in &node_set {
            if iface.description.contains(node.as_str()) && iface.node.contains(node.as_str()) {
                continue;
            }
            let prefix = node_prefix(node, config);
            if (iface.description.contains(node.as_str()) || iface.description.contains(prefix.as_str()))
                && !config
                    .description_excludelist
                    .iter()
                    .any(|exc| iface.description.contains(exc.as_str()))
            {
                matched.push(iface.clone());
                break;
            }
        }
    }

    let links = match_links(&matched, config, now, errors);

    let mut touched: HashSet<&str> = HashSet::new();
    for link in &links {
        touched.insert(link.source().node.as_str());
        if let Some(target) = link.target() {
            touched.insert(target.node.as_str());
        }
    }

    let mut nodes: Vec<DiscoveredNode> = node_set
        .into_iter()
        .filter(|n| include_orphans || touched.contains(n.as_str()))
        .map(|n| DiscoveredNode {
            group: n.split(config.node_separator.as_str()).next().unwrap_or(&n).to_string(),
            id: n,
        })
        .collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let links = links
        .into_iter()
        .map(|link| DiscoveredLink {
            source: link.source().node.clone(),
            target: link.target().map(|t| t.node.clone()).unwrap_or_default(),
        })
        .collect();

    DiscoveryResult { nodes, links }
}

/// The set difference between every node touched by any candidate interface
/// and the node set `discover_nodes` would return with orphans excluded
/// (§4.H supplement). Reuses `discover_nodes`'s own machinery rather than
/// having an independent algorithm.
pub fn discover_orphan_nodes(
    all_interfaces: &[Interface],
    node_filter: &str,
    config: &MatcherConfig,
    now: Timestamp,
    errors: &VerificationErrors,
) -> Vec<String> {
    let gathered = gather_candidate_interfaces(all_interfaces, config, true);

    let mut all_nodes: Vec<String> = gathered.iter().map(|i| i.node.clone()).collect();
    all_nodes.sort();
    all_nodes.dedup();
    if !node_filter.is_empty() {
        all_nodes.retain(|n| n.contains(node_filter));
    }

    let connected = discover_nodes(all_interfaces, node_filter, false, config, now, errors);
    let connected_ids: HashSet<&str> = connected.nodes.iter().map(|n| n.id.as_str()).collect();

    let mut orphans: Vec<String> = all_nodes
        .into_iter()
        .filter(|n| !connected_ids.contains(n.as_str()))
        .collect();
    orphans.sort();
    orphans
}

/// Classifies and serializes the accumulated verification errors as CSV
/// (§4.H). The header row is always emitted first, even with zero errors.
pub fn errors_to_csv(errors: &[String]) -> anyhow::Result<String> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(["errortype", "source", "parsed_remote", "expected", "full_error"])?;

    for error in errors {
        let tokenizable = error.replace('(', "\"").replace(')', "\"");
        let Some(tokens) = shlex::split(&tokenizable) else {
            continue;
        };
        let row = if error.contains("does not match") {
            let source = tokens.get(4).cloned().unwrap_or_default();
            let source = tokens
                .get(5)
                .map(|t| format!("{source} {t}"))
                .unwrap_or(source);
            let parsed_remote = tokens
                .last()
                .map(|t| t.replace("parsed: ", ""))
                .unwrap_or_default();
            let expected = tokens.get(10).cloned().unwrap_or_default();
            let expected = tokens
                .get(11)
                .map(|t| format!("{expected} {t}"))
                .unwrap_or(expected);
            Some(["mismatch".to_string(), source, parsed_remote, expected, error.clone()])
        } else if error.contains("local and remote") {
            let who = tokens.last().cloned().unwrap_or_default();
            Some(["loop".to_string(), who.clone(), who, String::new(), error.clone()])
        } else {
            None
        };
        if let Some(row) = row {
            writer.write_record(row)?;
        }
    }

    let bytes = writer.into_inner()?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn now() -> Timestamp {
        Timestamp::from_datetime(Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap())
    }

    fn iface(node: &str, interface: &str, description: &str) -> Interface {
        Interface::new(node, interface, description)
    }

    /// The topology fixture named throughout §8: node-a ↔ node-b ↔ test-c ↔
    /// test-b-100 ↔ test-a.
    fn fixture_interfaces() -> Vec<Interface> {
        vec![
            iface("node-a", "TenGigabitEth1/1", "DC_node-b_Te1/1"),
            iface("node-b", "TenGigabitEth1/1", "DC_node-a_Te1/1"),
            iface("node-b", "TenGigabitEth2/1", "DC_test-c_Te2/1"),
            iface("test-c", "TenGigabitEth2/1", "DC_node-b_Te2/1"),
            iface("test-c", "TenGigabitEth1/1", "DC_test-b-100_Eth5/1"),
            iface("test-b-100", "Eth5/1", "DC_test-c_Te1/1"),
            iface("test-c", "TenGigabitEth1/10", "DC_test-b-100_Eth5/10"),
            iface("test-b-100", "Eth5/10", "DC_test-c_Te1/10"),
            iface("test-b-100", "Eth6/1", "DC_test-a_Gi1/1"),
            iface("test-a", "GigabitEth1/1", "DC_test-b-100_Eth6/1"),
            iface("test-a", "Te9/1", "ISP_fw_I1-TR"),
        ]
    }

    #[test]
    fn verify_link_succeeds_both_directions() {
        let config = MatcherConfig::default();
        let local = iface("node-a", "TenGigabitEth1/1", "DC_node-b_Te1/1");
        let remote = iface("node-b", "TenGigabitEth1/1", "DC_node-a_Te1/1");
        assert!(verify_link(&local, &remote, &config, now()).is_ok());
        assert!(verify_link(&remote, &local, &config, now()).is_ok());
    }

    #[test]
    fn verify_link_loop_is_rejected() {
        let config = MatcherConfig::default();
        let local = iface("node-a", "TenGigabitEth1/1", "DC_node-a_Ten1/1");
        let remote = iface("node-a", "TenGigabitEth1/1", "DC_node-a_Ten1/1");
        let err = verify_link(&local, &remote, &config, now()).unwrap_err();
        assert!(matches!(err, VerificationError::Loop(_)));
    }

    #[test]
    fn get_links_between_skip_self_excludes_direct_pair() {
        let config = MatcherConfig::default();
        let errors = VerificationErrors::new();
        let interfaces = fixture_interfaces();
        let nodes = vec!["node".to_string()];
        let links = get_links_between(&interfaces, &nodes, true, &config, now(), &errors);
        assert!(links.is_empty());
        let links = get_links_between(&interfaces, &nodes, false, &config, now(), &errors);
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn get_links_between_finds_two_links_for_test_segment() {
        let config = MatcherConfig::default();
        let errors = VerificationErrors::new();
        let interfaces = fixture_interfaces();
        let nodes = vec!["test-b".to_string(), "test-c".to_string()];
        let links = get_links_between(&interfaces, &nodes, true, &config, now(), &errors);
        assert_eq!(links.len(), 2);
    }

    #[test]
    fn get_links_remote_honors_locality_filter() {
        let config = MatcherConfig::default();
        let mut interfaces = fixture_interfaces();
        interfaces.push(iface("node-a", "Te9/2", "ISP_I2-TR"));
        let nodes = vec!["test".to_string(), "node".to_string()];
        let remotes = vec!["I2--node".to_string()];
        let links = get_links_remote(&interfaces, &nodes, &remotes, &config);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].source().node, "node-a");
        assert_eq!(links[0].remote_label(), Some("I2--node"));
    }

    #[test]
    fn get_links_remote_matches_plain_label() {
        let config = MatcherConfig::default();
        let interfaces = fixture_interfaces();
        let nodes = vec!["test".to_string()];
        let remotes = vec!["fw".to_string()];
        let links = get_links_remote(&interfaces, &nodes, &remotes, &config);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].source().node, "test-a");
        assert_eq!(links[0].remote_label(), Some("fw"));
    }

    #[test]
    fn discover_orphan_nodes_finds_node_with_no_verified_link() {
        let config = MatcherConfig::default();
        let errors = VerificationErrors::new();
        let mut interfaces = fixture_interfaces();
        interfaces.push(iface("lonely-node", "TenGigabitEth1/1", "unrelated text"));
        let orphans = discover_orphan_nodes(&interfaces, "", &config, now(), &errors);
        assert!(orphans.contains(&"lonely-node".to_string()));
        assert!(!orphans.contains(&"node-a".to_string()));
    }

    #[test]
    fn csv_export_has_header_and_one_row_per_error() {
        let config = MatcherConfig::default();
        let errors = VerificationErrors::new();
        let local = iface("node-a", "TenGigabitEth1/1", "DC_node-a_Ten1/1");
        let remote = iface("node-a", "TenGigabitEth1/1", "DC_node-a_Ten1/1");
        errors.record(&verify_link(&local, &remote, &config, now()).unwrap_err());

        let mismatch_local = iface("node-a", "TenGigabitEth1/1", "DC_node-b_Te9/9");
        let mismatch_remote = iface("node-b", "TenGigabitEth1/1", "DC_node-a_Te1/1");
        errors.record(&verify_link(&mismatch_local, &mismatch_remote, &config, now()).unwrap_err());

        let csv_text = errors_to_csv(&errors.snapshot()).unwrap();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(csv_text.as_bytes());
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 3);
        for record in &records {
            assert_eq!(record.len(), 5);
        }
    }
}
