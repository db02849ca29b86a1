// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! The capability set every backend must expose (§4.C), plus the
//! node-name resolution logic shared by all callers.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::model::{Counter, Interface, Node, Optic, Rate, State};
use crate::timestamp::Timestamp;

/// Per-node, per-interface sample table, the shape every `DataSource`
/// method returns.
pub type SampleMap<T> = HashMap<String, HashMap<String, T>>;

/// Ordered historic samples, same key shape as [`SampleMap`] but with a
/// `Vec` of time-stamped values per interface.
pub type HistoricMap<T> = HashMap<String, HashMap<String, Vec<T>>>;

/// Uniform interface over a telemetry backend (TSDB, SNMP, or a test
/// double). All methods accept an already-resolved node name list; callers
/// go through [`resolve_node_names`] first.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Human-readable name used as the merge's priority tag and as the
    /// `datasource` field stamped on every sample.
    fn name(&self) -> &'static str;

    async fn get_nodes(&self) -> anyhow::Result<HashMap<String, Node>>;

    async fn get_descriptions(&self, nodes: &[String]) -> anyhow::Result<SampleMap<String>>;

    async fn get_states(&self, nodes: &[String]) -> anyhow::Result<SampleMap<State>>;
    async fn get_rates(&self, nodes: &[String]) -> anyhow::Result<SampleMap<Rate>>;
    async fn get_optics(&self, nodes: &[String]) -> anyhow::Result<SampleMap<Optic>>;
    async fn get_counters(&self, nodes: &[String]) -> anyhow::Result<SampleMap<Counter>>;

    /// A backend with no historic capability returns an empty map; this is
    /// not an error (§4.C).
    async fn get_historic_states(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> anyhow::Result<HistoricMap<State>>;

    async fn get_historic_rates(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> anyhow::Result<HistoricMap<Rate>>;

    async fn get_historic_optics(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> anyhow::Result<HistoricMap<Optic>>;

    async fn get_historic_counters(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> anyhow::Result<HistoricMap<Counter>>;
}

/// Expands a caller-supplied list of node names/substrings against a
/// backend's known node set, reproducing the `lookup_node` decorator (§4.C):
/// exact matches are always included; if none match, every known name
/// containing the request as a substring is included. `["node", "test"]`
/// therefore expands to every node containing either token.
pub fn resolve_node_names(requested: &[String], known: &[String]) -> Vec<String> {
    let mut resolved: Vec<String> = Vec::new();
    for want in requested {
        let exact: Vec<&String> = known.iter().filter(|n| *n == want).collect();
        if !exact.is_empty() {
            for n in exact {
                if !resolved.contains(n) {
                    resolved.push(n.clone());
                }
            }
            continue;
        }
        for n in known {
            if n.contains(want.as_str()) && !resolved.contains(n) {
                resolved.push(n.clone());
            }
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins_over_substring_scan() {
        let known = vec!["node-a".to_string(), "node-b".to_string(), "test-a".to_string()];
        let got = resolve_node_names(&["node-a".to_string()], &known);
        assert_eq!(got, vec!["node-a".to_string()]);
    }

    #[test]
    fn substring_expands_to_every_containing_name() {
        let known = vec!["node-a".to_string(), "node-b".to_string(), "test-a".to_string()];
        let got = resolve_node_names(&["node".to_string()], &known);
        assert_eq!(got, vec!["node-a".to_string(), "node-b".to_string()]);
    }

    #[test]
    fn multiple_substrings_expand_to_union() {
        let known = vec!["node-a".to_string(), "node-b".to_string(), "test-a".to_string()];
        let got = resolve_node_names(&["node".to_string(), "test".to_string()], &known);
        assert_eq!(got.len(), 3);
    }

    use crate::arb::ArbToken;
    use std::collections::HashSet;

    /// §8: "Node-resolution is monotone: adding a backend with a new node
    /// cannot remove any previously resolved node." Modeled here as widening
    /// the known-node set and checking the resolved set only grows.
    #[quickcheck_macros::quickcheck]
    fn prop_adding_a_known_node_is_monotone(existing: Vec<ArbToken>, request: ArbToken, extra: ArbToken) -> bool {
        let known: Vec<String> = existing.iter().map(|t| t.0.clone()).collect();
        let before: HashSet<String> = resolve_node_names(&[request.0.clone()], &known).into_iter().collect();

        let mut widened = known;
        widened.push(extra.0);
        let after: HashSet<String> = resolve_node_names(&[request.0], &widened).into_iter().collect();

        before.is_subset(&after)
    }
}
