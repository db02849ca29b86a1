// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! The enrichment pipeline (§4.I): joins verified links with rate / optical /
//! counter / state samples, tolerating one-sided data loss on rates by
//! reading the opposite endpoint and inverting directionality.
//!
//! This is the top-level object an HTTP shell (out of scope) would hold one
//! of per configured backend set: it owns the node roster refresh, the
//! per-selector link cache, and the process-wide verification-error set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::cache::Cache;
use crate::config::MatcherConfig;
use crate::datasource::{DataSource, HistoricMap, SampleMap};
use crate::matcher::{self, DiscoveryResult, VerificationErrors};
use crate::model::{numeric_suffix, Counter, Endpoint, Interface, Link, Measurements, Optic, Rate, State};
use crate::timestamp::Timestamp;

/// Cached link collections refresh hourly; the topology underneath changes
/// far slower than any one measurement (§4.I step 2).
const LINK_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Which matcher query backs a given enrichment call (§4.H, §4.I). `Between`
/// enables the one-sided rate fallback; `Remote` never does, since there is
/// no verified second endpoint to read it from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkSelector {
    Between { nodes: Vec<String>, skip_self: bool },
    Remote { nodes: Vec<String>, remotes: Vec<String> },
}

/// One link's measurement history: ascending snapshots aligned across
/// whichever sample sequences the caller asked for (§4.I "Timeline variants").
#[derive(Debug, Clone)]
pub struct LinkTimeline {
    pub endpoint: Endpoint,
    pub snapshots: Vec<Link>,
}

/// Joins topology with telemetry. Holds one [`DataSource`] (typically a
/// [`crate::merge::MultiSource`]) and the matcher config shared with the
/// parser, plus the two link caches and the deduplicated error set.
pub struct Engine {
    datasource: Arc<dyn DataSource>,
    config: MatcherConfig,
    errors: VerificationErrors,
    between_cache: Cache<(Vec<String>, bool), Vec<Link>>,
    remote_cache: Cache<(Vec<String>, Vec<String>), Vec<Link>>,
}

impl Engine {
    pub fn new(datasource: Arc<dyn DataSource>, config: MatcherConfig) -> Self {
        Engine {
            datasource,
            config,
            errors: VerificationErrors::new(),
            between_cache: Cache::new(LINK_CACHE_TTL),
            remote_cache: Cache::new(LINK_CACHE_TTL),
        }
    }

    pub fn errors(&self) -> &VerificationErrors {
        &self.errors
    }

    /// Refreshes the node roster and fetches every interface description
    /// known to the merged datasource (§4.I step 1). Returns an empty set
    /// (logging the failure) rather than propagating, matching the matcher's
    /// tolerance for a degraded backend.
    async fn gather_interfaces(&self) -> Vec<Interface> {
        let nodes = match self.datasource.get_nodes().await {
            Ok(n) => n,
            Err(err) => {
                warn!("get_nodes failed: {err}");
                return Vec::new();
            }
        };
        let node_names: Vec<String> = nodes.into_keys().collect();

        let descriptions = match self.datasource.get_descriptions(&node_names).await {
            Ok(d) => d,
            Err(err) => {
                warn!("get_descriptions failed: {err}");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for (node, interfaces) in descriptions {
            for (interface, description) in interfaces {
                out.push(Interface::new(node.clone(), interface, description));
            }
        }
        out
    }

    /// Fetches the matcher's verified link collection for `selector`, through
    /// the 1h cache keyed by `(nodes, skip_self)` or `(nodes, remotes)`
    /// (§4.I step 2).
    async fn links_for(&self, selector: &LinkSelector, now: Timestamp) -> Vec<Link> {
        let interfaces = self.gather_interfaces().await;

        match selector {
            LinkSelector::Between { nodes, skip_self } => {
                let key = (nodes.clone(), *skip_self);
                let config = &self.config;
                let errors = &self.errors;
                self.between_cache
                    .get(key, move |(nodes, skip_self)| async move {
                        Ok::<_, std::convert::Infallible>(matcher::get_links_between(
                            &interfaces, &nodes, skip_self, config, now, errors,
                        ))
                    })
                    .await
                    .unwrap_or_default()
            }
            LinkSelector::Remote { nodes, remotes } => {
                let key = (nodes.clone(), remotes.clone());
                let config = &self.config;
                self.remote_cache
                    .get(key, move |(nodes, remotes)| async move {
                        Ok::<_, std::convert::Infallible>(matcher::get_links_remote(
                            &interfaces, &nodes, &remotes, config,
                        ))
                    })
                    .await
                    .unwrap_or_default()
            }
        }
    }

    pub async fn discover_nodes(&self, filter: &str, include_orphans: bool) -> DiscoveryResult {
        let now = Timestamp::now();
        let interfaces = self.gather_interfaces().await;
        matcher::discover_nodes(&interfaces, filter, include_orphans, &self.config, now, &self.errors)
    }

    pub async fn discover_orphan_nodes(&self, filter: &str) -> Vec<String> {
        let now = Timestamp::now();
        let interfaces = self.gather_interfaces().await;
        matcher::discover_orphan_nodes(&interfaces, filter, &self.config, now, &self.errors)
    }

    async fn fetch_rates(&self, nodes: &[String]) -> SampleMap<Rate> {
        match self.datasource.get_rates(nodes).await {
            Ok(m) => m,
            Err(err) => {
                warn!("get_rates failed: {err}");
                SampleMap::new()
            }
        }
    }

    async fn fetch_states(&self, nodes: &[String]) -> SampleMap<State> {
        match self.datasource.get_states(nodes).await {
            Ok(m) => m,
            Err(err) => {
                warn!("get_states failed: {err}");
                SampleMap::new()
            }
        }
    }

    async fn fetch_counters(&self, nodes: &[String]) -> SampleMap<Counter> {
        match self.datasource.get_counters(nodes).await {
            Ok(m) => m,
            Err(err) => {
                warn!("get_counters failed: {err}");
                SampleMap::new()
            }
        }
    }

    async fn fetch_optics(&self, nodes: &[String]) -> SampleMap<Optic> {
        match self.datasource.get_optics(nodes).await {
            Ok(m) => m,
            Err(err) => {
                warn!("get_optics failed: {err}");
                SampleMap::new()
            }
        }
    }

    async fn fetch_historic_rates(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> HistoricMap<Rate> {
        match self.datasource.get_historic_rates(nodes, start, end, short_interval).await {
            Ok(m) => m,
            Err(err) => {
                warn!("get_historic_rates failed: {err}");
                HistoricMap::new()
            }
        }
    }

    async fn fetch_historic_states(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> HistoricMap<State> {
        match self.datasource.get_historic_states(nodes, start, end, short_interval).await {
            Ok(m) => m,
            Err(err) => {
                warn!("get_historic_states failed: {err}");
                HistoricMap::new()
            }
        }
    }

    async fn fetch_historic_counters(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> HistoricMap<Counter> {
        match self.datasource.get_historic_counters(nodes, start, end, short_interval).await {
            Ok(m) => m,
            Err(err) => {
                warn!("get_historic_counters failed: {err}");
                HistoricMap::new()
            }
        }
    }

    async fn fetch_historic_optics(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> HistoricMap<Optic> {
        match self.datasource.get_historic_optics(nodes, start, end, short_interval).await {
            Ok(m) => m,
            Err(err) => {
                warn!("get_historic_optics failed: {err}");
                HistoricMap::new()
            }
        }
    }

    /// Point-in-time rate enrichment (§4.I steps 3-6). Falls back to the
    /// reversed target-side rate when the source side is null, unless
    /// `selector` is a [`LinkSelector::Remote`] — there is no verified
    /// target to fall back to.
    pub async fn get_rates(&self, selector: &LinkSelector) -> Vec<Link> {
        let now = Timestamp::now();
        let links = self.links_for(selector, now).await;
        let allow_fallback = matches!(selector, LinkSelector::Between { .. });

        let source_nodes = dedup_nodes(links.iter().map(|l| l.source().node.as_str()));
        let rates = self.fetch_rates(&source_nodes).await;
        let states = self.fetch_states(&source_nodes).await;

        let target_rates = if allow_fallback {
            let target_nodes = dedup_nodes(links.iter().filter_map(|l| l.target()).map(|t| t.node.as_str()));
            self.fetch_rates(&target_nodes).await
        } else {
            SampleMap::new()
        };

        let mut out = Vec::with_capacity(links.len());
        for mut link in links {
            let source = link.source().clone();
            let mut rate = lookup(&rates, &source.node, &source.interface);
            if rate.is_none() && allow_fallback {
                if let Some(target) = link.target() {
                    rate = lookup(&target_rates, &target.node, &target.interface).map(|r| r.reverse());
                }
            }
            let Some(rate) = rate else { continue };

            let state = lookup(&states, &source.node, &source.interface);
            link.measurements.apply_state(state);
            link.measurements.apply_rate(Some(rate));
            out.push(link);
        }
        out
    }

    /// Point-in-time health enrichment (§4.I supplement): counters are read
    /// from both sides unconditionally, with no reversal, since an error
    /// count is not directional the way a rate is.
    pub async fn get_health(&self, selector: &LinkSelector) -> Vec<Link> {
        let now = Timestamp::now();
        let links = self.links_for(selector, now).await;

        let all_nodes = dedup_nodes(
            links
                .iter()
                .map(|l| l.source().node.as_str())
                .chain(links.iter().filter_map(|l| l.target()).map(|t| t.node.as_str())),
        );
        let counters = self.fetch_counters(&all_nodes).await;
        let states = self.fetch_states(&all_nodes).await;

        let mut out = Vec::with_capacity(links.len());
        for mut link in links {
            let source = link.source().clone();
            let target = link.target().cloned();
            let source_counter = lookup(&counters, &source.node, &source.interface);
            let target_counter = target.as_ref().and_then(|t| lookup(&counters, &t.node, &t.interface));
            if source_counter.is_none() && target_counter.is_none() {
                continue;
            }

            let state = lookup(&states, &source.node, &source.interface);
            link.measurements.apply_state(state);
            link.measurements.apply_health(source_counter, target_counter);
            out.push(link);
        }
        out
    }

    /// Point-in-time optical enrichment (§4.I supplement): both sides read
    /// unconditionally through the numeric-suffix "ends-with" join, since the
    /// optics table is keyed differently from the state table (§4.I,
    /// "Optics-specific key translation").
    pub async fn get_optics(&self, selector: &LinkSelector) -> Vec<Link> {
        let now = Timestamp::now();
        let links = self.links_for(selector, now).await;

        let all_nodes = dedup_nodes(
            links
                .iter()
                .map(|l| l.source().node.as_str())
                .chain(links.iter().filter_map(|l| l.target()).map(|t| t.node.as_str())),
        );
        let optics = self.fetch_optics(&all_nodes).await;
        let states = self.fetch_states(&all_nodes).await;

        let mut out = Vec::with_capacity(links.len());
        for mut link in links {
            let source = link.source().clone();
            let target = link.target().cloned();
            let source_optic = optics_lookup(&optics, &source.node, &source.interface);
            let target_optic = target.as_ref().and_then(|t| optics_lookup(&optics, &t.node, &t.interface));
            if source_optic.is_none() && target_optic.is_none() {
                continue;
            }

            let state = lookup(&states, &source.node, &source.interface);
            link.measurements.apply_state(state);
            link.measurements.apply_optics(source_optic, target_optic);
            out.push(link);
        }
        out
    }

    /// Historic rate timeline (§4.I "Timeline variants"). Each snapshot's
    /// rate and state are read from the same index of their respective
    /// historic sequence; a shorter sequence is padded with `None` so time
    /// alignment across (rate, state) is preserved even when one side is
    /// missing samples.
    pub async fn get_rates_timeline(
        &self,
        selector: &LinkSelector,
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> Vec<LinkTimeline> {
        let now = Timestamp::now();
        let links = self.links_for(selector, now).await;
        let allow_fallback = matches!(selector, LinkSelector::Between { .. });

        let source_nodes = dedup_nodes(links.iter().map(|l| l.source().node.as_str()));
        let rates = self.fetch_historic_rates(&source_nodes, start, end, short_interval).await;
        let states = self.fetch_historic_states(&source_nodes, start, end, short_interval).await;

        let target_rates = if allow_fallback {
            let target_nodes = dedup_nodes(links.iter().filter_map(|l| l.target()).map(|t| t.node.as_str()));
            self.fetch_historic_rates(&target_nodes, start, end, short_interval).await
        } else {
            HistoricMap::new()
        };

        let mut out = Vec::with_capacity(links.len());
        for link in links {
            let source = link.source().clone();
            let mut rate_seq = historic_lookup(&rates, &source.node, &source.interface);
            if rate_seq.is_empty() && allow_fallback {
                if let Some(target) = link.target() {
                    rate_seq = historic_lookup(&target_rates, &target.node, &target.interface)
                        .into_iter()
                        .map(|r| r.reverse())
                        .collect();
                }
            }
            let state_seq = historic_lookup(&states, &source.node, &source.interface);
            if rate_seq.is_empty() && state_seq.is_empty() {
                continue;
            }

            let snapshots = zip_with_nulls(&rate_seq, &state_seq)
                .into_iter()
                .map(|(rate, state)| snapshot(&link, state, rate, None, None, None, None))
                .collect();
            out.push(LinkTimeline { endpoint: link.endpoint.clone(), snapshots });
        }
        out
    }

    /// Historic health timeline: per-index zip of (source counters, target
    /// counters), state aligned the same way as [`Engine::get_rates_timeline`].
    pub async fn get_health_timeline(
        &self,
        selector: &LinkSelector,
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> Vec<LinkTimeline> {
        let now = Timestamp::now();
        let links = self.links_for(selector, now).await;

        let all_nodes = dedup_nodes(
            links
                .iter()
                .map(|l| l.source().node.as_str())
                .chain(links.iter().filter_map(|l| l.target()).map(|t| t.node.as_str())),
        );
        let counters = self.fetch_historic_counters(&all_nodes, start, end, short_interval).await;
        let states = self.fetch_historic_states(&all_nodes, start, end, short_interval).await;

        let mut out = Vec::with_capacity(links.len());
        for link in links {
            let source = link.source().clone();
            let target = link.target().cloned();
            let source_seq = historic_lookup(&counters, &source.node, &source.interface);
            let target_seq = target.as_ref().map(|t| historic_lookup(&counters, &t.node, &t.interface)).unwrap_or_default();
            if source_seq.is_empty() && target_seq.is_empty() {
                continue;
            }

            let state_seq = historic_lookup(&states, &source.node, &source.interface);
            let snapshots = zip_with_nulls(&source_seq, &target_seq)
                .into_iter()
                .enumerate()
                .map(|(i, (sc, tc))| snapshot(&link, state_seq.get(i).copied(), None, None, sc, tc, None))
                .collect();
            out.push(LinkTimeline { endpoint: link.endpoint.clone(), snapshots });
        }
        out
    }

    /// Historic optics timeline: per-index zip of (source optics, target
    /// optics), joined through the numeric-suffix "ends-with" key translation.
    pub async fn get_optics_timeline(
        &self,
        selector: &LinkSelector,
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> Vec<LinkTimeline> {
        let now = Timestamp::now();
        let links = self.links_for(selector, now).await;

        let all_nodes = dedup_nodes(
            links
                .iter()
                .map(|l| l.source().node.as_str())
                .chain(links.iter().filter_map(|l| l.target()).map(|t| t.node.as_str())),
        );
        let optics = self.fetch_historic_optics(&all_nodes, start, end, short_interval).await;
        let states = self.fetch_historic_states(&all_nodes, start, end, short_interval).await;

        let mut out = Vec::with_capacity(links.len());
        for link in links {
            let source = link.source().clone();
            let target = link.target().cloned();
            let source_seq = historic_optics_lookup(&optics, &source.node, &source.interface);
            let target_seq = target
                .as_ref()
                .map(|t| historic_optics_lookup(&optics, &t.node, &t.interface))
                .unwrap_or_default();
            if source_seq.is_empty() && target_seq.is_empty() {
                continue;
            }

            let state_seq = historic_lookup(&states, &source.node, &source.interface);
            let snapshots = zip_with_nulls(&source_seq, &target_seq)
                .into_iter()
                .enumerate()
                .map(|(i, (so, to))| snapshot(&link, state_seq.get(i).copied(), None, so, None, None, to))
                .collect();
            out.push(LinkTimeline { endpoint: link.endpoint.clone(), snapshots });
        }
        out
    }
}

/// Builds one timeline snapshot sharing `link`'s endpoint, applying whichever
/// measurement slices are present at this index. `source_optic`/`target_optic`
/// are threaded independently since, unlike rates and counters, they are
/// never symmetric calls on the same side.
#[allow(clippy::too_many_arguments)]
fn snapshot(
    link: &Link,
    state: Option<State>,
    rate: Option<Rate>,
    source_optic: Option<Optic>,
    source_counter: Option<Counter>,
    target_counter: Option<Counter>,
    target_optic: Option<Optic>,
) -> Link {
    let mut out = Link {
        endpoint: link.endpoint.clone(),
        measurements: Measurements::default(),
    };
    out.measurements.apply_state(state);
    if rate.is_some() {
        out.measurements.apply_rate(rate);
    }
    if source_counter.is_some() || target_counter.is_some() {
        out.measurements.apply_health(source_counter, target_counter);
    }
    if source_optic.is_some() || target_optic.is_some() {
        out.measurements.apply_optics(source_optic, target_optic);
    }
    out
}

fn dedup_nodes<'a>(iter: impl Iterator<Item = &'a str>) -> Vec<String> {
    let set: HashSet<&str> = iter.collect();
    let mut nodes: Vec<String> = set.into_iter().map(|s| s.to_string()).collect();
    nodes.sort();
    nodes
}

fn lookup<T: Clone>(map: &SampleMap<T>, node: &str, interface: &str) -> Option<T> {
    map.get(node)?.get(interface).cloned()
}

fn historic_lookup<T: Clone>(map: &HistoricMap<T>, node: &str, interface: &str) -> Vec<T> {
    map.get(node).and_then(|t| t.get(interface)).cloned().unwrap_or_default()
}

/// Optics tables are keyed by the *numeric suffix* of the interface name
/// while the interfaces the matcher produced carry the full name; try an
/// exact match first (a backend that already keys by full name), then fall
/// back to the first table entry whose key `full_interface` ends with
/// (§4.I "Optics-specific key translation").
fn optics_lookup(map: &SampleMap<Optic>, node: &str, full_interface: &str) -> Option<Optic> {
    let table = map.get(node)?;
    if let Some(v) = table.get(full_interface) {
        return Some(v.clone());
    }
    let suffix = numeric_suffix(full_interface);
    table
        .iter()
        .find(|(k, _)| k.as_str() == suffix || full_interface.ends_with(k.as_str()))
        .map(|(_, v)| v.clone())
}

fn historic_optics_lookup(map: &HistoricMap<Optic>, node: &str, full_interface: &str) -> Vec<Optic> {
    let Some(table) = map.get(node) else { return Vec::new() };
    if let Some(v) = table.get(full_interface) {
        return v.clone();
    }
    let suffix = numeric_suffix(full_interface);
    table
        .iter()
        .find(|(k, _)| k.as_str() == suffix || full_interface.ends_with(k.as_str()))
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

/// Zips two historic sequences by index, padding the shorter with `None` so
/// a sample missing from one side doesn't shift the other's alignment
/// (§4.I "Timeline variants").
fn zip_with_nulls<A: Clone, B: Clone>(a: &[A], b: &[B]) -> Vec<(Option<A>, Option<B>)> {
    let len = a.len().max(b.len());
    (0..len).map(|i| (a.get(i).cloned(), b.get(i).cloned())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    /// A topology consisting of a single verified link between node-a and
    /// node-b, plus programmable point/historic sample tables (§8 scenarios
    /// 7-9).
    struct FakeDataSource {
        descriptions: SampleMap<String>,
        rates: SampleMap<Rate>,
        historic_rates: HistoricMap<Rate>,
        historic_states: HistoricMap<State>,
    }

    fn iface_sample(node: &str, interface: &str, description: &str) -> (String, (String, String)) {
        (node.to_string(), (interface.to_string(), description.to_string()))
    }

    fn two_node_descriptions() -> SampleMap<String> {
        let mut map: SampleMap<String> = HashMap::new();
        let (node, (iface, desc)) = iface_sample("node-a", "TenGigabitEth1/1", "DC_node-b_Te1/1");
        map.entry(node).or_default().insert(iface, desc);
        let (node, (iface, desc)) = iface_sample("node-b", "TenGigabitEth1/1", "DC_node-a_Te1/1");
        map.entry(node).or_default().insert(iface, desc);
        map
    }

    fn rate(in_bps: f64, out_bps: f64) -> Rate {
        Rate {
            in_bps,
            out_bps,
            bandwidth_bps: 10_000_000_000.0,
            datasource: "fake",
            timestamp: Timestamp::now(),
        }
    }

    #[async_trait]
    impl DataSource for FakeDataSource {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn get_nodes(&self) -> anyhow::Result<HashMap<String, crate::model::Node>> {
            Ok(self
                .descriptions
                .keys()
                .map(|n| (n.clone(), crate::model::Node::new(n.clone(), "fake")))
                .collect())
        }

        async fn get_descriptions(&self, _nodes: &[String]) -> anyhow::Result<SampleMap<String>> {
            Ok(self.descriptions.clone())
        }
        async fn get_states(&self, _nodes: &[String]) -> anyhow::Result<SampleMap<State>> {
            Ok(HashMap::new())
        }
        async fn get_rates(&self, _nodes: &[String]) -> anyhow::Result<SampleMap<Rate>> {
            Ok(self.rates.clone())
        }
        async fn get_optics(&self, _nodes: &[String]) -> anyhow::Result<SampleMap<Optic>> {
            Ok(HashMap::new())
        }
        async fn get_counters(&self, _nodes: &[String]) -> anyhow::Result<SampleMap<Counter>> {
            Ok(HashMap::new())
        }
        async fn get_historic_states(
            &self,
            _nodes: &[String],
            _start: Timestamp,
            _end: Timestamp,
            _short_interval: bool,
        ) -> anyhow::Result<HistoricMap<State>> {
            Ok(self.historic_states.clone())
        }
        async fn get_historic_rates(
            &self,
            _nodes: &[String],
            start: Timestamp,
            end: Timestamp,
            _short_interval: bool,
        ) -> anyhow::Result<HistoricMap<Rate>> {
            if !self.historic_rates.is_empty() {
                return Ok(self.historic_rates.clone());
            }
            // Synthesize one sample per minute across [start, end], mirroring
            // a real backend's fixed-step historic query.
            let minutes = ((end.as_datetime() - start.as_datetime()).num_minutes()).max(0) as usize;
            let mut map: HistoricMap<Rate> = HashMap::new();
            let samples: Vec<Rate> = (0..minutes).map(|i| rate(i as f64, i as f64)).collect();
            map.entry("node-a".to_string()).or_default().insert("TenGigabitEth1/1".to_string(), samples);
            Ok(map)
        }
        async fn get_historic_optics(
            &self,
            _nodes: &[String],
            _start: Timestamp,
            _end: Timestamp,
            _short_interval: bool,
        ) -> anyhow::Result<HistoricMap<Optic>> {
            Ok(HashMap::new())
        }
        async fn get_historic_counters(
            &self,
            _nodes: &[String],
            _start: Timestamp,
            _end: Timestamp,
            _short_interval: bool,
        ) -> anyhow::Result<HistoricMap<Counter>> {
            Ok(HashMap::new())
        }
    }

    fn selector() -> LinkSelector {
        LinkSelector::Between { nodes: vec!["node".to_string()], skip_self: false }
    }

    #[tokio::test]
    async fn one_sided_rate_fallback_reverses_target_side() {
        let mut rates: SampleMap<Rate> = HashMap::new();
        rates.entry("node-b".to_string()).or_default().insert("TenGigabitEth1/1".to_string(), rate(5.0, 9.0));

        let engine = Engine::new(
            Arc::new(FakeDataSource {
                descriptions: two_node_descriptions(),
                rates,
                historic_rates: HashMap::new(),
                historic_states: HashMap::new(),
            }),
            MatcherConfig::default(),
        );

        let links = engine.get_rates(&selector()).await;
        assert_eq!(links.len(), 1);
        // Source has no rate; target's (in=5, out=9) is reversed to (in=9, out=5).
        assert_eq!(links[0].measurements.in_rate, Some(9.0));
        assert_eq!(links[0].measurements.out_rate, Some(5.0));
    }

    #[tokio::test]
    async fn link_is_dropped_when_both_sides_null() {
        let engine = Engine::new(
            Arc::new(FakeDataSource {
                descriptions: two_node_descriptions(),
                rates: HashMap::new(),
                historic_rates: HashMap::new(),
                historic_states: HashMap::new(),
            }),
            MatcherConfig::default(),
        );

        let links = engine.get_rates(&selector()).await;
        assert!(links.is_empty());
    }

    #[tokio::test]
    async fn remote_selector_never_falls_back() {
        let mut rates: SampleMap<Rate> = HashMap::new();
        rates.entry("node-b".to_string()).or_default().insert("TenGigabitEth1/1".to_string(), rate(5.0, 9.0));

        let mut descriptions = two_node_descriptions();
        descriptions
            .entry("node-a".to_string())
            .or_default()
            .insert("Te9/1".to_string(), "ISP_fw_I1-TR".to_string());

        let engine = Engine::new(
            Arc::new(FakeDataSource {
                descriptions,
                rates,
                historic_rates: HashMap::new(),
                historic_states: HashMap::new(),
            }),
            MatcherConfig::default(),
        );

        let remote_selector = LinkSelector::Remote {
            nodes: vec!["node".to_string()],
            remotes: vec!["fw".to_string()],
        };
        let links = engine.get_rates(&remote_selector).await;
        // The remote link has no source-side rate and fallback is disabled.
        assert!(links.is_empty());
    }

    #[tokio::test]
    async fn rate_timeline_bisecting_the_window_shortens_it() {
        let engine = Engine::new(
            Arc::new(FakeDataSource {
                descriptions: two_node_descriptions(),
                rates: HashMap::new(),
                historic_rates: HashMap::new(),
                historic_states: HashMap::new(),
            }),
            MatcherConfig::default(),
        );

        let now = Timestamp::now();
        let hour_ago = now - StdDuration::from_secs(3600);
        let five_min_ago = now - StdDuration::from_secs(5 * 60);

        let full = engine.get_rates_timeline(&selector(), hour_ago, now, false).await;
        let bisected = engine.get_rates_timeline(&selector(), five_min_ago, now, false).await;

        assert_eq!(full.len(), 1);
        assert_eq!(bisected.len(), 1);
        assert!(bisected[0].snapshots.len() < full[0].snapshots.len());

        let mut previous: Option<f64> = None;
        for link in &full[0].snapshots {
            let in_rate = link.measurements.in_rate.expect("rate populated");
            if let Some(prev) = previous {
                assert!(in_rate >= prev, "timeline must be ascending by timestamp order");
            }
            previous = Some(in_rate);
        }
    }

    #[tokio::test]
    async fn timeline_with_missing_state_still_yields_rate_length() {
        let mut historic_rates: HistoricMap<Rate> = HashMap::new();
        historic_rates
            .entry("node-a".to_string())
            .or_default()
            .insert("TenGigabitEth1/1".to_string(), vec![rate(1.0, 2.0), rate(3.0, 4.0), rate(5.0, 6.0)]);

        let engine = Engine::new(
            Arc::new(FakeDataSource {
                descriptions: two_node_descriptions(),
                rates: HashMap::new(),
                historic_rates,
                historic_states: HashMap::new(),
            }),
            MatcherConfig::default(),
        );

        let now = Timestamp::now();
        let timelines = engine.get_rates_timeline(&selector(), now - StdDuration::from_secs(60), now, false).await;
        assert_eq!(timelines.len(), 1);
        assert_eq!(timelines[0].snapshots.len(), 3);
        for snapshot in &timelines[0].snapshots {
            assert!(snapshot.measurements.state.is_none());
            assert!(snapshot.measurements.in_rate.is_some());
        }
    }

    #[tokio::test]
    async fn health_keeps_link_when_only_target_counter_present() {
        let mut counters: SampleMap<Counter> = HashMap::new();
        counters.entry("node-b".to_string()).or_default().insert(
            "TenGigabitEth1/1".to_string(),
            Counter {
                crc_errors: Some(1),
                input_errors: Some(2),
                packets_received: Some(100),
                output_drops: Some(0),
                datasource: "fake",
                timestamp: Timestamp::now(),
            },
        );

        struct HealthSource {
            descriptions: SampleMap<String>,
            counters: SampleMap<Counter>,
        }
        #[async_trait]
        impl DataSource for HealthSource {
            fn name(&self) -> &'static str {
                "fake"
            }
            async fn get_nodes(&self) -> anyhow::Result<HashMap<String, crate::model::Node>> {
                Ok(self
                    .descriptions
                    .keys()
                    .map(|n| (n.clone(), crate::model::Node::new(n.clone(), "fake")))
                    .collect())
            }
            async fn get_descriptions(&self, _nodes: &[String]) -> anyhow::Result<SampleMap<String>> {
                Ok(self.descriptions.clone())
            }
            async fn get_states(&self, _nodes: &[String]) -> anyhow::Result<SampleMap<State>> {
                Ok(HashMap::new())
            }
            async fn get_rates(&self, _nodes: &[String]) -> anyhow::Result<SampleMap<Rate>> {
                Ok(HashMap::new())
            }
            async fn get_optics(&self, _nodes: &[String]) -> anyhow::Result<SampleMap<Optic>> {
                Ok(HashMap::new())
            }
            async fn get_counters(&self, _nodes: &[String]) -> anyhow::Result<SampleMap<Counter>> {
                Ok(self.counters.clone())
            }
            async fn get_historic_states(
                &self,
                _n: &[String],
                _s: Timestamp,
                _e: Timestamp,
                _si: bool,
            ) -> anyhow::Result<HistoricMap<State>> {
                Ok(HashMap::new())
            }
            async fn get_historic_rates(
                &self,
                _n: &[String],
                _s: Timestamp,
                _e: Timestamp,
                _si: bool,
            ) -> anyhow::Result<HistoricMap<Rate>> {
                Ok(HashMap::new())
            }
            async fn get_historic_optics(
                &self,
                _n: &[String],
                _s: Timestamp,
                _e: Timestamp,
                _si: bool,
            ) -> anyhow::Result<HistoricMap<Optic>> {
                Ok(HashMap::new())
            }
            async fn get_historic_counters(
                &self,
                _n: &[String],
                _s: Timestamp,
                _e: Timestamp,
                _si: bool,
            ) -> anyhow::Result<HistoricMap<Counter>> {
                Ok(HashMap::new())
            }
        }

        let engine = Engine::new(
            Arc::new(HealthSource { descriptions: two_node_descriptions(), counters }),
            MatcherConfig::default(),
        );
        let links = engine.get_health(&selector()).await;
        assert_eq!(links.len(), 1);
        assert!(links[0].measurements.source_crc_error.is_none());
        assert_eq!(links[0].measurements.target_crc_error, Some(1));
    }
}
