// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! SNMP-backed [`DataSource`] (§4.E): a background poll loop that walks each
//! host's interface table, computes rates from byte-counter deltas, and
//! publishes results through per-class caches the rest of the engine reads.
//!
//! The actual SNMP wire protocol (PDU encoding, UDP transport, community
//! auth) is out of scope for this crate (§1) — this module's seam is
//! [`SnmpSession`], a per-host walk abstraction a caller supplies a real
//! implementation of (e.g. wrapping an SNMP client library).

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::cache::Cache;
use crate::config::{SnmpConfig, SNMP_BANDWIDTH_TTL};
use crate::datasource::{resolve_node_names, DataSource, HistoricMap, SampleMap};
use crate::model::{Counter, LinkState, Node, Optic, Rate, State};
use crate::stats;
use crate::timestamp::Timestamp;

/// One SNMP walk of a single host's interface table, as a backend would
/// implement it against a real agent. Returns `ifIndex → value` maps keyed
/// by the caller-supplied OID, already decoded to the listed scalar types.
#[async_trait]
pub trait SnmpSession: Send + Sync {
    /// Resolves the device name via the given hostname OID.
    async fn get_device_name(&self, host: &str, oid: &str) -> anyhow::Result<String>;

    async fn walk_strings(&self, host: &str, oid: &str) -> anyhow::Result<HashMap<String, String>>;
    async fn walk_counters(&self, host: &str, oid: &str) -> anyhow::Result<HashMap<String, u64>>;
    async fn walk_ints(&self, host: &str, oid: &str) -> anyhow::Result<HashMap<String, i64>>;
    /// Optic sensor table: `ifIndex → (sensor_name → reading)`.
    async fn walk_optic_sensors(&self, host: &str, oid: &str) -> anyhow::Result<HashMap<String, HashMap<String, f64>>>;
}

struct PreviousCounter {
    bytes: u64,
    at: Timestamp,
}

/// Per-host, per-interface previous byte counters, mutated only by the poll
/// loop (§4.E, §9 "no reader contention: enrichment reads the cache, not the
/// raw byte tables").
#[derive(Default)]
struct CounterHistory {
    in_bytes: HashMap<(String, String), PreviousCounter>,
    out_bytes: HashMap<(String, String), PreviousCounter>,
}

/// SNMP-backed `DataSource`. Owns a background poll task that refreshes the
/// description/rate/optics caches every `poll_interval`; `get_states` and
/// `get_counters` are computed live from the most recent per-host walk
/// results cached by the same loop, rather than a separate direct query —
/// SNMP has no "historic" capability, so those methods return empty maps.
pub struct SnmpSource<S> {
    session: S,
    config: SnmpConfig,
    nodes: RwLock<HashMap<String, Node>>,
    host_by_node: RwLock<HashMap<String, String>>,
    retry_queue: RwLock<Vec<String>>,
    history: StdMutex<CounterHistory>,
    descriptions: RwLock<SampleMap<String>>,
    rates: RwLock<SampleMap<Rate>>,
    optics: RwLock<SampleMap<Optic>>,
    states: RwLock<SampleMap<State>>,
    bandwidth: Cache<String, HashMap<String, f64>>,
    poll_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl<S: SnmpSession + 'static> SnmpSource<S> {
    /// Validates `config` (§7 "ConfigurationMissing") before constructing;
    /// `new` stays infallible for tests and pre-validated configs.
    pub fn try_new(session: S, config: SnmpConfig) -> Result<Self, crate::error::ConfigError> {
        config.validate()?;
        Ok(Self::new(session, config))
    }

    pub fn new(session: S, config: SnmpConfig) -> Self {
        let interval = config.poll_interval.max(Duration::from_secs(1));
        SnmpSource {
            session,
            config: SnmpConfig { poll_interval: interval, ..config },
            nodes: RwLock::new(HashMap::new()),
            host_by_node: RwLock::new(HashMap::new()),
            retry_queue: RwLock::new(Vec::new()),
            history: StdMutex::new(CounterHistory::default()),
            descriptions: RwLock::new(HashMap::new()),
            rates: RwLock::new(HashMap::new()),
            optics: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            bandwidth: Cache::new(SNMP_BANDWIDTH_TTL),
            poll_handle: StdMutex::new(None),
        }
    }

    /// Opens a session per configured host, resolving its device name;
    /// hosts that fail are parked in the retry queue (§4.E).
    pub async fn start(self: &std::sync::Arc<Self>) {
        for host in &self.config.hosts {
            match self.session.get_device_name(host, &self.config.node_name_oid).await {
                Ok(name) => {
                    self.nodes.write().await.insert(name.clone(), Node::new(name.clone(), "snmp"));
                    self.host_by_node.write().await.insert(name, host.clone());
                }
                Err(err) => {
                    warn!("snmp host {host} unreachable at startup: {err}");
                    self.retry_queue.write().await.push(host.clone());
                }
            }
        }
        stats::SNMP_HOSTS_RETRY_QUEUE.set(self.retry_queue.read().await.len() as i64);

        let this = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move { this.poll_loop().await });
        *self.poll_handle.lock().expect("snmp poll handle lock poisoned") = Some(handle);
    }

    /// Aborts the background poll task; required for graceful shutdown and
    /// to avoid leaking the task when a `SnmpSource` is dropped inside a
    /// test (§1A supplement, new relative to the threaded original).
    pub fn shutdown(&self) {
        if let Some(handle) = self.poll_handle.lock().expect("snmp poll handle lock poisoned").take() {
            handle.abort();
        }
    }

    async fn poll_loop(&self) {
        let mut cycle: u64 = 0;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            cycle += 1;
            self.poll_once().await;
            if cycle % 10 == 0 {
                self.retry_failed_hosts().await;
            }
        }
    }

    async fn retry_failed_hosts(&self) {
        let pending: Vec<String> = self.retry_queue.read().await.clone();
        if pending.is_empty() {
            return;
        }
        let mut still_failing = Vec::new();
        for host in pending {
            match self.session.get_device_name(&host, &self.config.node_name_oid).await {
                Ok(name) => {
                    debug!("snmp host {host} recovered as {name}");
                    self.nodes.write().await.insert(name.clone(), Node::new(name.clone(), "snmp"));
                    self.host_by_node.write().await.insert(name, host);
                }
                Err(_) => still_failing.push(host),
            }
        }
        *self.retry_queue.write().await = still_failing;
        stats::SNMP_HOSTS_RETRY_QUEUE.set(self.retry_queue.read().await.len() as i64);
    }

    /// Refreshes descriptions, rates, and optics for every reachable host,
    /// logging and continuing past any per-host failure (§4.E). A host whose
    /// walk fails this cycle keeps its last-known entries rather than having
    /// them cleared, so a single missed poll doesn't blank out the map.
    async fn poll_once(&self) {
        let hosts = self.host_by_node.read().await.clone();
        stats::SNMP_HOSTS_REACHABLE.set(hosts.len() as i64);

        let now = Timestamp::now();
        for (node, host) in &hosts {
            match self.poll_host(node, host, now).await {
                Ok((desc, rate, optic, state)) => {
                    self.descriptions.write().await.insert(node.clone(), desc);
                    self.rates.write().await.insert(node.clone(), rate);
                    self.optics.write().await.insert(node.clone(), optic);
                    self.states.write().await.insert(node.clone(), state);
                }
                Err(err) => {
                    warn!("snmp poll failed for host {host} ({node}): {err}");
                }
            }
        }
    }

    async fn poll_host(
        &self,
        node: &str,
        host: &str,
        now: Timestamp,
    ) -> anyhow::Result<(HashMap<String, String>, HashMap<String, Rate>, HashMap<String, Optic>, HashMap<String, State>)> {
        let names = self.session.walk_strings(host, &self.config.interface_name_oid).await?;
        let raw_descriptions = self
            .session
            .walk_strings(host, &self.config.interface_description_oid)
            .await?;
        let oper_status = self.session.walk_ints(host, &self.config.oper_status_oid).await?;
        let in_octets = self.session.walk_counters(host, &self.config.in_octets_oid).await?;
        let out_octets = self.session.walk_counters(host, &self.config.out_octets_oid).await?;
        let high_speed = self.session.walk_ints(host, &self.config.high_speed_oid).await?;
        let optic_names = self.session.walk_strings(host, &self.config.optic_name_table_oid).await?;
        let optic_sensors = self
            .session
            .walk_optic_sensors(host, &self.config.optic_sensor_table_oid)
            .await?;

        let mut descriptions = HashMap::new();
        let mut states = HashMap::new();
        for (index, iface) in &names {
            if let Some(desc) = raw_descriptions.get(index) {
                descriptions.insert(iface.clone(), desc.clone());
            }
            let state = match oper_status.get(index) {
                Some(1) => LinkState::Up,
                Some(2) => LinkState::Down,
                _ => LinkState::Unknown,
            };
            states.insert(
                iface.clone(),
                State { state, datasource: "snmp", timestamp: now },
            );
        }

        let bandwidth = self
            .bandwidth
            .get(host.to_string(), |host| {
                let high_speed = high_speed.clone();
                let names = names.clone();
                async move {
                    let _ = host;
                    let mut out = HashMap::new();
                    for (index, iface) in &names {
                        if let Some(mbps) = high_speed.get(index) {
                            out.insert(iface.clone(), (*mbps as f64) * 1_000_000.0);
                        }
                    }
                    Ok::<_, anyhow::Error>(out)
                }
            })
            .await?;

        let rates = self.compute_rates(node, &names, &in_octets, &out_octets, &bandwidth, now);

        let mut optics = HashMap::new();
        let mut sensors_by_iface: HashMap<String, HashMap<String, f64>> = HashMap::new();
        let mut sorted_indices: Vec<&String> = optic_sensors.keys().collect();
        sorted_indices.sort();
        for index in sorted_indices {
            let Some(raw_name) = optic_names.get(index) else { continue };
            let iface = rekey_optics_interface(raw_name);
            let mut sensors: Vec<(&String, &f64)> = optic_sensors[index].iter().collect();
            sensors.sort_by(|a, b| a.0.cmp(b.0));
            let entry = sensors_by_iface.entry(iface).or_default();
            for (name, value) in sensors {
                entry.insert(name.clone(), *value);
            }
        }
        for (iface, sensors) in sensors_by_iface {
            let rx = sensors.get(&self.config.optic_rx_sensor_name).copied();
            let tx = sensors.get(&self.config.optic_tx_sensor_name).copied();
            let lbc = sensors.get(&self.config.optic_lbc_sensor_name).copied();
            if let (Some(rx), Some(tx), Some(lbc)) = (rx, tx, lbc) {
                optics.insert(
                    iface,
                    Optic {
                        rx_dbm: rx / 10.0,
                        tx_dbm: tx / 10.0,
                        lbc_ma: lbc / 10.0,
                        datasource: "snmp",
                        timestamp: now,
                    },
                );
            }
        }

        Ok((descriptions, rates, optics, states))
    }

    /// Computes `delta_bytes * 8 / delta_seconds` per interface whose prior
    /// sample exists, then overwrites the prior with the current reading
    /// (§4.E). First observation for an interface yields no rate.
    fn compute_rates(
        &self,
        node: &str,
        names: &HashMap<String, String>,
        in_octets: &HashMap<String, u64>,
        out_octets: &HashMap<String, u64>,
        bandwidth: &HashMap<String, f64>,
        now: Timestamp,
    ) -> HashMap<String, Rate> {
        let mut history = self.history.lock().expect("snmp counter history lock poisoned");
        let mut rates = HashMap::new();
        for (index, iface) in names {
            let key = (node.to_string(), iface.clone());
            let in_bps = in_octets.get(index).and_then(|bytes| {
                rate_from_delta(&mut history.in_bytes, key.clone(), *bytes, now)
            });
            let out_bps = out_octets.get(index).and_then(|bytes| {
                rate_from_delta(&mut history.out_bytes, key.clone(), *bytes, now)
            });
            if let (Some(in_bps), Some(out_bps)) = (in_bps, out_bps) {
                rates.insert(
                    iface.clone(),
                    Rate {
                        in_bps,
                        out_bps,
                        bandwidth_bps: bandwidth.get(iface).copied().unwrap_or(0.0),
                        datasource: "snmp",
                        timestamp: now,
                    },
                );
            }
        }
        rates
    }
}

/// Strips everything up to and including the literal `Optics` token, keeping
/// only the numeric suffix (§4.E optical keys).
fn rekey_optics_interface(raw: &str) -> String {
    match raw.find("Optics") {
        Some(idx) => raw[idx + "Optics".len()..].to_string(),
        None => raw.to_string(),
    }
}

/// Computes a bits/second rate from the stored previous byte count for
/// `key`, then overwrites it with `(bytes, now)`. Rejects an interval under
/// one second (§4.E) and any observation that is not strictly newer.
fn rate_from_delta(
    table: &mut HashMap<(String, String), PreviousCounter>,
    key: (String, String),
    bytes: u64,
    now: Timestamp,
) -> Option<f64> {
    let previous = table.insert(key, PreviousCounter { bytes, at: now });
    let previous = previous?;
    let delta_seconds = (now.as_nanos() - previous.at.as_nanos()) as f64 / 1_000_000_000.0;
    if delta_seconds < 1.0 {
        return None;
    }
    let delta_bytes = bytes.saturating_sub(previous.bytes) as f64;
    Some(delta_bytes * 8.0 / delta_seconds)
}

#[async_trait]
impl<S: SnmpSession + 'static> DataSource for SnmpSource<S> {
    fn name(&self) -> &'static str {
        "snmp"
    }

    async fn get_nodes(&self) -> anyhow::Result<HashMap<String, Node>> {
        Ok(self.nodes.read().await.clone())
    }

    async fn get_descriptions(&self, nodes: &[String]) -> anyhow::Result<SampleMap<String>> {
        let all = self.descriptions.read().await.clone();
        Ok(filter_by_nodes(all, nodes, &self.node_names().await))
    }

    async fn get_states(&self, nodes: &[String]) -> anyhow::Result<SampleMap<State>> {
        let all = self.states.read().await.clone();
        Ok(filter_by_nodes(all, nodes, &self.node_names().await))
    }

    async fn get_rates(&self, nodes: &[String]) -> anyhow::Result<SampleMap<Rate>> {
        let all = self.rates.read().await.clone();
        Ok(filter_by_nodes(all, nodes, &self.node_names().await))
    }

    async fn get_optics(&self, nodes: &[String]) -> anyhow::Result<SampleMap<Optic>> {
        let all = self.optics.read().await.clone();
        Ok(filter_by_nodes(all, nodes, &self.node_names().await))
    }

    async fn get_counters(&self, _nodes: &[String]) -> anyhow::Result<SampleMap<Counter>> {
        // Not exposed over the configured OID table in this deployment;
        // an absent capability is not an error (§4.C).
        Ok(HashMap::new())
    }

    async fn get_historic_states(
        &self,
        _nodes: &[String],
        _start: Timestamp,
        _end: Timestamp,
        _short_interval: bool,
    ) -> anyhow::Result<HistoricMap<State>> {
        Ok(HashMap::new())
    }

    async fn get_historic_rates(
        &self,
        _nodes: &[String],
        _start: Timestamp,
        _end: Timestamp,
        _short_interval: bool,
    ) -> anyhow::Result<HistoricMap<Rate>> {
        Ok(HashMap::new())
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

impl<S: SnmpSession + 'static> SnmpSource<S> {
    async fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn filter_by_nodes<T: Clone>(all: SampleMap<T>, requested: &[String], known: &[String]) -> SampleMap<T> {
    let resolved = resolve_node_names(requested, known);
    all.into_iter().filter(|(node, _)| resolved.contains(node)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rekey_strips_through_optics_token() {
        assert_eq!(rekey_optics_interface("entPhysicalOptics1/0/1"), "1/0/1");
        assert_eq!(rekey_optics_interface("unrelated"), "unrelated");
    }

    #[test]
    fn first_observation_yields_no_rate() {
        let mut table = HashMap::new();
        let now = Timestamp::now();
        assert!(rate_from_delta(&mut table, ("r1".to_string(), "et-0/0/0".to_string()), 1000, now).is_none());
        assert!(table.contains_key(&("r1".to_string(), "et-0/0/0".to_string())));
    }

    #[test]
    fn second_observation_computes_bits_per_second() {
        let mut table = HashMap::new();
        let t0 = Timestamp::now();
        let t1 = t0 + Duration::from_secs(10);
        rate_from_delta(&mut table, ("r1".to_string(), "et-0/0/0".to_string()), 1_000_000, t0);
        let bps = rate_from_delta(&mut table, ("r1".to_string(), "et-0/0/0".to_string()), 2_000_000, t1).unwrap();
        assert_eq!(bps, (1_000_000.0 * 8.0) / 10.0);
    }

    #[test]
    fn sub_second_interval_is_rejected() {
        let mut table = HashMap::new();
        let t0 = Timestamp::now();
        rate_from_delta(&mut table, ("r1".to_string(), "et-0/0/0".to_string()), 1000, t0);
        assert!(rate_from_delta(&mut table, ("r1".to_string(), "et-0/0/0".to_string()), 2000, t0).is_none());
    }

    struct FakeSession {
        names: HashMap<String, String>,
        descriptions: HashMap<String, String>,
        oper_status: HashMap<String, i64>,
        in_octets: StdMutex<HashMap<String, u64>>,
        out_octets: StdMutex<HashMap<String, u64>>,
        high_speed: HashMap<String, i64>,
        optic_names: HashMap<String, String>,
        optic_sensors: HashMap<String, HashMap<String, f64>>,
        reachable: bool,
    }

    #[async_trait]
    impl SnmpSession for FakeSession {
        async fn get_device_name(&self, host: &str, _oid: &str) -> anyhow::Result<String> {
            if self.reachable {
                Ok(format!("node-{host}"))
            } else {
                anyhow::bail!("unreachable")
            }
        }

        async fn walk_strings(&self, _host: &str, oid: &str) -> anyhow::Result<HashMap<String, String>> {
            if oid == "ifname" {
                Ok(self.names.clone())
            } else if oid == "ifdesc" {
                Ok(self.descriptions.clone())
            } else if oid == "opticname" {
                Ok(self.optic_names.clone())
            } else {
                Ok(HashMap::new())
            }
        }

        async fn walk_counters(&self, _host: &str, oid: &str) -> anyhow::Result<HashMap<String, u64>> {
            if oid == "in" {
                Ok(self.in_octets.lock().unwrap().clone())
            } else if oid == "out" {
                Ok(self.out_octets.lock().unwrap().clone())
            } else {
                Ok(HashMap::new())
            }
        }

        async fn walk_ints(&self, _host: &str, oid: &str) -> anyhow::Result<HashMap<String, i64>> {
            if oid == "operstatus" {
                Ok(self.oper_status.clone())
            } else if oid == "highspeed" {
                Ok(self.high_speed.clone())
            } else {
                Ok(HashMap::new())
            }
        }

        async fn walk_optic_sensors(
            &self,
            _host: &str,
            _oid: &str,
        ) -> anyhow::Result<HashMap<String, HashMap<String, f64>>> {
            Ok(self.optic_sensors.clone())
        }
    }

    fn test_config() -> SnmpConfig {
        SnmpConfig {
            hosts: vec!["10.0.0.1".to_string()],
            community: "public".to_string(),
            poll_interval: Duration::from_millis(10),
            node_name_oid: "nodename".to_string(),
            interface_name_oid: "ifname".to_string(),
            interface_description_oid: "ifdesc".to_string(),
            high_speed_oid: "highspeed".to_string(),
            oper_status_oid: "operstatus".to_string(),
            in_octets_oid: "in".to_string(),
            out_octets_oid: "out".to_string(),
            optic_name_table_oid: "opticname".to_string(),
            optic_sensor_table_oid: "opticsensors".to_string(),
            optic_rx_sensor_name: "rx".to_string(),
            optic_tx_sensor_name: "tx".to_string(),
            optic_lbc_sensor_name: "lbc".to_string(),
        }
    }

    #[tokio::test]
    async fn poll_once_populates_descriptions_states_and_optics() {
        let session = FakeSession {
            names: HashMap::from([("1".to_string(), "et-0/0/0".to_string())]),
            descriptions: HashMap::from([("1".to_string(), "core: to-router-a".to_string())]),
            oper_status: HashMap::from([("1".to_string(), 1)]),
            in_octets: StdMutex::new(HashMap::from([("1".to_string(), 1000)])),
            out_octets: StdMutex::new(HashMap::from([("1".to_string(), 2000)])),
            high_speed: HashMap::from([("1".to_string(), 100)]),
            optic_names: HashMap::from([("2".to_string(), "entPhysicalOptics1/0/1".to_string())]),
            optic_sensors: HashMap::from([(
                "2".to_string(),
                HashMap::from([
                    ("rx".to_string(), -20.0),
                    ("tx".to_string(), -10.0),
                    ("lbc".to_string(), 350.0),
                ]),
            )]),
            reachable: true,
        };

        let source = Arc::new(SnmpSource::new(session, test_config()));
        source.start().await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        source.shutdown();

        let nodes = source.get_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        let node_name = nodes.keys().next().unwrap().clone();

        let descriptions = source.get_descriptions(&[node_name.clone()]).await.unwrap();
        assert_eq!(descriptions[&node_name]["et-0/0/0"], "core: to-router-a");

        let states = source.get_states(&[node_name.clone()]).await.unwrap();
        assert_eq!(states[&node_name]["et-0/0/0"].state, LinkState::Up);

        let optics = source.get_optics(&[node_name.clone()]).await.unwrap();
        let optic = &optics[&node_name]["1/0/1"];
        assert_eq!(optic.rx_dbm, -2.0);
        assert_eq!(optic.tx_dbm, -1.0);
        assert_eq!(optic.lbc_ma, 35.0);
    }

    #[tokio::test]
    async fn unreachable_host_is_queued_for_retry() {
        let session = FakeSession {
            names: HashMap::new(),
            descriptions: HashMap::new(),
            oper_status: HashMap::new(),
            in_octets: StdMutex::new(HashMap::new()),
            out_octets: StdMutex::new(HashMap::new()),
            high_speed: HashMap::new(),
            optic_names: HashMap::new(),
            optic_sensors: HashMap::new(),
            reachable: false,
        };
        let source = Arc::new(SnmpSource::new(session, test_config()));
        source.start().await;
        assert_eq!(source.retry_queue.read().await.len(), 1);
        assert!(source.get_nodes().await.unwrap().is_empty());
        source.shutdown();
    }

    #[test]
    fn try_new_rejects_config_with_no_hosts() {
        let session = FakeSession {
            names: HashMap::new(),
            descriptions: HashMap::new(),
            oper_status: HashMap::new(),
            in_octets: StdMutex::new(HashMap::new()),
            out_octets: StdMutex::new(HashMap::new()),
            high_speed: HashMap::new(),
            optic_names: HashMap::new(),
            optic_sensors: HashMap::new(),
            reachable: true,
        };
        let config = SnmpConfig { hosts: Vec::new(), ..test_config() };
        let err = SnmpSource::try_new(session, config).unwrap_err();
        assert!(matches!(err, crate::error::ConfigError::MissingField("snmp.hosts")));
    }
}
