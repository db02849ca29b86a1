// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! TSDB-backed [`DataSource`] (§4.D): builds grouped, time-bucketed queries
//! against four logically separate query classes (metrics, optics,
//! descriptions, counters) and parses the resulting rows into typed samples.
//!
//! The wire protocol a real time-series database speaks (HTTP, line
//! protocol, auth headers) is out of scope for this crate (§1 "vendor-
//! specific wire details") — this module owns query *construction* and row
//! *parsing* only, against a pluggable [`QueryExecutor`] a caller supplies.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use crate::cache::Cache;
use crate::config::{TsdbConfig, TsdbQueryConfig};
use crate::datasource::{resolve_node_names, DataSource, HistoricMap, SampleMap};
use crate::model::{Counter, LinkState, Node, Optic, Rate, State};
use crate::timestamp::Timestamp;

/// One row of a query result: column name to raw JSON-typed value, the
/// already-deserialized shape a TSDB client library would hand back.
pub type Row = HashMap<String, Value>;

/// Executes a query string against the backing time-series store and
/// returns its rows. Production code supplies an implementation wrapping
/// whatever HTTP/query client the deployment uses; tests supply a fake.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn query(&self, query: &str) -> anyhow::Result<Vec<Row>>;
}

fn row_str<'a>(row: &'a Row, field: &str) -> Option<&'a str> {
    row.get(field).and_then(Value::as_str)
}

fn row_f64(row: &Row, field: &str) -> Option<f64> {
    row.get(field).and_then(Value::as_f64)
}

fn row_i64(row: &Row, field: &str) -> Option<i64> {
    row.get(field).and_then(Value::as_i64)
}

fn row_timestamp(row: &Row) -> Timestamp {
    row.get("time")
        .and_then(Value::as_i64)
        .map(|nanos| {
            let secs = nanos / 1_000_000_000;
            let nsecs = (nanos % 1_000_000_000) as u32;
            Timestamp::from_datetime(
                chrono::DateTime::<chrono::Utc>::from_timestamp(secs, nsecs).unwrap_or_else(chrono::Utc::now),
            )
        })
        .unwrap_or_else(Timestamp::now)
}

/// Builds the base (non-historic) query string for a query class. `fields[0]`
/// is always the interface tag name (never aggregated, it's a `GROUP BY`
/// key); the remainder are `last()`-aggregated value columns, mirroring
/// influx.py's `last(...) AS ... GROUP BY "node","<interface>" LIMIT 1`
/// shape — `LIMIT 1` applies per group, so every matching node/interface
/// series keeps its own most recent sample.
fn build_point_query(config: &TsdbQueryConfig, fields: &[&str], nodes: &[String]) -> String {
    let regex = nodes.join("|");
    let interface_tag = fields[0];
    let select = fields[1..]
        .iter()
        .map(|f| format!("last(\"{f}\") AS \"{f}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {} FROM \"{}\" WHERE \"node\" =~ /{}/ GROUP BY \"node\", \"{}\" LIMIT 1",
        select, config.measurement, regex, interface_tag,
    )
}

/// Rewrites the base query with a time filter and a `GROUP BY time(...)`
/// bucket (§4.D historic queries), keeping the same `last()` aggregation and
/// node/interface grouping as [`build_point_query`]. Interval is the short
/// interval when requested, else the long one.
fn build_historic_query(
    config: &TsdbQueryConfig,
    fields: &[&str],
    nodes: &[String],
    start: Timestamp,
    end: Timestamp,
    interval: u64,
) -> String {
    let regex = nodes.join("|");
    let interface_tag = fields[0];
    let select = fields[1..]
        .iter()
        .map(|f| format!("last(\"{f}\") AS \"{f}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {} FROM \"{}\" WHERE \"node\" =~ /{}/ AND time >= {}ns AND time <= {}ns GROUP BY time({}s), \"node\", \"{}\" fill(null)",
        select, config.measurement, regex, start.as_nanos(), end.as_nanos(), interval, interface_tag,
    )
}

/// One parsed row of the combined metric measurement (rate + state share a
/// measurement in the original deployment; §4.D groups them under one query
/// class even though they surface through two different `DataSource`
/// methods).
#[derive(Clone, Debug)]
struct MetricRow {
    interface: String,
    in_bps: Option<f64>,
    out_bps: Option<f64>,
    bandwidth_bps: Option<f64>,
    state: Option<LinkState>,
    timestamp: Timestamp,
}

fn normalize_state(raw: &str) -> LinkState {
    match raw {
        "im-state-up" => LinkState::Up,
        "im-state-down" => LinkState::Down,
        "im-state-admin-down" => LinkState::Shut,
        "im-state-err-disable" => LinkState::ErrDisable,
        _ => LinkState::Unknown,
    }
}

fn parse_metric_row(row: &Row, config: &TsdbQueryConfig, historic: bool) -> Option<MetricRow> {
    let interface = row_str(row, &config.interface_field)?.to_string();
    let bandwidth = row_f64(row, &config.bandwidth_field).map(|v| v * 1000.0);
    if bandwidth.is_none() && !historic {
        // Single-sample path skips rows with a null bandwidth (§4.D); the
        // historic path keeps them as a null placeholder to preserve
        // time alignment across the bucketed sequence.
        return None;
    }
    Some(MetricRow {
        interface,
        in_bps: row_f64(row, &config.in_rate_field).map(|v| v * 1000.0),
        out_bps: row_f64(row, &config.out_rate_field).map(|v| v * 1000.0),
        bandwidth_bps: bandwidth,
        state: row_str(row, &config.state_field).map(normalize_state),
        timestamp: row_timestamp(row),
    })
}

/// Applies the optical unit normalization from §4.D: divide by 100, then,
/// if the resulting laser bias exceeds 100mA, divide all three quantities by
/// 10 — this compensates a known upstream 10x scaling bug (§9), not a design
/// choice of this crate.
fn normalize_optic(rx: f64, tx: f64, lbc: f64) -> (f64, f64, f64) {
    let (mut rx, mut tx, mut lbc) = (rx / 100.0, tx / 100.0, lbc / 100.0);
    if lbc > 100.0 {
        rx /= 10.0;
        tx /= 10.0;
        lbc /= 10.0;
    }
    (rx, tx, lbc)
}

/// TSDB-backed `DataSource`. Generic over the query-execution seam so tests
/// can swap in a fake without a real database.
pub struct TsdbSource<Q> {
    executor: Q,
    config: TsdbConfig,
    historic_short_interval: u64,
    historic_long_interval: u64,
    known_nodes: Cache<(), HashMap<String, Node>>,
    desc_cache: Cache<Vec<String>, SampleMap<String>>,
    metric_cache: Cache<Vec<String>, SampleMap<MetricRow>>,
    optic_cache: Cache<Vec<String>, SampleMap<Optic>>,
    counter_cache: Cache<Vec<String>, SampleMap<Counter>>,
    historic_metric_cache: Cache<(Vec<String>, i64, i64, bool), HistoricMap<MetricRow>>,
    historic_optic_cache: Cache<(Vec<String>, i64, i64, bool), HistoricMap<Optic>>,
    historic_counter_cache: Cache<(Vec<String>, i64, i64, bool), HistoricMap<Counter>>,
}

impl<Q: QueryExecutor> TsdbSource<Q> {
    /// Validates `config` (§7 "ConfigurationMissing") before constructing,
    /// the fallible counterpart callers wiring up a real deployment should
    /// use; `new`/`with_intervals` stay infallible for tests and for callers
    /// that have already validated their config by other means.
    pub fn try_new(executor: Q, config: TsdbConfig) -> Result<Self, crate::error::ConfigError> {
        config.validate()?;
        Ok(Self::new(executor, config))
    }

    /// `historic_short_interval`/`historic_long_interval` are the matcher
    /// config's time-bucket widths (§6); they are threaded in rather than
    /// duplicated onto `TsdbConfig` since a single engine shares one pair of
    /// these across every backend.
    pub fn new(executor: Q, config: TsdbConfig) -> Self {
        Self::with_intervals(executor, config, 60, 900)
    }

    pub fn with_intervals(
        executor: Q,
        config: TsdbConfig,
        historic_short_interval: u64,
        historic_long_interval: u64,
    ) -> Self {
        // Historic link-layout-style caches get the long interval as their
        // TTL (§1A); node-roster discovery gets a flat 1h TTL matching the
        // "long ≈ 1 hour" default named in §4.B for description/link caches.
        let historic_ttl = Duration::from_secs(historic_long_interval);
        TsdbSource {
            known_nodes: Cache::new(Duration::from_secs(3600)),
            desc_cache: Cache::new(config.point_ttl_desc()),
            metric_cache: Cache::new(config.point_ttl_metric()),
            optic_cache: Cache::new(config.point_ttl_optic()),
            counter_cache: Cache::new(config.point_ttl_counter()),
            historic_metric_cache: Cache::new(historic_ttl),
            historic_optic_cache: Cache::new(historic_ttl),
            historic_counter_cache: Cache::new(historic_ttl),
            historic_short_interval,
            historic_long_interval,
            executor,
            config,
        }
    }

    async fn resolved(&self, nodes: &[String]) -> anyhow::Result<Vec<String>> {
        let known = self
            .known_nodes
            .get((), |_| async { self.fetch_nodes().await })
            .await?;
        let mut names: Vec<String> = known.keys().cloned().collect();
        names.sort();
        Ok(resolve_node_names(nodes, &names))
    }

    async fn fetch_nodes(&self) -> anyhow::Result<HashMap<String, Node>> {
        let query = format!("SHOW TAG VALUES FROM \"{}\" WITH KEY = \"node\"", self.config.desc.measurement);
        let rows = self.executor.query(&query).await?;
        let mut nodes = HashMap::new();
        for row in rows {
            if let Some(name) = row_str(&row, "node") {
                nodes.insert(name.to_string(), Node::new(name, "tsdb"));
            }
        }
        Ok(nodes)
    }

    fn interval_for(&self, short_interval: bool) -> u64 {
        if short_interval {
            self.historic_short_interval
        } else {
            self.historic_long_interval
        }
    }

    async fn metric_rows(&self, nodes: &[String]) -> anyhow::Result<SampleMap<MetricRow>> {
        let resolved = self.resolved(nodes).await?;
        self.metric_cache
            .get(resolved, |nodes| async move {
                let fields = [
                    self.config.metric.interface_field.as_str(),
                    self.config.metric.in_rate_field.as_str(),
                    self.config.metric.out_rate_field.as_str(),
                    self.config.metric.bandwidth_field.as_str(),
                    self.config.metric.state_field.as_str(),
                ];
                let query = build_point_query(&self.config.metric, &fields, &nodes);
                debug!("tsdb metric query: {query}");
                let rows = self.executor.query(&query).await?;
                Ok(group_by_interface(rows, |row| {
                    parse_metric_row(row, &self.config.metric, false)
                }))
            })
            .await
    }

    async fn historic_metric_rows(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> anyhow::Result<HistoricMap<MetricRow>> {
        let resolved = self.resolved(nodes).await?;
        let key = (resolved, start.as_nanos(), end.as_nanos(), short_interval);
        self.historic_metric_cache
            .get(key, |(nodes, _, _, short)| async move {
                let interval = self.interval_for(short);
                let fields = [
                    self.config.metric.interface_field.as_str(),
                    self.config.metric.in_rate_field.as_str(),
                    self.config.metric.out_rate_field.as_str(),
                    self.config.metric.bandwidth_field.as_str(),
                    self.config.metric.state_field.as_str(),
                ];
                let query = build_historic_query(&self.config.metric, &fields, &nodes, start, end, interval);
                debug!("tsdb historic metric query: {query}");
                let rows = self.executor.query(&query).await?;
                Ok(group_historic_by_interface(rows, |row| {
                    parse_metric_row(row, &self.config.metric, true)
                }))
            })
            .await
    }
}

fn group_by_interface(rows: Vec<Row>, parse: impl Fn(&Row) -> Option<MetricRow>) -> SampleMap<MetricRow> {
    let mut out: SampleMap<MetricRow> = HashMap::new();
    for row in &rows {
        let Some(node) = row_str(row, "node").map(str::to_string) else { continue };
        let Some(sample) = parse(row) else { continue };
        out.entry(node).or_default().insert(sample.interface.clone(), sample);
    }
    out
}

fn group_historic_by_interface(
    rows: Vec<Row>,
    parse: impl Fn(&Row) -> Option<MetricRow>,
) -> HistoricMap<MetricRow> {
    let mut out: HistoricMap<MetricRow> = HashMap::new();
    for row in &rows {
        let Some(node) = row_str(row, "node").map(str::to_string) else { continue };
        let Some(sample) = parse(row) else { continue };
        out.entry(node)
            .or_default()
            .entry(sample.interface.clone())
            .or_default()
            .push(sample);
    }
    out
}

#[async_trait]
impl<Q: QueryExecutor + Send + Sync> DataSource for TsdbSource<Q> {
    fn name(&self) -> &'static str {
        "tsdb"
    }

    async fn get_nodes(&self) -> anyhow::Result<HashMap<String, Node>> {
        self.known_nodes.get((), |_| async { self.fetch_nodes().await }).await
    }

    async fn get_descriptions(&self, nodes: &[String]) -> anyhow::Result<SampleMap<String>> {
        let resolved = self.resolved(nodes).await?;
        self.desc_cache
            .get(resolved, |nodes| async move {
                let fields = [self.config.desc.interface_field.as_str(), self.config.desc.description_field.as_str()];
                let query = build_point_query(&self.config.desc, &fields, &nodes);
                debug!("tsdb description query: {query}");
                let rows = self.executor.query(&query).await?;
                let mut out: SampleMap<String> = HashMap::new();
                for row in &rows {
                    let Some(node) = row_str(row, "node").map(str::to_string) else { continue };
                    let Some(iface) = row_str(row, &self.config.desc.interface_field).map(str::to_string) else {
                        continue;
                    };
                    let description = row_str(row, &self.config.desc.description_field).unwrap_or("").to_string();
                    out.entry(node).or_default().insert(iface, description);
                }
                Ok(out)
            })
            .await
    }

    async fn get_states(&self, nodes: &[String]) -> anyhow::Result<SampleMap<State>> {
        let rows = self.metric_rows(nodes).await?;
        Ok(rows
            .into_iter()
            .map(|(node, by_iface)| {
                let states = by_iface
                    .into_iter()
                    .filter_map(|(iface, row)| {
                        row.state.map(|state| {
                            (
                                iface,
                                State {
                                    state,
                                    datasource: "tsdb",
                                    timestamp: row.timestamp,
                                },
                            )
                        })
                    })
                    .collect();
                (node, states)
            })
            .collect())
    }

    async fn get_rates(&self, nodes: &[String]) -> anyhow::Result<SampleMap<Rate>> {
        let rows = self.metric_rows(nodes).await?;
        Ok(rows
            .into_iter()
            .map(|(node, by_iface)| {
                let rates = by_iface
                    .into_iter()
                    .filter_map(|(iface, row)| {
                        row.bandwidth_bps.map(|bandwidth_bps| {
                            (
                                iface,
                                Rate {
                                    in_bps: row.in_bps.unwrap_or(0.0),
                                    out_bps: row.out_bps.unwrap_or(0.0),
                                    bandwidth_bps,
                                    datasource: "tsdb",
                                    timestamp: row.timestamp,
                                },
                            )
                        })
                    })
                    .collect();
                (node, rates)
            })
            .collect())
    }

    async fn get_optics(&self, nodes: &[String]) -> anyhow::Result<SampleMap<Optic>> {
        let resolved = self.resolved(nodes).await?;
        self.optic_cache
            .get(resolved, |nodes| async move {
                let fields = [
                    self.config.optic.interface_field.as_str(),
                    self.config.optic.rx_field.as_str(),
                    self.config.optic.tx_field.as_str(),
                    self.config.optic.lbc_field.as_str(),
                ];
                let query = build_point_query(&self.config.optic, &fields, &nodes);
                debug!("tsdb optic query: {query}");
                let rows = self.executor.query(&query).await?;
                let mut out: SampleMap<Optic> = HashMap::new();
                for row in &rows {
                    let Some(node) = row_str(row, "node").map(str::to_string) else { continue };
                    let Some(raw_iface) = row_str(row, &self.config.optic.interface_field) else { continue };
                    let iface = rekey_optics_interface(raw_iface);
                    let (Some(rx), Some(tx), Some(lbc)) = (
                        row_f64(row, &self.config.optic.rx_field),
                        row_f64(row, &self.config.optic.tx_field),
                        row_f64(row, &self.config.optic.lbc_field),
                    ) else {
                        continue;
                    };
                    let (rx, tx, lbc) = normalize_optic(rx, tx, lbc);
                    out.entry(node).or_default().insert(
                        iface,
                        Optic {
                            rx_dbm: rx,
                            tx_dbm: tx,
                            lbc_ma: lbc,
                            datasource: "tsdb",
                            timestamp: row_timestamp(row),
                        },
                    );
                }
                Ok(out)
            })
            .await
    }

    async fn get_counters(&self, nodes: &[String]) -> anyhow::Result<SampleMap<Counter>> {
        let resolved = self.resolved(nodes).await?;
        self.counter_cache
            .get(resolved, |nodes| async move {
                let fields = [
                    self.config.counter.interface_field.as_str(),
                    self.config.counter.crc_field.as_str(),
                    self.config.counter.input_error_field.as_str(),
                    self.config.counter.packets_received_field.as_str(),
                    self.config.counter.output_drops_field.as_str(),
                ];
                let query = build_point_query(&self.config.counter, &fields, &nodes);
                debug!("tsdb counter query: {query}");
                let rows = self.executor.query(&query).await?;
                let mut out: SampleMap<Counter> = HashMap::new();
                for row in &rows {
                    let Some(node) = row_str(row, "node").map(str::to_string) else { continue };
                    let Some(iface) = row_str(row, &self.config.counter.interface_field).map(str::to_string) else {
                        continue;
                    };
                    out.entry(node).or_default().insert(
                        iface,
                        Counter {
                            crc_errors: row_i64(row, &self.config.counter.crc_field),
                            input_errors: row_i64(row, &self.config.counter.input_error_field),
                            packets_received: row_i64(row, &self.config.counter.packets_received_field),
                            output_drops: row_i64(row, &self.config.counter.output_drops_field),
                            datasource: "tsdb",
                            timestamp: row_timestamp(row),
                        },
                    );
                }
                Ok(out)
            })
            .await
    }

    async fn get_historic_states(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> anyhow::Result<HistoricMap<State>> {
        let rows = self.historic_metric_rows(nodes, start, end, short_interval).await?;
        Ok(rows
            .into_iter()
            .map(|(node, by_iface)| {
                let states = by_iface
                    .into_iter()
                    .map(|(iface, samples)| {
                        let states = samples
                            .into_iter()
                            .map(|row| State {
                                state: row.state.unwrap_or(LinkState::Unknown),
                                datasource: "tsdb",
                                timestamp: row.timestamp,
                            })
                            .collect();
                        (iface, states)
                    })
                    .collect();
                (node, states)
            })
            .collect())
    }

    async fn get_historic_rates(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> anyhow::Result<HistoricMap<Rate>> {
        let rows = self.historic_metric_rows(nodes, start, end, short_interval).await?;
        Ok(rows
            .into_iter()
            .map(|(node, by_iface)| {
                let rates = by_iface
                    .into_iter()
                    .map(|(iface, samples)| {
                        let rates = samples
                            .into_iter()
                            .map(|row| Rate {
                                in_bps: row.in_bps.unwrap_or(0.0),
                                out_bps: row.out_bps.unwrap_or(0.0),
                                bandwidth_bps: row.bandwidth_bps.unwrap_or(0.0),
                                datasource: "tsdb",
                                timestamp: row.timestamp,
                            })
                            .collect();
                        (iface, rates)
                    })
                    .collect();
                (node, rates)
            })
            .collect())
    }

    async fn get_historic_optics(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> anyhow::Result<HistoricMap<Optic>> {
        let resolved = self.resolved(nodes).await?;
        let key = (resolved, start.as_nanos(), end.as_nanos(), short_interval);
        self.historic_optic_cache
            .get(key, |(nodes, _, _, short)| async move {
                let interval = self.interval_for(short);
                let fields = [
                    self.config.optic.interface_field.as_str(),
                    self.config.optic.rx_field.as_str(),
                    self.config.optic.tx_field.as_str(),
                    self.config.optic.lbc_field.as_str(),
                ];
                let query = build_historic_query(&self.config.optic, &fields, &nodes, start, end, interval);
                debug!("tsdb historic optic query: {query}");
                let rows = self.executor.query(&query).await?;
                let mut out: HistoricMap<Optic> = HashMap::new();
                for row in &rows {
                    let Some(node) = row_str(row, "node").map(str::to_string) else { continue };
                    let Some(raw_iface) = row_str(row, &self.config.optic.interface_field) else { continue };
                    let iface = rekey_optics_interface(raw_iface);
                    let rx = row_f64(row, &self.config.optic.rx_field);
                    let tx = row_f64(row, &self.config.optic.tx_field);
                    let lbc = row_f64(row, &self.config.optic.lbc_field);
                    let (rx, tx, lbc) = match (rx, tx, lbc) {
                        (Some(rx), Some(tx), Some(lbc)) => normalize_optic(rx, tx, lbc),
                        _ => (0.0, 0.0, 0.0),
                    };
                    out.entry(node).or_default().entry(iface).or_default().push(Optic {
                        rx_dbm: rx,
                        tx_dbm: tx,
                        lbc_ma: lbc,
                        datasource: "tsdb",
                        timestamp: row_timestamp(row),
                    });
                }
                Ok(out)
            })
            .await
    }

    async fn get_historic_counters(
        &self,
        nodes: &[String],
        start: Timestamp,
        end: Timestamp,
        short_interval: bool,
    ) -> anyhow::Result<HistoricMap<Counter>> {
        let resolved = self.resolved(nodes).await?;
        let key = (resolved, start.as_nanos(), end.as_nanos(), short_interval);
        self.historic_counter_cache
            .get(key, |(nodes, _, _, short)| async move {
                let interval = self.interval_for(short);
                let fields = [
                    self.config.counter.interface_field.as_str(),
                    self.config.counter.crc_field.as_str(),
                    self.config.counter.input_error_field.as_str(),
                    self.config.counter.packets_received_field.as_str(),
                    self.config.counter.output_drops_field.as_str(),
                ];
                let query = build_historic_query(&self.config.counter, &fields, &nodes, start, end, interval);
                debug!("tsdb historic counter query: {query}");
                let rows = self.executor.query(&query).await?;
                let mut out: HistoricMap<Counter> = HashMap::new();
                for row in &rows {
                    let Some(node) = row_str(row, "node").map(str::to_string) else { continue };
                    let Some(iface) = row_str(row, &self.config.counter.interface_field).map(str::to_string) else {
                        continue;
                    };
                    out.entry(node).or_default().entry(iface).or_default().push(Counter {
                        crc_errors: row_i64(row, &self.config.counter.crc_field),
                        input_errors: row_i64(row, &self.config.counter.input_error_field),
                        packets_received: row_i64(row, &self.config.counter.packets_received_field),
                        output_drops: row_i64(row, &self.config.counter.output_drops_field),
                        datasource: "tsdb",
                        timestamp: row_timestamp(row),
                    });
                }
                Ok(out)
            })
            .await
    }
}

/// Strips a leading `<name>Optics` tag, keeping only the numeric suffix
/// (e.g. `TenGigabitEth0Optics0/1/0/1` → `0/1/0/1`), the producer-side half
/// of the optics/state key mismatch noted in §4.I and §9.
fn rekey_optics_interface(raw: &str) -> String {
    match raw.find("Optics") {
        Some(idx) => raw[idx + "Optics".len()..].to_string(),
        None => raw.to_string(),
    }
}
