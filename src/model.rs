// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Immutable sample types and the mutable [`Link`]/[`Endpoint`] model they feed.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::{Map, Value};

use crate::timestamp::Timestamp;

/// An immutable `(node, interface, description)` triple.
///
/// Two interfaces are equal iff all three fields are equal; ordering is
/// derived for deterministic iteration when sorting candidate lists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interface {
    pub node: String,
    pub interface: String,
    pub description: String,
}

impl Interface {
    pub fn new(
        node: impl Into<String>,
        interface: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Interface {
            node: node.into(),
            interface: interface.into(),
            description: description.into(),
        }
    }
}

/// The numeric suffix of an interface id (e.g. `TenGigabitEth1/1` → `1/1`),
/// how optical measurements are keyed across backends (§3, §4.D, §4.E).
pub fn numeric_suffix(interface: &str) -> &str {
    match interface.find(|c: char| c.is_ascii_digit()) {
        Some(idx) => &interface[idx..],
        None => interface,
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{} {}", self.node, self.interface)
        } else {
            write!(f, "{} {} ({})", self.node, self.interface, self.description)
        }
    }
}

/// A known device, tagged with the backend that reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub source: String,
}

impl Node {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Node {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// The partial `(node, interface)` hint recovered from an interface
/// description by the parser (§4.G). A parse only succeeds when *both*
/// fields were found; a result missing either is treated as unparsable
/// rather than threaded through as a half-populated value, since nothing
/// downstream can cross-check a missing half anyway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRemote {
    pub node: String,
    pub interface: String,
}

impl fmt::Display for ParsedRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.node, self.interface)
    }
}

/// Administrative/operational interface state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
    Shut,
    ErrDisable,
    Unknown,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Up => "up",
            LinkState::Down => "down",
            LinkState::Shut => "shut",
            LinkState::ErrDisable => "errdisable",
            LinkState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Latest (or one historic) state sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub state: LinkState,
    pub datasource: &'static str,
    pub timestamp: Timestamp,
}

/// Latest (or one historic) in/out rate sample, in bits per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub in_bps: f64,
    pub out_bps: f64,
    pub bandwidth_bps: f64,
    pub datasource: &'static str,
    pub timestamp: Timestamp,
}

impl Rate {
    /// Swap input/output direction, used for the one-sided fallback in §4.I.
    /// Bandwidth is direction-agnostic and is therefore invariant under reversal.
    pub fn reverse(&self) -> Rate {
        Rate {
            in_bps: self.out_bps,
            out_bps: self.in_bps,
            bandwidth_bps: self.bandwidth_bps,
            datasource: self.datasource,
            timestamp: self.timestamp,
        }
    }
}

/// Optical power / laser bias sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Optic {
    pub rx_dbm: f64,
    pub tx_dbm: f64,
    pub lbc_ma: f64,
    pub datasource: &'static str,
    pub timestamp: Timestamp,
}

/// Error-counter sample. Counters are nullable because not every backend
/// reports every column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub crc_errors: Option<i64>,
    pub input_errors: Option<i64>,
    pub packets_received: Option<i64>,
    pub output_drops: Option<i64>,
    pub datasource: &'static str,
    pub timestamp: Timestamp,
}

impl Counter {
    /// `input_errors / packets_received`, or zero when there is nothing to
    /// divide by (§3 invariant).
    pub fn packet_loss(&self) -> f64 {
        match (self.input_errors, self.packets_received) {
            (Some(errors), Some(received)) if received > 0 => errors as f64 / received as f64,
            _ => 0.0,
        }
    }
}

/// Either side of a verified link, or the single known side of a [`Remote`]
/// reference to an unverified peer. Replaces the source's `Remote(Link)`
/// subclass-that-deletes-a-field with a proper tagged variant (§9).
#[derive(Debug, Clone)]
pub enum Endpoint {
    Pair(Interface, Interface),
    Open(Interface, String),
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Endpoint::Pair(a1, a2), Endpoint::Pair(b1, b2)) => {
                (a1 == b1 && a2 == b2) || (a1 == b2 && a2 == b1)
            }
            (Endpoint::Open(a, la), Endpoint::Open(b, lb)) => a == b && la == lb,
            _ => false,
        }
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Endpoint::Pair(a, b) => {
                // Combine with a commutative operator so swapped endpoints hash
                // identically, matching the symmetric Eq above (§9 open question).
                let mut ha = DefaultHasher::new();
                a.hash(&mut ha);
                let mut hb = DefaultHasher::new();
                b.hash(&mut hb);
                0u8.hash(state);
                (ha.finish() ^ hb.finish()).hash(state);
            }
            Endpoint::Open(a, label) => {
                1u8.hash(state);
                a.hash(state);
                label.hash(state);
            }
        }
    }
}

/// Mutable measurement fields attached to a [`Link`]. Kept as a separate type
/// from [`Endpoint`] so identity (`Eq`/`Hash`) never accidentally depends on
/// the samples that happen to be attached at a given moment.
#[derive(Debug, Clone, Default)]
pub struct Measurements {
    pub datasource: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub state: Option<LinkState>,
    pub in_rate: Option<f64>,
    pub out_rate: Option<f64>,
    pub bandwidth: Option<f64>,
    pub source_crc_error: Option<i64>,
    pub source_in_error: Option<i64>,
    pub source_packet_loss: Option<f64>,
    pub source_out_drop: Option<i64>,
    pub target_crc_error: Option<i64>,
    pub target_in_error: Option<i64>,
    pub target_packet_loss: Option<f64>,
    pub target_out_drop: Option<i64>,
    pub source_optic_rx: Option<f64>,
    pub source_optic_tx: Option<f64>,
    pub source_optic_lbc: Option<f64>,
    pub target_optic_rx: Option<f64>,
    pub target_optic_tx: Option<f64>,
    pub target_optic_lbc: Option<f64>,
}

impl Measurements {
    /// `datasource`/`timestamp` are only backfilled if unset.
    ///
    /// This is the observed (and possibly accidental) asymmetry with
    /// [`Measurements::apply_rate`] noted as an open question in §9 — it is
    /// preserved here deliberately, not "fixed".
    pub fn apply_state(&mut self, state: Option<State>) {
        let Some(state) = state else { return };
        self.state = Some(state.state);
        if self.datasource.is_none() {
            self.datasource = Some(state.datasource.to_string());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(state.timestamp);
        }
    }

    /// `datasource`/`timestamp` are always overwritten, unlike [`Measurements::apply_state`].
    pub fn apply_rate(&mut self, rate: Option<Rate>) {
        let Some(rate) = rate else { return };
        self.in_rate = Some(rate.in_bps);
        self.out_rate = Some(rate.out_bps);
        self.bandwidth = Some(rate.bandwidth_bps);
        self.datasource = Some(rate.datasource.to_string());
        self.timestamp = Some(rate.timestamp);
    }

    /// Reads both sides unconditionally; only the source side touches
    /// `datasource`/`timestamp` (matches the source's `set_health`, which never
    /// assigns either from the target counter).
    pub fn apply_health(&mut self, source: Option<Counter>, target: Option<Counter>) {
        if let Some(c) = source {
            self.source_crc_error = c.crc_errors;
            self.source_in_error = c.input_errors;
            self.source_packet_loss = Some(c.packet_loss());
            self.source_out_drop = c.output_drops;
            self.datasource = Some(c.datasource.to_string());
            self.timestamp = Some(c.timestamp);
        }
        if let Some(c) = target {
            self.target_crc_error = c.crc_errors;
            self.target_in_error = c.input_errors;
            self.target_packet_loss = Some(c.packet_loss());
            self.target_out_drop = c.output_drops;
        }
    }

    /// Reads both sides unconditionally. The source side sets both
    /// `datasource` and `timestamp`; the target side only overwrites
    /// `datasource` (matches the source's `set_optics`, which never sets a
    /// `datetime` from the target optic either).
    pub fn apply_optics(&mut self, source: Option<Optic>, target: Option<Optic>) {
        if let Some(o) = source {
            self.source_optic_rx = Some(o.rx_dbm);
            self.source_optic_tx = Some(o.tx_dbm);
            self.source_optic_lbc = Some(o.lbc_ma);
            self.datasource = Some(o.datasource.to_string());
            self.timestamp = Some(o.timestamp);
        }
        if let Some(o) = target {
            self.target_optic_rx = Some(o.rx_dbm);
            self.target_optic_tx = Some(o.tx_dbm);
            self.target_optic_lbc = Some(o.lbc_ma);
            self.datasource = Some(o.datasource.to_string());
        }
    }

    fn write_fields(&self, map: &mut Map<String, Value>) {
        macro_rules! put {
            ($field:expr, $key:literal) => {
                if let Some(v) = &$field {
                    map.insert($key.to_string(), json_value(v));
                }
            };
        }
        put!(self.in_rate, "in");
        put!(self.out_rate, "out");
        put!(self.state.map(|s| s.to_string()), "state");
        put!(self.bandwidth, "bandwidth");
        put!(self.datasource, "datasource");
        put!(self.timestamp.map(|t| t.to_string()), "datetime");
        put!(self.source_optic_rx, "source_receive");
        put!(self.source_optic_tx, "source_transmit");
        put!(self.source_optic_lbc, "source_lbc");
        put!(self.target_optic_rx, "target_receive");
        put!(self.target_optic_tx, "target_transmit");
        put!(self.target_optic_lbc, "target_lbc");
        put!(self.source_crc_error, "source_crc_error");
        put!(self.source_in_error, "source_input_error");
        put!(self.source_packet_loss, "source_packet_loss");
        put!(self.source_out_drop, "source_output_drop");
        put!(self.target_crc_error, "target_crc_error");
        put!(self.target_in_error, "target_input_error");
        put!(self.target_packet_loss, "target_packet_loss");
        put!(self.target_out_drop, "target_output_drop");
    }

    pub fn has_rate_data(&self) -> bool {
        self.in_rate.is_some() || self.out_rate.is_some() || self.bandwidth.is_some()
    }

    pub fn has_counter_data(&self) -> bool {
        self.source_crc_error.is_some()
            || self.source_in_error.is_some()
            || self.target_crc_error.is_some()
            || self.target_in_error.is_some()
    }

    pub fn has_optic_data(&self) -> bool {
        self.source_optic_lbc.is_some() || self.target_optic_lbc.is_some()
    }
}

fn json_value(v: &impl fmt::Display) -> Value {
    let s = v.to_string();
    if let Ok(f) = s.parse::<f64>() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::String(s))
    } else {
        Value::String(s)
    }
}

/// A verified link between two interfaces, or an unverified reference to a
/// labeled remote peer, plus whatever measurements have been attached to it.
#[derive(Debug, Clone)]
pub struct Link {
    pub endpoint: Endpoint,
    pub measurements: Measurements,
}

impl Link {
    pub fn new_pair(source: Interface, target: Interface) -> Self {
        Link {
            endpoint: Endpoint::Pair(source, target),
            measurements: Measurements::default(),
        }
    }

    pub fn new_remote(source: Interface, label: impl Into<String>) -> Self {
        Link {
            endpoint: Endpoint::Open(source, label.into()),
            measurements: Measurements::default(),
        }
    }

    pub fn source(&self) -> &Interface {
        match &self.endpoint {
            Endpoint::Pair(s, _) => s,
            Endpoint::Open(s, _) => s,
        }
    }

    pub fn target(&self) -> Option<&Interface> {
        match &self.endpoint {
            Endpoint::Pair(_, t) => Some(t),
            Endpoint::Open(..) => None,
        }
    }

    pub fn remote_label(&self) -> Option<&str> {
        match &self.endpoint {
            Endpoint::Open(_, label) => Some(label.as_str()),
            Endpoint::Pair(..) => None,
        }
    }

    /// Dictionary-shaped view matching the `_asdict_list` mapping from the
    /// original (§3). Only fields that have actually been set are emitted.
    pub fn as_fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match &self.endpoint {
            Endpoint::Pair(source, target) => {
                map.insert("source".to_string(), Value::String(source.node.clone()));
                map.insert("target".to_string(), Value::String(target.node.clone()));
            }
            Endpoint::Open(source, label) => {
                map.insert("source".to_string(), Value::String(source.node.clone()));
                map.insert("remote".to_string(), Value::String(label.clone()));
            }
        }
        self.measurements.write_fields(&mut map);
        map
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Eq for Link {}

impl Hash for Link {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint.hash(state);
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Pair(s, t) => write!(f, "{s} <-> {t}"),
            Endpoint::Open(s, label) => write!(f, "{s} -> {label}"),
        }
    }
}
