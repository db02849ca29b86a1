// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Network weathermap core: topology discovery from free-form interface
//! descriptions, two-sided link verification, and per-link telemetry
//! enrichment across one or more pluggable data sources.
//!
//! The HTTP surface, static map/uplink catalogs, and vendor-specific wire
//! protocols for SNMP/TSDB are deliberately out of scope — this crate owns
//! topology, caching, merge policy, and enrichment only.

mod cache;
mod config;
mod datasource;
mod engine;
mod error;
mod matcher;
mod merge;
mod model;
mod parser;
mod snmp;
mod stats;
mod timestamp;
mod tsdb;
mod validation;

#[cfg(any(test, feature = "arb"))]
mod arb;

pub use cache::{Cache, SharedCache};
pub use config::{
    Config, MatcherConfig, SnmpConfig, TsdbConfig, TsdbQueryConfig, SNMP_BANDWIDTH_TTL, SNMP_DESCRIPTION_TTL,
};
pub use datasource::{resolve_node_names, DataSource, HistoricMap, SampleMap};
pub use engine::{Engine, LinkSelector, LinkTimeline};
pub use error::{ConfigError, ValidationError, VerificationError};
pub use matcher::{
    discover_nodes, discover_orphan_nodes, errors_to_csv, get_links_between, get_links_remote, verify_link,
    DiscoveredLink, DiscoveredNode, DiscoveryResult, VerificationErrors,
};
pub use merge::MultiSource;
pub use model::{
    Counter, Endpoint, Interface, Link, LinkState, Measurements, Node, Optic, ParsedRemote, Rate, State,
};
pub use parser::{check_description, check_interface_name, parse_description};
pub use snmp::{SnmpSession, SnmpSource};
pub use stats::register_metrics;
pub use timestamp::Timestamp;
pub use tsdb::{QueryExecutor, TsdbSource};
pub use validation::{validate_node_list, validate_span};

#[cfg(any(test, feature = "arb"))]
pub use arb::{ArbInterface, ArbInterfaceId, ArbRate, ArbToken};
