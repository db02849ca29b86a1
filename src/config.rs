// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Configuration surface (§1A, §6). The core never reads files or
//! environment variables itself — callers populate these structs and hand
//! them to the backend constructors.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::ConfigError;

/// Parser/matcher tunables (§4.G, §4.H).
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub node_excludelist: HashSet<String>,
    pub node_separator: String,
    pub node_num_segments: usize,
    pub remote_includelist: HashSet<String>,
    pub description_prefix_excludelist: Vec<String>,
    pub description_excludelist: Vec<String>,
    pub historic_short_interval: u64,
    pub historic_long_interval: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            node_excludelist: ["the", "as", "a", "an"].iter().map(|s| s.to_string()).collect(),
            node_separator: "-".to_string(),
            node_num_segments: 2,
            remote_includelist: ["isp", "peer", "fw", "firewall"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            description_prefix_excludelist: vec!["BRDG_".to_string(), "PWL_".to_string()],
            description_excludelist: vec!["-rt-".to_string(), "-sw-".to_string()],
            historic_short_interval: 60,
            historic_long_interval: 900,
        }
    }
}

/// Field-name overrides for one of the TSDB's four query classes
/// (metric/optic/desc/counter), plus the connection settings for that class.
#[derive(Debug, Clone)]
pub struct TsdbQueryConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub measurement: String,
    pub interval: u64,
    pub interface_field: String,
    pub in_rate_field: String,
    pub out_rate_field: String,
    pub bandwidth_field: String,
    pub rx_field: String,
    pub tx_field: String,
    pub lbc_field: String,
    pub description_field: String,
    pub state_field: String,
    pub crc_field: String,
    pub input_error_field: String,
    pub packets_received_field: String,
    pub output_drops_field: String,
}

impl Default for TsdbQueryConfig {
    fn default() -> Self {
        TsdbQueryConfig {
            host: "localhost".to_string(),
            port: 8086,
            username: String::new(),
            password: String::new(),
            database: "weathermap".to_string(),
            measurement: "interface".to_string(),
            interval: 60,
            interface_field: "interface".to_string(),
            in_rate_field: "in_rate".to_string(),
            out_rate_field: "out_rate".to_string(),
            bandwidth_field: "bandwidth".to_string(),
            rx_field: "rx_power".to_string(),
            tx_field: "tx_power".to_string(),
            lbc_field: "lbc".to_string(),
            description_field: "description".to_string(),
            state_field: "line_state".to_string(),
            crc_field: "crc_errors".to_string(),
            input_error_field: "input_errors".to_string(),
            packets_received_field: "packets_received".to_string(),
            output_drops_field: "output_drops".to_string(),
        }
    }
}

/// Connection and cache-TTL configuration for the TSDB backend (§4.D, §6).
#[derive(Debug, Clone)]
pub struct TsdbConfig {
    pub metric: TsdbQueryConfig,
    pub optic: TsdbQueryConfig,
    pub desc: TsdbQueryConfig,
    pub counter: TsdbQueryConfig,
}

impl TsdbConfig {
    /// Refuses to construct a backend whose connection settings are missing
    /// a `host` or `database` for any of its four query classes (§7
    /// "ConfigurationMissing: a required field in a backend config is
    /// absent"). Field-name overrides are never required — an empty
    /// override just means "use this query class's raw column name",
    /// handled by the row parser, not a configuration failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for query in [&self.metric, &self.optic, &self.desc, &self.counter] {
            if query.host.is_empty() {
                return Err(ConfigError::MissingField("tsdb.host"));
            }
            if query.database.is_empty() {
                return Err(ConfigError::MissingField("tsdb.database"));
            }
            if query.measurement.is_empty() {
                return Err(ConfigError::MissingField("tsdb.measurement"));
            }
        }
        Ok(())
    }

    /// Point-query cache TTL for a query class: `interval` for descriptions,
    /// `interval * 2` otherwise (§1A).
    pub fn point_ttl_desc(&self) -> Duration {
        Duration::from_secs(self.desc.interval)
    }

    pub fn point_ttl_metric(&self) -> Duration {
        Duration::from_secs(self.metric.interval * 2)
    }

    pub fn point_ttl_optic(&self) -> Duration {
        Duration::from_secs(self.optic.interval * 2)
    }

    pub fn point_ttl_counter(&self) -> Duration {
        Duration::from_secs(self.counter.interval * 2)
    }
}

impl Default for TsdbConfig {
    fn default() -> Self {
        TsdbConfig {
            metric: TsdbQueryConfig::default(),
            optic: TsdbQueryConfig::default(),
            desc: TsdbQueryConfig::default(),
            counter: TsdbQueryConfig::default(),
        }
    }
}

/// SNMP host list, OID table, and poll interval (§4.E, §6).
#[derive(Debug, Clone)]
pub struct SnmpConfig {
    pub hosts: Vec<String>,
    pub community: String,
    pub poll_interval: Duration,
    pub node_name_oid: String,
    pub interface_name_oid: String,
    pub interface_description_oid: String,
    pub high_speed_oid: String,
    pub oper_status_oid: String,
    pub in_octets_oid: String,
    pub out_octets_oid: String,
    pub optic_name_table_oid: String,
    pub optic_sensor_table_oid: String,
    pub optic_rx_sensor_name: String,
    pub optic_tx_sensor_name: String,
    pub optic_lbc_sensor_name: String,
}

impl Default for SnmpConfig {
    fn default() -> Self {
        SnmpConfig {
            hosts: Vec::new(),
            community: "public".to_string(),
            poll_interval: Duration::from_secs(30),
            node_name_oid: "1.3.6.1.2.1.1.5.0".to_string(),
            interface_name_oid: "1.3.6.1.2.1.31.1.1.1.1".to_string(),
            interface_description_oid: "1.3.6.1.2.1.31.1.1.1.18".to_string(),
            high_speed_oid: "1.3.6.1.2.1.31.1.1.1.15".to_string(),
            oper_status_oid: "1.3.6.1.2.1.2.2.1.8".to_string(),
            in_octets_oid: "1.3.6.1.2.1.31.1.1.1.6".to_string(),
            out_octets_oid: "1.3.6.1.2.1.31.1.1.1.10".to_string(),
            optic_name_table_oid: "1.3.6.1.4.1.9.9.91.1.1.1.1".to_string(),
            optic_sensor_table_oid: "1.3.6.1.4.1.9.9.91.1.1.1.1".to_string(),
            optic_rx_sensor_name: "Rx Power".to_string(),
            optic_tx_sensor_name: "Tx Power".to_string(),
            optic_lbc_sensor_name: "Bias Current".to_string(),
        }
    }
}

impl SnmpConfig {
    /// Refuses to construct a backend with no hosts to poll or no hostname
    /// OID to resolve them with (§7 "ConfigurationMissing").
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::MissingField("snmp.hosts"));
        }
        if self.node_name_oid.is_empty() {
            return Err(ConfigError::MissingField("snmp.node_name_oid"));
        }
        Ok(())
    }
}

/// The bandwidth and optics-table cache TTLs used by the SNMP backend (§1A).
pub const SNMP_BANDWIDTH_TTL: Duration = Duration::from_secs(8 * 3600);
pub const SNMP_DESCRIPTION_TTL: Duration = Duration::from_secs(8 * 3600);

/// Top-level configuration tree: one `MatcherConfig` shared by the matcher
/// and parser, plus zero or more backend configs (at least one must succeed
/// to construct for `Engine::new` to succeed).
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub matcher: MatcherConfig,
    pub tsdb: Option<TsdbConfig>,
    pub snmp: Option<SnmpConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsdb_config_rejects_missing_host() {
        let mut config = TsdbConfig::default();
        config.metric.host = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::MissingField("tsdb.host"))));
    }

    #[test]
    fn tsdb_config_accepts_defaults() {
        assert!(TsdbConfig::default().validate().is_ok());
    }

    #[test]
    fn snmp_config_rejects_empty_host_list() {
        let config = SnmpConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingField("snmp.hosts"))));
    }

    #[test]
    fn snmp_config_accepts_populated_host_list() {
        let config = SnmpConfig { hosts: vec!["10.0.0.1".to_string()], ..SnmpConfig::default() };
        assert!(config.validate().is_ok());
    }
}
