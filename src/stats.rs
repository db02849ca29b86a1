// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};

use crate::error::VerificationError;

macro_rules! metrics {
    ($($name:ident : $type:ty = $make:expr);* $(;)?) => {
        $(
          lazy_static! {
            pub static ref $name: $type = $make.unwrap();
          }
        )*

        pub fn register_metrics(registry: &Registry) -> anyhow::Result<()> {
          $(registry.register(Box::new($name.clone()))?;)*
          Ok(())
        }
    };
}

metrics! {
    CACHE_HITS: IntCounter =
        IntCounter::new("weathermap_cache_hits", "Number of cache lookups served without a refresh");

    CACHE_MISSES: IntCounter =
        IntCounter::new("weathermap_cache_misses", "Number of cache lookups that triggered a producer call");

    CACHE_SINGLE_FLIGHT_WAITS: IntCounter = IntCounter::new(
        "weathermap_cache_single_flight_waits",
        "Number of callers that waited on an in-flight refresh instead of driving one"
    );

    CACHE_STALE_RETURNS: IntCounter = IntCounter::new(
        "weathermap_cache_stale_returns",
        "Number of callers that gave up waiting and received stale data"
    );

    BACKEND_TIMEOUTS: IntCounter = IntCounter::new(
        "weathermap_backend_timeouts",
        "Number of per-backend calls that exceeded their merge deadline"
    );

    MERGE_SLOW_DATASOURCE: IntCounter = IntCounter::new(
        "weathermap_merge_slow_datasource",
        "Number of backend calls that finished more than 100ms after the previous one"
    );

    VERIFICATION_ERRORS_UNPARSABLE: IntCounter = IntCounter::new(
        "weathermap_verification_errors_unparsable",
        "Number of distinct unparsable-description verification errors"
    );

    VERIFICATION_ERRORS_LOOP: IntCounter = IntCounter::new(
        "weathermap_verification_errors_loop",
        "Number of distinct self-loop verification errors"
    );

    VERIFICATION_ERRORS_MISMATCH_INTERFACE: IntCounter = IntCounter::new(
        "weathermap_verification_errors_mismatch_interface",
        "Number of distinct interface-mismatch verification errors"
    );

    VERIFICATION_ERRORS_MISMATCH_NODE: IntCounter = IntCounter::new(
        "weathermap_verification_errors_mismatch_node",
        "Number of distinct node-mismatch verification errors"
    );

    LINKS_EMITTED: IntCounter =
        IntCounter::new("weathermap_links_emitted", "Number of verified links emitted by the matcher");

    SNMP_HOSTS_REACHABLE: IntGauge =
        IntGauge::new("weathermap_snmp_hosts_reachable", "Number of SNMP hosts currently reachable");

    SNMP_HOSTS_RETRY_QUEUE: IntGauge =
        IntGauge::new("weathermap_snmp_hosts_retry_queue", "Number of SNMP hosts awaiting a setup retry");
}

/// Bumps the counter matching `err`'s class (§4.H, §9 Globals). Called only
/// the first time a given message is inserted into the deduplicated
/// verification-error set, so counts track distinct failures, not retries.
pub fn record_verification_error(err: &VerificationError) {
    match err {
        VerificationError::Unparsable(_) => VERIFICATION_ERRORS_UNPARSABLE.inc(),
        VerificationError::Loop(_) => VERIFICATION_ERRORS_LOOP.inc(),
        VerificationError::MismatchInterface(_) => VERIFICATION_ERRORS_MISMATCH_INTERFACE.inc(),
        VerificationError::MismatchNode(_) => VERIFICATION_ERRORS_MISMATCH_NODE.inc(),
    }
}
