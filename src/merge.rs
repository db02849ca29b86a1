// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Multi-source merge (§4.F): fan out a `DataSource` call across every
//! registered backend in parallel, then combine the per-backend results by
//! node name, first-registered-backend wins.
//!
//! [`MultiSource`] itself implements [`DataSource`], so the rest of the core
//! (the matcher, the enrichment engine) never has to know whether it is
//! talking to one backend or several — the composite satisfies the same
//! capability set (§9 "Dynamic dispatch on backends").

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::warn;

use crate::datasource::{DataSource, HistoricMap, SampleMap};
use crate::error::ConfigError;
use crate::model::{Counter, Node, Optic, Rate, State};
use crate::stats;
use crate::timestamp::Timestamp;

/// Point queries (latest sample, node list) time out at 15s per backend.
const POINT_TIMEOUT: Duration = Duration::from_secs(15);
/// Historic queries (time-ranged) time out at 60s per backend — the keyword
/// arguments in the source stand in for "this is a historic call".
const HISTORIC_TIMEOUT: Duration = Duration::from_secs(60);
/// A backend that finishes this much later than the previous one to join is
/// logged as slow, mirroring the source's sequential `thread.join()` timing.
const SLOW_THRESHOLD: Duration = Duration::from_millis(100);

/// Runs `call` against every backend concurrently, bounded by `timeout`
/// each. Returns one slot per backend in registration order (`None` for a
/// timed-out, erroring, or panicked task) so the caller can merge by
/// priority order rather than completion order.
async fn fan_out<T, Fut, F>(
    backends: &[Arc<dyn DataSource>],
    timeout: Duration,
    method_name: &str,
    call: F,
) -> Vec<Option<T>>
where
    F: Fn(Arc<dyn DataSource>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = backends
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, backend)| {
            let fut = call(backend);
            tokio::spawn(async move { (index, tokio::time::timeout(timeout, fut).await) })
        })
        .collect();

    let mut results: Vec<Option<T>> = (0..backends.len()).map(|_| None).collect();
    let mut prev_join = Instant::now();
    for handle in handles {
        match handle.await {
            Ok((index, Ok(Ok(value)))) => {
                let now = Instant::now();
                if now.saturating_duration_since(prev_join) >= SLOW_THRESHOLD {
                    warn!("slow datasource {} for {method_name}", backends[index].name());
                    stats::MERGE_SLOW_DATASOURCE.inc();
                }
                prev_join = now;
                results[index] = Some(value);
            }
            Ok((index, Ok(Err(err)))) => {
                warn!("backend {} failed for {method_name}: {err}", backends[index].name());
            }
            Ok((index, Err(_elapsed))) => {
                warn!("backend {} timed out for {method_name}", backends[index].name());
                stats::BACKEND_TIMEOUTS.inc();
            }
            Err(join_err) => {
                warn!("backend task panicked during {method_name}: {join_err}");
            }
        }
    }
    results
}

/// First-writer-wins merge across per-backend node maps: the earliest
/// registered backend that produced a given node key keeps it, later
/// backends never overwrite (§4.F).
fn merge_first_writer_wins<V>(per_backend: Vec<Option<HashMap<String, V>>>) -> HashMap<String, V> {
    let mut merged = HashMap::new();
    for maybe in per_backend {
        if let Some(map) = maybe {
            for (key, value) in map {
                merged.entry(key).or_insert(value);
            }
        }
    }
    merged
}

/// An ordered sequence of backends, merged into a single logical
/// [`DataSource`]. Construction order is priority order.
pub struct MultiSource {
    backends: Vec<Arc<dyn DataSource>>,
}

impl MultiSource {
    /// Fails with [`ConfigError::NoDatasources`] when `backends` is empty —
    /// the case where every configured backend refused to initialize (§7
    /// "ConfigurationMissing ... requests fail with 'no datasources
    /// configured' when none did"). A backend that fails its own config
    /// validation simply never makes it into this list.
    pub fn new(backends: Vec<Arc<dyn DataSource>>) -> Result<Self, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::NoDatasources);
        }
        Ok(MultiSource { backends })
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

macro_rules! point_method {
    ($fn_name:ident, $sample:ty, $method_name:literal) => {
        async fn $fn_name(&self, nodes: &[String]) -> anyhow::Result<SampleMap<$sample>> {
            let nodes = nodes.to_vec();
            let results = fan_out(&self.backends, POINT_TIMEOUT, $method_name, move |backend| {
                let nodes = nodes.clone();
                async move { backend.$fn_name(&nodes).await }
            })
            .await;
            Ok(merge_first_writer_wins(results))
        }
    };
}

macro_rules! historic_method {
    ($fn_name:ident, $sample:ty, $method_name:literal) => {
        async fn $fn_name(
            &self,
            nodes: &[String],
            start: Timestamp,
            end: Timestamp,
            short_interval: bool,
        ) -> anyhow::Result<HistoricMap<$sample>> {
            let nodes = nodes.to_vec();
            let results = fan_out(&self.backends, HISTORIC_TIMEOUT, $method_name, move |backend| {
                let nodes = nodes.clone();
                async move { backend.$fn_name(&nodes, start, end, short_interval).await }
            })
            .await;
            Ok(merge_first_writer_wins(results))
        }
    };
}

#[async_trait]
impl DataSource for MultiSource {
    fn name(&self) -> &'static str {
        "merged"
    }

    async fn get_nodes(&self) -> anyhow::Result<HashMap<String, Node>> {
        let results = fan_out(&self.backends, POINT_TIMEOUT, "get_nodes", |backend| async move {
            backend.get_nodes().await
        })
        .await;
        Ok(merge_first_writer_wins(results))
    }

    point_method!(get_descriptions, String, "get_descriptions");
    point_method!(get_states, State, "get_states");
    point_method!(get_rates, Rate, "get_rates");
    point_method!(get_optics, Optic, "get_optics");
    point_method!(get_counters, Counter, "get_counters");

    historic_method!(get_historic_states, State, "get_historic_states");
    historic_method!(get_historic_rates, Rate, "get_historic_rates");
    historic_method!(get_historic_optics, Optic, "get_historic_optics");
    historic_method!(get_historic_counters, Counter, "get_historic_counters");
}
