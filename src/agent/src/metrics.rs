// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Agent metrics, registered once into a shared registry that is passed by
//! reference into constructors, never held as a hidden global.
//!
//! `replication_delay_seconds` is special: it is only registered while the
//! instance is a functioning replica, and unregistered when the instance
//! acts as primary.

use std::collections::HashMap;

use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub clone_count: IntCounter,
    pub clone_failure_count: IntCounter,
    pub clone_in_progress: IntGauge,
    pub clone_duration_seconds: Histogram,
    pub log_rotation_count: IntCounter,
    pub log_rotation_failure_count: IntCounter,
    pub log_rotation_duration_seconds: Histogram,
    replication_delay: Gauge,
}

impl Metrics {
    /// Builds the agent's metric set, pre-labeled with the cluster name, and
    /// registers everything except the replication-delay gauge.
    pub fn register_into(
        registry: &Registry,
        cluster_name: &str,
        instance_name: &str,
        instance_index: u32,
    ) -> Result<Metrics, prometheus::Error> {
        let cluster: HashMap<String, String> =
            [("cluster_name".to_string(), cluster_name.to_string())]
                .into_iter()
                .collect();

        let clone_count = IntCounter::with_opts(
            Opts::new("clone_count", "Total number of clone operations started.")
                .const_labels(cluster.clone()),
        )?;
        let clone_failure_count = IntCounter::with_opts(
            Opts::new(
                "clone_failure_count",
                "Total number of failed clone operations.",
            )
            .const_labels(cluster.clone()),
        )?;
        let clone_in_progress = IntGauge::with_opts(
            Opts::new(
                "clone_in_progress",
                "Whether a clone operation is in progress (0 or 1).",
            )
            .const_labels(cluster.clone()),
        )?;
        let clone_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "clone_duration_seconds",
                "Wall-clock seconds spent on clone operations.",
            )
            .const_labels(cluster.clone()),
        )?;
        let log_rotation_count = IntCounter::with_opts(
            Opts::new(
                "log_rotation_count",
                "Total number of log rotation attempts.",
            )
            .const_labels(cluster.clone()),
        )?;
        let log_rotation_failure_count = IntCounter::with_opts(
            Opts::new(
                "log_rotation_failure_count",
                "Total number of failed log rotations.",
            )
            .const_labels(cluster.clone()),
        )?;
        let log_rotation_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "log_rotation_duration_seconds",
                "Wall-clock seconds spent rotating logs.",
            )
            .const_labels(cluster.clone()),
        )?;

        let mut delay_labels = cluster.clone();
        delay_labels.insert("name".to_string(), instance_name.to_string());
        delay_labels.insert("index".to_string(), instance_index.to_string());
        let replication_delay = Gauge::with_opts(
            Opts::new(
                "replication_delay_seconds",
                "Applied-transaction delay behind the primary.",
            )
            .const_labels(delay_labels),
        )?;

        for collector in [
            Box::new(clone_count.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(clone_failure_count.clone()),
            Box::new(clone_in_progress.clone()),
            Box::new(clone_duration_seconds.clone()),
            Box::new(log_rotation_count.clone()),
            Box::new(log_rotation_failure_count.clone()),
            Box::new(log_rotation_duration_seconds.clone()),
        ] {
            registry.register(collector)?;
        }

        Ok(Metrics {
            registry: registry.clone(),
            clone_count,
            clone_failure_count,
            clone_in_progress,
            clone_duration_seconds,
            log_rotation_count,
            log_rotation_failure_count,
            log_rotation_duration_seconds,
            replication_delay,
        })
    }

    /// Registers the replication-delay gauge; re-registering is a no-op.
    pub fn register_replication_delay(&self) {
        match self
            .registry
            .register(Box::new(self.replication_delay.clone()))
        {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => warn!("failed to register replication delay gauge: {}", e),
        }
    }

    /// Drops the replication-delay gauge from the exposition; unregistering
    /// an unregistered gauge is a no-op.
    pub fn unregister_replication_delay(&self) {
        let _ = self
            .registry
            .unregister(Box::new(self.replication_delay.clone()));
    }

    pub fn set_replication_delay(&self, seconds: f64) {
        self.replication_delay.set(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> (Registry, Metrics) {
        let registry = Registry::new();
        let metrics = Metrics::register_into(&registry, "test", "test", 0).unwrap();
        (registry, metrics)
    }

    fn family_names(registry: &Registry) -> Vec<String> {
        registry
            .gather()
            .into_iter()
            .map(|f| f.get_name().to_string())
            .collect()
    }

    #[test]
    fn registers_static_families() {
        let (registry, metrics) = metrics();
        metrics.clone_count.inc();
        metrics.log_rotation_count.inc();
        let names = family_names(&registry);
        for name in [
            "clone_count",
            "clone_failure_count",
            "clone_in_progress",
            "clone_duration_seconds",
            "log_rotation_count",
            "log_rotation_failure_count",
            "log_rotation_duration_seconds",
        ] {
            assert!(names.contains(&name.to_string()), "missing {}", name);
        }
        assert!(!names.contains(&"replication_delay_seconds".to_string()));
    }

    #[test]
    fn replication_delay_registration_is_idempotent() {
        let (registry, metrics) = metrics();
        metrics.register_replication_delay();
        metrics.register_replication_delay();
        metrics.set_replication_delay(1.5);
        assert!(family_names(&registry).contains(&"replication_delay_seconds".to_string()));

        metrics.unregister_replication_delay();
        metrics.unregister_replication_delay();
        assert!(!family_names(&registry).contains(&"replication_delay_seconds".to_string()));
    }

    #[test]
    fn cluster_label_is_constant() {
        let (registry, metrics) = metrics();
        metrics.clone_count.inc();
        let families = registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "clone_count")
            .unwrap();
        let labels = family.get_metric()[0].get_label();
        assert!(labels
            .iter()
            .any(|l| l.get_name() == "cluster_name" && l.get_value() == "test"));
    }
}
