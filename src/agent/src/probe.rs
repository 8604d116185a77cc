// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Probe evaluator.
//!
//! Derives liveness and readiness verdicts from fresh MySQL observations.
//! The readiness cascade distinguishes a working primary, a healthy replica,
//! a lagging replica, and an instance still being cloned; every verdict is
//! computed from scratch on each call.

use std::time::Duration;

use tokio::time::Instant;

use crate::conn::SqlError;
use crate::metrics::Metrics;
use crate::status::{CloneState, StatusSource};

/// A readiness verdict; the reason is returned in the probe body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
}

pub struct Prober<S> {
    source: S,
    metrics: Metrics,
    /// Agent process start, the origin of the transaction-queueing wait.
    started_at: Instant,
    /// Warm-up window during which readiness stays negative so downstream
    /// routers can drain in-flight writes to the previous primary.
    queueing_wait: Duration,
    max_delay: Option<Duration>,
}

impl<S: StatusSource> Prober<S> {
    pub fn new(
        source: S,
        metrics: Metrics,
        started_at: Instant,
        queueing_wait: Duration,
        max_delay: Option<Duration>,
    ) -> Self {
        Prober {
            source,
            metrics,
            started_at,
            queueing_wait,
            max_delay,
        }
    }

    /// Liveness: mysqld answers `SELECT VERSION()`.
    pub async fn liveness(&self) -> Result<(), SqlError> {
        self.source.version().await.map(drop)
    }

    /// The readiness decision cascade.
    pub async fn readiness(&self) -> Result<Readiness, SqlError> {
        if self.started_at.elapsed() < self.queueing_wait {
            return Ok(Readiness::NotReady(
                "the instance is waiting for transaction queueing".into(),
            ));
        }

        if let Some(state) = self.source.clone_state().await? {
            if state != CloneState::Completed {
                return Ok(Readiness::NotReady("the instance is under cloning".into()));
            }
        }

        let vars = self.source.global_variables().await?;
        if !vars.read_only {
            // Acting as primary; the delay gauge has no meaning here.
            self.metrics.unregister_replication_delay();
            return Ok(Readiness::Ready);
        }

        let Some(replica) = self.source.replica_status().await? else {
            // Declares itself a replica but has no replication channel
            // configured yet; the operator is still reconciling.
            return Ok(Readiness::NotReady(
                "replication is not configured yet".into(),
            ));
        };
        if !replica.threads_running() {
            return Ok(Readiness::NotReady(
                "replication threads are stopped".into(),
            ));
        }
        if replica.has_thread_error() {
            return Ok(Readiness::NotReady(format!(
                "replication threads report an error: io={} ({}), sql={} ({})",
                replica.last_io_errno,
                replica.last_io_error,
                replica.last_sql_errno,
                replica.last_sql_error
            )));
        }

        let Some(threshold) = self.max_delay else {
            return Ok(Readiness::Ready);
        };
        let delay = match self.source.applied_transaction_timestamps().await? {
            Some(timestamps) => timestamps.delay(),
            // Nothing applied yet; nothing to lag behind.
            None => Duration::ZERO,
        };
        self.metrics.register_replication_delay();
        self.metrics.set_replication_delay(delay.as_secs_f64());
        if delay >= threshold {
            return Ok(Readiness::NotReady(format!(
                "the instance delays from the primary: threshold={:?}, delayed={:?}",
                threshold, delay
            )));
        }
        Ok(Readiness::Ready)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use prometheus::Registry;

    use super::*;
    use crate::status::{
        AppliedTransactionTimestamps, GlobalVariables, ReplicaStatus,
    };

    #[derive(Clone, Default)]
    struct MockSource {
        version_fails: bool,
        clone_state: Option<CloneState>,
        read_only: bool,
        replica: Option<ReplicaStatus>,
        timestamps: Option<AppliedTransactionTimestamps>,
    }

    #[async_trait]
    impl StatusSource for MockSource {
        async fn version(&self) -> Result<String, SqlError> {
            if self.version_fails {
                Err(SqlError::EmptyResult {
                    sql: "SELECT VERSION()".into(),
                })
            } else {
                Ok("8.0.39".into())
            }
        }

        async fn global_variables(&self) -> Result<GlobalVariables, SqlError> {
            Ok(GlobalVariables {
                read_only: self.read_only,
                super_read_only: self.read_only,
            })
        }

        async fn replica_status(&self) -> Result<Option<ReplicaStatus>, SqlError> {
            Ok(self.replica.clone())
        }

        async fn clone_state(&self) -> Result<Option<CloneState>, SqlError> {
            Ok(self.clone_state.clone())
        }

        async fn applied_transaction_timestamps(
            &self,
        ) -> Result<Option<AppliedTransactionTimestamps>, SqlError> {
            Ok(self.timestamps)
        }
    }

    fn healthy_replica() -> ReplicaStatus {
        ReplicaStatus {
            source_host: "primary".into(),
            io_running: "Yes".into(),
            sql_running: "Yes".into(),
            ..Default::default()
        }
    }

    fn registry_and_metrics() -> (Registry, Metrics) {
        let registry = Registry::new();
        let metrics = Metrics::register_into(&registry, "test", "test", 0).unwrap();
        (registry, metrics)
    }

    fn warm_prober(source: MockSource, metrics: Metrics, max_delay: Option<Duration>) -> Prober<MockSource> {
        // A start instant in the past so the queueing wait has elapsed.
        let started_at = Instant::now() - Duration::from_secs(120);
        Prober::new(source, metrics, started_at, Duration::from_secs(30), max_delay)
    }

    async fn verdict(source: MockSource, max_delay: Option<Duration>) -> Readiness {
        let (_registry, metrics) = registry_and_metrics();
        warm_prober(source, metrics, max_delay)
            .readiness()
            .await
            .unwrap()
    }

    fn delayed(seconds: f64) -> Option<AppliedTransactionTimestamps> {
        Some(AppliedTransactionTimestamps {
            original_commit: 1_000.0,
            end_apply: 1_000.0 + seconds,
        })
    }

    #[tokio::test]
    async fn liveness_follows_mysqld() {
        let (_registry, metrics) = registry_and_metrics();
        let prober = warm_prober(MockSource::default(), metrics.clone(), None);
        assert!(prober.liveness().await.is_ok());

        let failing = warm_prober(
            MockSource {
                version_fails: true,
                ..Default::default()
            },
            metrics,
            None,
        );
        assert!(failing.liveness().await.is_err());
    }

    #[tokio::test]
    async fn queueing_wait_holds_readiness_down() {
        let (_registry, metrics) = registry_and_metrics();
        let prober = Prober::new(
            MockSource::default(), // would be ready: primary
            metrics,
            Instant::now(),
            Duration::from_secs(60),
            None,
        );
        match prober.readiness().await.unwrap() {
            Readiness::NotReady(reason) => assert!(reason.contains("transaction queueing")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cloning_blocks_readiness() {
        for state in [
            CloneState::InProgress("In Progress".into()),
            CloneState::Failed,
        ] {
            let source = MockSource {
                clone_state: Some(state),
                ..Default::default()
            };
            match verdict(source, None).await {
                Readiness::NotReady(reason) => assert!(reason.contains("under cloning")),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn completed_clone_does_not_block() {
        let source = MockSource {
            clone_state: Some(CloneState::Completed),
            read_only: false,
            ..Default::default()
        };
        assert_eq!(verdict(source, None).await, Readiness::Ready);
    }

    #[tokio::test]
    async fn primary_is_ready_and_unregisters_delay_gauge() {
        let (registry, metrics) = registry_and_metrics();
        metrics.register_replication_delay();

        let prober = warm_prober(MockSource::default(), metrics, Some(Duration::from_secs(60)));
        assert_eq!(prober.readiness().await.unwrap(), Readiness::Ready);
        let names: Vec<_> = registry
            .gather()
            .into_iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(!names.contains(&"replication_delay_seconds".to_string()));
    }

    #[tokio::test]
    async fn replica_without_channel_is_not_ready() {
        let source = MockSource {
            read_only: true,
            replica: None,
            ..Default::default()
        };
        match verdict(source, None).await {
            Readiness::NotReady(reason) => assert!(reason.contains("not configured")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stopped_replication_threads_are_not_ready() {
        for (io, sql) in [("No", "Yes"), ("Yes", "No"), ("Connecting", "Yes")] {
            let mut replica = healthy_replica();
            replica.io_running = io.into();
            replica.sql_running = sql.into();
            let source = MockSource {
                read_only: true,
                replica: Some(replica),
                ..Default::default()
            };
            match verdict(source, None).await {
                Readiness::NotReady(reason) => {
                    assert!(reason.contains("threads are stopped"))
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn replication_errors_are_not_ready() {
        let mut replica = healthy_replica();
        replica.last_sql_errno = 1032;
        replica.last_sql_error = "HA_ERR_KEY_NOT_FOUND".into();
        let source = MockSource {
            read_only: true,
            replica: Some(replica),
            ..Default::default()
        };
        match verdict(source, None).await {
            Readiness::NotReady(reason) => assert!(reason.contains("1032")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn healthy_replica_without_threshold_is_ready() {
        let source = MockSource {
            read_only: true,
            replica: Some(healthy_replica()),
            timestamps: delayed(3600.0),
            ..Default::default()
        };
        // No threshold configured: delay is not even consulted.
        assert_eq!(verdict(source, None).await, Readiness::Ready);
    }

    #[tokio::test]
    async fn delay_threshold_gates_readiness() {
        let threshold = Some(Duration::from_secs(60));

        let lagging = MockSource {
            read_only: true,
            replica: Some(healthy_replica()),
            timestamps: delayed(120.0),
            ..Default::default()
        };
        match verdict(lagging, threshold).await {
            Readiness::NotReady(reason) => assert!(reason.contains("delays from the primary")),
            other => panic!("unexpected: {:?}", other),
        }

        let caught_up = MockSource {
            read_only: true,
            replica: Some(healthy_replica()),
            timestamps: delayed(1.0),
            ..Default::default()
        };
        assert_eq!(verdict(caught_up, threshold).await, Readiness::Ready);

        // No applied transaction yet counts as zero delay.
        let fresh = MockSource {
            read_only: true,
            replica: Some(healthy_replica()),
            timestamps: None,
            ..Default::default()
        };
        assert_eq!(verdict(fresh, threshold).await, Readiness::Ready);
    }

    #[tokio::test]
    async fn delay_gauge_is_published_for_replicas() {
        let (registry, metrics) = registry_and_metrics();
        let source = MockSource {
            read_only: true,
            replica: Some(healthy_replica()),
            timestamps: delayed(2.5),
            ..Default::default()
        };
        let prober = warm_prober(source, metrics, Some(Duration::from_secs(60)));
        prober.readiness().await.unwrap();

        let families = registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "replication_delay_seconds")
            .expect("gauge registered");
        let value = family.get_metric()[0].get_gauge().get_value();
        assert!((value - 2.5).abs() < 1e-9, "value = {}", value);
    }
}
