// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Log rotator.
//!
//! On a cron schedule, renames the MySQL error and slow-query logs and tells
//! mysqld to reopen them. Rename is atomic on the same filesystem, and
//! `FLUSH ... LOGS` reopens by path. The `LOCAL` keyword keeps the flush off
//! the binary log; replicating it would fight rotation on replicas.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use mysql_async::prelude::Queryable;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::conn::{AgentPool, SqlError};
use crate::metrics::Metrics;

pub const ERROR_LOG: &str = "mysql.err";
pub const SLOW_LOG: &str = "mysql.slow";

/// Rotation failures are counted and logged, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum RotateError {
    #[error("error renaming {path}: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Sql(#[from] SqlError),
}

/// The SQL half of a rotation, behind a seam so rename handling is testable
/// without mysqld.
#[async_trait]
pub trait LogFlusher: Send + Sync {
    async fn flush_local_logs(&self) -> Result<(), SqlError>;
}

#[async_trait]
impl LogFlusher for AgentPool {
    async fn flush_local_logs(&self) -> Result<(), SqlError> {
        const SQL: &str = "FLUSH LOCAL ERROR LOGS, SLOW LOGS";
        let mut conn = self.get().await?;
        self.timed(SQL, async {
            conn.query_drop(SQL)
                .await
                .map_err(|e| SqlError::stmt(SQL, e))
        })
        .await
    }
}

pub struct LogRotator<F> {
    log_dir: PathBuf,
    flusher: F,
    metrics: Metrics,
}

impl<F: LogFlusher> LogRotator<F> {
    pub fn new(log_dir: PathBuf, flusher: F, metrics: Metrics) -> Self {
        LogRotator {
            log_dir,
            flusher,
            metrics,
        }
    }

    /// One rotation pass. Failures are absorbed into the failure counter.
    pub async fn rotate(&self) {
        self.metrics.log_rotation_count.inc();
        let started = Instant::now();
        if let Err(e) = self.try_rotate().await {
            self.metrics.log_rotation_failure_count.inc();
            error!("log rotation failed: {}", e);
            return;
        }
        self.metrics
            .log_rotation_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        debug!("rotated mysqld logs in {:?}", started.elapsed());
    }

    async fn try_rotate(&self) -> Result<(), RotateError> {
        rotate_file(&self.log_dir.join(ERROR_LOG))?;
        rotate_file(&self.log_dir.join(SLOW_LOG))?;
        self.flusher.flush_local_logs().await?;
        Ok(())
    }
}

/// Renames `<path>` to `<path>.0`, overwriting any previous rotation. A
/// missing source is not an error; mysqld may simply not have written that
/// log yet.
fn rotate_file(path: &Path) -> Result<(), RotateError> {
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".0");
    match std::fs::rename(path, PathBuf::from(rotated)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RotateError::Rename {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Parses a rotation schedule. Standard five-field crontab expressions are
/// accepted by prepending a seconds field of zero.
pub fn parse_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized)
}

/// Runs rotations on the schedule until `shutdown` fires. The caller joins
/// the handle with a bounded grace period so an in-flight rotation can
/// finish.
pub fn spawn<F: LogFlusher + 'static>(
    rotator: LogRotator<F>,
    schedule: Schedule,
    mut shutdown: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => rotator.rotate().await,
                _ = shutdown.changed() => break,
            }
        }
    })
}
