// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Clone orchestrator.
//!
//! Drives `CLONE INSTANCE` against the local mysqld: admission through a
//! one-capacity non-blocking gate, recipient-emptiness check, the clone
//! statement itself over a socket connection (errno 3707 is the expected
//! "server is restarting" outcome), a bounded boot-wait loop, and a
//! post-clone re-initialization when the donor belongs to a foreign cluster.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Passwords;
use crate::conn::{connect_socket, quote_literal, AgentPool, SqlError};
use crate::init::{self, InitError, AGENT_USER};
use crate::metrics::Metrics;
use crate::status;

#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub donor_host: String,
    pub donor_port: u16,
    pub donor_user: String,
    pub donor_password: String,
    /// Credentials valid on the cloned dataset. Non-empty init_user marks
    /// the donor as external and triggers the post-clone re-init.
    pub init_user: String,
    pub init_password: String,
    pub boot_timeout: Duration,
}

impl CloneRequest {
    pub fn validate(&self) -> Result<(), CloneError> {
        if self.donor_host.is_empty() {
            return Err(CloneError::InvalidArgument("host must not be empty".into()));
        }
        if self.donor_port == 0 {
            return Err(CloneError::InvalidArgument("port must be positive".into()));
        }
        if self.donor_user.is_empty() {
            return Err(CloneError::InvalidArgument("user must not be empty".into()));
        }
        if self.donor_password.is_empty() {
            return Err(CloneError::InvalidArgument(
                "password must not be empty".into(),
            ));
        }
        if self.boot_timeout.is_zero() {
            return Err(CloneError::InvalidArgument(
                "boot_timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn is_external(&self) -> bool {
        !self.init_user.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CloneError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("another request is under processing")]
    TooManyRequests,
    #[error("recipient is not empty")]
    NotEmpty,
    #[error("mysqld did not come back within {0:?}")]
    BootTimeout(Duration),
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error(transparent)]
    Init(#[from] InitError),
}

/// Operations the orchestrator performs against the local instance. The
/// production implementation talks to mysqld; tests substitute a mock.
#[async_trait]
pub trait Recipient: Send + Sync {
    /// The executed GTID set reported by `SHOW MASTER STATUS`.
    async fn executed_gtid_set(&self) -> Result<String, SqlError>;
    async fn set_valid_donor_list(&self, donor: &str) -> Result<(), SqlError>;
    /// Issues `CLONE INSTANCE`; errno 3707 is surfaced verbatim and
    /// interpreted by the orchestrator.
    async fn clone_instance(&self, request: &CloneRequest) -> Result<(), SqlError>;
    /// Waits until mysqld accepts connections again, bounded by the
    /// request's boot timeout.
    async fn wait_boot(&self, request: &CloneRequest) -> Result<(), CloneError>;
    /// Post-clone re-initialization; a no-op for same-cluster donors.
    async fn reinit(&self, request: &CloneRequest) -> Result<(), CloneError>;
}

/// Token-gated single-slot executor for clone requests.
pub struct Cloner<R> {
    recipient: R,
    gate: Semaphore,
    metrics: Metrics,
    restart_grace: Duration,
}

impl<R: Recipient> Cloner<R> {
    pub fn new(recipient: R, metrics: Metrics, restart_grace: Duration) -> Self {
        Cloner {
            recipient,
            gate: Semaphore::new(1),
            metrics,
            restart_grace,
        }
    }

    /// Copies the dataset from the donor named in `request`. Strictly
    /// single-flight: a second concurrent call fails with
    /// [`CloneError::TooManyRequests`] without touching MySQL.
    pub async fn execute(&self, request: CloneRequest) -> Result<(), CloneError> {
        request.validate()?;
        let _permit = self
            .gate
            .try_acquire()
            .map_err(|_| CloneError::TooManyRequests)?;

        let executed = self.recipient.executed_gtid_set().await?;
        if !executed.is_empty() {
            return Err(CloneError::NotEmpty);
        }

        self.metrics.clone_count.inc();
        self.metrics.clone_in_progress.set(1);
        let started = Instant::now();
        let result = self.run(&request).await;
        self.metrics.clone_in_progress.set(0);
        self.metrics
            .clone_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            self.metrics.clone_failure_count.inc();
            warn!("clone from {}:{} failed: {}", request.donor_host, request.donor_port, e);
        } else {
            info!(
                "cloned from {}:{} in {:?}",
                request.donor_host,
                request.donor_port,
                started.elapsed()
            );
        }
        result
    }

    async fn run(&self, request: &CloneRequest) -> Result<(), CloneError> {
        let donor = format!("{}:{}", request.donor_host, request.donor_port);
        self.recipient.set_valid_donor_list(&donor).await?;

        match self.recipient.clone_instance(request).await {
            Ok(()) => {}
            // mysqld is restarting to take over the cloned dataset.
            Err(e) if e.is_restart_expected() => {}
            Err(e) => return Err(e.into()),
        }

        // Give mysqld a moment to begin its restart before probing.
        tokio::time::sleep(self.restart_grace).await;
        self.recipient.wait_boot(request).await?;
        self.recipient.reinit(request).await?;
        Ok(())
    }
}

/// The production [`Recipient`], backed by the local mysqld.
pub struct MysqlRecipient {
    pool: AgentPool,
    socket: PathBuf,
    passwords: Passwords,
}

impl MysqlRecipient {
    pub fn new(pool: AgentPool, socket: PathBuf, passwords: Passwords) -> Self {
        MysqlRecipient {
            pool,
            socket,
            passwords,
        }
    }

    fn boot_credentials<'a>(&'a self, request: &'a CloneRequest) -> (&'a str, &'a str) {
        if request.is_external() {
            (&request.init_user, &request.init_password)
        } else {
            (AGENT_USER, &self.passwords.agent)
        }
    }
}

#[async_trait]
impl Recipient for MysqlRecipient {
    async fn executed_gtid_set(&self) -> Result<String, SqlError> {
        let mut conn = self.pool.get().await?;
        let primary = self
            .pool
            .timed("primary status", status::primary_status(&mut conn))
            .await?;
        Ok(primary.executed_gtid_set)
    }

    async fn set_valid_donor_list(&self, donor: &str) -> Result<(), SqlError> {
        // SET GLOBAL cannot be prepared; interpolate client-side.
        let sql = format!(
            "SET GLOBAL clone_valid_donor_list = {}",
            quote_literal(donor)
        );
        let mut conn = self.pool.get().await?;
        conn.query_drop(&sql)
            .await
            .map_err(|e| SqlError::stmt(&sql, e))
    }

    async fn clone_instance(&self, request: &CloneRequest) -> Result<(), SqlError> {
        // The clone runs on a socket connection without I/O deadlines: the
        // statement restarts the TCP listener, and a read timeout would kill
        // a long-running clone.
        let mut conn = connect_socket(&self.socket, AGENT_USER, &self.passwords.agent).await?;
        let sql = format!(
            "CLONE INSTANCE FROM {}@{}:{} IDENTIFIED BY {}",
            quote_literal(&request.donor_user),
            quote_literal(&request.donor_host),
            request.donor_port,
            quote_literal(&request.donor_password)
        );
        conn.query_drop(&sql)
            .await
            .map_err(|e| SqlError::stmt("CLONE INSTANCE", e))
    }

    async fn wait_boot(&self, request: &CloneRequest) -> Result<(), CloneError> {
        let (user, password) = self.boot_credentials(request);
        let deadline = Instant::now() + request.boot_timeout;
        loop {
            match connect_socket(&self.socket, user, password).await {
                Ok(conn) => {
                    drop(conn);
                    return Ok(());
                }
                Err(e) if e.is_access_denied() => return Err(e.into()),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(CloneError::BootTimeout(request.boot_timeout));
                    }
                    warn!("mysqld not up yet, retrying: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn reinit(&self, request: &CloneRequest) -> Result<(), CloneError> {
        if !request.is_external() {
            return Ok(());
        }
        let mut conn =
            connect_socket(&self.socket, &request.init_user, &request.init_password).await?;
        init::reinit_external(&mut conn, &self.passwords).await?;
        conn.disconnect()
            .await
            .map_err(|e| SqlError::stmt("QUIT", e))?;
        Ok(())
    }
}
