// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Status inspector.
//!
//! One pure function per observation; each runs a single statement and scans
//! the first row. Absence of a row is signaled distinctly from an error:
//! a missing replica status means "no replication configured", which is
//! normal for a primary. None of these records is ever cached.

use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Row};

use crate::conn::{AgentPool, SqlError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalVariables {
    pub read_only: bool,
    pub super_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryStatus {
    pub file: String,
    pub position: u64,
    pub executed_gtid_set: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub source_host: String,
    pub io_running: String,
    pub sql_running: String,
    pub last_io_errno: u32,
    pub last_io_error: String,
    pub last_sql_errno: u32,
    pub last_sql_error: String,
    pub retrieved_gtid_set: String,
    pub executed_gtid_set: String,
    pub seconds_behind_source: Option<u64>,
}

impl ReplicaStatus {
    pub fn threads_running(&self) -> bool {
        self.io_running == "Yes" && self.sql_running == "Yes"
    }

    pub fn has_thread_error(&self) -> bool {
        self.last_io_errno != 0 || self.last_sql_errno != 0
    }
}

/// The state column of `performance_schema.clone_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneState {
    InProgress(String),
    Completed,
    Failed,
}

impl CloneState {
    fn from_raw(raw: String) -> Self {
        match raw.as_str() {
            "Completed" => CloneState::Completed,
            "Failed" => CloneState::Failed,
            _ => CloneState::InProgress(raw),
        }
    }
}

/// Original-commit and end-apply timestamps of the last applied transaction,
/// as epoch seconds with microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedTransactionTimestamps {
    pub original_commit: f64,
    pub end_apply: f64,
}

impl AppliedTransactionTimestamps {
    /// The replica-lag signal: end-apply minus original-commit.
    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64((self.end_apply - self.original_commit).max(0.0))
    }
}

pub async fn global_variables(conn: &mut Conn) -> Result<GlobalVariables, SqlError> {
    const SQL: &str = "SELECT @@read_only, @@super_read_only";
    let row: Option<(bool, bool)> = conn
        .query_first(SQL)
        .await
        .map_err(|e| SqlError::stmt(SQL, e))?;
    let (read_only, super_read_only) = row.ok_or_else(|| SqlError::EmptyResult {
        sql: SQL.to_string(),
    })?;
    Ok(GlobalVariables {
        read_only,
        super_read_only,
    })
}

pub async fn primary_status(conn: &mut Conn) -> Result<PrimaryStatus, SqlError> {
    const SQL: &str = "SHOW MASTER STATUS";
    let row: Option<Row> = conn
        .query_first(SQL)
        .await
        .map_err(|e| SqlError::stmt(SQL, e))?;
    let mut row = row.ok_or_else(|| SqlError::EmptyResult {
        sql: SQL.to_string(),
    })?;
    Ok(PrimaryStatus {
        file: take_string(&mut row, "File"),
        position: row.take::<Option<u64>, _>("Position").flatten().unwrap_or(0),
        executed_gtid_set: take_string(&mut row, "Executed_Gtid_Set"),
    })
}

/// `SHOW REPLICA STATUS`, falling back to the pre-8.0.22 statement and
/// column spellings. `None` means no replication channel is configured.
pub async fn replica_status(conn: &mut Conn) -> Result<Option<ReplicaStatus>, SqlError> {
    const SQL: &str = "SHOW REPLICA STATUS";
    const OLD_SQL: &str = "SHOW SLAVE STATUS";
    let row: Option<Row> = match conn.query_first(SQL).await {
        Ok(row) => row,
        Err(mysql_async::Error::Server(_)) => conn
            .query_first(OLD_SQL)
            .await
            .map_err(|e| SqlError::stmt(OLD_SQL, e))?,
        Err(e) => return Err(SqlError::stmt(SQL, e)),
    };
    let Some(mut row) = row else {
        return Ok(None);
    };
    Ok(Some(ReplicaStatus {
        source_host: take_either_string(&mut row, "Source_Host", "Master_Host"),
        io_running: take_either_string(&mut row, "Replica_IO_Running", "Slave_IO_Running"),
        sql_running: take_either_string(&mut row, "Replica_SQL_Running", "Slave_SQL_Running"),
        last_io_errno: row
            .take::<Option<u32>, _>("Last_IO_Errno")
            .flatten()
            .unwrap_or(0),
        last_io_error: take_string(&mut row, "Last_IO_Error"),
        last_sql_errno: row
            .take::<Option<u32>, _>("Last_SQL_Errno")
            .flatten()
            .unwrap_or(0),
        last_sql_error: take_string(&mut row, "Last_SQL_Error"),
        retrieved_gtid_set: take_string(&mut row, "Retrieved_Gtid_Set"),
        executed_gtid_set: take_string(&mut row, "Executed_Gtid_Set"),
        seconds_behind_source: take_either(
            &mut row,
            "Seconds_Behind_Source",
            "Seconds_Behind_Master",
        ),
    }))
}

/// `None` means no clone has ever run on this instance.
pub async fn clone_state(conn: &mut Conn) -> Result<Option<CloneState>, SqlError> {
    const SQL: &str = "SELECT state FROM performance_schema.clone_status";
    let state: Option<Option<String>> = conn
        .query_first(SQL)
        .await
        .map_err(|e| SqlError::stmt(SQL, e))?;
    Ok(state.flatten().map(CloneState::from_raw))
}

/// Timestamps of the last applied transaction, latest worker first. `None`
/// when no transaction has been applied yet.
pub async fn applied_transaction_timestamps(
    conn: &mut Conn,
) -> Result<Option<AppliedTransactionTimestamps>, SqlError> {
    const SQL: &str = "SELECT \
         UNIX_TIMESTAMP(LAST_APPLIED_TRANSACTION_ORIGINAL_COMMIT_TIMESTAMP), \
         UNIX_TIMESTAMP(LAST_APPLIED_TRANSACTION_END_APPLY_TIMESTAMP) \
         FROM performance_schema.replication_applier_status_by_worker \
         ORDER BY LAST_APPLIED_TRANSACTION_END_APPLY_TIMESTAMP DESC LIMIT 1";
    let row: Option<(Option<f64>, Option<f64>)> = conn
        .query_first(SQL)
        .await
        .map_err(|e| SqlError::stmt(SQL, e))?;
    Ok(match row {
        // A zero timestamp is the "never applied anything" sentinel.
        Some((Some(original_commit), Some(end_apply)))
            if original_commit > 0.0 && end_apply > 0.0 =>
        {
            Some(AppliedTransactionTimestamps {
                original_commit,
                end_apply,
            })
        }
        _ => None,
    })
}

pub async fn version(conn: &mut Conn) -> Result<String, SqlError> {
    const SQL: &str = "SELECT VERSION()";
    let version: Option<String> = conn
        .query_first(SQL)
        .await
        .map_err(|e| SqlError::stmt(SQL, e))?;
    version.ok_or_else(|| SqlError::EmptyResult {
        sql: SQL.to_string(),
    })
}

fn take_string(row: &mut Row, column: &str) -> String {
    row.take::<Option<String>, _>(column)
        .flatten()
        .unwrap_or_default()
}

fn take_either_string(row: &mut Row, new_column: &str, old_column: &str) -> String {
    match row.take::<Option<String>, _>(new_column) {
        Some(value) => value.unwrap_or_default(),
        None => take_string(row, old_column),
    }
}

fn take_either<T>(row: &mut Row, new_column: &str, old_column: &str) -> Option<T>
where
    T: mysql_async::prelude::FromValue,
{
    match row.take::<Option<T>, _>(new_column) {
        Some(value) => value,
        None => row.take::<Option<T>, _>(old_column).flatten(),
    }
}

/// Observation seam between the probe evaluator and the SQL layer.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn version(&self) -> Result<String, SqlError>;
    async fn global_variables(&self) -> Result<GlobalVariables, SqlError>;
    async fn replica_status(&self) -> Result<Option<ReplicaStatus>, SqlError>;
    async fn clone_state(&self) -> Result<Option<CloneState>, SqlError>;
    async fn applied_transaction_timestamps(
        &self,
    ) -> Result<Option<AppliedTransactionTimestamps>, SqlError>;
}

#[async_trait]
impl StatusSource for AgentPool {
    async fn version(&self) -> Result<String, SqlError> {
        let mut conn = self.get().await?;
        self.timed("SELECT VERSION()", version(&mut conn)).await
    }

    async fn global_variables(&self) -> Result<GlobalVariables, SqlError> {
        let mut conn = self.get().await?;
        self.timed("global variables", global_variables(&mut conn))
            .await
    }

    async fn replica_status(&self) -> Result<Option<ReplicaStatus>, SqlError> {
        let mut conn = self.get().await?;
        self.timed("replica status", replica_status(&mut conn)).await
    }

    async fn clone_state(&self) -> Result<Option<CloneState>, SqlError> {
        let mut conn = self.get().await?;
        self.timed("clone state", clone_state(&mut conn)).await
    }

    async fn applied_transaction_timestamps(
        &self,
    ) -> Result<Option<AppliedTransactionTimestamps>, SqlError> {
        let mut conn = self.get().await?;
        self.timed(
            "applied transaction timestamps",
            applied_transaction_timestamps(&mut conn),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_state_parsing() {
        assert_eq!(
            CloneState::from_raw("Completed".into()),
            CloneState::Completed
        );
        assert_eq!(CloneState::from_raw("Failed".into()), CloneState::Failed);
        assert_eq!(
            CloneState::from_raw("In Progress".into()),
            CloneState::InProgress("In Progress".into())
        );
    }

    #[test]
    fn applied_transaction_delay() {
        let ts = AppliedTransactionTimestamps {
            original_commit: 100.0,
            end_apply: 102.5,
        };
        assert_eq!(ts.delay(), Duration::from_millis(2500));

        // Clock skew can make end-apply precede original-commit.
        let skewed = AppliedTransactionTimestamps {
            original_commit: 102.5,
            end_apply: 100.0,
        };
        assert_eq!(skewed.delay(), Duration::ZERO);
    }

    #[test]
    fn replica_thread_checks() {
        let mut status = ReplicaStatus {
            io_running: "Yes".into(),
            sql_running: "Yes".into(),
            ..Default::default()
        };
        assert!(status.threads_running());
        assert!(!status.has_thread_error());

        status.sql_running = "Connecting".into();
        assert!(!status.threads_running());

        status.last_sql_errno = 1032;
        assert!(status.has_thread_error());
    }
}
