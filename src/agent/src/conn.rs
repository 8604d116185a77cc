// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! SQL access layer.
//!
//! The agent holds one pooled TCP connection to the local mysqld,
//! authenticated as its own privileged user. A second, socket-based
//! connection mode exists for `CLONE INSTANCE` and the boot-wait loop:
//! cloning restarts the TCP listener, and a Unix-socket connection without
//! I/O deadlines survives the restart window better.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mysql_async::{Conn, OptsBuilder, Pool};

/// Access denied for the supplied credentials. Connect retry loops must
/// stop immediately on this code; retrying would never succeed.
pub const ER_ACCESS_DENIED: u16 = 1045;

/// The expected return of `CLONE INSTANCE` when it restarts the server.
pub const ER_RESTART_EXPECTED: u16 = 3707;

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("error executing `{sql}`: {source}")]
    Statement {
        sql: String,
        #[source]
        source: mysql_async::Error,
    },
    #[error("`{sql}` returned no rows")]
    EmptyResult { sql: String },
    #[error("error connecting to mysqld: {0}")]
    Connect(#[source] mysql_async::Error),
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
}

impl SqlError {
    pub(crate) fn stmt(sql: &str, source: mysql_async::Error) -> Self {
        SqlError::Statement {
            sql: sql.to_string(),
            source,
        }
    }

    /// The MySQL server error number behind this error, if any.
    pub fn errno(&self) -> Option<u16> {
        let source = match self {
            SqlError::Statement { source, .. } => source,
            SqlError::Connect(source) => source,
            _ => return None,
        };
        match source {
            mysql_async::Error::Server(e) => Some(e.code),
            _ => None,
        }
    }

    pub fn is_access_denied(&self) -> bool {
        self.errno() == Some(ER_ACCESS_DENIED)
    }

    pub fn is_restart_expected(&self) -> bool {
        self.errno() == Some(ER_RESTART_EXPECTED)
    }
}

/// Connection parameters for the pooled admin-port connection.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub host: String,
    pub port: u16,
    pub socket: PathBuf,
    pub user: String,
    pub password: String,
    /// How long an idle pooled connection may live.
    pub conn_max_idle_time: Duration,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
}

/// The process-wide connection pool targeting the local mysqld over TCP.
#[derive(Debug, Clone)]
pub struct AgentPool {
    pool: Pool,
    dial_timeout: Duration,
    read_timeout: Duration,
}

impl AgentPool {
    pub fn connect(config: &ConnConfig) -> Self {
        let opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .prefer_socket(false)
            .tcp_keepalive(Some(60_000_u32))
            .conn_ttl(Some(config.conn_max_idle_time));
        AgentPool {
            pool: Pool::new(opts),
            dial_timeout: config.dial_timeout,
            read_timeout: config.read_timeout,
        }
    }

    /// Checks out a connection, bounded by the dial timeout.
    pub async fn get(&self) -> Result<Conn, SqlError> {
        match tokio::time::timeout(self.dial_timeout, self.pool.get_conn()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(SqlError::Connect(e)),
            Err(_) => Err(SqlError::Timeout {
                op: "connect",
                timeout: self.dial_timeout,
            }),
        }
    }

    /// Bounds a statement future with the configured read timeout.
    pub async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T, SqlError>
    where
        F: Future<Output = Result<T, SqlError>>,
    {
        match tokio::time::timeout(self.read_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(SqlError::Timeout {
                op,
                timeout: self.read_timeout,
            }),
        }
    }
}

/// Opens a one-off connection over the MySQL Unix domain socket, with no
/// I/O deadlines.
pub async fn connect_socket(socket: &Path, user: &str, password: &str) -> Result<Conn, SqlError> {
    let opts = OptsBuilder::default()
        .socket(Some(socket.to_string_lossy().into_owned()))
        .user(Some(user))
        .pass(Some(password));
    Conn::new(opts).await.map_err(SqlError::Connect)
}

/// Escapes a string for client-side interpolation into account-management
/// statements, which MySQL does not allow to be prepared.
pub fn quote_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}
