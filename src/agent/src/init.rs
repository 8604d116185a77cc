// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Initialization engine.
//!
//! Brings a newly started mysqld to a known, privileged, super-read-only
//! state exactly once per process start, before any RPC or probe server
//! binds: writability on, fixed user catalog applied, plugins installed,
//! the local superuser dropped, the binary log reset, and the instance
//! clamped into super-read-only.
//!
//! Account-management statements cannot be prepared, so they are rendered
//! client-side; rendering is separated from execution to keep the exact SQL
//! testable without a server.

use std::path::Path;
use std::time::Duration;

use mysql_async::prelude::Queryable;
use mysql_async::Conn;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, Passwords};
use crate::conn::{connect_socket, quote_literal, SqlError};

/// How long to keep retrying the admin reconnect after the catalog pass.
const ADMIN_RECONNECT_WINDOW: Duration = Duration::from_secs(60);

pub const ADMIN_USER: &str = "admin";
pub const AGENT_USER: &str = "agent";

/// A schema-scoped privilege revocation, applied after the global grants.
#[derive(Debug, Clone, Copy)]
pub struct SchemaRevoke {
    pub schema: &'static str,
    pub privileges: &'static [&'static str],
}

/// One entry of the fixed user catalog. Names and grant lists are known at
/// compile time; only passwords are injected at runtime.
#[derive(Debug, Clone, Copy)]
pub struct UserSetting {
    pub name: &'static str,
    pub grants: &'static [&'static str],
    pub schema_revokes: &'static [SchemaRevoke],
    pub with_grant_option: bool,
    /// `GRANT PROXY ON ''@'' ... WITH GRANT OPTION`; admin only.
    pub proxy_grant: bool,
}

/// Privileges the writable user must not hold on the mysql schema, even
/// though it holds ALL globally. Requires partial_revokes=ON.
const MYSQL_SCHEMA_REVOKES: &[SchemaRevoke] = &[SchemaRevoke {
    schema: "mysql",
    privileges: &[
        "INSERT",
        "UPDATE",
        "DELETE",
        "CREATE",
        "DROP",
        "REFERENCES",
        "INDEX",
        "ALTER",
        "CREATE TEMPORARY TABLES",
        "LOCK TABLES",
        "EXECUTE",
        "CREATE VIEW",
        "CREATE ROUTINE",
        "ALTER ROUTINE",
        "EVENT",
        "TRIGGER",
    ],
}];

pub const USER_CATALOG: &[UserSetting] = &[
    UserSetting {
        name: ADMIN_USER,
        grants: &["ALL"],
        schema_revokes: &[],
        with_grant_option: true,
        proxy_grant: true,
    },
    UserSetting {
        name: AGENT_USER,
        grants: &[
            "SELECT",
            "RELOAD",
            "CLONE_ADMIN",
            "BINLOG_ADMIN",
            "SYSTEM_VARIABLES_ADMIN",
            "REPLICATION CLIENT",
            "SERVICE_CONNECTION_ADMIN",
        ],
        schema_revokes: &[],
        with_grant_option: false,
        proxy_grant: false,
    },
    UserSetting {
        name: "replication",
        grants: &["REPLICATION SLAVE", "REPLICATION CLIENT"],
        schema_revokes: &[],
        with_grant_option: false,
        proxy_grant: false,
    },
    UserSetting {
        name: "clone-donor",
        grants: &["BACKUP_ADMIN", "SERVICE_CONNECTION_ADMIN"],
        schema_revokes: &[],
        with_grant_option: false,
        proxy_grant: false,
    },
    UserSetting {
        name: "exporter",
        grants: &["PROCESS", "REPLICATION CLIENT", "SELECT"],
        schema_revokes: &[],
        with_grant_option: false,
        proxy_grant: false,
    },
    UserSetting {
        name: "backup",
        grants: &[
            "SELECT",
            "RELOAD",
            "LOCK TABLES",
            "PROCESS",
            "REPLICATION CLIENT",
            "BACKUP_ADMIN",
        ],
        schema_revokes: &[],
        with_grant_option: false,
        proxy_grant: false,
    },
    UserSetting {
        name: "readonly",
        grants: &[
            "SELECT",
            "SHOW DATABASES",
            "SHOW VIEW",
            "PROCESS",
            "REPLICATION CLIENT",
        ],
        schema_revokes: &[],
        with_grant_option: false,
        proxy_grant: false,
    },
    UserSetting {
        name: "writable",
        grants: &["ALL"],
        schema_revokes: MYSQL_SCHEMA_REVOKES,
        with_grant_option: true,
        proxy_grant: false,
    },
];

#[derive(Debug, Clone, Copy)]
pub struct Plugin {
    pub name: &'static str,
    pub soname: &'static str,
}

pub const PLUGIN_CATALOG: &[Plugin] = &[
    Plugin {
        name: "rpl_semi_sync_master",
        soname: "semisync_master.so",
    },
    Plugin {
        name: "rpl_semi_sync_slave",
        soname: "semisync_slave.so",
    },
    Plugin {
        name: "clone",
        soname: "mysql_clone.so",
    },
];

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error("could not reconnect as the admin user within {0:?}")]
    AdminReconnect(Duration),
}

/// Statements creating a catalog user from scratch, in application order.
fn create_user_statements(user: &UserSetting, password: &str) -> Vec<String> {
    let mut stmts = Vec::with_capacity(3 + user.schema_revokes.len());
    stmts.push(format!(
        "CREATE USER IF NOT EXISTS '{}'@'%' IDENTIFIED BY {}",
        user.name,
        quote_literal(password)
    ));
    let mut grant = format!(
        "GRANT {} ON *.* TO '{}'@'%'",
        user.grants.join(", "),
        user.name
    );
    if user.with_grant_option {
        grant.push_str(" WITH GRANT OPTION");
    }
    stmts.push(grant);
    if user.proxy_grant {
        stmts.push(format!(
            "GRANT PROXY ON ''@'' TO '{}'@'%' WITH GRANT OPTION",
            user.name
        ));
    }
    for revoke in user.schema_revokes {
        stmts.push(format!(
            "REVOKE {} ON {}.* FROM '{}'@'%'",
            revoke.privileges.join(", "),
            revoke.schema,
            user.name
        ));
    }
    stmts
}

/// Re-identifies an existing account with the current password.
fn reset_password_statement(user: &UserSetting, password: &str) -> String {
    format!(
        "ALTER USER '{}'@'%' IDENTIFIED BY {}",
        user.name,
        quote_literal(password)
    )
}

async fn exec(conn: &mut Conn, sql: &str) -> Result<(), SqlError> {
    conn.query_drop(sql)
        .await
        .map_err(|e| SqlError::stmt(sql, e))
}

/// Like [`exec`] but reports a redacted statement text on failure, for
/// statements that interpolate a password.
async fn exec_redacted(conn: &mut Conn, sql: &str, redacted: &str) -> Result<(), SqlError> {
    conn.query_drop(sql)
        .await
        .map_err(|e| SqlError::stmt(redacted, e))
}

async fn user_exists(conn: &mut Conn, name: &str) -> Result<bool, SqlError> {
    const SQL: &str = "SELECT COUNT(*) FROM mysql.user WHERE user = ? AND host = '%'";
    let count: Option<u64> = conn
        .exec_first(SQL, (name,))
        .await
        .map_err(|e| SqlError::stmt(SQL, e))?;
    Ok(count.unwrap_or(0) > 0)
}

/// Ensure-user: create the account with its grants and revokes when absent;
/// when present, force-update the password only on the reset path.
async fn ensure_user(
    conn: &mut Conn,
    user: &UserSetting,
    password: &str,
    reset: bool,
) -> Result<(), SqlError> {
    if user_exists(conn, user.name).await? {
        if reset {
            let redacted = format!("ALTER USER '{}'@'%' IDENTIFIED BY <redacted>", user.name);
            exec_redacted(conn, &reset_password_statement(user, password), &redacted).await?;
            debug!(user = user.name, "reset catalog user password");
        }
        return Ok(());
    }
    for stmt in create_user_statements(user, password) {
        let redacted = if stmt.starts_with("CREATE USER") {
            format!(
                "CREATE USER IF NOT EXISTS '{}'@'%' IDENTIFIED BY <redacted>",
                user.name
            )
        } else {
            stmt.clone()
        };
        exec_redacted(conn, &stmt, &redacted).await?;
    }
    debug!(user = user.name, "created catalog user");
    Ok(())
}

async fn apply_user_catalog(
    conn: &mut Conn,
    passwords: &Passwords,
    reset: bool,
) -> Result<(), SqlError> {
    for user in USER_CATALOG {
        // validate() ran before any SQL, so the password is present.
        let password = passwords.for_role(user.name).unwrap_or_default();
        ensure_user(conn, user, password, reset).await?;
    }
    Ok(())
}

/// Installs a plugin only if it is not already ACTIVE.
async fn ensure_plugin(conn: &mut Conn, plugin: &Plugin) -> Result<(), SqlError> {
    const SQL: &str = "SELECT COUNT(*) FROM information_schema.plugins \
         WHERE PLUGIN_NAME = ? AND PLUGIN_STATUS = 'ACTIVE'";
    let active: Option<u64> = conn
        .exec_first(SQL, (plugin.name,))
        .await
        .map_err(|e| SqlError::stmt(SQL, e))?;
    if active.unwrap_or(0) > 0 {
        return Ok(());
    }
    let stmt = format!(
        "INSTALL PLUGIN {} SONAME {}",
        plugin.name,
        quote_literal(plugin.soname)
    );
    exec(conn, &stmt).await?;
    info!(plugin = plugin.name, "installed plugin");
    Ok(())
}

/// Reconnects over the socket as the admin user, retrying once per second
/// for up to `window`. Access denied aborts immediately; retrying a bad
/// password would never succeed.
async fn reconnect_admin(
    socket: &Path,
    password: &str,
    window: Duration,
) -> Result<Conn, InitError> {
    let deadline = Instant::now() + window;
    loop {
        match connect_socket(socket, ADMIN_USER, password).await {
            Ok(conn) => return Ok(conn),
            Err(e) if e.is_access_denied() => return Err(e.into()),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(InitError::AdminReconnect(window));
                }
                warn!("admin reconnect failed, retrying: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// One-shot bootstrap of a freshly started mysqld, connected over the socket
/// as the still-present local superuser.
pub async fn initialize(socket: &Path, passwords: &Passwords) -> Result<(), InitError> {
    passwords.validate()?;

    let mut conn = connect_socket(socket, "root", "").await?;
    // Without this the user catalog cannot be written.
    exec(&mut conn, "SET GLOBAL read_only=OFF").await?;
    // Required so that writable may hold ALL globally while being revoked
    // on mysql.*.
    exec(&mut conn, "SET GLOBAL partial_revokes='ON'").await?;
    apply_user_catalog(&mut conn, passwords, false).await?;
    for plugin in PLUGIN_CATALOG {
        ensure_plugin(&mut conn, plugin).await?;
    }
    drop(conn);

    let mut admin = reconnect_admin(socket, &passwords.admin, ADMIN_RECONNECT_WINDOW).await?;
    exec(&mut admin, "DROP USER IF EXISTS 'root'@'localhost'").await?;
    exec(&mut admin, "FLUSH PRIVILEGES").await?;
    // Start with an empty GTID history.
    exec(&mut admin, "RESET MASTER").await?;
    exec(&mut admin, "SET GLOBAL super_read_only=ON").await?;
    info!("initialized mysqld");
    Ok(())
}

/// Post-clone re-initialization for a dataset cloned from a foreign cluster:
/// the same catalog pass with forced password updates, kept out of the
/// binary log, and no `RESET MASTER` (the cloned GTID history must be
/// preserved).
pub async fn reinit_external(conn: &mut Conn, passwords: &Passwords) -> Result<(), InitError> {
    passwords.validate()?;

    exec(conn, "SET sql_log_bin=OFF").await?;
    exec(conn, "SET GLOBAL read_only=OFF").await?;
    exec(conn, "SET GLOBAL partial_revokes='ON'").await?;
    apply_user_catalog(conn, passwords, true).await?;
    for plugin in PLUGIN_CATALOG {
        ensure_plugin(conn, plugin).await?;
    }
    exec(conn, "SET sql_log_bin=ON").await?;
    exec(conn, "SET GLOBAL super_read_only=ON").await?;
    info!("re-initialized mysqld after external clone");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_user(name: &str) -> &'static UserSetting {
        USER_CATALOG
            .iter()
            .find(|u| u.name == name)
            .expect("user in catalog")
    }

    #[test]
    fn catalog_covers_all_roles() {
        let names: Vec<_> = USER_CATALOG.iter().map(|u| u.name).collect();
        assert_eq!(
            names,
            vec![
                "admin",
                "agent",
                "replication",
                "clone-donor",
                "exporter",
                "backup",
                "readonly",
                "writable",
            ]
        );
    }

    #[test]
    fn admin_holds_grant_option_and_proxy() {
        let admin = catalog_user("admin");
        assert!(admin.with_grant_option);
        assert!(admin.proxy_grant);
        // Only admin is allowed to proxy.
        assert_eq!(
            USER_CATALOG.iter().filter(|u| u.proxy_grant).count(),
            1
        );
    }

    #[test]
    fn writable_revokes_mysql_schema() {
        let writable = catalog_user("writable");
        assert_eq!(writable.grants, &["ALL"][..]);
        assert_eq!(writable.schema_revokes.len(), 1);
        assert_eq!(writable.schema_revokes[0].schema, "mysql");
        assert!(writable.schema_revokes[0].privileges.contains(&"DROP"));
    }

    #[test]
    fn create_statements_for_admin() {
        let stmts = create_user_statements(catalog_user("admin"), "s3cr3t");
        assert_eq!(
            stmts,
            vec![
                "CREATE USER IF NOT EXISTS 'admin'@'%' IDENTIFIED BY 's3cr3t'",
                "GRANT ALL ON *.* TO 'admin'@'%' WITH GRANT OPTION",
                "GRANT PROXY ON ''@'' TO 'admin'@'%' WITH GRANT OPTION",
            ]
        );
    }

    #[test]
    fn create_statements_for_writable_end_with_revoke() {
        let stmts = create_user_statements(catalog_user("writable"), "pw");
        assert_eq!(
            stmts[0],
            "CREATE USER IF NOT EXISTS 'writable'@'%' IDENTIFIED BY 'pw'"
        );
        assert_eq!(stmts[1], "GRANT ALL ON *.* TO 'writable'@'%' WITH GRANT OPTION");
        assert!(stmts[2].starts_with("REVOKE INSERT, UPDATE, DELETE"));
        assert!(stmts[2].ends_with("ON mysql.* FROM 'writable'@'%'"));
    }

    #[test]
    fn create_statements_for_plain_user() {
        let stmts = create_user_statements(catalog_user("replication"), "pw");
        assert_eq!(
            stmts,
            vec![
                "CREATE USER IF NOT EXISTS 'replication'@'%' IDENTIFIED BY 'pw'",
                "GRANT REPLICATION SLAVE, REPLICATION CLIENT ON *.* TO 'replication'@'%'",
            ]
        );
    }

    #[test]
    fn passwords_are_escaped() {
        let stmts = create_user_statements(catalog_user("agent"), "it's;a\\pw");
        assert!(stmts[0].ends_with("IDENTIFIED BY 'it''s;a\\\\pw'"));
        let reset = reset_password_statement(catalog_user("agent"), "it's");
        assert_eq!(reset, "ALTER USER 'agent'@'%' IDENTIFIED BY 'it''s'");
    }

    #[test]
    fn every_catalog_role_has_a_password_source() {
        let passwords = Passwords {
            admin: "1".into(),
            agent: "2".into(),
            replication: "3".into(),
            clone_donor: "4".into(),
            exporter: "5".into(),
            backup: "6".into(),
            readonly: "7".into(),
            writable: "8".into(),
        };
        for user in USER_CATALOG {
            assert!(
                passwords.for_role(user.name).is_some(),
                "no password source for {}",
                user.name
            );
        }
    }

    #[test]
    fn plugin_catalog_contents() {
        let names: Vec<_> = PLUGIN_CATALOG.iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec!["rpl_semi_sync_master", "rpl_semi_sync_slave", "clone"]
        );
    }
}
