// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Agent identity and derived secrets.

use std::env;
use std::fmt;

pub const ENV_POD_NAME: &str = "POD_NAME";
pub const ENV_CLUSTER_NAME: &str = "CLUSTER_NAME";
pub const ENV_MYSQL_SOCKET: &str = "MYSQL_SOCKET";

pub const DEFAULT_MYSQL_SOCKET: &str = "/run/mysqld/mysqld.sock";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
    #[error("password for the {0} user is empty")]
    EmptyPassword(&'static str),
    #[error("pod name {0:?} does not end in an ordinal suffix")]
    MalformedPodName(String),
}

/// Passwords for the fixed user catalog, read from the environment at
/// startup. All must be non-empty before any SQL is issued.
#[derive(Clone)]
pub struct Passwords {
    pub admin: String,
    pub agent: String,
    pub replication: String,
    pub clone_donor: String,
    pub exporter: String,
    pub backup: String,
    pub readonly: String,
    pub writable: String,
}

impl fmt::Debug for Passwords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passwords(<redacted>)")
    }
}

/// Reads a required environment variable; absent and empty are both errors.
pub fn require_env(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnv(name)),
    }
}

const PASSWORD_ENVS: &[(&str, &str)] = &[
    ("admin", "ADMIN_PASSWORD"),
    ("agent", "AGENT_PASSWORD"),
    ("replication", "REPLICATION_PASSWORD"),
    ("clone-donor", "CLONE_DONOR_PASSWORD"),
    ("exporter", "EXPORTER_PASSWORD"),
    ("backup", "BACKUP_PASSWORD"),
    ("readonly", "READONLY_PASSWORD"),
    ("writable", "WRITABLE_PASSWORD"),
];

impl Passwords {
    pub fn from_env() -> Result<Self, ConfigError> {
        let read = |env_name: &'static str| env::var(env_name).unwrap_or_default();
        let passwords = Passwords {
            admin: read("ADMIN_PASSWORD"),
            agent: read("AGENT_PASSWORD"),
            replication: read("REPLICATION_PASSWORD"),
            clone_donor: read("CLONE_DONOR_PASSWORD"),
            exporter: read("EXPORTER_PASSWORD"),
            backup: read("BACKUP_PASSWORD"),
            readonly: read("READONLY_PASSWORD"),
            writable: read("WRITABLE_PASSWORD"),
        };
        passwords.validate()?;
        Ok(passwords)
    }

    /// The password for a catalog role, by the role's logical name.
    pub fn for_role(&self, role: &str) -> Option<&str> {
        match role {
            "admin" => Some(&self.admin),
            "agent" => Some(&self.agent),
            "replication" => Some(&self.replication),
            "clone-donor" => Some(&self.clone_donor),
            "exporter" => Some(&self.exporter),
            "backup" => Some(&self.backup),
            "readonly" => Some(&self.readonly),
            "writable" => Some(&self.writable),
            _ => None,
        }
    }

    /// Fails fast when any catalog password is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for &(role, _env_name) in PASSWORD_ENVS {
            match self.for_role(role) {
                Some(password) if !password.is_empty() => {}
                _ => return Err(ConfigError::EmptyPassword(role)),
            }
        }
        Ok(())
    }
}

/// Splits a pod name into its StatefulSet base name and ordinal. Pod names
/// must end in `-<N>` with a non-negative integer N.
pub fn split_pod_name(pod_name: &str) -> Result<(&str, u32), ConfigError> {
    let malformed = || ConfigError::MalformedPodName(pod_name.to_string());
    let (base, tail) = pod_name.rsplit_once('-').ok_or_else(malformed)?;
    if base.is_empty() {
        return Err(malformed());
    }
    let ordinal = tail.parse::<u32>().map_err(|_| malformed())?;
    Ok((base, ordinal))
}

/// `server_id = base + ordinal`, for the bootstrap tooling's consumption.
pub fn server_id(base: u32, pod_name: &str) -> Result<u32, ConfigError> {
    let (_, ordinal) = split_pod_name(pod_name)?;
    Ok(base + ordinal)
}
