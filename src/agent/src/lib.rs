// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-instance sidecar agent for managed MySQL clusters.
//!
//! One agent runs alongside every mysqld pod, sharing its data directory and
//! administrative Unix socket, and is the only component that issues
//! privileged operations against the local instance: one-shot initialization
//! of the user catalog, liveness/readiness probes, single-flight `CLONE
//! INSTANCE` orchestration, and scheduled log rotation.

pub mod clone;
pub mod config;
pub mod conn;
pub mod http;
pub mod init;
pub mod metrics;
pub mod probe;
pub mod rotate;
pub mod service;
pub mod status;

pub use clone::{CloneError, CloneRequest, Cloner, MysqlRecipient, Recipient};
pub use config::{ConfigError, Passwords};
pub use conn::{AgentPool, ConnConfig, SqlError};
pub use init::{initialize, reinit_external, InitError};
pub use metrics::Metrics;
pub use probe::{Prober, Readiness};
pub use rotate::LogRotator;
pub use status::StatusSource;
