// Copyright Ferrite Project contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The sidecar daemon: initializes the local mysqld once, then serves the
//! clone RPC, the probe endpoints, and the metrics exposition until told to
//! stop.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ferrite_agent::clone::{Cloner, MysqlRecipient};
use ferrite_agent::config::{self, Passwords};
use ferrite_agent::conn::{AgentPool, ConnConfig};
use ferrite_agent::http;
use ferrite_agent::init::{self, AGENT_USER};
use ferrite_agent::metrics::Metrics;
use ferrite_agent::probe::Prober;
use ferrite_agent::rotate::{self, LogRotator};
use ferrite_agent::service::{AgentServer, AgentService};

/// Per-instance sidecar agent for managed MySQL clusters.
#[derive(Debug, Parser)]
#[clap(name = "ferrite-agentd")]
struct Args {
    /// Address the clone gRPC service listens on.
    #[clap(long, env = "GRPC_LISTEN_ADDR", default_value = "0.0.0.0:9080")]
    grpc_listen: SocketAddr,

    /// Address the liveness/readiness probes listen on.
    #[clap(long, env = "PROBE_LISTEN_ADDR", default_value = "0.0.0.0:9081")]
    probe_listen: SocketAddr,

    /// Address the Prometheus exposition listens on.
    #[clap(long, env = "METRICS_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    metrics_listen: SocketAddr,

    /// Host of the local mysqld admin interface.
    #[clap(long, env = "MYSQL_ADMIN_HOST", default_value = "localhost")]
    mysql_admin_host: String,

    /// Port of the local mysqld admin interface.
    #[clap(long, env = "MYSQL_ADMIN_PORT", default_value = "33062")]
    mysql_admin_port: u16,

    /// Directory holding the mysqld error and slow logs.
    #[clap(long, env = "MYSQL_LOG_DIR", default_value = "/var/log/mysql")]
    log_dir: PathBuf,

    /// How long an idle pooled connection may live.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "30m")]
    conn_max_idle_time: Duration,

    #[clap(long, value_parser = humantime::parse_duration, default_value = "3s")]
    dial_timeout: Duration,

    #[clap(long, value_parser = humantime::parse_duration, default_value = "30s")]
    read_timeout: Duration,

    /// Crontab expression driving log rotation.
    #[clap(long, default_value = "*/5 * * * *")]
    log_rotation_schedule: String,

    /// Maximum acceptable applied-transaction delay before a replica is
    /// marked unready. Zero disables the check.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "1m")]
    max_delay: Duration,

    /// Warm-up window after process start during which readiness stays
    /// negative, so routers can drain writes to the previous primary.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "30s")]
    transaction_queueing_wait: Duration,

    /// Grace period between CLONE INSTANCE and the first boot probe.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "100ms")]
    clone_restart_grace: Duration,

    /// server_id = base + pod ordinal.
    #[clap(long, default_value = "1000")]
    server_id_base: u32,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("ferrite-agentd: fatal: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let started_at = Instant::now();

    let pod_name = config::require_env(config::ENV_POD_NAME)?;
    let cluster_name = config::require_env(config::ENV_CLUSTER_NAME)?;
    let socket = PathBuf::from(
        env::var(config::ENV_MYSQL_SOCKET)
            .unwrap_or_else(|_| config::DEFAULT_MYSQL_SOCKET.to_string()),
    );
    let passwords = Passwords::from_env().context("reading passwords from the environment")?;

    let (instance_name, ordinal) = config::split_pod_name(&pod_name)?;
    let server_id = args.server_id_base + ordinal;
    info!(pod_name, cluster_name, server_id, "starting agent");

    // Bring the instance to its known super-read-only state before any
    // surface binds.
    init::initialize(&socket, &passwords)
        .await
        .context("initializing mysqld")?;

    let pool = AgentPool::connect(&ConnConfig {
        host: args.mysql_admin_host.clone(),
        port: args.mysql_admin_port,
        socket: socket.clone(),
        user: AGENT_USER.to_string(),
        password: passwords.agent.clone(),
        conn_max_idle_time: args.conn_max_idle_time,
        dial_timeout: args.dial_timeout,
        read_timeout: args.read_timeout,
    });

    let registry = Registry::new();
    let metrics = Metrics::register_into(&registry, &cluster_name, instance_name, ordinal)
        .context("registering metrics")?;

    let recipient = MysqlRecipient::new(pool.clone(), socket.clone(), passwords.clone());
    let cloner = Arc::new(Cloner::new(
        recipient,
        metrics.clone(),
        args.clone_restart_grace,
    ));
    let max_delay = (!args.max_delay.is_zero()).then_some(args.max_delay);
    let prober: Arc<Prober<AgentPool>> = Arc::new(Prober::new(
        pool.clone(),
        metrics.clone(),
        started_at,
        args.transaction_queueing_wait,
        max_delay,
    ));

    let schedule = rotate::parse_schedule(&args.log_rotation_schedule)
        .context("parsing the log rotation schedule")?;
    let rotator = LogRotator::new(args.log_dir.clone(), pool.clone(), metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutting down");
        let _ = shutdown_tx.send(());
    });

    let rotation = rotate::spawn(rotator, schedule, shutdown_rx.clone());

    let grpc = {
        let mut shutdown = shutdown_rx.clone();
        info!("serving gRPC on {}", args.grpc_listen);
        tonic::transport::Server::builder()
            .add_service(AgentServer::new(AgentService::new(cloner)))
            .serve_with_shutdown(args.grpc_listen, async move {
                let _ = shutdown.changed().await;
            })
    };

    let probe = serve_http(args.probe_listen, http::probe_router(prober), shutdown_rx.clone());
    let metrics_http = serve_http(
        args.metrics_listen,
        http::metrics_router(registry.clone()),
        shutdown_rx.clone(),
    );

    info!("serving probes on {}", args.probe_listen);
    info!("serving metrics on {}", args.metrics_listen);
    let (grpc_res, probe_res, metrics_res) = tokio::join!(grpc, probe, metrics_http);
    grpc_res.context("gRPC server failed")?;
    probe_res.context("probe server failed")?;
    metrics_res.context("metrics server failed")?;

    // Give an in-flight rotation a bounded chance to finish.
    if tokio::time::timeout(Duration::from_secs(5), rotation)
        .await
        .is_err()
    {
        warn!("log rotation did not finish within the shutdown grace period");
    }
    Ok(())
}

async fn serve_http(
    addr: SocketAddr,
    router: axum::Router,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
