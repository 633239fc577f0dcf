//! gearcheck worker
//!
//! Pulls host, service and event handler jobs from one or more Gearman job
//! servers, runs them and posts check results back.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gearcheck_broker::{BrokerClient, GearmanWorker};
use gearcheck_common::TransportMode;
use gearcheck_worker::config::split_list;
use gearcheck_worker::{
    Mode, Overrides, PoolLink, Reporter, Shutdown, WorkerConfig, WorkerLoop,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gearcheck-worker", version)]
#[command(about = "Runs monitoring checks pulled from a Gearman job server")]
struct Cli {
    /// Path to the worker configuration (TOML)
    #[arg(long, env = "GEARCHECK_CONFIG")]
    config: Option<PathBuf>,

    /// Job server as host[:port]; repeat or comma separate
    #[arg(long = "server", env = "GEARCHECK_SERVERS")]
    servers: Vec<String>,

    /// Take host checks
    #[arg(long)]
    hosts: bool,

    /// Take service checks
    #[arg(long)]
    services: bool,

    /// Take event handler jobs
    #[arg(long)]
    events: bool,

    /// Take jobs from hostgroup_<name>; repeat or comma separate
    #[arg(long = "hostgroup")]
    hostgroups: Vec<String>,

    /// Take jobs from servicegroup_<name>; repeat or comma separate
    #[arg(long = "servicegroup")]
    servicegroups: Vec<String>,

    /// Default check timeout in seconds
    #[arg(long, env = "GEARCHECK_JOB_TIMEOUT")]
    job_timeout: Option<u64>,

    /// Skip jobs scheduled longer ago than this many seconds (0 disables)
    #[arg(long, env = "GEARCHECK_MAX_AGE")]
    max_age: Option<u64>,

    /// Run checks without isolating them in their own process group
    #[arg(long)]
    no_fork_on_exec: bool,

    /// Prefix result output with this worker's identity
    #[arg(long)]
    debug_result: bool,

    /// Exit after this many jobs (0 for no limit)
    #[arg(long, env = "GEARCHECK_MAX_JOBS")]
    max_jobs: Option<u64>,

    /// standalone or pooled
    #[arg(long, env = "GEARCHECK_MODE", value_parser = parse_mode)]
    mode: Option<Mode>,

    /// Payload encoding on the job server: base64 or plain
    #[arg(long, env = "GEARCHECK_TRANSPORT", value_parser = parse_transport)]
    transport: Option<TransportMode>,

    /// Name used in verbose results (defaults to the host name)
    #[arg(long, env = "GEARCHECK_IDENTITY")]
    identity: Option<String>,

    /// Shared active-job counter file (pooled mode)
    #[arg(long, env = "GEARCHECK_COUNTER_PATH")]
    counter_path: Option<PathBuf>,

    /// Exit after this many idle seconds (pooled mode, 0 disables)
    #[arg(long, env = "GEARCHECK_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            servers: split_list(&self.servers),
            hosts: self.hosts,
            services: self.services,
            events: self.events,
            hostgroups: split_list(&self.hostgroups),
            servicegroups: split_list(&self.servicegroups),
            job_timeout: self.job_timeout,
            max_age: self.max_age,
            fork_on_exec: self.no_fork_on_exec.then_some(false),
            debug_result: self.debug_result,
            max_jobs: self.max_jobs,
            mode: self.mode,
            transport: self.transport,
            identity: self.identity.clone(),
            counter_path: self.counter_path.clone(),
            idle_timeout_secs: self.idle_timeout,
        }
    }
}

fn parse_mode(raw: &str) -> Result<Mode, String> {
    Mode::parse(raw).ok_or_else(|| format!("unknown mode '{}' (standalone, pooled)", raw))
}

fn parse_transport(raw: &str) -> Result<TransportMode, String> {
    TransportMode::parse(raw).ok_or_else(|| format!("unknown transport '{}' (base64, plain)", raw))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    info!(
        "{}",
        gearcheck_build_info::formatted_banner(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    );

    let mut config = WorkerConfig::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")?;
    config.apply(cli.overrides());
    config.validate().context("invalid configuration")?;

    let shutdown = Shutdown::new();
    spawn_signal_handlers(shutdown.clone());

    let source = GearmanWorker::connect(&config.servers)
        .await
        .context("cannot start worker")?;
    let client = BrokerClient::connect(&config.servers)
        .context("cannot start client")?
        .with_retry_delay(Duration::from_secs(config.retry_delay_secs));
    let identity = config.debug_result.then(|| config.resolved_identity());
    let reporter = Reporter::new(client, config.transport, config.result_retries, identity);

    let pool = match (config.mode, config.pool.counter_path.clone()) {
        (Mode::Pooled, Some(path)) => PoolLink::pooled(path),
        _ => PoolLink::standalone(),
    };

    info!(
        servers = ?config.servers,
        mode = config.mode.as_str(),
        fork_on_exec = config.fork_on_exec,
        max_jobs = config.max_jobs,
        "starting worker"
    );
    let mut worker = WorkerLoop::new(&config, source, reporter, pool, shutdown);
    let exit = worker.run().await.context("worker failed")?;

    info!(
        jobs = worker.state().jobs_done(),
        reason = exit.as_str(),
        "worker finished"
    );
    Ok(())
}

fn spawn_signal_handlers(shutdown: Shutdown) {
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received SIGINT; finishing current job");
            ctrl_c.request();
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("received SIGTERM; finishing current job");
                shutdown.request();
            }
        });
    }
}
