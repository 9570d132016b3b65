//! FIBP server entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use fibp::config::{parse_address_list, GatewayConfig, HostPort};
use fibp::Gateway;

/// Multi-protocol service gateway.
#[derive(Debug, Parser)]
#[command(name = "fibp", version, about)]
struct ProcessOptions {
    /// Directory holding config.xml.
    #[arg(long = "config-dir")]
    config_dir: PathBuf,

    /// Prefix prepended to log lines.
    #[arg(long = "log-prefix")]
    log_prefix: Option<String>,

    /// File to write the process id into.
    #[arg(long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Cluster-report endpoint, HOST:PORT.
    #[arg(long = "report-addr")]
    report_addr: Option<String>,

    /// Registry addresses, HOST:PORT[,HOST:PORT…]; overrides the config.
    #[arg(long = "registry-addr")]
    registry_addr: Option<String>,

    /// Verbose logging.
    #[arg(long, short)]
    verbose: bool,
}

fn init_tracing(opts: &ProcessOptions) {
    let default_directive = if opts.verbose { "fibp=debug" } else { "fibp=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> std::process::ExitCode {
    let opts = ProcessOptions::parse();
    init_tracing(&opts);
    match run(opts) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fibp aborted");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(opts: ProcessOptions) -> Result<()> {
    if let Some(pid_file) = &opts.pid_file {
        std::fs::write(pid_file, std::process::id().to_string())
            .with_context(|| format!("writing pid file {}", pid_file.display()))?;
    }

    let mut config = GatewayConfig::load(&opts.config_dir)
        .with_context(|| format!("loading config from {}", opts.config_dir.display()))?;
    if let Some(list) = &opts.registry_addr {
        let addrs = parse_address_list(list);
        if addrs.is_empty() {
            anyhow::bail!("--registry-addr has no valid HOST:PORT entries");
        }
        config.registry_addrs = addrs;
    }
    if let Some(addr) = &opts.report_addr {
        config.report_addr =
            Some(HostPort::parse(addr).map_err(|e| anyhow::anyhow!(e.to_string()))?);
    }
    if let Some(prefix) = &opts.log_prefix {
        info!(prefix = %prefix, "log prefix set");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_num.into_inner())
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async move {
        info!("fibp process has started");
        let mut gateway = Gateway::init(&config).await?;
        gateway.run().await;
        info!("fibp process has exited");
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}
