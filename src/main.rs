use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use logship::geo::GeoDb;
use logship::schema::Schema;
use logship::{frontend, pipeline, queue, tunnel};

/// Schema-driven access-log pipeline: parse, aggregate, forward.
#[derive(Parser)]
#[command(name = "logship", about, version)]
struct Cli {
    /// Schema file path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log file path (file mode).
    #[arg(short, long, conflicts_with_all = ["tcp", "redis"])]
    log: Option<PathBuf>,

    /// IP database path.
    #[arg(short, long, default_value = "/opt/17monipdb.dat")]
    db: PathBuf,

    /// Redis input, host[:port] (queue mode).
    #[arg(short, long, requires = "redis_queue", conflicts_with = "tcp")]
    redis: Option<String>,

    /// Redis job queue name.
    #[arg(long)]
    redis_queue: Option<String>,

    /// TCP input mode (reverse forwarder).
    #[arg(short, long)]
    tcp: bool,

    /// Listen address for TCP input mode.
    #[arg(long, default_value = "127.0.0.1")]
    listen_ip: String,

    /// Listen port for TCP input mode.
    #[arg(long, default_value_t = 5565)]
    listen_port: u16,

    /// Collector address.
    #[arg(long, default_value = "127.0.0.1")]
    server_ip: String,

    /// Collector port.
    #[arg(long, default_value_t = 5566)]
    server_port: u16,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    if cli.redis.is_none() && cli.config.is_none() {
        anyhow::bail!("--config is required (use --help for usage)");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // The geo resolver is a process-wide resource; a missing database is
    // fatal before any thread spawns.
    let mut geo = GeoDb::open(&cli.db)?;

    let backend_addr = format!("{}:{}", cli.server_ip, cli.server_port);
    let tunnel = tunnel::spawn(backend_addr, cancel.child_token());

    if cli.tcp {
        let listen_addr = format!("{}:{}", cli.listen_ip, cli.listen_port);
        frontend::run(&listen_addr, tunnel, cancel.clone()).await?;
    } else if let Some(redis_addr) = &cli.redis {
        let queue_name = cli
            .redis_queue
            .as_deref()
            .context("--redis requires --redis-queue")?;
        queue::run(redis_addr, queue_name, &mut geo, &tunnel, cancel.clone()).await?;
    } else {
        let config = cli.config.context("--config is required")?;
        let mut schema = Schema::from_file(&config)?;
        schema.normalize();

        let log_path = cli.log.context("--log is required in file mode")?;
        pipeline::run_cycle(&log_path, &schema, &mut geo, &tunnel).await?;
    }

    cancel.cancel();
    info!("logship stopped");

    Ok(())
}

/// SIGINT/SIGTERM cancel the long-running input modes.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }

        cancel.cancel();
    });
}
