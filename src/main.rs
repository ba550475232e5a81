#![warn(clippy::all)]

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use caching_proxy::server::{self, ServerConfig, DEFAULT_MAX_CLIENTS, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(author, version, about = "Caching HTTP/HTTPS forward proxy")]
struct Args {
    /// Port to listen on; a non-numeric value falls back to the default.
    port: Option<String>,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// File with one blocked hostname or URL per line.
    #[arg(long, default_value = "blocked_urls.txt")]
    blocklist: PathBuf,

    /// Maximum concurrently served connections.
    #[arg(long, default_value_t = DEFAULT_MAX_CLIENTS)]
    max_clients: usize,

    /// Origin connect timeout in seconds; 0 disables.
    #[arg(long, default_value_t = 10)]
    timeout_connect: u64,

    /// Seconds between stats log lines; 0 disables.
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let port = match args.port.as_deref() {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            eprintln!("Invalid port number provided. Using default port {DEFAULT_PORT}");
            DEFAULT_PORT
        }),
        None => DEFAULT_PORT,
    };

    let config = ServerConfig {
        host: args.host,
        port,
        max_clients: args.max_clients,
        blocklist: args.blocklist,
        connect_timeout: (args.timeout_connect > 0)
            .then(|| Duration::from_secs(args.timeout_connect)),
        stats_interval: args.stats_interval,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    runtime.block_on(server::serve(config))
}
