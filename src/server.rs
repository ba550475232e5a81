use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin;
use crate::blocklist::BlockList;
use crate::cache::ResponseCache;
use crate::handler::{self, ProxyContext};
use crate::stats::{ConnectionGuard, Stats};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_CLIENTS: usize = 400;

const LISTEN_BACKLOG: i32 = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub blocklist: PathBuf,
    pub connect_timeout: Option<Duration>,
    pub stats_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            blocklist: PathBuf::from("blocked_urls.txt"),
            connect_timeout: Some(Duration::from_secs(10)),
            stats_interval: 60,
        }
    }
}

/// Accept loop plus bounded worker pool. Cancelling the shutdown token
/// stops accepting; in-flight connections get a grace period to finish
/// before being aborted.
pub struct ProxyServer {
    listener: TcpListener,
    ctx: ProxyContext,
    shutdown: CancellationToken,
    max_clients: usize,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        max_clients: usize,
        ctx: ProxyContext,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        match socket.bind(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                eprintln!("\nERROR: Port {} is already in use.", addr.port());
                eprintln!("Check active processes with: lsof -i:{}", addr.port());
                std::process::exit(1);
            }
            Err(e) => return Err(e).with_context(|| format!("failed to bind {addr}")),
        }

        socket.listen(LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(socket.into())?;

        Ok(Self {
            listener,
            ctx,
            shutdown,
            max_clients,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<()> {
        let ProxyServer {
            listener,
            ctx,
            shutdown,
            max_clients,
        } = self;

        let semaphore = Arc::new(Semaphore::new(max_clients));
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished workers so the set doesn't grow without bound.
            while workers.try_join_next().is_some() {}

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept error: {}", e);
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };
            debug!("accepted connection from {}", peer);

            let ctx = ctx.clone();
            workers.spawn(async move {
                let _permit = permit;
                let _guard = ConnectionGuard::new(ctx.stats.clone());
                if let Err(e) = handler::handle_connection(stream, ctx.clone()).await {
                    debug!("connection error from {}: {:#}", peer, e);
                    ctx.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        // Stop accepting; in-flight workers keep running through the grace
        // period.
        drop(listener);

        if !workers.is_empty() {
            info!("draining {} in-flight connections", workers.len());
            let drained = timeout(SHUTDOWN_GRACE, async {
                while workers.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("grace period expired, aborting remaining connections");
                workers.shutdown().await;
            }
        }

        info!("proxy server has shut down");
        Ok(())
    }
}

/// Wires the whole proxy together for the binary: blocklist file, cache,
/// stats reporting, admin console on stdin, listener, accept loop.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let blocklist = Arc::new(BlockList::new());
    match blocklist.load_file(&config.blocklist) {
        Ok(count) => info!(
            "loaded {} blocked hosts from {}",
            count,
            config.blocklist.display()
        ),
        Err(e) => warn!("could not read blocked hosts file: {:#}", e),
    }

    let cache = Arc::new(ResponseCache::new());
    let stats = Arc::new(Stats::new());

    if config.stats_interval > 0 {
        let stats = stats.clone();
        let interval_secs = config.stats_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                stats.print();
            }
        });
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(admin::run(
        BufReader::new(tokio::io::stdin()),
        blocklist.clone(),
        shutdown.clone(),
    ));

    let ctx = ProxyContext {
        cache,
        blocklist,
        stats,
        connect_timeout: config.connect_timeout,
    };

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid listen address")?;
    let server = ProxyServer::bind(addr, config.max_clients, ctx, shutdown).await?;
    info!("proxy listening on http://{}", server.local_addr()?);

    server.run().await
}
