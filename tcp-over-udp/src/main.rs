//! Entry point for `tcp-over-udp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All actual protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, argument parsing, stdin/stdout plumbing).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tcp_over_udp::{Endpoint, ProtocolConfig};

/// TCP-like reliable byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept one connection and copy what it sends to stdout.
    Server {
        /// Local UDP address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Protocol port to listen on.
        #[arg(short, long, default_value_t = 80)]
        port: u16,
    },
    /// Connect to a server and send stdin over the connection.
    Client {
        /// Remote server UDP address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Protocol port the server listens on.
        #[arg(short, long, default_value_t = 80)]
        port: u16,
        /// Local UDP address to bind.
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
    },
}

#[derive(Args)]
struct Tuning {
    /// Retransmission timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    rto_ms: u64,
    /// TIME_WAIT duration in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    time_wait_ms: u64,
    /// Send window, in segments.
    #[arg(long, default_value_t = 8)]
    window: usize,
    /// Maximum payload bytes per segment.
    #[arg(long, default_value_t = 1000)]
    mss: usize,
}

impl From<Tuning> for ProtocolConfig {
    fn from(t: Tuning) -> Self {
        ProtocolConfig {
            rto: Duration::from_millis(t.rto_ms),
            time_wait: Duration::from_millis(t.time_wait_ms),
            window: t.window,
            mss: t.mss,
            ..ProtocolConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = ProtocolConfig::from(cli.tuning);

    match cli.mode {
        Mode::Server { bind, port } => run_server(bind, port, config).await,
        Mode::Client { server, port, bind } => run_client(bind, server, port, config).await,
    }
}

async fn run_server(bind: SocketAddr, port: u16, config: ProtocolConfig) -> anyhow::Result<()> {
    let endpoint = Endpoint::bind_udp(bind, config)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let time_wait = endpoint.config().time_wait;
    log::info!("Listening on {} port {port}", endpoint.local_addr());

    let conn = endpoint.accept(port).await.context("accept")?;
    let snapshot = conn.snapshot().await;
    log::info!(
        "Accepted connection from {:?} port {}",
        snapshot.peer,
        snapshot.peer_port
    );

    let data = conn.read_to_end().await.context("read")?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&data).await?;
    stdout.flush().await?;
    log::info!("Received {} bytes", data.len());

    conn.close().await?;
    linger(&conn, time_wait).await;
    Ok(())
}

async fn run_client(
    bind: SocketAddr,
    server: SocketAddr,
    port: u16,
    config: ProtocolConfig,
) -> anyhow::Result<()> {
    let endpoint = Endpoint::bind_udp(bind, config)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let time_wait = endpoint.config().time_wait;
    log::info!("Connecting from {} to {server} port {port}", endpoint.local_addr());

    let conn = endpoint.connect(server, port).await.context("connect")?;
    log::info!("Connected");

    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;
    let n = conn.write(&input).await.context("write")?;
    log::info!("Sent {n} bytes");

    conn.close().await?;
    linger(&conn, time_wait).await;
    Ok(())
}

/// Keep the endpoint alive until the connection has fully closed, or give up
/// after a bounded wait.
async fn linger(conn: &tcp_over_udp::Connection, time_wait: Duration) {
    let deadline = tokio::time::Instant::now() + time_wait + Duration::from_secs(30);
    while conn.state().await != tcp_over_udp::ConnectionState::Closed {
        if tokio::time::Instant::now() >= deadline {
            log::warn!("Gave up waiting for close in {}", conn.state().await);
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    log::info!("Connection closed");
}
