//! Shared fixtures: two endpoints joined by a simulated network.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tcp_over_udp::simulator::{Fate, Simulator, SimulatorConfig, Transmission};
use tcp_over_udp::{Connection, ConnectionState, Endpoint, Flags, ProtocolConfig};

pub const SERVER: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1)), 9000);
pub const CLIENT: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 2)), 9000);
pub const PORT: u16 = 80;

pub const CLIENT_ISN: u32 = 100;
pub const SERVER_ISN: u32 = 10_000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fixed ISNs and a short TIME_WAIT.
pub fn config() -> ProtocolConfig {
    ProtocolConfig {
        client_isn: Some(CLIENT_ISN),
        server_isn: Some(SERVER_ISN),
        time_wait: Duration::from_secs(5),
        ..ProtocolConfig::default()
    }
}

pub struct Pair {
    pub sim: Simulator,
    pub server: Endpoint,
    pub client: Endpoint,
}

pub fn pair(net: SimulatorConfig, config: ProtocolConfig) -> Pair {
    init_logging();
    let sim = Simulator::new(net);
    let server = Endpoint::attach(&sim, SERVER, config.clone());
    let client = Endpoint::attach(&sim, CLIENT, config);
    Pair { sim, server, client }
}

/// Run the handshake; returns `(client, server)`.
pub async fn open(pair: &Pair) -> (Arc<Connection>, Arc<Connection>) {
    let (server, client) = tokio::join!(pair.server.accept(PORT), pair.client.connect(SERVER, PORT));
    (client.expect("connect"), server.expect("accept"))
}

/// Poll until `conn` reaches `want`, failing after two simulated minutes.
pub async fn wait_state(conn: &Connection, want: ConnectionState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    loop {
        let state = conn.state().await;
        if state == want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "still in {state} waiting for {want}"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

pub fn from_client(t: &Transmission) -> bool {
    t.from == CLIENT
}

pub fn from_server(t: &Transmission) -> bool {
    t.from == SERVER
}

pub fn flagged(t: &Transmission, flags: Flags) -> bool {
    t.segment.flags == flags
}

pub fn is_data(t: &Transmission) -> bool {
    t.segment.is_data() && !t.segment.payload.is_empty()
}

pub fn delivered(t: &Transmission) -> bool {
    t.fate != Fate::Dropped && t.fate != Fate::Unroutable
}

/// Deterministic test payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
