//! A local endpoint: one datagram address, many connections.
//!
//! An [`Endpoint`] owns the [`PortTable`] and the datagram transport its
//! connections share, and runs the dispatch loop that reads segments off the
//! transport and hands each to the connection [`Demultiplexer::route`]
//! picks.  Segments are delivered one at a time in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::ProtocolConfig;
use crate::connection::Connection;
use crate::demux::{Demultiplexer, PortTable};
use crate::error::ConnError;
use crate::segment::Segment;
use crate::simulator::{SimInbox, Simulator};
use crate::socket::{DatagramSender, UdpTransport};
use crate::timer::TimerService;

pub struct Endpoint {
    local_addr: SocketAddr,
    table: Arc<PortTable>,
    net: Arc<dyn DatagramSender>,
    timers: Arc<TimerService>,
    config: ProtocolConfig,
    dispatcher: Option<JoinHandle<()>>,
}

impl Endpoint {
    /// Bind a UDP socket at `addr` and start dispatching from it.
    pub async fn bind_udp(addr: SocketAddr, config: ProtocolConfig) -> Result<Self, ConnError> {
        let transport = UdpTransport::bind(addr).await?;
        let mut endpoint = Self::new(transport.local_addr, Arc::new(transport.clone()), config);

        let table = Arc::clone(&endpoint.table);
        endpoint.dispatcher = Some(tokio::spawn(async move {
            loop {
                match transport.recv_from().await {
                    Ok((segment, from)) => dispatch(&table, segment, from).await,
                    Err(ConnError::Segment(e)) => log::warn!("[endpoint] undecodable datagram: {e}"),
                    Err(e) => {
                        log::error!("[endpoint] receive failed: {e}");
                        return;
                    }
                }
            }
        }));
        log::info!("[endpoint] bound {}", endpoint.local_addr);
        Ok(endpoint)
    }

    /// Attach a host to `sim` at `addr` and start dispatching from it.
    pub fn attach(sim: &Simulator, addr: SocketAddr, config: ProtocolConfig) -> Self {
        let (link, mut inbox): (_, SimInbox) = sim.attach(addr);
        let mut endpoint = Self::new(addr, Arc::new(link), config);

        let table = Arc::clone(&endpoint.table);
        endpoint.dispatcher = Some(tokio::spawn(async move {
            while let Some((segment, from)) = inbox.recv().await {
                dispatch(&table, segment, from).await;
            }
        }));
        endpoint
    }

    fn new(local_addr: SocketAddr, net: Arc<dyn DatagramSender>, config: ProtocolConfig) -> Self {
        Self {
            local_addr,
            table: Arc::new(PortTable::new()),
            net,
            timers: Arc::new(TimerService::new()),
            config,
            dispatcher: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn table(&self) -> &PortTable {
        &self.table
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// A fresh, unopened connection bound to this endpoint.
    pub fn socket(&self) -> Arc<Connection> {
        Connection::new(
            Arc::clone(&self.table) as Arc<dyn Demultiplexer>,
            Arc::clone(&self.net),
            Arc::clone(&self.timers),
            self.config.clone(),
        )
    }

    /// Open a connection to `peer_port` on the endpoint at `peer`.
    pub async fn connect(&self, peer: SocketAddr, peer_port: u16) -> Result<Arc<Connection>, ConnError> {
        let conn = self.socket();
        conn.connect(peer, peer_port).await?;
        Ok(conn)
    }

    /// Wait for one peer to connect to `local_port`.
    pub async fn accept(&self, local_port: u16) -> Result<Arc<Connection>, ConnError> {
        let conn = self.socket();
        conn.accept(local_port).await?;
        Ok(conn)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.take() {
            task.abort();
        }
    }
}

async fn dispatch(table: &PortTable, segment: Segment, from: SocketAddr) {
    // The table lock is released before the connection lock is taken.
    let target = table.route(&segment, from);
    match target {
        Some(conn) => conn.receive_segment(segment, from).await,
        None => log::debug!("[endpoint] no route for {segment} from {from}"),
    }
}
