//! Port/connection lookup: routes inbound segments to connection objects.
//!
//! [`Demultiplexer`] is the seam the connection state machine consumes: it
//! registers itself as a listener on a local port or as a full connection on
//! a [`Quad`], and deregisters after TIME_WAIT.  [`PortTable`] is the
//! in-process implementation every [`crate::endpoint::Endpoint`] uses.
//!
//! Routing rule: an inbound segment goes to the connection registered on its
//! exact quad; failing that, a **bare SYN** goes to the listener on its
//! destination port; anything else is unroutable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::connection::Connection;
use crate::error::DemuxError;
use crate::segment::Segment;

/// First port handed out by [`PortTable::next_available_port`].
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Connection identity as seen from the local endpoint.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Quad {
    /// Datagram address of the remote endpoint.
    pub peer: SocketAddr,
    pub local_port: u16,
    pub peer_port: u16,
}

impl Quad {
    /// The quad an inbound segment from `from` belongs to.
    pub fn inbound(segment: &Segment, from: SocketAddr) -> Self {
        Self {
            peer: from,
            local_port: segment.dest_port,
            peer_port: segment.source_port,
        }
    }
}

pub trait Demultiplexer: Send + Sync {
    fn register_listening_socket(&self, local_port: u16, conn: Arc<Connection>) -> Result<(), DemuxError>;

    fn unregister_listening_socket(&self, local_port: u16, conn: &Arc<Connection>) -> Result<(), DemuxError>;

    fn register_connection(&self, quad: Quad, conn: Arc<Connection>) -> Result<(), DemuxError>;

    fn unregister_connection(&self, quad: Quad, conn: &Arc<Connection>) -> Result<(), DemuxError>;

    /// A local port with no listener and no connection on it.
    fn next_available_port(&self) -> Result<u16, DemuxError>;

    /// Replace the listening registration on `quad.local_port` with a
    /// connection registration on `quad`.
    ///
    /// The default performs the two steps separately; implementations that
    /// can do it under one lock should override it.
    fn promote_listener(&self, quad: Quad, conn: &Arc<Connection>) -> Result<(), DemuxError> {
        self.unregister_listening_socket(quad.local_port, conn)?;
        self.register_connection(quad, Arc::clone(conn))
    }

    /// The connection an inbound segment should be delivered to.
    fn route(&self, segment: &Segment, from: SocketAddr) -> Option<Arc<Connection>>;
}

#[derive(Default)]
struct Tables {
    listeners: HashMap<u16, Arc<Connection>>,
    connections: HashMap<Quad, Arc<Connection>>,
    next_port: u16,
}

impl Tables {
    fn port_in_use(&self, port: u16) -> bool {
        self.listeners.contains_key(&port) || self.connections.keys().any(|q| q.local_port == port)
    }
}

/// Thread-safe [`Demultiplexer`] backed by two hash maps.
#[derive(Default)]
pub struct PortTable {
    inner: RwLock<Tables>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn listener_count(&self) -> usize {
        self.read().listeners.len()
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    pub fn is_registered(&self, quad: &Quad) -> bool {
        self.read().connections.contains_key(quad)
    }
}

impl Demultiplexer for PortTable {
    fn register_listening_socket(&self, local_port: u16, conn: Arc<Connection>) -> Result<(), DemuxError> {
        let mut t = self.write();
        if t.listeners.contains_key(&local_port) {
            return Err(DemuxError::PortInUse(local_port));
        }
        t.listeners.insert(local_port, conn);
        log::debug!("[demux] listening on :{local_port}");
        Ok(())
    }

    fn unregister_listening_socket(&self, local_port: u16, conn: &Arc<Connection>) -> Result<(), DemuxError> {
        let mut t = self.write();
        match t.listeners.get(&local_port) {
            Some(existing) if Arc::ptr_eq(existing, conn) => {
                t.listeners.remove(&local_port);
                Ok(())
            }
            _ => Err(DemuxError::NotRegistered(format!("listener :{local_port}"))),
        }
    }

    fn register_connection(&self, quad: Quad, conn: Arc<Connection>) -> Result<(), DemuxError> {
        let mut t = self.write();
        if t.connections.contains_key(&quad) {
            return Err(DemuxError::ConnectionExists {
                peer: quad.peer,
                local_port: quad.local_port,
            });
        }
        t.connections.insert(quad, conn);
        log::debug!("[demux] registered :{} <-> {}:{}", quad.local_port, quad.peer, quad.peer_port);
        Ok(())
    }

    fn unregister_connection(&self, quad: Quad, conn: &Arc<Connection>) -> Result<(), DemuxError> {
        let mut t = self.write();
        match t.connections.get(&quad) {
            Some(existing) if Arc::ptr_eq(existing, conn) => {
                t.connections.remove(&quad);
                log::debug!("[demux] unregistered :{} <-> {}:{}", quad.local_port, quad.peer, quad.peer_port);
                Ok(())
            }
            _ => Err(DemuxError::NotRegistered(format!(
                ":{} <-> {}:{}",
                quad.local_port, quad.peer, quad.peer_port
            ))),
        }
    }

    fn next_available_port(&self) -> Result<u16, DemuxError> {
        let mut t = self.write();
        let span = u32::from(u16::MAX - EPHEMERAL_PORT_START) + 1;
        for _ in 0..span {
            if t.next_port < EPHEMERAL_PORT_START {
                t.next_port = EPHEMERAL_PORT_START;
            }
            let candidate = t.next_port;
            t.next_port = candidate.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
            if !t.port_in_use(candidate) {
                return Ok(candidate);
            }
        }
        Err(DemuxError::PortsExhausted)
    }

    fn promote_listener(&self, quad: Quad, conn: &Arc<Connection>) -> Result<(), DemuxError> {
        let mut t = self.write();
        match t.listeners.get(&quad.local_port) {
            Some(existing) if Arc::ptr_eq(existing, conn) => {}
            _ => return Err(DemuxError::NotRegistered(format!("listener :{}", quad.local_port))),
        }
        if t.connections.contains_key(&quad) {
            return Err(DemuxError::ConnectionExists {
                peer: quad.peer,
                local_port: quad.local_port,
            });
        }
        t.listeners.remove(&quad.local_port);
        t.connections.insert(quad, Arc::clone(conn));
        log::debug!(
            "[demux] listener :{} promoted to connection with {}:{}",
            quad.local_port,
            quad.peer,
            quad.peer_port
        );
        Ok(())
    }

    fn route(&self, segment: &Segment, from: SocketAddr) -> Option<Arc<Connection>> {
        let t = self.read();
        let quad = Quad::inbound(segment, from);
        if let Some(conn) = t.connections.get(&quad) {
            return Some(Arc::clone(conn));
        }
        if segment.is_bare_syn() {
            return t.listeners.get(&segment.dest_port).cloned();
        }
        None
    }
}
