//! `tcp-over-udp`: a TCP-like reliable byte stream implemented over UDP.
//!
//! # Architecture
//!
//! ```text
//!   application: connect / accept / write / read / close
//!  ┌───────────────────────────────────────────┐
//!  │               Connection                  │
//!  │  state machine ─ Sender ─ Receiver        │
//!  │        ▲            │ retransmit timers   │
//!  └────────┼────────────┼─────────────────────┘
//!           │ route       │ segments
//!  ┌────────┴──────┐ ┌────▼──────────────────────┐
//!  │   PortTable   │ │ DatagramSender            │
//!  │ (demux)       │ │ UdpTransport | Simulator  │
//!  └────────▲──────┘ └───────────────────────────┘
//!           └──── Endpoint dispatch loop ◀─ inbound datagrams
//! ```
//!
//! Each module has a single responsibility:
//! - [`segment`]: wire format (serialise / deserialise) and sequence arithmetic
//! - [`connection`]: per-connection lifecycle and the FSM transitions
//! - [`state`]: finite-state-machine types
//! - [`sender`]: outbound window and outstanding-segment table
//! - [`receiver`]: inbound in-order acceptance
//! - [`buffer`]: byte stream buffers
//! - [`timer`]: retransmit and TIME_WAIT timers
//! - [`demux`]: port and connection registry
//! - [`endpoint`]: one datagram address and its dispatch loop
//! - [`socket`]: datagram transport seam and the UDP implementation
//! - [`simulator`]: lossy/reorder network for testing
//! - [`config`]: protocol tunables
//! - [`error`]: error types

pub mod buffer;
pub mod config;
pub mod connection;
pub mod demux;
pub mod endpoint;
pub mod error;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;

pub use config::ProtocolConfig;
pub use connection::{Connection, ConnectionSnapshot};
pub use demux::{Demultiplexer, PortTable, Quad};
pub use endpoint::Endpoint;
pub use error::{ConnError, DemuxError};
pub use segment::{Flags, Segment};
pub use state::ConnectionState;
