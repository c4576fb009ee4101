//! `netplay-transport`: peer-to-peer transport for real-time netplay.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────────────┐
//!                  │            Transport             │
//!                  │  Stream  │  Datagram  │  Smart   │
//!                  └────┬─────┴─────┬──────┴────┬─────┘
//!                       │           │           │ RelaySelector:
//!            frames     │           │ sessions  │ udp → tcp → relay
//!                  ┌────▼───┐  ┌────▼──────────────────┐
//!                  │  TCP   │  │ ReliableSession / peer │
//!                  └────────┘  │ (Go-Back-N, no I/O)    │
//!                              └────┬──────────────────┘
//!                                   │ packets
//!                              ┌────▼──────────┐
//!                              │ DatagramSocket│  (tokio UdpSocket + faults)
//!                              └───────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`address`]: host/port/family values and dual-stack resolution
//! - [`packet`]: datagram wire format (13-byte header)
//! - [`frame`]: stream framing and the receive buffer
//! - [`wire`]: big-endian field codec for snapshots
//! - [`gbn_sender`]: Go-Back-N outbound window
//! - [`gbn_receiver`]: in-order delivery with a bounded reorder buffer
//! - [`timer`]: retransmission timeout with RTT estimation
//! - [`session`]: per-peer reliable session (pure state machine)
//! - [`simulator`]: packet-loss and checksum-failure injection
//! - [`socket`]: async UDP socket wrapper
//! - [`state`]: transport lifecycle states
//! - [`transport`]: the `Transport` enum, config, events and errors
//! - [`datagram`]: UDP transport multiplexing sessions per peer
//! - [`stream`]: TCP transport
//! - [`smart`]: path-selecting transport
//! - [`selector`]: relay list and family-aware attempt ordering
//! - [`relay`]: TCP relay server
//! - [`handoff`]: capture and resume a live transport (Unix)

pub mod address;
pub mod datagram;
pub mod frame;
pub mod gbn_receiver;
pub mod gbn_sender;
#[cfg(unix)]
pub mod handoff;
pub mod packet;
pub mod relay;
pub mod selector;
pub mod session;
pub mod simulator;
pub mod smart;
pub mod socket;
pub mod state;
pub mod stream;
pub mod timer;
pub mod transport;
pub mod wire;

pub use address::{FamilyPreference, NetworkAddress};
pub use session::{ReliableSession, SessionConfig};
pub use transport::{Protocol, Transport, TransportConfig, TransportError, TransportEvent};
