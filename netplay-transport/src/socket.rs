//! Async UDP socket abstraction.
//!
//! [`DatagramSocket`] is a thin wrapper around `tokio::net::UdpSocket` that
//! speaks [`crate::packet::Packet`] and applies the configured
//! [`FaultInjector`].  All protocol logic lives elsewhere; this module owns
//! only byte I/O.
//!
//! Sends use `try_send_to`: a UDP send either completes immediately or is
//! treated as a lost datagram, which the reliability layer already handles.
//! That keeps every await point in the transports' event loops at a receive
//! or a timer tick.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::packet::{Packet, PacketError};
use crate::simulator::FaultInjector;

/// Maximum UDP payload size.
pub const MAX_DATAGRAM: usize = 65_535;

/// Errors that can arise from socket operations.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("packet decode error: {0}")]
    Packet(#[from] PacketError),
}

/// An async, packet-oriented UDP socket with fault injection.
#[derive(Debug)]
pub struct DatagramSocket {
    /// Address this socket is bound to (filled in after the OS assigns a port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
    faults: FaultInjector,
}

impl DatagramSocket {
    /// Bind a new socket to `local_addr`.
    pub async fn bind(local_addr: SocketAddr, faults: FaultInjector) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        Self::from_tokio(inner, faults)
    }

    /// Wrap an already bound std socket (e.g. one inherited from another
    /// process).  Must be called inside a tokio runtime.
    pub fn from_std(socket: std::net::UdpSocket, faults: FaultInjector) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Self::from_tokio(UdpSocket::from_std(socket)?, faults)
    }

    fn from_tokio(inner: UdpSocket, faults: FaultInjector) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner,
            faults,
        })
    }

    pub fn inner(&self) -> &UdpSocket {
        &self.inner
    }

    /// Send one encoded datagram to `dest`.
    ///
    /// Returns `Ok(false)` when the datagram was dropped, either by the
    /// packet-loss injector or because the socket buffer was full.
    pub fn send_bytes(&mut self, bytes: &[u8], dest: SocketAddr) -> io::Result<bool> {
        if self.faults.drop_outbound() {
            log::trace!("[udp] injected loss of {} byte(s) to {dest}", bytes.len());
            return Ok(false);
        }
        match self.inner.try_send_to(bytes, dest) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("[udp] send buffer full; dropping datagram to {dest}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Encode `packet` and send it as a single datagram to `dest`.
    pub fn send_packet(&mut self, packet: &Packet, dest: SocketAddr) -> Result<bool, SocketError> {
        let bytes = packet.encode()?;
        Ok(self.send_bytes(&bytes, dest)?)
    }

    /// Receive the next raw datagram.  Cancel-safe.
    pub async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }

    /// Decode an inbound datagram, applying checksum-failure injection.
    pub fn decode_inbound(&mut self, bytes: &[u8]) -> Result<Packet, PacketError> {
        if self.faults.corrupt_inbound() {
            return Err(PacketError::ChecksumFailed);
        }
        Packet::decode(bytes)
    }
}
