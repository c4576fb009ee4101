//! Minimal TCP relay for peers that cannot reach each other directly.
//!
//! A client opens a stream to the relay and sends one
//! [`Frame::RelayRequest`].  The relay dials the destination, answers with
//! [`Frame::RelayAccept`] and from then on splices the two streams.  Bytes
//! the client sent after its request are forwarded first.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::address::{FamilyPreference, NetworkAddress};
use crate::frame::{Frame, ReadBuffer};
use crate::transport::{resolve_candidates, TransportConfig, TransportError};

/// Accepts tunnel requests and spawns one task per tunnel.
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
    connect_timeout: Duration,
    preference: FamilyPreference,
}

impl RelayServer {
    /// Bind the first usable record of `local`.
    pub async fn bind(
        local: &NetworkAddress,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let mut last_err = None;
        for addr in resolve_candidates(local, config.preference).await? {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    log::info!("[relay] listening on {}", listener.local_addr()?);
                    return Ok(Self {
                        listener,
                        connect_timeout: config.connect_timeout,
                        preference: config.preference,
                    });
                }
                Err(source) => {
                    last_err = Some(TransportError::Bind {
                        address: addr.to_string(),
                        source,
                    })
                }
            }
        }
        Err(last_err.unwrap_or(TransportError::Unreachable {
            address: local.to_string(),
            attempts: 0,
            last: "no local address".into(),
        }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve tunnels until the task is dropped.
    pub async fn run(self) {
        loop {
            let (client, from) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("[relay] accept failed: {e}");
                    tokio::task::yield_now().await;
                    continue;
                }
            };
            let (connect_timeout, preference) = (self.connect_timeout, self.preference);
            tokio::spawn(async move {
                match tunnel(client, connect_timeout, preference).await {
                    Ok((up, down)) => {
                        log::info!("[relay] {from} closed: {up} byte(s) up, {down} down")
                    }
                    Err(e) => log::warn!("[relay] {from}: {e}"),
                }
            });
        }
    }
}

async fn read_frame(stream: &mut TcpStream, buf: &mut ReadBuffer) -> Result<Frame, TransportError> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(frame) = buf.next_frame() {
            return Ok(frame);
        }
        match stream.read(&mut chunk).await? {
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            n => buf.extend(&chunk[..n]),
        }
    }
}

/// Serve one tunnel; returns the bytes copied each way.
async fn tunnel(
    mut client: TcpStream,
    connect_timeout: Duration,
    preference: FamilyPreference,
) -> Result<(u64, u64), TransportError> {
    let mut buf = ReadBuffer::new();
    let peer = client.peer_addr()?.to_string();
    let request = timeout(connect_timeout, read_frame(&mut client, &mut buf))
        .await
        .map_err(|_| TransportError::Timeout {
            address: peer.clone(),
            timeout: connect_timeout,
        })??;
    let destination = match request {
        Frame::RelayRequest { destination } => destination,
        other => {
            return Err(TransportError::Handshake {
                address: peer,
                reason: format!("expected relay request, got {:?}", other.kind()),
            })
        }
    };

    let mut upstream = None;
    let mut attempts = 0;
    let mut last = String::from("no address records");
    for target in resolve_candidates(&destination, preference).await? {
        attempts += 1;
        match timeout(connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                upstream = Some(stream);
                break;
            }
            Ok(Err(e)) => last = e.to_string(),
            Err(_) => last = format!("timed out after {connect_timeout:?}"),
        }
    }
    let Some(mut upstream) = upstream else {
        return Err(TransportError::Unreachable {
            address: destination.to_string(),
            attempts,
            last,
        });
    };
    if let Err(e) = upstream.set_nodelay(true) {
        log::debug!("[relay] set_nodelay: {e}");
    }
    log::info!("[relay] tunnel {peer} -> {destination}");

    client.write_all(&Frame::RelayAccept.encode()).await?;
    if !buf.is_empty() {
        upstream.write_all(buf.unread()).await?;
    }
    Ok(tokio::io::copy_bidirectional(&mut client, &mut upstream).await?)
}
