//! Entry point for `netplay-transport`.
//!
//! Parses CLI arguments and dispatches into **server**, **client** or
//! **relay** mode.  All protocol work is delegated to library modules;
//! `main.rs` owns only process setup (logging, argument parsing) and the
//! line-based demo loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};

use netplay_transport::address::{ExternalIp, FamilyPreference, NetworkAddress};
use netplay_transport::relay::RelayServer;
use netplay_transport::selector::RelaySelector;
use netplay_transport::simulator::FaultConfig;
use netplay_transport::transport::{Protocol, Transport, TransportConfig, TransportEvent};

/// Peer-to-peer transport with UDP, TCP and relay paths.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    opts: Options,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct Options {
    /// Resolve and connect over IPv4 only.
    #[arg(long, global = true, conflicts_with = "ipv6_only")]
    ipv4_only: bool,

    /// Resolve and connect over IPv6 only.
    #[arg(long, global = true)]
    ipv6_only: bool,

    /// Transport flavour.
    #[arg(long, global = true, value_enum, default_value_t = ProtocolArg::Smart)]
    protocol: ProtocolArg,

    /// Deliver raw bytes instead of framed messages.
    #[arg(long, global = true)]
    raw: bool,

    /// Percentage of outbound datagrams to drop.
    #[arg(long, global = true, default_value_t = 0)]
    packet_loss: u8,

    /// Percentage of inbound datagrams to treat as corrupt.
    #[arg(long, global = true, default_value_t = 0)]
    checksum_fail: u8,

    /// Seed for the fault injector, for reproducible runs.
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[arg(long, global = true, default_value_t = 5000)]
    connect_timeout_ms: u64,

    /// File with one relay `host:port` per line.
    #[arg(long, global = true)]
    relay_list: Option<PathBuf>,

    /// Skip direct paths and go through a relay.
    #[arg(long, global = true)]
    force_relay: bool,

    /// Public address to show to users (as reported by a discovery service).
    #[arg(long, global = true)]
    external_ip: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Stream,
    Datagram,
    Smart,
}

impl From<ProtocolArg> for Protocol {
    fn from(p: ProtocolArg) -> Self {
        match p {
            ProtocolArg::Stream => Protocol::Stream,
            ProtocolArg::Datagram => Protocol::Datagram,
            ProtocolArg::Smart => Protocol::Smart,
        }
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Listen for peers and echo every message back.
    Server {
        /// Local address to bind (`:3939` binds every interface).
        #[arg(short, long, default_value = ":3939")]
        bind: String,
    },
    /// Connect to a peer; stdin lines are sent, messages are printed.
    Client {
        /// Remote address (e.g. 127.0.0.1:3939 or [::1]:3939).
        #[arg(short, long)]
        server: String,
    },
    /// Run a relay for peers that cannot reach each other directly.
    Relay {
        #[arg(short, long, default_value = ":3940")]
        bind: String,
    },
}

impl Options {
    fn preference(&self) -> FamilyPreference {
        if self.ipv4_only {
            FamilyPreference::Ipv4Only
        } else if self.ipv6_only {
            FamilyPreference::Ipv6Only
        } else {
            FamilyPreference::DualStack
        }
    }

    fn transport_config(&self) -> anyhow::Result<TransportConfig> {
        let preference = self.preference();
        preference.set_current();

        let mut faults = FaultConfig::default()
            .with_packet_loss(self.packet_loss)
            .with_checksum_fail(self.checksum_fail);
        if let Some(seed) = self.seed {
            faults = faults.with_seed(seed);
        }
        let relays = match &self.relay_list {
            Some(path) => RelaySelector::from_file(path, preference)?.relays().to_vec(),
            None => Vec::new(),
        };
        if self.force_relay && relays.is_empty() {
            bail!("--force-relay needs a non-empty --relay-list");
        }

        Ok(TransportConfig::default()
            .with_preference(preference)
            .with_raw(self.raw)
            .with_faults(faults)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_relays(relays)
            .with_force_relay(self.force_relay))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.opts.transport_config()?;
    let external = cli
        .opts
        .external_ip
        .as_deref()
        .map_or(ExternalIp::Unknown, ExternalIp::from_report);
    let protocol = Protocol::from(cli.opts.protocol);

    match cli.mode {
        Mode::Server { bind } => {
            let local: NetworkAddress = bind.parse().context("invalid --bind address")?;
            let transport = Transport::listen(protocol, local, config).await?;
            log::info!(
                "{protocol} server on {} (external address: {external})",
                transport.address()
            );
            serve(transport).await;
        }
        Mode::Client { server } => {
            let remote: NetworkAddress = server.parse().context("invalid --server address")?;
            let transport = Transport::connect(protocol, remote.clone(), config)
                .await
                .with_context(|| format!("cannot reach {remote}"))?;
            log::info!("connected to {remote} over {protocol}");
            chat(transport).await?;
        }
        Mode::Relay { bind } => {
            let local: NetworkAddress = bind.parse().context("invalid --bind address")?;
            let relay = RelayServer::bind(&local, &config).await?;
            log::info!("relay on {} (external address: {external})", relay.local_addr()?);
            relay.run().await;
        }
    }
    Ok(())
}

/// Echo everything a peer sends.  Stream peers each get their own task.
async fn serve(mut listener: Transport) {
    while let Some(event) = listener.next_event().await {
        match event {
            TransportEvent::Accepted { peer } => {
                log::info!("peer {peer} joined");
                if listener.pending_accepts() == 0 {
                    continue;
                }
                match listener.accept().await {
                    Ok(conn) => {
                        tokio::spawn(serve_connection(conn));
                    }
                    Err(e) => log::warn!("accept failed: {e}"),
                }
            }
            other => echo(&mut listener, other).await,
        }
    }
}

async fn serve_connection(mut conn: Transport) {
    while let Some(event) = conn.next_event().await {
        echo(&mut conn, event).await;
    }
}

async fn echo(t: &mut Transport, event: TransportEvent) {
    match event {
        TransportEvent::Message { from, payload } => {
            log::debug!("{from}: {} byte(s)", payload.len());
            t.send(&payload, Some(&from)).await;
        }
        TransportEvent::RawData { from, bytes } => {
            if t.send(&bytes, Some(&from)).await {
                t.consume(bytes.len());
            }
        }
        TransportEvent::Disconnected { peer, reason } => log::info!("peer {peer} left: {reason}"),
        TransportEvent::Accepted { .. } => {}
    }
}

/// Send stdin lines and print whatever comes back.
async fn chat(mut t: Transport) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !t.send(line.as_bytes(), None).await {
                        bail!("connection lost");
                    }
                }
                None => break,
            },
            event = t.next_event() => match event {
                Some(TransportEvent::Message { payload, .. }) => {
                    println!("{}", String::from_utf8_lossy(&payload));
                }
                Some(TransportEvent::RawData { bytes, .. }) => {
                    print!("{}", String::from_utf8_lossy(&bytes));
                    t.consume(bytes.len());
                }
                Some(TransportEvent::Disconnected { reason, .. }) => {
                    log::info!("disconnected: {reason}");
                    break;
                }
                Some(TransportEvent::Accepted { .. }) => {}
                None => break,
            },
        }
    }
    t.disconnect().await;
    Ok(())
}
