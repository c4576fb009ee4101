//! Fault injection for self-testing the reliability layer.
//!
//! Real networks drop and corrupt packets.  To exercise retransmission
//! without depending on actual network conditions, every datagram socket
//! carries a [`FaultInjector`] that applies a configurable fault model:
//!
//! | Fault            | Description                                          |
//! |------------------|------------------------------------------------------|
//! | Packet loss      | Drop an outbound datagram before it is transmitted.  |
//! | Checksum failure | Treat an inbound datagram as corrupt and discard it. |
//!
//! Both rates are whole percentages.  The RNG is seeded so a failing run can
//! be replayed: pass the seed printed at debug level back through
//! [`FaultConfig::with_seed`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Configuration for the fault-injection model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultConfig {
    /// Percentage (0..=100) of outbound datagrams silently dropped.
    pub packet_loss: u8,
    /// Percentage (0..=100) of inbound datagrams treated as corrupt.
    pub checksum_fail: u8,
    /// RNG seed; `None` draws a fresh one.
    pub seed: Option<u64>,
}

impl FaultConfig {
    pub fn with_packet_loss(mut self, percent: u8) -> Self {
        self.packet_loss = percent.min(100);
        self
    }

    pub fn with_checksum_fail(mut self, percent: u8) -> Self {
        self.checksum_fail = percent.min(100);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// `true` when no fault is ever injected.
    pub fn is_passthrough(&self) -> bool {
        self.packet_loss == 0 && self.checksum_fail == 0
    }
}

/// Seeded decision source for [`FaultConfig`].
#[derive(Debug, Clone)]
pub struct FaultInjector {
    config: FaultConfig,
    rng: StdRng,
}

impl FaultInjector {
    pub fn new(config: FaultConfig) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random::<u64>);
        if !config.is_passthrough() {
            log::debug!(
                "[sim] loss={}% checksum_fail={}% seed={seed}",
                config.packet_loss,
                config.checksum_fail
            );
        }
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> FaultConfig {
        self.config
    }

    /// Decide whether the next outbound datagram is lost.
    pub fn drop_outbound(&mut self) -> bool {
        roll(&mut self.rng, self.config.packet_loss)
    }

    /// Decide whether the next inbound datagram fails its checksum.
    pub fn corrupt_inbound(&mut self) -> bool {
        roll(&mut self.rng, self.config.checksum_fail)
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new(FaultConfig::default())
    }
}

fn roll(rng: &mut StdRng, percent: u8) -> bool {
    match percent {
        0 => false,
        p if p >= 100 => true,
        p => rng.random_range(0..100u8) < p,
    }
}
