//! Retransmission timeout management.
//!
//! [`RetransmitTimer`] owns the retransmission timeout (RTO) of one session
//! and adapts it to measured round trips.
//!
//! The RTO follows RFC 6298 (`SRTT + 4 * RTTVAR`) and doubles on every
//! consecutive timeout. It stays between [`TimerConfig::min_rto`] and
//! [`TimerConfig::max_rto`].
//!
//! The timer never reads a clock.  [`crate::session::ReliableSession::tick`]
//! accumulates elapsed time and asks [`RetransmitTimer::expired`] whether the
//! head of the window is overdue, so the same logic runs identically under
//! tests, the tokio interval, and after a process handoff.

use std::time::Duration;

use crate::wire::{Reader, WireError, Writer};

/// Bounds for the retransmission timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTO used until the first round trip has been measured.
    pub initial_rto: Duration,
    /// Floor for the computed RTO. Samples taken before the first tick
    /// measure zero, so the estimate alone can reach zero.
    pub min_rto: Duration,
    /// Ceiling for both the computed RTO and back-off; wins over `min_rto`.
    pub max_rto: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
        }
    }
}

impl TimerConfig {
    pub fn with_initial_rto(mut self, rto: Duration) -> Self {
        self.initial_rto = rto;
        self
    }

    pub fn with_min_rto(mut self, rto: Duration) -> Self {
        self.min_rto = rto;
        self
    }

    pub fn with_max_rto(mut self, rto: Duration) -> Self {
        self.max_rto = rto;
        self
    }

    fn clamp(&self, rto: Duration) -> Duration {
        rto.max(self.min_rto).min(self.max_rto)
    }
}

/// Smoothed round-trip estimate, present once a sample has been taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RttEstimate {
    srtt: Duration,
    rttvar: Duration,
}

impl RttEstimate {
    fn first(sample: Duration) -> Self {
        Self {
            srtt: sample,
            rttvar: sample / 2,
        }
    }

    /// RFC 6298 section 2.3 with alpha = 1/8, beta = 1/4.
    fn update(self, sample: Duration) -> Self {
        Self {
            rttvar: self.rttvar * 3 / 4 + self.srtt.abs_diff(sample) / 4,
            srtt: self.srtt * 7 / 8 + sample / 8,
        }
    }

    fn rto(&self) -> Duration {
        self.srtt + self.rttvar * 4
    }
}

/// Adaptive RTO for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitTimer {
    config: TimerConfig,
    rto: Duration,
    estimate: Option<RttEstimate>,
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        Self::new(TimerConfig::default())
    }
}

impl RetransmitTimer {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            config,
            rto: config.clamp(config.initial_rto),
            estimate: None,
        }
    }

    pub fn config(&self) -> TimerConfig {
        self.config
    }

    /// Timeout currently in force, including any back-off.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.estimate.map(|e| e.srtt)
    }

    pub fn rttvar(&self) -> Option<Duration> {
        self.estimate.map(|e| e.rttvar)
    }

    /// `true` once `waited` has reached the current RTO.
    pub fn expired(&self, waited: Duration) -> bool {
        waited >= self.rto
    }

    /// Fold one round-trip measurement into the estimate and recompute the
    /// RTO, dropping any back-off.
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        self.estimate = Some(match self.estimate {
            Some(e) => e.update(sample),
            None => RttEstimate::first(sample),
        });
        self.reset();
    }

    /// Double the RTO after a timeout, up to `max_rto`.
    pub fn back_off(&mut self) {
        self.rto = self.config.clamp(self.rto * 2);
    }

    /// Drop back-off: the RTO returns to the estimate, or to `initial_rto`
    /// when nothing has been measured yet.
    pub fn reset(&mut self) {
        let base = self.estimate.map_or(self.config.initial_rto, |e| e.rto());
        self.rto = self.config.clamp(base);
    }

    pub(crate) fn write_to(&self, w: &mut Writer) {
        w.u64(micros(self.config.initial_rto))
            .u64(micros(self.config.min_rto))
            .u64(micros(self.config.max_rto))
            .u64(micros(self.rto));
        match self.estimate {
            Some(e) => {
                w.bool(true).u64(micros(e.srtt)).u64(micros(e.rttvar));
            }
            None => {
                w.bool(false);
            }
        }
    }

    pub(crate) fn read_from(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let config = TimerConfig {
            initial_rto: read_micros(r)?,
            min_rto: read_micros(r)?,
            max_rto: read_micros(r)?,
        };
        let rto = read_micros(r)?;
        let estimate = if r.bool()? {
            Some(RttEstimate {
                srtt: read_micros(r)?,
                rttvar: read_micros(r)?,
            })
        } else {
            None
        };
        Ok(Self {
            config,
            rto,
            estimate,
        })
    }
}

pub(crate) fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

fn read_micros(r: &mut Reader<'_>) -> Result<Duration, WireError> {
    r.u64().map(Duration::from_micros)
}
