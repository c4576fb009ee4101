//! Transport lifecycle state.
//!
//! ```text
//!   connect()                          listen()
//!      │                                  │
//!      ▼                                  ▼
//!  CONNECTING ──handshake──▶ CONNECTED  LISTENING
//!      │                         │          │
//!      │        disconnect / peer loss      │
//!      └─────────────▶ DISCONNECTED ◀───────┘
//! ```
//!
//! Nothing leaves `Disconnected`; a transport is reconstructed instead.

use std::fmt;

/// All possible states of a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TransportState {
    Listening,
    Connecting,
    Connected,
    #[default]
    Disconnected,
}

impl TransportState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: TransportState) -> bool {
        use TransportState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Listening, Disconnected)
        )
    }

    /// `true` for the states a handoff may capture.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Listening)
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Listening => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Disconnected => 3,
        }
    }

    pub(crate) fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Listening,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnected,
            _ => return None,
        })
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listening => "listening",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
