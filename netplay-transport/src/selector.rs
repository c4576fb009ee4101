//! Path selection for the smart transport.
//!
//! [`RelaySelector::plan`] lists the attempts a smart connect makes, in
//! order: a direct datagram handshake, a direct stream, then one relayed
//! tunnel per usable relay.  The family preference filters every candidate:
//! under dual-stack IPv6 candidates come before IPv4 ones, under a
//! single-family preference the other family is never tried.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::address::{AddressFamily, FamilyPreference, NetworkAddress};
use crate::transport::resolve_candidates;

/// How a smart transport reached (or was reached by) its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// UDP with a Go-Back-N session.
    Datagram,
    /// Direct TCP.
    Stream,
    /// TCP through a relay.
    Relay,
}

impl Strategy {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Datagram => 0,
            Self::Stream => 1,
            Self::Relay => 2,
        }
    }

    pub(crate) fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Datagram),
            1 => Some(Self::Stream),
            2 => Some(Self::Relay),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Datagram => "datagram",
            Self::Stream => "stream",
            Self::Relay => "relay",
        })
    }
}

/// One connection attempt: a strategy and the address it dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub strategy: Strategy,
    /// The destination for direct strategies, the relay for [`Strategy::Relay`].
    pub via: NetworkAddress,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayListError {
    #[error("cannot read relay list {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Relay list plus the family policy that orders candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaySelector {
    relays: Vec<NetworkAddress>,
    preference: FamilyPreference,
    force_relay: bool,
}

impl RelaySelector {
    pub fn new(relays: Vec<NetworkAddress>, preference: FamilyPreference) -> Self {
        Self {
            relays,
            preference,
            force_relay: false,
        }
    }

    /// Skip the direct strategies.
    pub fn with_force_relay(mut self, force: bool) -> Self {
        self.force_relay = force;
        self
    }

    pub fn relays(&self) -> &[NetworkAddress] {
        &self.relays
    }

    pub fn preference(&self) -> FamilyPreference {
        self.preference
    }

    /// Load a relay list.  A missing file is an empty list.
    pub fn from_file(
        path: impl AsRef<Path>,
        preference: FamilyPreference,
    ) -> Result<Self, RelayListError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::new(parse_list(&text), preference)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!("[relay] no relay list at {}; direct paths only", path.display());
                Ok(Self::new(Vec::new(), preference))
            }
            Err(source) => Err(RelayListError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Whether the preference allows `addr` judged by its literal form.
    ///
    /// Hostnames are admitted; resolution filters their records later.
    pub fn admits(&self, addr: &NetworkAddress) -> bool {
        match literal_family(addr) {
            Some(family) => self.preference.admits(family),
            None => true,
        }
    }

    /// Filter resolved records by the preference; dual-stack puts IPv6 first.
    pub fn order_records(&self, records: &[SocketAddr]) -> Vec<SocketAddr> {
        let mut out: Vec<SocketAddr> = records
            .iter()
            .copied()
            .filter(|r| self.preference.admits(AddressFamily::of(&r.ip())))
            .collect();
        out.sort_by_key(|r| r.is_ipv4());
        out
    }

    /// Resolve `via` and order its records for dialing.
    pub async fn resolve_targets(&self, via: &NetworkAddress) -> Vec<SocketAddr> {
        match resolve_candidates(via, self.preference).await {
            Ok(records) => self.order_records(&records),
            Err(e) => {
                log::debug!("[relay] {e}");
                Vec::new()
            }
        }
    }

    /// Attempts for reaching `destination`, in the order they are tried.
    pub fn plan(&self, destination: &NetworkAddress) -> Vec<Attempt> {
        let mut attempts = Vec::new();
        if !self.force_relay {
            for strategy in [Strategy::Datagram, Strategy::Stream] {
                attempts.push(Attempt {
                    strategy,
                    via: destination.clone(),
                });
            }
        }
        let mut relays: Vec<&NetworkAddress> =
            self.relays.iter().filter(|r| self.admits(r)).collect();
        relays.sort_by_key(|r| match literal_family(r) {
            Some(AddressFamily::V6) => 0,
            None => 1,
            Some(AddressFamily::V4) => 2,
        });
        attempts.extend(relays.into_iter().map(|r| Attempt {
            strategy: Strategy::Relay,
            via: r.clone(),
        }));
        attempts
    }
}

/// Family of an address literal; `None` for hostnames.
fn literal_family(addr: &NetworkAddress) -> Option<AddressFamily> {
    if addr.is_ipv6() {
        return Some(AddressFamily::V6);
    }
    addr.host()
        .parse::<IpAddr>()
        .ok()
        .map(|ip| AddressFamily::of(&ip))
}

/// Parse relay-list text: one address per line, `#` starts a comment.
pub fn parse_list(text: &str) -> Vec<NetworkAddress> {
    let mut relays = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        match NetworkAddress::parse(line) {
            Ok(addr) if addr.port() != 0 && !addr.host().is_empty() => relays.push(addr),
            Ok(_) => log::warn!("[relay] line {}: '{line}' needs a host and port", n + 1),
            Err(e) => log::warn!("[relay] line {}: {e}", n + 1),
        }
    }
    relays
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetworkAddress {
        s.parse().unwrap()
    }

    fn vias(plan: &[Attempt]) -> Vec<String> {
        plan.iter().map(|a| a.via.to_string()).collect()
    }

    #[test]
    fn parse_list_skips_comments_and_garbage() {
        let text = "# relays\n\n10.0.0.1:3939\n[2001:db8::1]:3939  # v6\nrelay.example:80\n[::1\nnoport\n";
        let relays = parse_list(text);
        assert_eq!(
            relays,
            vec![
                addr("10.0.0.1:3939"),
                addr("[2001:db8::1]:3939"),
                addr("relay.example:80"),
            ]
        );
    }

    #[test]
    fn plan_tries_direct_paths_first() {
        let sel = RelaySelector::new(vec![addr("10.0.0.1:1")], FamilyPreference::DualStack);
        let plan = sel.plan(&addr("10.0.0.9:3939"));
        let strategies: Vec<_> = plan.iter().map(|a| a.strategy).collect();
        assert_eq!(
            strategies,
            [Strategy::Datagram, Strategy::Stream, Strategy::Relay]
        );
    }

    #[test]
    fn dual_stack_orders_ipv6_relays_first() {
        let relays = vec![
            addr("10.0.0.1:1"),
            addr("relay.example:2"),
            addr("[2001:db8::1]:3"),
        ];
        let sel = RelaySelector::new(relays, FamilyPreference::DualStack).with_force_relay(true);
        assert_eq!(
            vias(&sel.plan(&addr("10.0.0.9:3939"))),
            ["[2001:db8::1]:3", "relay.example:2", "10.0.0.1:1"]
        );
    }

    #[test]
    fn ipv4_only_never_plans_ipv6() {
        let relays = vec![addr("[2001:db8::1]:3"), addr("10.0.0.1:1")];
        let sel = RelaySelector::new(relays, FamilyPreference::Ipv4Only).with_force_relay(true);
        assert_eq!(vias(&sel.plan(&addr("10.0.0.9:3939"))), ["10.0.0.1:1"]);

        let records: Vec<SocketAddr> = vec![
            "[::1]:5".parse().unwrap(),
            "127.0.0.1:5".parse().unwrap(),
        ];
        let v4: SocketAddr = "127.0.0.1:5".parse().unwrap();
        assert_eq!(sel.order_records(&records), vec![v4]);
    }

    #[test]
    fn dual_stack_records_put_ipv6_first() {
        let sel = RelaySelector::new(Vec::new(), FamilyPreference::DualStack);
        let records: Vec<SocketAddr> = vec![
            "127.0.0.1:5".parse().unwrap(),
            "[::1]:5".parse().unwrap(),
        ];
        let ordered = sel.order_records(&records);
        assert!(ordered[0].is_ipv6());
        assert!(ordered[1].is_ipv4());
    }

    #[test]
    fn empty_relay_list_is_direct_only() {
        let sel = RelaySelector::new(Vec::new(), FamilyPreference::DualStack);
        assert_eq!(sel.plan(&addr("10.0.0.9:1")).len(), 2);
        assert!(sel.with_force_relay(true).plan(&addr("10.0.0.9:1")).is_empty());
    }

    #[test]
    fn missing_relay_file_is_empty() {
        let sel = RelaySelector::from_file(
            "/nonexistent/netplay-relays.txt",
            FamilyPreference::DualStack,
        )
        .unwrap();
        assert!(sel.relays().is_empty());
    }
}
