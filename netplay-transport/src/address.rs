//! Host + port + family value type and the dual-stack resolution policy.
//!
//! A [`NetworkAddress`] is what users type (`127.0.0.1:3939`, `[::1]:3939`,
//! `example.com`) and what the transports key their peers by.  Resolution into
//! OS-level [`SocketAddr`] records is lazy and cached inside the value; any
//! change to host, port or family drops the cache.
//!
//! Resolution consults a [`FamilyPreference`].  The preference is passed in
//! explicitly; the process-wide default ([`FamilyPreference::current`]) is
//! read by value when a [`crate::transport::TransportConfig`] is built, so
//! changing it later never disturbs an in-flight operation.
//!
//! # Textual forms
//!
//! | Input                | Host           | Port | Family |
//! |----------------------|----------------|------|--------|
//! | `127.0.0.1:3939`     | `127.0.0.1`    | 3939 | IPv4   |
//! | `example.com`        | `example.com`  | 0    | IPv4   |
//! | `:3939`              | (any)          | 3939 | IPv4   |
//! | `[::1]:3939`         | `::1`          | 3939 | IPv6   |
//! | `2001:db8::1`        | `2001:db8::1`  | 0    | IPv6   |
//! | `::1:3939`           | `::1`          | 3939 | IPv6   |
//! | `::ffff:192.168.1.1` | unchanged      | 0    | IPv6   |
//!
//! The `::`-prefixed bare form is inherently ambiguous (`::1:2` could be an
//! address or an address plus port).  It is split only when the trailing
//! segment is a decimal port in `1..=65535` *and* the remainder is itself an
//! IPv6 literal; everything else with two or more colons is a bare address.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::wire::{Reader, WireError, Writer};

/// Minimum encoded size of the address wire form:
/// text length(2) + port(2) + family flag(1).
pub const WIRE_MIN_LEN: usize = 5;

// ---------------------------------------------------------------------------
// Family + preference
// ---------------------------------------------------------------------------

/// IP family an address is tagged with.
///
/// The tag is metadata: two addresses with equal host and port compare equal
/// whatever their family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressFamily {
    #[default]
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }
}

/// Which IP families resolution may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FamilyPreference {
    Ipv4Only,
    Ipv6Only,
    /// Both families; IPv6 is tried first where an order matters.
    #[default]
    DualStack,
}

static CURRENT_PREFERENCE: AtomicU8 = AtomicU8::new(FamilyPreference::DualStack as u8);

impl FamilyPreference {
    /// The process-wide default preference.
    pub fn current() -> Self {
        Self::from_u8(CURRENT_PREFERENCE.load(Ordering::Relaxed))
    }

    /// Replace the process-wide default.  Only resolutions started afterwards
    /// observe the change.
    pub fn set_current(self) {
        CURRENT_PREFERENCE.store(self as u8, Ordering::Relaxed);
        log::debug!("[addr] family preference set to {self:?}");
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ipv4Only,
            1 => Self::Ipv6Only,
            _ => Self::DualStack,
        }
    }

    /// `true` if records of `family` may be used under this preference.
    pub fn admits(self, family: AddressFamily) -> bool {
        match self {
            Self::Ipv4Only => family == AddressFamily::V4,
            Self::Ipv6Only => family == AddressFamily::V6,
            Self::DualStack => true,
        }
    }

    /// Loopback literal for internal-only traffic.
    ///
    /// Dual-stack keeps the IPv4 loopback for compatibility with peers that
    /// only listen on IPv4.
    pub fn loopback(self) -> &'static str {
        match self {
            Self::Ipv6Only => "::1",
            Self::Ipv4Only | Self::DualStack => "127.0.0.1",
        }
    }
}

/// Loopback literal for the process-wide preference.
pub fn loopback_address() -> &'static str {
    FamilyPreference::current().loopback()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A textual address could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressFormatError {
    #[error("invalid address '{0}': missing matching bracket")]
    UnmatchedBracket(String),
    #[error("invalid address '{0}': empty port")]
    EmptyPort(String),
    #[error("invalid address '{0}': port is not a number in 0..=65535")]
    InvalidPort(String),
    #[error("invalid address '{0}': no address content")]
    Degenerate(String),
    #[error("invalid address '{0}': unexpected characters after ']'")]
    TrailingGarbage(String),
}

/// Name or address resolution produced no usable records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot resolve '{host}' ({family:?}): {cause}")]
pub struct ResolutionError {
    pub host: String,
    pub family: Lookup,
    pub cause: ResolutionCause,
}

impl ResolutionError {
    /// OS error code, when the resolver reported one.
    pub fn os_code(&self) -> Option<i32> {
        match self.cause {
            ResolutionCause::Resolver { code, .. } => code,
            ResolutionCause::FamilyFiltered { .. } => None,
        }
    }
}

/// Why a [`ResolutionError`] was raised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionCause {
    /// The resolver itself failed.
    #[error("{message}")]
    Resolver {
        kind: io::ErrorKind,
        code: Option<i32>,
        message: String,
    },
    /// Records came back, but none of the requested family.
    #[error("none of {discarded} record(s) is of the requested family")]
    FamilyFiltered { discarded: usize },
}

impl From<&io::Error> for ResolutionCause {
    fn from(e: &io::Error) -> Self {
        Self::Resolver {
            kind: e.kind(),
            code: e.raw_os_error(),
            message: e.to_string(),
        }
    }
}

/// Family restriction applied to one resolver query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Any,
    V4Only,
    V6Only,
}

impl Lookup {
    fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4Only => addr.is_ipv4(),
            Self::V6Only => addr.is_ipv6(),
        }
    }
}

// ---------------------------------------------------------------------------
// NetworkAddress
// ---------------------------------------------------------------------------

/// Host, port and family, with a lazily populated resolution cache.
#[derive(Debug, Clone, Default)]
pub struct NetworkAddress {
    host: String,
    port: u16,
    family: AddressFamily,
    resolved: Option<Vec<SocketAddr>>,
}

impl NetworkAddress {
    /// Build from a raw host and port.  Hosts containing `:` are tagged IPv6.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let family = if host.contains(':') {
            AddressFamily::V6
        } else {
            AddressFamily::V4
        };
        Self {
            host,
            port,
            family,
            resolved: None,
        }
    }

    /// Bind-any address on `port` (empty host).
    pub fn any(port: u16) -> Self {
        Self::new("", port)
    }

    /// Parse one of the accepted textual forms (see the module docs).
    pub fn parse(text: &str) -> Result<Self, AddressFormatError> {
        let fail = |make: fn(String) -> AddressFormatError| make(text.to_owned());

        if text.is_empty() {
            return Ok(Self::default());
        }

        if let Some(rest) = text.strip_prefix('[') {
            let close = rest
                .find(']')
                .ok_or_else(|| fail(AddressFormatError::UnmatchedBracket))?;
            let host = &rest[..close];
            if !has_content(host) {
                return Err(fail(AddressFormatError::Degenerate));
            }
            let tail = &rest[close + 1..];
            let port = if tail.is_empty() {
                0
            } else if let Some(port) = tail.strip_prefix(':') {
                parse_port(port, text)?
            } else {
                return Err(fail(AddressFormatError::TrailingGarbage));
            };
            return Ok(Self::tagged(host, port, AddressFamily::V6));
        }

        if text.contains(']') {
            return Err(fail(AddressFormatError::UnmatchedBracket));
        }

        match text.matches(':').count() {
            0 => {
                if !has_content(text) {
                    return Err(fail(AddressFormatError::Degenerate));
                }
                Ok(Self::tagged(text, 0, AddressFamily::V4))
            }
            1 => {
                let (host, port) = text
                    .split_once(':')
                    .ok_or_else(|| fail(AddressFormatError::EmptyPort))?;
                let port = parse_port(port, text)?;
                if !host.is_empty() && !has_content(host) {
                    return Err(fail(AddressFormatError::Degenerate));
                }
                Ok(Self::tagged(host, port, AddressFamily::V4))
            }
            _ => {
                if let Some((host, port)) = split_compact_v6(text) {
                    return Ok(Self::tagged(host, port, AddressFamily::V6));
                }
                if text.ends_with(':') && text.parse::<Ipv6Addr>().is_err() {
                    return Err(fail(AddressFormatError::EmptyPort));
                }
                if !has_content(text) {
                    return Err(fail(AddressFormatError::Degenerate));
                }
                Ok(Self::tagged(text, 0, AddressFamily::V6))
            }
        }
    }

    fn tagged(host: &str, port: u16, family: AddressFamily) -> Self {
        Self {
            host: host.to_owned(),
            port,
            family,
            resolved: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn is_ipv6(&self) -> bool {
        self.family == AddressFamily::V6
    }

    /// `true` when both host and port are unset.
    pub fn is_empty(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }

    pub fn is_loopback(&self) -> bool {
        self.host == "localhost"
            || self
                .host
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
        self.invalidate();
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
        self.invalidate();
    }

    pub fn set_family(&mut self, family: AddressFamily) {
        self.family = family;
        self.invalidate();
    }

    pub fn clear(&mut self) {
        self.host.clear();
        self.port = 0;
        self.invalidate();
    }

    /// Drop any cached resolution.
    pub fn invalidate(&mut self) {
        self.resolved = None;
    }

    /// Cached records from an earlier [`resolve`](Self::resolve), if any.
    pub fn resolved(&self) -> Option<&[SocketAddr]> {
        self.resolved.as_deref()
    }

    /// Resolve into OS address records, caching the result.
    ///
    /// Blocks the calling thread on the system resolver for host names;
    /// async callers use [`resolve_async`](Self::resolve_async).
    pub fn resolve(
        &mut self,
        preference: FamilyPreference,
    ) -> Result<&[SocketAddr], ResolutionError> {
        if self.resolved.is_none() {
            let records = self.lookup_records(preference)?;
            log::debug!(
                "[addr] resolved '{self}' under {preference:?} -> {records:?}"
            );
            self.resolved = Some(records);
        }
        Ok(self.resolved.as_deref().unwrap_or(&[]))
    }

    /// Same as [`resolve`](Self::resolve), but the resolver query runs on
    /// tokio's blocking pool instead of the calling thread.
    pub async fn resolve_async(
        &mut self,
        preference: FamilyPreference,
    ) -> Result<&[SocketAddr], ResolutionError> {
        if self.resolved.is_none() {
            let records = match self.query(preference) {
                Query::Ready(records) => records,
                Query::Lookups(order) => {
                    let mut found = None;
                    let mut last = None;
                    for family in order {
                        match lookup_async(&self.host, self.port, *family).await {
                            Ok(records) => {
                                found = Some(records);
                                break;
                            }
                            Err(err) => {
                                log::debug!("[addr] {err}");
                                last = Some(err);
                            }
                        }
                    }
                    match found {
                        Some(records) => records,
                        None => return Err(last.unwrap_or_else(|| self.no_query())),
                    }
                }
            };
            log::debug!(
                "[addr] resolved '{self}' under {preference:?} -> {records:?}"
            );
            self.resolved = Some(records);
        }
        Ok(self.resolved.as_deref().unwrap_or(&[]))
    }

    /// Lookups to run, in order, until one yields records.
    ///
    /// 1. an IPv6-tagged address resolves IPv6-only;
    /// 2. an empty host yields the bind-any address(es) of `preference`;
    /// 3. otherwise `preference` decides; dual-stack runs an unrestricted
    ///    lookup and falls back to IPv4-only if that lookup fails.
    fn query(&self, preference: FamilyPreference) -> Query {
        if self.family == AddressFamily::V6 {
            return Query::Lookups(&[Lookup::V6Only]);
        }
        if self.host.is_empty() {
            return Query::Ready(bind_any(preference, self.port));
        }
        Query::Lookups(match preference {
            FamilyPreference::Ipv4Only => &[Lookup::V4Only],
            FamilyPreference::Ipv6Only => &[Lookup::V6Only],
            FamilyPreference::DualStack => &[Lookup::Any, Lookup::V4Only],
        })
    }

    fn lookup_records(
        &self,
        preference: FamilyPreference,
    ) -> Result<Vec<SocketAddr>, ResolutionError> {
        match self.query(preference) {
            Query::Ready(records) => Ok(records),
            Query::Lookups(order) => {
                let mut last = None;
                for family in order {
                    match lookup(&self.host, self.port, *family) {
                        Ok(records) => return Ok(records),
                        Err(err) => {
                            log::debug!("[addr] {err}");
                            last = Some(err);
                        }
                    }
                }
                Err(last.unwrap_or_else(|| self.no_query()))
            }
        }
    }

    fn no_query(&self) -> ResolutionError {
        ResolutionError {
            host: self.host.clone(),
            family: Lookup::Any,
            cause: ResolutionCause::FamilyFiltered { discarded: 0 },
        }
    }

    // -----------------------------------------------------------------------
    // Wire form
    // -----------------------------------------------------------------------

    /// Append the wire form: text, port, family flag (1 = IPv4).
    pub fn write_to(&self, w: &mut Writer) {
        w.text(&self.host)
            .u16(self.port)
            .u8(u8::from(self.family == AddressFamily::V4));
    }

    pub fn read_from(r: &mut Reader<'_>) -> Result<Self, WireError> {
        if r.remaining() < WIRE_MIN_LEN {
            return Err(WireError::Truncated {
                offset: 0,
                needed: WIRE_MIN_LEN - r.remaining(),
            });
        }
        let host = r.text()?;
        let port = r.u16()?;
        let family = match r.u8()? {
            1 => AddressFamily::V4,
            0 => AddressFamily::V6,
            v => {
                return Err(WireError::InvalidValue {
                    field: "address family",
                    value: u64::from(v),
                })
            }
        };
        Ok(Self {
            host,
            port,
            family,
            resolved: None,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write_to(&mut w);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let addr = Self::read_from(&mut r)?;
        r.finish()?;
        Ok(addr)
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(sa: SocketAddr) -> Self {
        Self {
            host: sa.ip().to_string(),
            port: sa.port(),
            family: AddressFamily::of(&sa.ip()),
            resolved: Some(vec![sa]),
        }
    }
}

impl FromStr for NetworkAddress {
    type Err = AddressFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for NetworkAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for NetworkAddress {}

impl Hash for NetworkAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        match (self.family, self.port) {
            (AddressFamily::V6, p) if p > 0 => write!(f, "[{}]:{}", self.host, p),
            (_, 0) => f.write_str(&self.host),
            (_, p) => write!(f, "{}:{}", self.host, p),
        }
    }
}

/// Format `host` and `port` with IPv6 bracketing where needed.
pub fn format_with_port(host: &str, port: u16) -> String {
    NetworkAddress::new(host, port).to_string()
}

// ---------------------------------------------------------------------------
// External address label
// ---------------------------------------------------------------------------

/// Best-effort public address reported by an external discovery service.
///
/// The transport never parses it; it is only shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExternalIp {
    Known(String),
    #[default]
    Unknown,
}

impl ExternalIp {
    pub const UNKNOWN: &'static str = "Unknown";

    pub fn from_report(report: &str) -> Self {
        match report.trim() {
            "" | Self::UNKNOWN => Self::Unknown,
            s => Self::Known(s.to_owned()),
        }
    }
}

impl fmt::Display for ExternalIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(s) => f.write_str(s),
            Self::Unknown => f.write_str(Self::UNKNOWN),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn has_content(host: &str) -> bool {
    host.chars().any(|c| c.is_ascii_alphanumeric()) || host.parse::<IpAddr>().is_ok()
}

fn parse_port(text: &str, original: &str) -> Result<u16, AddressFormatError> {
    if text.is_empty() {
        return Err(AddressFormatError::EmptyPort(original.to_owned()));
    }
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressFormatError::InvalidPort(original.to_owned()));
    }
    text.parse::<u16>()
        .map_err(|_| AddressFormatError::InvalidPort(original.to_owned()))
}

/// `::1:3939` style: `::` prefix, numeric trailing port, IPv6 remainder.
fn split_compact_v6(text: &str) -> Option<(&str, u16)> {
    if !text.starts_with("::") {
        return None;
    }
    let (host, port) = text.rsplit_once(':')?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let port = port.parse::<u16>().ok().filter(|p| *p >= 1)?;
    host.parse::<Ipv6Addr>().ok()?;
    Some((host, port))
}

fn bind_any(preference: FamilyPreference, port: u16) -> Vec<SocketAddr> {
    let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    match preference {
        FamilyPreference::Ipv4Only => vec![v4],
        FamilyPreference::Ipv6Only => vec![v6],
        FamilyPreference::DualStack => vec![v6, v4],
    }
}

enum Query {
    Ready(Vec<SocketAddr>),
    Lookups(&'static [Lookup]),
}

fn lookup(host: &str, port: u16, family: Lookup) -> Result<Vec<SocketAddr>, ResolutionError> {
    admit(host, family, (host, port).to_socket_addrs())
}

async fn lookup_async(
    host: &str,
    port: u16,
    family: Lookup,
) -> Result<Vec<SocketAddr>, ResolutionError> {
    admit(host, family, tokio::net::lookup_host((host, port)).await)
}

/// Keep the records of `family`; an empty result is an error.
fn admit(
    host: &str,
    family: Lookup,
    found: io::Result<impl Iterator<Item = SocketAddr>>,
) -> Result<Vec<SocketAddr>, ResolutionError> {
    let fail = |cause| ResolutionError {
        host: host.to_owned(),
        family,
        cause,
    };
    let all: Vec<SocketAddr> = found.map_err(|e| fail(ResolutionCause::from(&e)))?.collect();
    let discarded = all.len();
    let records: Vec<SocketAddr> = all.into_iter().filter(|sa| family.admits(sa)).collect();
    if records.is_empty() {
        return Err(fail(ResolutionCause::FamilyFiltered { discarded }));
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> NetworkAddress {
        NetworkAddress::parse(s).unwrap()
    }

    #[test]
    fn ipv4_with_port() {
        let a = parse("127.0.0.1:3939");
        assert_eq!(a.host(), "127.0.0.1");
        assert_eq!(a.port(), 3939);
        assert_eq!(a.family(), AddressFamily::V4);
        assert_eq!(a.to_string(), "127.0.0.1:3939");
    }

    #[test]
    fn ipv4_without_port() {
        let a = parse("192.168.1.1");
        assert_eq!(a.host(), "192.168.1.1");
        assert_eq!(a.port(), 0);
        assert_eq!(a.to_string(), "192.168.1.1");
    }

    #[test]
    fn hostname_forms() {
        let a = parse("localhost:3939");
        assert_eq!((a.host(), a.port()), ("localhost", 3939));
        assert_eq!(a.family(), AddressFamily::V4);

        let b = parse("example.com");
        assert_eq!((b.host(), b.port()), ("example.com", 0));
    }

    #[test]
    fn bracketed_ipv6() {
        let a = parse("[::1]:3939");
        assert_eq!(a.host(), "::1");
        assert_eq!(a.port(), 3939);
        assert_eq!(a.family(), AddressFamily::V6);
        assert_eq!(a.to_string(), "[::1]:3939");

        let b = parse("[2001:db8::1]:8080");
        assert_eq!(b.host(), "2001:db8::1");
        assert_eq!(b.to_string(), "[2001:db8::1]:8080");
    }

    #[test]
    fn bracketed_ipv6_without_port_formats_bare() {
        let a = parse("[fe80::1]");
        assert_eq!(a.port(), 0);
        assert_eq!(a.to_string(), "fe80::1");
    }

    #[test]
    fn bare_ipv6() {
        for s in ["2001:db8::1", "::1", "::ffff:192.168.1.1", "::"] {
            let a = parse(s);
            assert_eq!(a.host(), s);
            assert_eq!(a.port(), 0);
            assert_eq!(a.family(), AddressFamily::V6);
            assert_eq!(a.to_string(), s);
        }
    }

    #[test]
    fn compact_ipv6_with_port() {
        let a = parse("::1:3939");
        assert_eq!(a.host(), "::1");
        assert_eq!(a.port(), 3939);
        assert_eq!(a.family(), AddressFamily::V6);
        assert_eq!(a.to_string(), "[::1]:3939");
    }

    #[test]
    fn ambiguous_short_form_stays_an_address() {
        // ':' alone is not an IPv6 literal, so nothing is split off.
        let a = parse("::80");
        assert_eq!(a.host(), "::80");
        assert_eq!(a.port(), 0);
    }

    #[test]
    fn port_only_means_bind_any() {
        let a = parse(":3939");
        assert_eq!(a.host(), "");
        assert_eq!(a.port(), 3939);
        assert_eq!(a.to_string(), ":3939");
        assert_eq!(parse(&a.to_string()), a);
    }

    #[test]
    fn empty_text_is_empty_address() {
        let a = parse("");
        assert!(a.is_empty());
        assert_eq!(a.to_string(), "");
    }

    #[test]
    fn malformed_inputs() {
        use AddressFormatError::*;
        let check = |input: &str, make: fn(String) -> AddressFormatError| {
            assert_eq!(
                NetworkAddress::parse(input),
                Err(make(input.to_owned())),
                "input {input:?}"
            );
        };
        check("[::1", UnmatchedBracket);
        check("::1]:80", UnmatchedBracket);
        check("[::1]:", EmptyPort);
        check("[::1]:http", InvalidPort);
        check("[::1]x", TrailingGarbage);
        check("[]:80", Degenerate);
        check("127.0.0.1:", EmptyPort);
        check("127.0.0.1:abc", InvalidPort);
        check("127.0.0.1:70000", InvalidPort);
        check("host:-1", InvalidPort);
        check("..:80", Degenerate);
        check("...", Degenerate);
        check(":::", EmptyPort);
    }

    #[test]
    fn canonical_round_trip() {
        for s in [
            "127.0.0.1:3939",
            "192.168.1.1",
            "localhost:80",
            "[::1]:3939",
            "::1:3939",
            "2001:db8::1",
            "::ffff:192.168.1.1",
            "[2001:db8::1]:8080",
            ":4000",
        ] {
            let once = parse(s);
            let twice = parse(&once.to_string());
            assert_eq!(twice, once, "input {s:?}");
            assert_eq!(twice.family(), once.family(), "input {s:?}");
        }
    }

    #[test]
    fn equality_ignores_family() {
        let mut a = NetworkAddress::new("host", 1);
        let b = a.clone();
        a.set_family(AddressFamily::V6);
        assert_eq!(a, b);

        use std::collections::hash_map::DefaultHasher;
        let h = |x: &NetworkAddress| {
            let mut s = DefaultHasher::new();
            x.hash(&mut s);
            s.finish()
        };
        assert_eq!(h(&a), h(&b));
    }

    #[test]
    fn from_socket_addr() {
        let v4: SocketAddr = "10.0.0.7:1234".parse().unwrap();
        let a = NetworkAddress::from(v4);
        assert_eq!((a.host(), a.port(), a.family()), ("10.0.0.7", 1234, AddressFamily::V4));
        assert_eq!(a.resolved(), Some(&[v4][..]));

        let v6: SocketAddr = "[::1]:99".parse().unwrap();
        let b = NetworkAddress::from(v6);
        assert_eq!((b.host(), b.port(), b.family()), ("::1", 99, AddressFamily::V6));
        assert_eq!(b.to_string(), "[::1]:99");
    }

    #[test]
    fn mutation_invalidates_cache() {
        let mut a = parse("127.0.0.1:5000");
        a.resolve(FamilyPreference::DualStack).unwrap();
        assert!(a.resolved().is_some());
        a.set_port(5001);
        assert!(a.resolved().is_none());
        a.resolve(FamilyPreference::DualStack).unwrap();
        a.set_host("127.0.0.2");
        assert!(a.resolved().is_none());
        a.resolve(FamilyPreference::DualStack).unwrap();
        a.clear();
        assert!(a.resolved().is_none());
    }

    #[test]
    fn ipv6_only_rejects_ipv4_literal() {
        let mut a = parse("127.0.0.1:3939");
        let err = a.resolve(FamilyPreference::Ipv6Only).unwrap_err();
        assert_eq!(err.host, "127.0.0.1");
        assert_eq!(err.family, Lookup::V6Only);
        assert_eq!(err.cause, ResolutionCause::FamilyFiltered { discarded: 1 });
        assert_eq!(err.os_code(), None);
    }

    #[test]
    fn resolver_failure_keeps_os_error() {
        let e = io::Error::from_raw_os_error(11);
        let err = admit("example.invalid", Lookup::Any, Err::<std::vec::IntoIter<SocketAddr>, _>(e))
            .unwrap_err();
        assert_eq!(err.os_code(), Some(11));
        match err.cause {
            ResolutionCause::Resolver { kind, code, .. } => {
                assert_eq!(kind, io::Error::from_raw_os_error(11).kind());
                assert_eq!(code, Some(11));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn async_resolution_matches_blocking() {
        let mut a = parse("127.0.0.1:3939");
        let records = a.resolve_async(FamilyPreference::Ipv4Only).await.unwrap().to_vec();
        assert_eq!(records, vec!["127.0.0.1:3939".parse::<SocketAddr>().unwrap()]);

        let mut b = parse("127.0.0.1:3939");
        let err = b.resolve_async(FamilyPreference::Ipv6Only).await.unwrap_err();
        assert_eq!(err.cause, ResolutionCause::FamilyFiltered { discarded: 1 });
    }

    #[test]
    fn ipv6_only_resolves_loopback_and_any() {
        let mut lo = NetworkAddress::new("::1", 3939);
        let records = lo.resolve(FamilyPreference::Ipv6Only).unwrap();
        assert!(!records.is_empty());
        assert!(records.iter().all(SocketAddr::is_ipv6));

        let mut any = NetworkAddress::any(3939);
        let records = any.resolve(FamilyPreference::Ipv6Only).unwrap();
        assert_eq!(records, &["[::]:3939".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn ipv6_tag_overrides_ipv4_preference() {
        let mut a = parse("[::1]:3939");
        let records = a.resolve(FamilyPreference::Ipv4Only).unwrap();
        assert!(records.iter().all(SocketAddr::is_ipv6));
    }

    #[test]
    fn dual_stack_bind_any_lists_ipv6_first() {
        let mut a = NetworkAddress::any(7);
        let records = a.resolve(FamilyPreference::DualStack).unwrap().to_vec();
        assert_eq!(records.len(), 2);
        assert!(records[0].is_ipv6());
        assert!(records[1].is_ipv4());
    }

    #[test]
    fn ipv4_only_resolves_literal() {
        let mut a = parse("127.0.0.1:3939");
        let records = a.resolve(FamilyPreference::Ipv4Only).unwrap();
        assert_eq!(records, &["127.0.0.1:3939".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn loopback_per_preference() {
        assert_eq!(FamilyPreference::Ipv4Only.loopback(), "127.0.0.1");
        assert_eq!(FamilyPreference::DualStack.loopback(), "127.0.0.1");
        assert_eq!(FamilyPreference::Ipv6Only.loopback(), "::1");
    }

    #[test]
    fn preference_admits() {
        assert!(FamilyPreference::DualStack.admits(AddressFamily::V6));
        assert!(!FamilyPreference::Ipv4Only.admits(AddressFamily::V6));
        assert!(!FamilyPreference::Ipv6Only.admits(AddressFamily::V4));
    }

    #[test]
    fn wire_form() {
        let a = parse("[::1]:3939");
        let bytes = a.encode();
        assert_eq!(bytes.len(), WIRE_MIN_LEN + 3);
        let b = NetworkAddress::decode(&bytes).unwrap();
        assert_eq!(b, a);
        assert_eq!(b.family(), AddressFamily::V6);
    }

    #[test]
    fn wire_form_rejects_short_payload() {
        assert!(matches!(
            NetworkAddress::decode(&[0, 0, 1]),
            Err(WireError::Truncated { .. })
        ));
        // Declares 4 text bytes but carries 2.
        assert!(NetworkAddress::decode(&[0, 4, b'a', b'b', 0, 1, 1]).is_err());
    }

    #[test]
    fn external_ip_label() {
        assert_eq!(ExternalIp::from_report("Unknown"), ExternalIp::Unknown);
        assert_eq!(ExternalIp::from_report(""), ExternalIp::Unknown);
        assert_eq!(
            ExternalIp::from_report("203.0.113.9\n").to_string(),
            "203.0.113.9"
        );
        assert_eq!(ExternalIp::Unknown.to_string(), "Unknown");
    }

    #[test]
    fn format_with_port_brackets_ipv6() {
        assert_eq!(format_with_port("::1", 80), "[::1]:80");
        assert_eq!(format_with_port("10.1.1.1", 80), "10.1.1.1:80");
        assert_eq!(format_with_port("::1", 0), "::1");
    }
}
