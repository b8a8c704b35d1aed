//! Address scope classification
//!
//! Search engines occasionally return hosts in private, reserved or
//! documentation ranges (misconfigured banners, NAT leaks). With
//! `skip_non_global` those hosts are still recorded but never handed to an
//! active scanner.
//!
//! # Example
//!
//! ```
//! use grinder_core::ip_utils::{classify_ip, is_global_ip, AddressScope};
//! use std::net::IpAddr;
//!
//! let public_ip: IpAddr = "8.8.8.8".parse().unwrap();
//! assert!(is_global_ip(&public_ip));
//!
//! let private_ip: IpAddr = "192.168.1.1".parse().unwrap();
//! assert_eq!(classify_ip(&private_ip), AddressScope::Private);
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Routing scope of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressScope {
    /// Routable on the public Internet
    Global,
    /// RFC 1918, RFC 6598 shared space or IPv6 unique-local
    Private,
    /// Loopback
    Loopback,
    /// Link-local
    LinkLocal,
    /// Multicast or broadcast
    Multicast,
    /// TEST-NET or 2001:db8::/32
    Documentation,
    /// Unspecified address
    Unspecified,
    /// Benchmarking, protocol assignment, class E and other reserved blocks
    Reserved,
}

impl AddressScope {
    /// Short label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressScope::Global => "global",
            AddressScope::Private => "private",
            AddressScope::Loopback => "loopback",
            AddressScope::LinkLocal => "link-local",
            AddressScope::Multicast => "multicast",
            AddressScope::Documentation => "documentation",
            AddressScope::Unspecified => "unspecified",
            AddressScope::Reserved => "reserved",
        }
    }
}

impl fmt::Display for AddressScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// (network, prefix length, scope) for blocks the standard library does not name
const V4_BLOCKS: &[([u8; 4], u32, AddressScope)] = &[
    ([100, 64, 0, 0], 10, AddressScope::Private),
    ([192, 0, 0, 0], 24, AddressScope::Reserved),
    ([198, 18, 0, 0], 15, AddressScope::Reserved),
    ([240, 0, 0, 0], 4, AddressScope::Reserved),
];

const V6_BLOCKS: &[([u16; 2], u32, AddressScope)] = &[
    ([0xfc00, 0], 7, AddressScope::Private),
    ([0xfe80, 0], 10, AddressScope::LinkLocal),
    ([0x2001, 0x0db8], 32, AddressScope::Documentation),
    // Teredo tunnels
    ([0x2001, 0x0000], 32, AddressScope::Reserved),
];

fn v4_in(ip: &Ipv4Addr, network: [u8; 4], prefix: u32) -> bool {
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    (u32::from(*ip) & mask) == (u32::from(Ipv4Addr::from(network)) & mask)
}

fn v6_in(ip: &Ipv6Addr, network: [u16; 2], prefix: u32) -> bool {
    let top = (u32::from(ip.segments()[0]) << 16) | u32::from(ip.segments()[1]);
    let net = (u32::from(network[0]) << 16) | u32::from(network[1]);
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    (top & mask) == (net & mask)
}

fn classify_ipv4(ip: &Ipv4Addr) -> AddressScope {
    if ip.is_unspecified() {
        AddressScope::Unspecified
    } else if ip.is_loopback() {
        AddressScope::Loopback
    } else if ip.is_private() {
        AddressScope::Private
    } else if ip.is_link_local() {
        AddressScope::LinkLocal
    } else if ip.is_multicast() || ip.is_broadcast() {
        AddressScope::Multicast
    } else if ip.is_documentation() {
        AddressScope::Documentation
    } else {
        V4_BLOCKS
            .iter()
            .find(|(net, prefix, _)| v4_in(ip, *net, *prefix))
            .map_or(AddressScope::Global, |(_, _, scope)| *scope)
    }
}

fn classify_ipv6(ip: &Ipv6Addr) -> AddressScope {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return classify_ipv4(&v4);
    }
    if ip.is_unspecified() {
        AddressScope::Unspecified
    } else if ip.is_loopback() {
        AddressScope::Loopback
    } else if ip.is_multicast() {
        AddressScope::Multicast
    } else if ip.segments()[0] == 0x0100 && ip.segments()[1..4].iter().all(|&s| s == 0) {
        // discard-only 100::/64
        AddressScope::Reserved
    } else {
        V6_BLOCKS
            .iter()
            .find(|(net, prefix, _)| v6_in(ip, *net, *prefix))
            .map_or(AddressScope::Global, |(_, _, scope)| *scope)
    }
}

/// Scope of an address
pub fn classify_ip(ip: &IpAddr) -> AddressScope {
    match ip {
        IpAddr::V4(v4) => classify_ipv4(v4),
        IpAddr::V6(v6) => classify_ipv6(v6),
    }
}

/// Returns true if the address is routable on the public Internet
///
/// ```
/// use grinder_core::ip_utils::is_global_ip;
///
/// assert!(is_global_ip(&"1.1.1.1".parse().unwrap()));
/// assert!(!is_global_ip(&"203.0.113.7".parse().unwrap()));
/// assert!(!is_global_ip(&"fe80::1".parse().unwrap()));
/// ```
pub fn is_global_ip(ip: &IpAddr) -> bool {
    classify_ip(ip) == AddressScope::Global
}
