//! Detection of non-routable ("bogon") addresses.
//!
//! Peers announcing from such addresses are silently ignored, they would only
//! pollute the peer store of everyone querying us.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Returns `true` if `address` should never be handed out to other peers.
pub fn is_bogon(address: &SocketAddr) -> bool {
    if address.port() == 0 {
        return true;
    }

    match address.ip() {
        IpAddr::V4(ip) => is_bogon_v4(&ip),
        IpAddr::V6(ip) => is_bogon_v6(&ip),
    }
}

fn is_bogon_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();

    octets[0] == 0
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_documentation()
        // 100.64.0.0/10 carrier-grade NAT
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // 240.0.0.0/4 reserved
        || octets[0] >= 240
}

fn is_bogon_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();

    ip.is_loopback()
        || ip.is_multicast()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (segments[0] & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
}
