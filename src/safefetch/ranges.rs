//! Private, loopback, link-local, and other non-routable address ranges
//! that `SafeFetch` must never connect to.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    matches!(o[0], 10)                                   // 10.0.0.0/8
        || matches!(o[0], 127)                            // 127.0.0.0/8
        || (o[0] == 169 && o[1] == 254)                   // 169.254.0.0/16
        || (o[0] == 172 && (16..=31).contains(&o[1]))     // 172.16.0.0/12
        || (o[0] == 192 && o[1] == 168)                   // 192.168.0.0/16
        || matches!(o[0], 0)                              // 0.0.0.0/8
        || (o[0] == 100 && (64..=127).contains(&o[1]))    // 100.64.0.0/10 (CGNAT)
        || (o[0] == 198 && (18..=19).contains(&o[1]))     // 198.18.0.0/15 (benchmark)
        || (224..=239).contains(&o[0])                    // 224.0.0.0/4 (multicast)
        || o[0] >= 240                                    // 240.0.0.0/4 (reserved) + 255.255.255.255
        || ip.is_broadcast()
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&v4);
    }
    let segments = ip.segments();
    // fc00::/7 unique local
    if segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }
    // fe80::/10 link-local
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4(s: &str) -> IpAddr {
        IpAddr::V4(s.parse().unwrap())
    }

    fn ipv6(s: &str) -> IpAddr {
        IpAddr::V6(s.parse().unwrap())
    }

    #[test]
    fn ipv4_private_ranges_are_flagged() {
        for addr in [
            "10.1.2.3",
            "127.0.0.1",
            "169.254.1.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.0.1",
            "0.0.0.0",
            "100.64.0.1",
            "100.127.255.255",
            "198.18.0.1",
            "224.0.0.1",
            "255.255.255.255",
        ] {
            assert!(is_private_ip(&ipv4(addr)), "{addr} should be private");
        }
    }

    #[test]
    fn ipv4_public_addresses_pass() {
        for addr in ["8.8.8.8", "93.184.216.34", "1.1.1.1"] {
            assert!(!is_private_ip(&ipv4(addr)), "{addr} should be public");
        }
    }

    #[test]
    fn ipv4_boundary_172_15_and_172_32_are_public() {
        assert!(!is_private_ip(&ipv4("172.15.255.255")));
        assert!(!is_private_ip(&ipv4("172.32.0.0")));
    }

    #[test]
    fn ipv6_loopback_and_ula_and_link_local_are_flagged() {
        assert!(is_private_ip(&ipv6("::1")));
        assert!(is_private_ip(&ipv6("fc00::1")));
        assert!(is_private_ip(&ipv6("fd12:3456::1")));
        assert!(is_private_ip(&ipv6("fe80::1")));
    }

    #[test]
    fn ipv6_mapped_private_ipv4_is_flagged() {
        assert!(is_private_ip(&ipv6("::ffff:10.0.0.1")));
    }

    #[test]
    fn ipv6_public_address_passes() {
        assert!(!is_private_ip(&ipv6("2606:4700:4700::1111")));
    }
}
