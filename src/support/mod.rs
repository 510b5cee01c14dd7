//! Support/Gate Engine: horizon/feature/window gating for schedule attempts,
//! plus the LNURL-verify invoice lifecycle used when payment mode requires
//! settlement before unlocking a user.

pub mod gate;
pub mod lnurl;
pub mod poller;

use std::net::IpAddr;

pub use gate::{evaluate, Feature, GateDecision, SupportPolicy, SupportState};

/// IPv4/IPv6 ranges that must never be reachable from the LNURL invoice
/// fetcher or accepted as a relay host outside loadtest mode: loopback,
/// link-local, private (RFC1918), CGNAT (100.64.0.0/10), and documentation
/// ranges are all folded into "private or reserved" for simplicity.
pub fn is_private_or_reserved_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() || v4.is_link_local() || v4.is_private() || v4.is_broadcast()
                || v4.is_documentation() || v4.is_unspecified()
            {
                return true;
            }
            let octets = v4.octets();
            // 100.64.0.0/10 (carrier-grade NAT)
            if octets[0] == 100 && (64..=127).contains(&octets[1]) {
                return true;
            }
            false
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            // fc00::/7 unique local, fe80::/10 link local
            let segments = v6.segments();
            if (segments[0] & 0xfe00) == 0xfc00 {
                return true;
            }
            if (segments[0] & 0xffc0) == 0xfe80 {
                return true;
            }
            // IPv4-mapped addresses inherit the IPv4 check.
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_or_reserved_ip(&IpAddr::V4(v4));
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_loopback_and_private_v4() {
        assert!(is_private_or_reserved_ip(&"127.0.0.1".parse().unwrap()));
        assert!(is_private_or_reserved_ip(&"10.0.0.5".parse().unwrap()));
        assert!(is_private_or_reserved_ip(&"192.168.1.1".parse().unwrap()));
        assert!(is_private_or_reserved_ip(&"100.64.0.1".parse().unwrap()));
        assert!(!is_private_or_reserved_ip(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn flags_loopback_and_unique_local_v6() {
        assert!(is_private_or_reserved_ip(&"::1".parse().unwrap()));
        assert!(is_private_or_reserved_ip(&"fc00::1".parse().unwrap()));
        assert!(is_private_or_reserved_ip(&"fe80::1".parse().unwrap()));
        assert!(!is_private_or_reserved_ip(&"2001:4860:4860::8888".parse().unwrap()));
    }
}
