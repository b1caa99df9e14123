use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;
use tracing::debug;

/// Ordered allowlist of CIDR ranges permitted to assert a username through
/// the reverse-proxy header.
#[derive(Debug, Clone, Default)]
pub struct TrustList {
    nets: Vec<IpNet>,
}

impl TrustList {
    /// Parse a comma-separated CIDR list. Malformed entries are skipped.
    pub fn parse(list: &str) -> Self {
        let nets = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| match entry.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(_) => {
                    debug!(entry, "skipping malformed CIDR in trust list");
                    None
                }
            })
            .collect();
        Self { nets }
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// True when `addr` (optionally `host:port`) falls inside one of the ranges.
    /// An empty list never trusts anything.
    pub fn contains(&self, addr: &str) -> bool {
        if self.nets.is_empty() {
            return false;
        }
        let Some(ip) = normalize_addr(addr) else {
            return false;
        };
        self.nets.iter().any(|net| net.contains(&ip))
    }
}

/// Checks `addr` against a comma-separated CIDR list.
pub fn validate_ip_against_list(addr: &str, comma_separated: &str) -> bool {
    TrustList::parse(comma_separated).contains(addr)
}

/// Strip an optional port and brackets, returning the bare host address.
/// IPv4-mapped IPv6 addresses collapse to IPv4 so they match IPv4 ranges.
fn normalize_addr(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    if addr.is_empty() {
        return None;
    }

    let ip = if let Ok(ip) = addr.parse::<IpAddr>() {
        ip
    } else if let Ok(sock) = addr.parse::<SocketAddr>() {
        sock.ip()
    } else {
        let (host, _port) = addr.rsplit_once(':')?;
        let host = host.trim_matches(|c| c == '[' || c == ']');
        if host.is_empty() {
            return None;
        }
        host.parse::<IpAddr>().ok()?
    };

    Some(match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    })
}
