//! Client IP extraction from proxy headers.
//!
//! `X-Forwarded-For` is read before `X-Real-Ip`. Each header is split on
//! commas and the first public IPv4 address wins. Addresses in private or
//! shared ranges are skipped so that internal hops never end up in the
//! click log.

use axum::http::HeaderMap;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

const PROXY_HEADERS: [&str; 2] = ["x-forwarded-for", "x-real-ip"];

static PRIVATE_RANGES: LazyLock<Vec<Ipv4Net>> = LazyLock::new(|| {
    [
        Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8),
        Ipv4Net::new(Ipv4Addr::new(100, 64, 0, 0), 10),
        Ipv4Net::new(Ipv4Addr::new(172, 16, 0, 0), 12),
        Ipv4Net::new(Ipv4Addr::new(192, 0, 0, 0), 24),
        Ipv4Net::new(Ipv4Addr::new(192, 168, 0, 0), 16),
        Ipv4Net::new(Ipv4Addr::new(198, 18, 0, 0), 15),
    ]
    .into_iter()
    .flatten()
    .collect()
});

/// True for a unicast address outside every private range
pub fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    if ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_link_local()
    {
        return false;
    }
    !PRIVATE_RANGES.iter().any(|net| net.contains(&ip))
}

/// The client's public IPv4 address, if a proxy header carries one
pub fn extract_client_ip(headers: &HeaderMap) -> Option<Ipv4Addr> {
    PROXY_HEADERS.iter().find_map(|name| {
        headers
            .get_all(*name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(|candidate| candidate.trim().parse::<Ipv4Addr>().ok())
            .find(|ip| is_public_ipv4(*ip))
    })
}
