//! WebSocket handshake gating.
//!
//! All gates default to open; production deployments are expected to enforce
//! access at the reverse proxy and use these as a second layer. A non-empty
//! allowlist that parses to zero valid networks denies everything rather than
//! failing open.

use std::collections::HashMap;
use std::net::IpAddr;

/// Comma-separated CIDR allowlist check.
///
/// - Empty list allows all.
/// - Invalid remote address denies.
/// - Non-empty list with no valid entries denies.
pub fn is_ip_allowed(remote_ip: &str, cidrs: &str) -> bool {
    let cidrs = cidrs.trim();
    if cidrs.is_empty() {
        return true;
    }
    let Ok(ip) = remote_ip.trim().parse::<IpAddr>() else {
        return false;
    };
    let networks: Vec<(IpAddr, u8)> = cidrs.split(',').filter_map(parse_cidr).collect();
    if networks.is_empty() {
        return false;
    }
    networks
        .iter()
        .any(|(net, prefix)| ip_in_network(ip, *net, *prefix))
}

fn parse_cidr(raw: &str) -> Option<(IpAddr, u8)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.split_once('/') {
        Some((addr, prefix)) => {
            let addr = addr.trim().parse::<IpAddr>().ok()?;
            let prefix = prefix.trim().parse::<u8>().ok()?;
            let max = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            (prefix <= max).then_some((addr, prefix))
        }
        None => {
            let addr = raw.parse::<IpAddr>().ok()?;
            let prefix = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Some((addr, prefix))
        }
    }
}

fn ip_in_network(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix as u32)
            };
            (u32::from(ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix as u32)
            };
            (u128::from(ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}

/// Resolve the effective client address, honoring `X-Forwarded-For` only when
/// the direct peer is a trusted proxy.
pub fn resolve_client_ip(
    remote_ip: &str,
    headers: &HashMap<String, String>,
    trusted_proxy_enabled: bool,
    trusted_proxy_cidrs: &str,
) -> String {
    if !trusted_proxy_enabled {
        return remote_ip.to_string();
    }
    if trusted_proxy_cidrs.trim().is_empty() || !is_ip_allowed(remote_ip, trusted_proxy_cidrs) {
        return remote_ip.to_string();
    }
    let forwarded = header_lookup(headers, "x-forwarded-for");
    match forwarded
        .and_then(|v| v.split(',').next().map(str::trim))
        .filter(|v| !v.is_empty())
    {
        Some(client) => client.to_string(),
        None => remote_ip.to_string(),
    }
}

fn header_lookup<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Optional shared-secret header gate. Empty secret allows all.
pub fn verify_shared_secret(
    headers: &HashMap<String, String>,
    header: &str,
    secret: &str,
) -> bool {
    let secret = secret.trim();
    if secret.is_empty() {
        return true;
    }
    let header = header.trim();
    if header.is_empty() {
        return false;
    }
    match header_lookup(headers, header) {
        Some(value) => constant_time_eq(value.trim().as_bytes(), secret.as_bytes()),
        None => false,
    }
}

/// Optional query token gate. Empty expected token allows all.
pub fn verify_query_token(
    query_params: &HashMap<String, String>,
    token_param: &str,
    expected_token: &str,
) -> bool {
    let expected = expected_token.trim();
    if expected.is_empty() {
        return true;
    }
    match query_params.get(token_param.trim()) {
        Some(value) => constant_time_eq(value.trim().as_bytes(), expected.as_bytes()),
        None => false,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
