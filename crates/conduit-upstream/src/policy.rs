//! Outbound destination filtering
//!
//! Blocks non-HTTP schemes, denied hosts and anything that resolves to a
//! private, loopback, link-local or otherwise internal address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use conduit_config::UrlPolicyConfig;
use url::{Host, Url};

use crate::error::UpstreamError;

/// Validates every URL the gateway is about to contact, including redirect hops
#[derive(Debug, Clone, Default)]
pub struct UrlPolicy {
    allow_hosts: Vec<String>,
    deny_hosts: Vec<String>,
    allow_private_networks: bool,
}

impl UrlPolicy {
    pub fn new(config: &UrlPolicyConfig) -> Self {
        let normalize = |hosts: &[String]| hosts.iter().map(|h| h.trim().to_ascii_lowercase()).collect();
        Self {
            allow_hosts: normalize(&config.allow_hosts),
            deny_hosts: normalize(&config.deny_hosts),
            allow_private_networks: config.allow_private_networks,
        }
    }

    /// Check a destination, resolving its host when it is a name
    pub async fn check(&self, url: &Url) -> Result<(), UpstreamError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UpstreamError::PolicyBlocked(format!("scheme {} is not allowed", url.scheme())));
        }

        let Some(host) = url.host() else {
            return Err(UpstreamError::PolicyBlocked("URL has no host".to_string()));
        };
        let host_name = match &host {
            Host::Domain(d) => d.trim_end_matches('.').to_ascii_lowercase(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };

        if matches_any(&self.deny_hosts, &host_name) {
            return Err(UpstreamError::PolicyBlocked(format!("host {host_name} is denied")));
        }
        if matches_any(&self.allow_hosts, &host_name) || self.allow_private_networks {
            return Ok(());
        }

        match host {
            Host::Ipv4(ip) => check_ip(IpAddr::V4(ip)),
            Host::Ipv6(ip) => check_ip(IpAddr::V6(ip)),
            Host::Domain(_) => {
                if host_name == "localhost" || host_name.ends_with(".localhost") {
                    return Err(UpstreamError::PolicyBlocked(format!("host {host_name} is internal")));
                }

                let port = url.port_or_known_default().unwrap_or(443);
                let addrs = tokio::net::lookup_host((host_name.as_str(), port))
                    .await
                    .map_err(|e| UpstreamError::Network(format!("failed to resolve {host_name}: {e}")))?;

                let mut resolved = false;
                for addr in addrs {
                    resolved = true;
                    check_ip(addr.ip())?;
                }
                if resolved {
                    Ok(())
                } else {
                    Err(UpstreamError::Network(format!("{host_name} resolved to no addresses")))
                }
            }
        }
    }
}

/// Exact match, or suffix match for patterns with a leading `.`
fn matches_any(patterns: &[String], host: &str) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_prefix('.') {
        Some(apex) => host == apex || host.ends_with(pattern.as_str()),
        None => host == pattern,
    })
}

fn check_ip(ip: IpAddr) -> Result<(), UpstreamError> {
    if is_internal(ip) {
        return Err(UpstreamError::PolicyBlocked(format!("address {ip} is not publicly routable")));
    }
    Ok(())
}

/// Addresses an upstream call must never reach
pub fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or_else(|| is_internal_v6(v6), is_internal_v4),
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        // 0.0.0.0/8
        || a == 0
        // carrier-grade NAT 100.64.0.0/10
        || (a == 100 && (64..128).contains(&b))
        // benchmarking 198.18.0.0/15
        || (a == 198 && (b == 18 || b == 19))
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // unique local fc00::/7
        || (first & 0xfe00) == 0xfc00
        // link-local fe80::/10
        || (first & 0xffc0) == 0xfe80
}
