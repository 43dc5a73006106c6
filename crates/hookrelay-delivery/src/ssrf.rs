//! Private-address policy applied to destination URLs before any request.
//!
//! A destination URL is attacker-controlled input: without this check the
//! delivery job could be pointed at loopback services, cloud metadata
//! endpoints or anything else on the internal network.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ipnetwork::IpNetwork;
use tracing::debug;
use url::{Host, Url};

use crate::config::DeliveryConfig;
use crate::error::DeliveryError;

#[derive(Debug, Clone, Default)]
pub struct SsrfPolicy {
    allowed: Vec<IpNetwork>,
    denied: Vec<IpNetwork>,
}

impl SsrfPolicy {
    pub fn new(allowed: Vec<IpNetwork>, denied: Vec<IpNetwork>) -> Self {
        Self { allowed, denied }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(config.allowed_private_networks(), config.denied_networks())
    }

    /// Allow-list wins over both the deny list and the private-range check.
    pub fn check_ip(&self, ip: IpAddr) -> Result<(), DeliveryError> {
        if self.allowed.iter().any(|net| net.contains(ip)) {
            return Ok(());
        }
        if self.denied.iter().any(|net| net.contains(ip)) || is_non_public(ip) {
            return Err(DeliveryError::PrivateAddress(ip.to_string()));
        }
        Ok(())
    }

    /// Validate `url` and every address its host resolves to.
    ///
    /// Returns the resolved addresses.
    pub async fn check(&self, url: &str) -> Result<Vec<SocketAddr>, DeliveryError> {
        let parsed = Url::parse(url).map_err(|e| DeliveryError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DeliveryError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| DeliveryError::InvalidUrl(format!("{url}: missing port")))?;

        let addrs: Vec<SocketAddr> = match parsed.host() {
            Some(Host::Ipv4(ip)) => vec![SocketAddr::new(IpAddr::V4(ip), port)],
            Some(Host::Ipv6(ip)) => vec![SocketAddr::new(IpAddr::V6(ip), port)],
            Some(Host::Domain(domain)) => tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| DeliveryError::Transport(format!("cannot resolve {domain}: {e}")))?
                .collect(),
            None => return Err(DeliveryError::InvalidUrl(format!("{url}: missing host"))),
        };

        if addrs.is_empty() {
            return Err(DeliveryError::Transport(format!(
                "{url}: host resolved to no addresses"
            )));
        }
        for addr in &addrs {
            self.check_ip(addr.ip())?;
        }

        debug!(url, addresses = ?addrs, "Destination passed address policy");
        Ok(addrs)
    }
}

/// Loopback, link-local, private (RFC 1918 / RFC 4193), shared, reserved,
/// documentation, multicast and unspecified addresses.
pub fn is_non_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_non_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_non_public_v4(v4),
            None => is_non_public_v6(v6),
        },
    }
}

fn is_non_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        // 0.0.0.0/8 "this network"
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0b1100_0000) == 64)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        // 240.0.0.0/4 reserved
        || a >= 240
}

fn is_non_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link-local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_private_ranges_rejected() {
        let policy = SsrfPolicy::default();
        for addr in [
            "127.0.0.1",
            "169.254.0.1",
            "169.254.169.254",
            "10.0.0.1",
            "172.16.5.4",
            "192.168.1.1",
            "100.64.0.1",
            "0.0.0.0",
            "::1",
            "fe80::1",
            "fd12:3456::1",
            "::ffff:10.0.0.1",
            "::ffff:127.0.0.1",
        ] {
            assert!(
                matches!(policy.check_ip(ip(addr)), Err(DeliveryError::PrivateAddress(_))),
                "{addr} should be rejected"
            );
        }
    }

    #[test]
    fn test_public_addresses_accepted() {
        let policy = SsrfPolicy::default();
        for addr in ["93.184.216.34", "8.8.8.8", "2606:4700:4700::1111"] {
            assert!(policy.check_ip(ip(addr)).is_ok(), "{addr} should pass");
        }
    }

    #[test]
    fn test_allow_list_exempts_private_address() {
        let policy = SsrfPolicy::new(vec![net("127.0.0.1/32"), net("169.254.0.0/16")], vec![]);
        assert!(policy.check_ip(ip("127.0.0.1")).is_ok());
        assert!(policy.check_ip(ip("169.254.10.10")).is_ok());
        assert!(policy.check_ip(ip("127.0.0.2")).is_err());
    }

    #[test]
    fn test_deny_list_blocks_public_address() {
        let policy = SsrfPolicy::new(vec![], vec![net("93.184.216.0/24")]);
        assert!(policy.check_ip(ip("93.184.216.34")).is_err());
        assert!(policy.check_ip(ip("8.8.8.8")).is_ok());
    }

    #[tokio::test]
    async fn test_check_url_with_ip_literal() {
        let policy = SsrfPolicy::default();
        assert!(matches!(
            policy.check("http://127.0.0.1:8080/hook").await,
            Err(DeliveryError::PrivateAddress(_))
        ));
        assert!(matches!(
            policy.check("http://[::1]/hook").await,
            Err(DeliveryError::PrivateAddress(_))
        ));
        let addrs = policy.check("https://93.184.216.34/hook").await.unwrap();
        assert_eq!(addrs, vec!["93.184.216.34:443".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_check_rejects_bad_urls() {
        let policy = SsrfPolicy::default();
        assert!(matches!(
            policy.check("ftp://93.184.216.34/").await,
            Err(DeliveryError::InvalidUrl(_))
        ));
        assert!(matches!(
            policy.check("not a url").await,
            Err(DeliveryError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_localhost_name_is_resolved_and_rejected() {
        let policy = SsrfPolicy::default();
        assert!(matches!(
            policy.check("http://localhost:9000/").await,
            Err(DeliveryError::PrivateAddress(_))
        ));
    }
}
