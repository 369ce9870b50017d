//! SSRF protection for outbound fetches.
//!
//! Crawler fetches and action webhooks may only reach public HTTP(S)
//! endpoints. Blocked: private ranges (RFC 1918), loopback, link-local,
//! multicast, unspecified, broadcast, documentation and shared address
//! space, cloud metadata endpoints, and their IPv6 equivalents including
//! IPv4-mapped addresses. Host names are checked both as literals and
//! after DNS resolution, so a public name pointing at an internal address
//! is still rejected.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::Url;

use crate::error::{Error, Result};

/// Per-crawl URL policy: the project's declared domain plus optional
/// allow/block host patterns.
#[derive(Debug, Default, Clone)]
pub struct UrlPolicy {
    /// Hosts must equal this domain or be a subdomain of it.
    pub declared_domain: Option<String>,
    /// Additional allowed host patterns (glob), checked when the declared
    /// domain does not match.
    pub allow_hosts: Option<GlobSet>,
    /// Blocked host patterns (glob); takes precedence.
    pub block_hosts: Option<GlobSet>,
    /// Skip the private-address classes. Intended for crawling intranet
    /// or local development targets; never set from user input.
    pub allow_private: bool,
}

impl UrlPolicy {
    pub fn for_domain(domain: Option<&str>) -> Self {
        Self {
            declared_domain: domain.map(|d| d.trim().trim_start_matches("www.").to_lowercase()),
            allow_hosts: None,
            block_hosts: None,
            allow_private: false,
        }
    }

    pub fn with_patterns(
        domain: Option<&str>,
        allow: &[String],
        block: &[String],
    ) -> anyhow::Result<Self> {
        let build = |patterns: &[String]| -> anyhow::Result<Option<GlobSet>> {
            if patterns.is_empty() {
                return Ok(None);
            }
            let mut builder = GlobSetBuilder::new();
            for p in patterns {
                builder.add(Glob::new(p)?);
            }
            Ok(Some(builder.build()?))
        };
        Ok(Self {
            declared_domain: domain.map(|d| d.trim().trim_start_matches("www.").to_lowercase()),
            allow_hosts: build(allow)?,
            block_hosts: build(block)?,
            allow_private: false,
        })
    }
}

/// Validate scheme, host policy and address classes for one URL. Resolves
/// the host via DNS, so the check covers rebinding to internal addresses.
pub async fn check_url(url: &Url, policy: &UrlPolicy) -> Result<()> {
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::validation(
                "url",
                format!("scheme '{}' is not allowed", other),
            ))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::validation("url", "missing host"))?
        .to_lowercase();

    if let Some(ref blocked) = policy.block_hosts {
        if blocked.is_match(&host) {
            return Err(Error::validation("url", format!("host {} is blocked", host)));
        }
    }

    if let Some(ref domain) = policy.declared_domain {
        let in_domain = host_in_domain(&host, domain);
        let allowed = in_domain
            || policy
                .allow_hosts
                .as_ref()
                .map(|set| set.is_match(&host))
                .unwrap_or(false);
        if !allowed {
            return Err(Error::validation(
                "url",
                format!("host {} is outside the project domain {}", host, domain),
            ));
        }
    }

    if policy.allow_private {
        return Ok(());
    }

    // Literal IP in the URL.
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(Error::validation(
                "url",
                format!("address {} is not publicly routable", ip),
            ));
        }
        return Ok(());
    }

    // Resolved addresses.
    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| Error::upstream(format!("DNS lookup failed for {}: {}", host, e)))?;
    for addr in addrs {
        if is_private_ip(&addr.ip()) {
            return Err(Error::validation(
                "url",
                format!("host {} resolves to a non-public address", host),
            ));
        }
    }

    Ok(())
}

/// `host` equals `domain` or is a subdomain of it.
pub fn host_in_domain(host: &str, domain: &str) -> bool {
    let host = host.trim_start_matches("www.");
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Classify an address as private/internal.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || is_documentation_v4(v4)
                || is_shared_address_space(v4)
                || is_cloud_metadata(v4)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || is_link_local_v6(v6)
                || is_unique_local_v6(v6)
                || is_documentation_v6(v6)
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}

/// RFC 5737 TEST-NET ranges.
fn is_documentation_v4(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    (o[0] == 192 && o[1] == 0 && o[2] == 2)
        || (o[0] == 198 && o[1] == 51 && o[2] == 100)
        || (o[0] == 203 && o[1] == 0 && o[2] == 113)
}

/// RFC 6598: 100.64.0.0/10.
fn is_shared_address_space(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 100 && (o[1] & 0xC0) == 64
}

/// AWS/GCP/Azure metadata endpoint.
fn is_cloud_metadata(ip: &Ipv4Addr) -> bool {
    ip.octets() == [169, 254, 169, 254]
}

/// fe80::/10.
fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// fc00::/7.
fn is_unique_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

/// RFC 3849: 2001:db8::/32.
fn is_documentation_v6(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] == 0x2001 && ip.segments()[1] == 0x0db8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_v4_classification() {
        for addr in [
            "10.0.0.1",
            "172.16.5.5",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.169.254",
            "0.0.0.0",
            "100.64.0.1",
            "192.0.2.17",
        ] {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(is_private_ip(&ip), "{} should be private", addr);
        }
        let public: IpAddr = "93.184.216.34".parse().unwrap();
        assert!(!is_private_ip(&public));
    }

    #[test]
    fn test_private_v6_classification() {
        for addr in ["::1", "fe80::1", "fc00::1", "2001:db8::1", "::ffff:10.0.0.1"] {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(is_private_ip(&ip), "{} should be private", addr);
        }
        let public: IpAddr = "2606:2800:220:1::1".parse().unwrap();
        assert!(!is_private_ip(&public));
    }

    #[test]
    fn test_host_in_domain() {
        assert!(host_in_domain("example.test", "example.test"));
        assert!(host_in_domain("docs.example.test", "example.test"));
        assert!(host_in_domain("www.example.test", "example.test"));
        assert!(!host_in_domain("evil-example.test", "example.test"));
        assert!(!host_in_domain("example.test.evil.io", "example.test"));
    }

    #[tokio::test]
    async fn test_rejects_bad_schemes() {
        let policy = UrlPolicy::default();
        for u in ["ftp://example.test/x", "file:///etc/passwd", "gopher://x"] {
            let url = Url::parse(u).unwrap();
            let err = check_url(&url, &policy).await.unwrap_err();
            assert_eq!(err.code(), "validation_error", "{} must be rejected", u);
        }
    }

    #[tokio::test]
    async fn test_rejects_literal_private_addresses() {
        let policy = UrlPolicy::default();
        for u in [
            "http://127.0.0.1/admin",
            "http://10.0.0.8/",
            "http://169.254.169.254/latest/meta-data/",
            "http://[::1]/",
        ] {
            let url = Url::parse(u).unwrap();
            let err = check_url(&url, &policy).await.unwrap_err();
            assert_eq!(err.code(), "validation_error", "{} must be rejected", u);
        }
    }

    #[tokio::test]
    async fn test_rejects_host_outside_domain() {
        let policy = UrlPolicy::for_domain(Some("example.test"));
        let url = Url::parse("https://other.test/page").unwrap();
        let err = check_url(&url, &policy).await.unwrap_err();
        assert!(err.to_string().contains("outside the project domain"));
    }

    #[tokio::test]
    async fn test_blocklist_beats_domain() {
        let policy = UrlPolicy::with_patterns(
            Some("example.test"),
            &[],
            &["secret.example.test".to_string()],
        )
        .unwrap();
        let url = Url::parse("https://secret.example.test/x").unwrap();
        let err = check_url(&url, &policy).await.unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }
}
