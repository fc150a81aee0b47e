//! SSRF-hardened HTTP fetch: resolves a URL's host, rejects anything
//! that lands in a private/loopback/link-local/reserved range, and pins
//! the resolved address across any redirect chain so a DNS answer can't
//! change out from under an in-flight request.

mod ranges;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::lookup_host;
use url::Url;

pub use ranges::is_private_ip;

use crate::error::{CoreError, Result};

pub struct SafeFetchConfig {
    pub max_redirects: u8,
    pub connect_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for SafeFetchConfig {
    fn default() -> Self {
        Self {
            max_redirects: 5,
            connect_timeout: Duration::from_secs(10),
            max_body_bytes: 20 * 1024,
        }
    }
}

/// A single resolved hop in a redirect chain, retained so the pinned
/// address can be compared against the next hop's resolution.
#[derive(Debug, Clone)]
pub struct ResolvedHop {
    pub url: Url,
    pub pinned_addr: IpAddr,
}

pub struct SafeFetch {
    config: SafeFetchConfig,
}

impl SafeFetch {
    pub fn new(config: SafeFetchConfig) -> Self {
        Self { config }
    }

    /// Resolve `url`'s host and return the first non-private address,
    /// or an error if resolution yields only private/reserved addresses
    /// or no addresses at all.
    pub async fn resolve_and_pin(&self, url: &Url) -> Result<ResolvedHop> {
        let host = url
            .host_str()
            .ok_or_else(|| CoreError::SsrfBlocked(format!("url has no host: {url}")))?;
        let port = url.port_or_known_default().unwrap_or(443);

        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_ip(&ip) {
                return Err(CoreError::SsrfBlocked(format!("{host} resolves to a private address")));
            }
            return Ok(ResolvedHop {
                url: url.clone(),
                pinned_addr: ip,
            });
        }

        let lookup_target = format!("{host}:{port}");
        let addrs: Vec<SocketAddr> = lookup_host(&lookup_target)
            .await
            .map_err(|e| CoreError::SsrfBlocked(format!("dns resolution failed for {host}: {e}")))?
            .collect();

        let first_public = addrs
            .iter()
            .map(|a| a.ip())
            .find(|ip| !is_private_ip(ip))
            .ok_or_else(|| CoreError::SsrfBlocked(format!("{host} resolves only to private addresses")))?;

        Ok(ResolvedHop {
            url: url.clone(),
            pinned_addr: first_public,
        })
    }

    /// Validate a redirect target: it must resolve, resolve to a
    /// non-private address, and if the scheme/host pair is unchanged
    /// from the prior hop the resolved address must match the pin
    /// (blocks a rebind between the original request and the redirect).
    pub async fn validate_redirect(&self, previous: &ResolvedHop, next_url: &Url) -> Result<ResolvedHop> {
        let next_hop = self.resolve_and_pin(next_url).await?;

        let same_host = previous.url.host_str() == next_url.host_str() && previous.url.scheme() == next_url.scheme();
        if same_host && next_hop.pinned_addr != previous.pinned_addr {
            return Err(CoreError::DnsRebinding(format!(
                "redirect target {next_url} resolved to a different address than the prior hop"
            )));
        }

        Ok(next_hop)
    }

    pub fn max_redirects(&self) -> u8 {
        self.config.max_redirects
    }

    pub fn max_body_bytes(&self) -> usize {
        self.config.max_body_bytes
    }

    pub fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }
}
