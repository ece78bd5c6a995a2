//! DNS blocklist checks: reversed-IPv4 A queries against the configured
//! list domains, with a hit threshold.

use std::net::IpAddr;

use async_std_resolver::AsyncStdResolver;
use tracing::{debug, warn};
use trust_dns_resolver::error::ResolveErrorKind;

pub struct DnsBlocklist {
    resolver: AsyncStdResolver,
    domains: Vec<String>,
    threshold: usize,
}

impl DnsBlocklist {
    pub fn new(resolver: AsyncStdResolver, domains: Vec<String>, threshold: usize) -> DnsBlocklist {
        DnsBlocklist {
            resolver,
            domains,
            threshold,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.domains.is_empty()
    }

    /// True when at least `threshold` lists return a positive answer for
    /// the address. Only IPv4 peers are looked up; lookup failures count as
    /// misses so a broken list cannot block all mail.
    pub async fn is_blocked(&self, addr: IpAddr) -> bool {
        let ip = match addr {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => return false,
        };
        let octets = ip.octets();
        let mut hits = 0;
        for domain in &self.domains {
            let query = format!(
                "{}.{}.{}.{}.{}.",
                octets[3], octets[2], octets[1], octets[0], domain
            );
            match self.resolver.ipv4_lookup(query.as_str()).await {
                Ok(answer) => {
                    if answer.iter().next().is_some() {
                        debug!(list = domain.as_str(), ip = %ip, "blocklist hit");
                        hits += 1;
                        if hits >= self.threshold {
                            return true;
                        }
                    }
                }
                Err(e) => match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => (),
                    _ => warn!(list = domain.as_str(), error = %e, "blocklist lookup failed"),
                },
            }
        }
        false
    }
}
