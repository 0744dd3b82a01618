//! The dial hook: DNS resolution with pre-connect address re-validation.
//!
//! Installed into reqwest as a custom resolver, which makes it the last
//! gate before the connector dials. Literal-IP hosts are checked during URL
//! validation; everything that arrives here is a name, and *every* address
//! it resolves to must pass the blocklist; one poisoned A record refuses
//! the whole connection. That closes the DNS-rebinding hole where a public
//! name momentarily resolves to something internal.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use super::doh::DohResolver;
use crate::config::Config;
use crate::error::Error;
use crate::validate;

pub(crate) struct GuardResolver {
    allow_private_ips: bool,
    doh: Option<Arc<DohResolver>>,
    /// Fixed answers used by tests to simulate arbitrary DNS responses.
    overrides: HashMap<String, Vec<IpAddr>>,
}

impl GuardResolver {
    pub(crate) fn from_config(config: &Config) -> Result<Self, Error> {
        let doh = if config.enable_doh {
            Some(Arc::new(DohResolver::new(config.doh_cache_ttl)?))
        } else {
            None
        };
        Ok(Self {
            allow_private_ips: config.allow_private_ips,
            doh,
            overrides: HashMap::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_overrides(
        allow_private_ips: bool,
        overrides: HashMap<String, Vec<IpAddr>>,
    ) -> Self {
        Self {
            allow_private_ips,
            doh: None,
            overrides,
        }
    }

    /// Resolves a hostname and enforces the address policy.
    async fn lookup_checked(
        host: String,
        fixed: Option<Vec<IpAddr>>,
        doh: Option<Arc<DohResolver>>,
        allow_private_ips: bool,
    ) -> Result<Vec<IpAddr>, Box<dyn std::error::Error + Send + Sync>> {
        let ips = match fixed {
            Some(ips) => ips,
            None => {
                let doh_answer = match &doh {
                    Some(resolver) => resolver.resolve(&host).await,
                    None => None,
                };
                match doh_answer {
                    Some(ips) => ips,
                    // DoH disabled or failed: system resolver.
                    None => system_lookup(&host).await?,
                }
            }
        };

        if ips.is_empty() {
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {host}"),
            )));
        }

        if !allow_private_ips {
            if let Some(bad) = ips.iter().find(|ip| validate::is_blocked_ip(**ip)) {
                tracing::warn!(host = %host, ip = %bad, "refusing connection to blocked address");
                return Err(Box::new(Error::SsrfBlocked {
                    target: format!("{host} ({bad})"),
                }));
            }
        }

        Ok(ips)
    }
}

impl Resolve for GuardResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        let fixed = self.overrides.get(&host).cloned();
        let doh = self.doh.clone();
        let allow_private_ips = self.allow_private_ips;

        Box::pin(async move {
            let ips =
                Self::lookup_checked(host, fixed, doh, allow_private_ips).await?;
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

async fn system_lookup(host: &str) -> std::io::Result<Vec<IpAddr>> {
    let addrs = tokio::net::lookup_host((host, 0)).await?;
    Ok(addrs.map(|addr| addr.ip()).collect())
}

impl std::fmt::Debug for GuardResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardResolver")
            .field("allow_private_ips", &self.allow_private_ips)
            .field("doh", &self.doh.is_some())
            .finish_non_exhaustive()
    }
}
