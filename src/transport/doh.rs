//! DNS-over-HTTPS resolution with a TTL cache.
//!
//! Queries the JSON DNS API (`application/dns-json`) of the configured
//! providers in order and caches positive answers. Any failure (provider
//! unreachable, malformed reply, no usable records) makes the caller fall
//! back to the system resolver, so enabling DoH can never make resolution
//! *less* available than it was.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::Error;

/// Providers tried in order. All of them speak the JSON DNS API.
const PROVIDERS: [&str; 3] = [
    "https://cloudflare-dns.com/dns-query",
    "https://dns.google/resolve",
    "https://dns.alidns.com/resolve",
];

const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// DNS record types carried in JSON answers.
const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;

#[derive(Debug, Deserialize)]
struct DnsJsonReply {
    #[serde(rename = "Answer", default)]
    answer: Vec<DnsJsonRecord>,
}

#[derive(Debug, Deserialize)]
struct DnsJsonRecord {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

#[derive(Debug, Clone)]
struct CachedAnswer {
    ips: Vec<IpAddr>,
    expires_at: Instant,
}

pub(crate) struct DohResolver {
    /// Bootstrap client with the stock resolver, so DoH lookups cannot
    /// recurse into the guard resolver.
    http: reqwest::Client,
    cache: RwLock<HashMap<String, CachedAnswer>>,
    ttl: Duration,
}

impl DohResolver {
    pub(crate) fn new(ttl: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(Error::Transport)?;
        Ok(Self {
            http,
            cache: RwLock::new(HashMap::new()),
            ttl,
        })
    }

    /// Resolves `host`, serving from cache while entries are fresh.
    ///
    /// `None` means "no DoH answer" and the caller should use the system
    /// resolver instead.
    pub(crate) async fn resolve(&self, host: &str) -> Option<Vec<IpAddr>> {
        if let Some(cached) = self.cached(host) {
            return Some(cached);
        }

        for provider in PROVIDERS {
            match self.query(provider, host).await {
                Ok(ips) if !ips.is_empty() => {
                    tracing::debug!(host, provider, answers = ips.len(), "doh answer");
                    self.insert(host, ips.clone());
                    return Some(ips);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(host, provider, error = %e, "doh query failed");
                }
            }
        }

        None
    }

    fn cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        let cache = match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = cache.get(host)?;
        if entry.expires_at > Instant::now() {
            Some(entry.ips.clone())
        } else {
            None
        }
    }

    fn insert(&self, host: &str, ips: Vec<IpAddr>) {
        let now = Instant::now();
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.retain(|_, entry| entry.expires_at > now);
        cache.insert(
            host.to_string(),
            CachedAnswer {
                ips,
                expires_at: now + self.ttl,
            },
        );
    }

    async fn query(&self, provider: &str, host: &str) -> Result<Vec<IpAddr>, reqwest::Error> {
        let mut ips = Vec::new();
        for record_type in ["A", "AAAA"] {
            let reply: DnsJsonReply = self
                .http
                .get(provider)
                .query(&[("name", host), ("type", record_type)])
                .header("accept", "application/dns-json")
                .send()
                .await?
                .json()
                .await?;
            ips.extend(parse_answers(&reply));
        }
        Ok(ips)
    }
}

/// Extracts usable A/AAAA records; CNAMEs and unparsable data are skipped.
fn parse_answers(reply: &DnsJsonReply) -> Vec<IpAddr> {
    reply
        .answer
        .iter()
        .filter(|record| matches!(record.record_type, TYPE_A | TYPE_AAAA))
        .filter_map(|record| record.data.parse().ok())
        .collect()
}

impl std::fmt::Debug for DohResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohResolver")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_answer_sections() {
        let reply: DnsJsonReply = serde_json::from_str(
            r#"{
                "Status": 0,
                "Answer": [
                    {"name": "x.example", "type": 5, "TTL": 300, "data": "y.example."},
                    {"name": "y.example", "type": 1, "TTL": 300, "data": "203.0.113.7"},
                    {"name": "y.example", "type": 28, "TTL": 300, "data": "2606:4700::1111"}
                ]
            }"#,
        )
        .unwrap();

        let ips = parse_answers(&reply);
        assert_eq!(ips.len(), 2);
        assert!(ips.contains(&"203.0.113.7".parse().unwrap()));
        assert!(ips.contains(&"2606:4700::1111".parse().unwrap()));
    }

    #[test]
    fn missing_answer_section_is_empty() {
        let reply: DnsJsonReply = serde_json::from_str(r#"{"Status": 3}"#).unwrap();
        assert!(parse_answers(&reply).is_empty());
    }

    #[test]
    fn cache_serves_until_expiry() {
        let resolver = DohResolver::new(Duration::from_secs(60)).unwrap();
        let ips: Vec<IpAddr> = vec!["203.0.113.9".parse().unwrap()];
        resolver.insert("cached.example", ips.clone());

        assert_eq!(resolver.cached("cached.example"), Some(ips));
        assert_eq!(resolver.cached("other.example"), None);
    }

    #[test]
    fn expired_entries_are_ignored() {
        let resolver = DohResolver::new(Duration::ZERO).unwrap();
        resolver.insert("stale.example", vec!["203.0.113.9".parse().unwrap()]);
        assert_eq!(resolver.cached("stale.example"), None);
    }
}
