//! Client configuration and named presets.
//!
//! A [`Config`] is a plain value object. [`Client::new`][crate::Client::new]
//! validates it and keeps a private copy, so mutating the original after
//! construction never changes a live client's behavior.

use std::time::Duration;

use indexmap::IndexMap;

use crate::error::Error;
use crate::validate;

/// Default `User-Agent` sent when neither the config nor the request sets one.
pub const DEFAULT_USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

const MAX_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_RETRIES_LIMIT: u32 = 10;
const MAX_POOL_SIZE: usize = 1000;
const MAX_CONCURRENCY: usize = 10_000;
const MAX_USER_AGENT_BYTES: usize = 512;
pub(crate) const MAX_REDIRECT_LIMIT: u32 = 50;

/// TLS protocol versions the transport may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// How outbound connections pick a proxy.
///
/// Priority when dispatching: `Manual` beats `System` beats `Direct`.
/// `System` honors `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY` (comma
/// separated host patterns; a leading `.` matches subdomains).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// Use the proxy settings found in the process environment.
    #[default]
    System,
    /// Always use this proxy URL.
    Manual(String),
    /// Never use a proxy, even if the environment configures one.
    Direct,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Per-attempt deadline covering the whole exchange. Zero disables it.
    pub timeout: Duration,
    /// TCP dial budget.
    pub connect_timeout: Duration,
    /// Extra budget for the TLS handshake, added to the connect phase.
    pub tls_handshake_timeout: Duration,
    /// How long to wait for response headers once the request is written.
    pub response_header_timeout: Duration,
    /// How long an idle pooled connection may linger.
    pub idle_conn_timeout: Duration,

    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    /// Base backoff delay before the first retry.
    pub retry_delay: Duration,
    /// Multiplier applied to the delay for each further retry.
    pub backoff_factor: f64,
    /// Upper bound for a single backoff sleep.
    pub max_retry_delay: Duration,
    /// Scale each backoff by a uniform factor in `[0.5, 1.0]`.
    pub retry_jitter: bool,

    /// Idle connections kept across all hosts.
    pub max_idle_conns: usize,
    /// Idle connections kept per host.
    pub max_idle_conns_per_host: usize,
    /// Hard cap of in-flight connections per host.
    pub max_conns_per_host: usize,
    /// Global admission limit for simultaneous requests.
    pub max_concurrent_requests: usize,

    pub min_tls_version: TlsVersion,
    pub max_tls_version: TlsVersion,
    /// Disables certificate verification. Never enable outside tests.
    pub insecure_skip_verify: bool,

    /// Cap on in-memory response bodies. Downloads stream and are exempt.
    pub max_response_body_size: usize,
    /// Permit requests to loopback/private/reserved addresses.
    pub allow_private_ips: bool,

    pub follow_redirects: bool,
    pub max_redirects: u32,

    pub enable_http2: bool,
    /// Store server cookies in the client's jar and send them back.
    pub enable_cookies: bool,

    /// Headers attached to every request unless overridden per request.
    pub default_headers: IndexMap<String, String>,
    pub user_agent: String,

    pub proxy: ProxyMode,

    /// Resolve names over DNS-over-HTTPS before falling back to the system
    /// resolver.
    pub enable_doh: bool,
    pub doh_cache_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(30),
            idle_conn_timeout: Duration::from_secs(90),

            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_retry_delay: Duration::from_secs(30),
            retry_jitter: true,

            max_idle_conns: 100,
            max_idle_conns_per_host: 10,
            max_conns_per_host: 50,
            max_concurrent_requests: 100,

            min_tls_version: TlsVersion::Tls12,
            max_tls_version: TlsVersion::Tls13,
            insecure_skip_verify: false,

            max_response_body_size: 10 * 1024 * 1024,
            allow_private_ips: false,

            follow_redirects: true,
            max_redirects: 10,

            enable_http2: true,
            enable_cookies: false,

            default_headers: IndexMap::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),

            proxy: ProxyMode::System,

            enable_doh: false,
            doh_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Strictest profile: TLS 1.3 floor, no redirects, private IPs denied,
    /// certificate verification always on.
    #[must_use]
    pub fn secure() -> Self {
        Self {
            min_tls_version: TlsVersion::Tls13,
            follow_redirects: false,
            allow_private_ips: false,
            insecure_skip_verify: false,
            ..Self::default()
        }
    }

    /// Tuned for high-throughput API fan-out: bigger pools, more admission
    /// slots, a short dial budget and fewer retries.
    #[must_use]
    pub fn performance() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_retries: 2,
            max_idle_conns: 200,
            max_idle_conns_per_host: 20,
            max_conns_per_host: 100,
            max_concurrent_requests: 256,
            ..Self::default()
        }
    }

    /// Bare-bones profile: no retries, no redirects, no cookies, small pools
    /// and a 1 MiB body cap.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            max_retries: 0,
            follow_redirects: false,
            enable_cookies: false,
            max_idle_conns: 10,
            max_idle_conns_per_host: 2,
            max_conns_per_host: 10,
            max_concurrent_requests: 16,
            max_response_body_size: 1024 * 1024,
            ..Self::default()
        }
    }

    /// Profile for test suites talking to localhost fixtures: private IPs
    /// allowed, certificate verification off, short timeouts and delays.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(250),
            retry_jitter: false,
            allow_private_ips: true,
            insecure_skip_verify: true,
            ..Self::default()
        }
    }

    /// Checks every bound the engine relies on.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.timeout.is_zero() && self.timeout > MAX_TIMEOUT {
            return Err(Error::invalid_config(
                "timeout",
                "must be zero or at most 10 minutes",
            ));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(Error::invalid_config("max_retries", "must be at most 10"));
        }
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(Error::invalid_config(
                "backoff_factor",
                "must be a finite number >= 1.0",
            ));
        }

        for (field, value) in [
            ("max_idle_conns", self.max_idle_conns),
            ("max_idle_conns_per_host", self.max_idle_conns_per_host),
            ("max_conns_per_host", self.max_conns_per_host),
        ] {
            if value == 0 || value > MAX_POOL_SIZE {
                return Err(Error::invalid_config(field, "must be in 1..=1000"));
            }
        }
        if self.max_concurrent_requests == 0 || self.max_concurrent_requests > MAX_CONCURRENCY {
            return Err(Error::invalid_config(
                "max_concurrent_requests",
                "must be in 1..=10000",
            ));
        }

        if self.user_agent.len() > MAX_USER_AGENT_BYTES {
            return Err(Error::invalid_config(
                "user_agent",
                "must be at most 512 bytes",
            ));
        }
        validate::header_value("user-agent", &self.user_agent)
            .map_err(|_| Error::invalid_config("user_agent", "not a valid header value"))?;

        if self.min_tls_version > self.max_tls_version {
            return Err(Error::invalid_config(
                "min_tls_version",
                "must not exceed max_tls_version",
            ));
        }

        if self.max_response_body_size == 0 {
            return Err(Error::invalid_config(
                "max_response_body_size",
                "must be positive",
            ));
        }
        if self.max_redirects > MAX_REDIRECT_LIMIT {
            return Err(Error::invalid_config(
                "max_redirects",
                "must be at most 50",
            ));
        }

        if let ProxyMode::Manual(raw) = &self.proxy {
            let parsed = url::Url::parse(raw)
                .map_err(|e| Error::invalid_config("proxy", e.to_string()))?;
            if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
                return Err(Error::invalid_config(
                    "proxy",
                    "proxy URL scheme must be http, https or socks5",
                ));
            }
        }

        for (name, value) in &self.default_headers {
            validate::header_name(name)
                .map_err(|_| Error::invalid_config("default_headers", format!("bad header name {name:?}")))?;
            validate::header_value(name, value)
                .map_err(|_| Error::invalid_config("default_headers", format!("bad value for {name:?}")))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn presets_validate() {
        assert!(Config::secure().validate().is_ok());
        assert!(Config::performance().validate().is_ok());
        assert!(Config::minimal().validate().is_ok());
        assert!(Config::testing().validate().is_ok());
    }

    #[test]
    fn secure_preset_is_strict() {
        let config = Config::secure();
        assert_eq!(config.min_tls_version, TlsVersion::Tls13);
        assert!(!config.follow_redirects);
        assert!(!config.allow_private_ips);
        assert!(!config.insecure_skip_verify);
    }

    #[test]
    fn testing_preset_allows_local_fixtures() {
        let config = Config::testing();
        assert!(config.allow_private_ips);
        assert!(config.insecure_skip_verify);
    }

    #[test]
    fn rejects_excessive_timeout() {
        let config = Config {
            timeout: Duration::from_secs(601),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { field: "timeout", .. })
        ));
    }

    #[test]
    fn zero_timeout_means_unlimited() {
        let config = Config {
            timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_retry_count_over_limit() {
        let config = Config {
            max_retries: 11,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_and_oversized_pools() {
        let config = Config {
            max_idle_conns: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_conns_per_host: 1001,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_user_agent() {
        let config = Config {
            user_agent: "u".repeat(513),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_proxy_url() {
        let config = Config {
            proxy: ProxyMode::Manual("not a proxy".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            proxy: ProxyMode::Manual("ftp://proxy.internal:21".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            proxy: ProxyMode::Manual("http://proxy.internal:3128".into()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());

        let config = Config {
            proxy: ProxyMode::Manual("socks5://localhost:1080".into()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_default_headers() {
        let mut headers = IndexMap::new();
        headers.insert("X-Ok".to_string(), "fine".to_string());
        headers.insert("Bad Header".to_string(), "x".to_string());
        let config = Config {
            default_headers: headers,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_tls_bounds() {
        let config = Config {
            min_tls_version: TlsVersion::Tls13,
            max_tls_version: TlsVersion::Tls12,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_redirect_limit_over_cap() {
        let config = Config {
            max_redirects: 51,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
