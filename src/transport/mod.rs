//! Adapter between the pipeline and the underlying HTTP transport.
//!
//! The transport itself (connection pooling, TLS, HTTP/1.1 and HTTP/2 wire
//! handling) is reqwest; this module owns the translation from [`Config`]
//! into a configured `reqwest::Client` and installs the guard resolver that
//! re-validates every address before a connection is dialed.
//!
//! Redirects are always disabled here; the pipeline follows them itself so
//! it can track the chain and strip sensitive headers.

mod doh;
mod resolve;

use std::sync::Arc;

use crate::config::{Config, ProxyMode, TlsVersion};
use crate::error::Error;

pub(crate) use resolve::GuardResolver;

/// Builds the transport for a client from its validated config.
pub(crate) fn build(config: &Config) -> Result<reqwest::Client, Error> {
    let resolver = GuardResolver::from_config(config)?;

    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(config.connect_timeout + config.tls_handshake_timeout)
        .read_timeout(config.response_header_timeout)
        .pool_idle_timeout(config.idle_conn_timeout)
        .pool_max_idle_per_host(config.max_idle_conns_per_host)
        .min_tls_version(tls_version(config.min_tls_version))
        .max_tls_version(tls_version(config.max_tls_version))
        .danger_accept_invalid_certs(config.insecure_skip_verify)
        .dns_resolver(Arc::new(resolver));

    if !config.enable_http2 {
        builder = builder.http1_only();
    }

    match &config.proxy {
        // reqwest reads HTTP_PROXY/HTTPS_PROXY/NO_PROXY by default.
        ProxyMode::System => {}
        ProxyMode::Manual(url) => {
            let proxy = reqwest::Proxy::all(url.as_str()).map_err(|e| Error::Proxy {
                reason: e.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }
        ProxyMode::Direct => {
            builder = builder.no_proxy();
        }
    }

    builder.build().map_err(Error::Transport)
}

const fn tls_version(version: TlsVersion) -> reqwest::tls::Version {
    match version {
        TlsVersion::Tls12 => reqwest::tls::Version::TLS_1_2,
        TlsVersion::Tls13 => reqwest::tls::Version::TLS_1_3,
    }
}
