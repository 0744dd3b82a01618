//! The client: owner of every long-lived resource.
//!
//! A [`Client`] is an `Arc` around its shared state (transport, admission
//! controller, cookie jar, lifecycle flags), so clones are cheap and all of
//! them observe the same pools and the same `close()`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use tokio::sync::Notify;
use tracing::debug;

use crate::admission::Admission;
use crate::config::Config;
use crate::cookies::CookieJar;
use crate::download::{DownloadOptions, DownloadResult};
use crate::error::Error;
use crate::request::RequestBuilder;
use crate::transport;

/// How long `close()` waits for in-flight requests to drain before giving
/// up and returning anyway.
const CLOSE_GRACE: Duration = Duration::from_secs(10);

/// An HTTP client with pooling, admission control, retries, redirect
/// tracking and SSRF defense.
///
/// Cloning is cheap and clones share all state. Dropping the last clone
/// releases the connection pool; an explicit [`Client::close`] additionally
/// drains in-flight work and makes further calls fail fast.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
pub(crate) struct ClientInner {
    pub(crate) config: Config,
    pub(crate) http: reqwest::Client,
    pub(crate) admission: Admission,
    pub(crate) jar: CookieJar,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl ClientInner {
    /// Fails fast once the client is closed. Runs before any other work.
    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

/// Counts one logical request against the owning client for the purpose of
/// drain-on-close.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    inner: Arc<ClientInner>,
}

impl InFlightGuard {
    pub(crate) fn new(inner: Arc<ClientInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl Client {
    /// Builds a client from a validated config.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let http = transport::build(&config)?;
        let admission = Admission::new(config.max_concurrent_requests, config.max_conns_per_host);
        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                admission,
                jar: CookieJar::new(),
                config,
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        })
    }

    /// A client with [`Config::default`].
    pub fn with_defaults() -> Result<Self, Error> {
        Self::new(Config::default())
    }

    /// A client with the [`Config::secure`] preset.
    pub fn secure() -> Result<Self, Error> {
        Self::new(Config::secure())
    }

    /// A client with the [`Config::performance`] preset.
    pub fn performance() -> Result<Self, Error> {
        Self::new(Config::performance())
    }

    /// A client with the [`Config::minimal`] preset.
    pub fn minimal() -> Result<Self, Error> {
        Self::new(Config::minimal())
    }

    pub(crate) fn inner(&self) -> Arc<ClientInner> {
        Arc::clone(&self.inner)
    }

    /// The config this client was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Starts a request with an arbitrary method.
    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url)
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    pub fn options(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::OPTIONS, url)
    }

    /// Downloads `url` to `path` with default options (no overwrite, no
    /// resume).
    pub async fn download(
        &self,
        url: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<DownloadResult, Error> {
        self.get(url).download_to(path).await
    }

    /// Downloads `url` according to `options`.
    pub async fn download_with_options(
        &self,
        url: impl Into<String>,
        options: DownloadOptions,
    ) -> Result<DownloadResult, Error> {
        self.get(url).download_with(options).await
    }

    /// Whether [`Client::close`] has been called on any clone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// In-flight connection counts per host, for metrics.
    #[must_use]
    pub fn host_connection_counts(&self) -> HashMap<String, u32> {
        self.inner.admission.snapshot()
    }

    /// Closes the client: new requests fail with [`Error::Closed`]
    /// immediately, while requests already in flight get a grace period to
    /// drain. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing client, draining in-flight requests");

        let drain = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
            debug!("close grace period elapsed with requests still in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_client_rejects_requests() {
        let client = Client::new(Config::testing()).unwrap();
        client.close().await;

        let err = client.get("http://example.com/").send().await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = Client::new(Config::testing()).unwrap();
        client.close().await;
        client.close().await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn clones_share_lifecycle() {
        let client = Client::new(Config::testing()).unwrap();
        let clone = client.clone();
        client.close().await;
        assert!(clone.is_closed());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = Config {
            max_retries: 99,
            ..Config::default()
        };
        assert!(matches!(
            Client::new(config),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn presets_construct() {
        assert!(Client::with_defaults().is_ok());
        assert!(Client::secure().is_ok());
        assert!(Client::performance().is_ok());
        assert!(Client::minimal().is_ok());
    }
}
