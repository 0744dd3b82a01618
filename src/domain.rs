//! Per-domain stateful client: cookies and headers that persist across
//! requests to one base URL.
//!
//! State is a reader/writer lock around two small maps. Reads happen on
//! every request (auto-send); writes happen when the caller changes state
//! explicitly or a request/response carries something new (auto-capture /
//! auto-merge). Traffic is read-mostly, which is what the lock is picked
//! for.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use reqwest::Method;
use url::Url;

use crate::client::Client;
use crate::config::Config;
use crate::cookies::Cookie;
use crate::download::{DownloadOptions, DownloadResult};
use crate::error::Error;
use crate::request::RequestBuilder;
use crate::validate;

/// Cookie and header state persisted between calls of one [`DomainClient`].
#[derive(Debug, Default)]
pub(crate) struct DomainState {
    /// Cookie name → cookie, last writer wins.
    cookies: HashMap<String, Cookie>,
    /// Lowercased header name → value.
    headers: HashMap<String, String>,
}

fn read_state(state: &Arc<RwLock<DomainState>>) -> RwLockReadGuard<'_, DomainState> {
    match state.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_state(state: &Arc<RwLock<DomainState>>) -> RwLockWriteGuard<'_, DomainState> {
    match state.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl DomainState {
    /// Stores headers and cookies a request carried, validating first so
    /// persistent state can never hold something the pipeline would reject.
    pub(crate) fn capture(
        state: &Arc<RwLock<Self>>,
        headers: &[(String, String)],
        cookies: &[Cookie],
    ) -> Result<(), Error> {
        if headers.is_empty() && cookies.is_empty() {
            return Ok(());
        }
        for (name, value) in headers {
            validate::header_name(name)?;
            validate::header_value(name, value)?;
        }

        let mut guard = write_state(state);
        for (name, value) in headers {
            guard
                .headers
                .insert(name.to_ascii_lowercase(), value.clone());
        }
        for cookie in cookies {
            guard.cookies.insert(cookie.name().to_string(), cookie.clone());
        }
        Ok(())
    }

    /// Merges cookies from a response, last writer wins by name.
    pub(crate) fn absorb_response_cookies(state: &Arc<RwLock<Self>>, cookies: &[Cookie]) {
        if cookies.is_empty() {
            return;
        }
        let mut guard = write_state(state);
        for cookie in cookies {
            guard.cookies.insert(cookie.name().to_string(), cookie.clone());
        }
    }
}

/// A client bound to one base URL that remembers cookies and headers.
///
/// Cookies are always enabled on the underlying client. Requests may use
/// relative paths (joined to the base path), absolute paths, or full
/// `http(s)` URLs. Full URLs pass through unchanged even when they point
/// at a different host, which is deliberate: an explicit URL goes where it
/// says. Non-HTTP schemes (`file:`, `data:`, `javascript:`) are rejected.
#[derive(Debug, Clone)]
pub struct DomainClient {
    client: Client,
    base: Url,
    state: Arc<RwLock<DomainState>>,
}

impl DomainClient {
    /// Creates a domain client with the default config (cookies forced on).
    pub fn new(base_url: &str) -> Result<Self, Error> {
        Self::with_config(base_url, Config::default())
    }

    /// Creates a domain client with a custom config (cookies forced on).
    pub fn with_config(base_url: &str, mut config: Config) -> Result<Self, Error> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::invalid_url(base_url, e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::invalid_url(
                base_url,
                format!("unsupported scheme {:?}", base.scheme()),
            ));
        }
        if base.host_str().is_none_or(str::is_empty) {
            return Err(Error::invalid_url(base_url, "base URL has no host"));
        }

        config.enable_cookies = true;
        let client = Client::new(config)?;

        Ok(Self {
            client,
            base,
            state: Arc::new(RwLock::new(DomainState::default())),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Turns a caller-supplied target into an absolute URL.
    fn resolve_target(&self, target: &str) -> Result<String, Error> {
        if let Ok(parsed) = Url::parse(target) {
            return match parsed.scheme() {
                "http" | "https" => Ok(parsed.into()),
                other => Err(Error::invalid_url(
                    target,
                    format!("unsupported scheme {other:?}"),
                )),
            };
        }

        if target.starts_with('/') {
            let joined = self
                .base
                .join(target)
                .map_err(|e| Error::invalid_url(target, e.to_string()))?;
            return Ok(joined.into());
        }

        // Relative targets append to the base path.
        let mut base = self.base.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let joined = base
            .join(target)
            .map_err(|e| Error::invalid_url(target, e.to_string()))?;
        Ok(joined.into())
    }

    /// Builds a request with persistent state merged in before any
    /// per-request option, so per-request options override for that call.
    pub fn request(&self, method: Method, target: &str) -> RequestBuilder {
        match self.resolve_target(target) {
            Ok(url) => {
                let mut builder = self
                    .client
                    .request(method, url)
                    .with_domain(Arc::clone(&self.state));
                let guard = read_state(&self.state);
                for (name, value) in &guard.headers {
                    builder = builder.seed_header(name, value);
                }
                for cookie in guard.cookies.values() {
                    builder = builder.seed_cookie(cookie.clone());
                }
                builder
            }
            Err(e) => self
                .client
                .request(Method::GET, String::new())
                .with_error(e),
        }
    }

    pub fn get(&self, target: &str) -> RequestBuilder {
        self.request(Method::GET, target)
    }

    pub fn post(&self, target: &str) -> RequestBuilder {
        self.request(Method::POST, target)
    }

    pub fn put(&self, target: &str) -> RequestBuilder {
        self.request(Method::PUT, target)
    }

    pub fn patch(&self, target: &str) -> RequestBuilder {
        self.request(Method::PATCH, target)
    }

    pub fn delete(&self, target: &str) -> RequestBuilder {
        self.request(Method::DELETE, target)
    }

    pub fn head(&self, target: &str) -> RequestBuilder {
        self.request(Method::HEAD, target)
    }

    pub fn options(&self, target: &str) -> RequestBuilder {
        self.request(Method::OPTIONS, target)
    }

    /// Downloads `target` to `path` with default options.
    pub async fn download(
        &self,
        target: &str,
        path: impl Into<PathBuf>,
    ) -> Result<DownloadResult, Error> {
        self.get(target).download_to(path).await
    }

    /// Downloads `target` according to `options`.
    pub async fn download_with_options(
        &self,
        target: &str,
        options: DownloadOptions,
    ) -> Result<DownloadResult, Error> {
        self.get(target).download_with(options).await
    }

    // -- Persistent header management ---------------------------------------

    /// Sets a persistent header after validating it.
    pub fn set_header(&self, name: &str, value: &str) -> Result<(), Error> {
        validate::header_name(name)?;
        validate::header_value(name, value)?;
        write_state(&self.state)
            .headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        Ok(())
    }

    /// Sets several persistent headers; fails on the first invalid one
    /// without applying any.
    pub fn set_headers<I, K, V>(&self, entries: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries: Vec<(String, String)> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        for (name, value) in &entries {
            validate::header_name(name)?;
            validate::header_value(name, value)?;
        }
        let mut guard = write_state(&self.state);
        for (name, value) in entries {
            guard.headers.insert(name.to_ascii_lowercase(), value);
        }
        Ok(())
    }

    #[must_use]
    pub fn get_headers(&self) -> HashMap<String, String> {
        read_state(&self.state).headers.clone()
    }

    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<String> {
        read_state(&self.state)
            .headers
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    pub fn delete_header(&self, name: &str) {
        write_state(&self.state)
            .headers
            .remove(&name.to_ascii_lowercase());
    }

    pub fn clear_headers(&self) {
        write_state(&self.state).headers.clear();
    }

    // -- Persistent cookie management ---------------------------------------

    pub fn set_cookie(&self, cookie: Cookie) {
        write_state(&self.state)
            .cookies
            .insert(cookie.name().to_string(), cookie);
    }

    /// Builds and stores a cookie from a name/value pair.
    pub fn set_cookie_value(&self, name: &str, value: &str) -> Result<(), Error> {
        let cookie = Cookie::new(name, value)?;
        self.set_cookie(cookie);
        Ok(())
    }

    pub fn set_cookies<I: IntoIterator<Item = Cookie>>(&self, cookies: I) {
        let mut guard = write_state(&self.state);
        for cookie in cookies {
            guard.cookies.insert(cookie.name().to_string(), cookie);
        }
    }

    #[must_use]
    pub fn get_cookie(&self, name: &str) -> Option<Cookie> {
        read_state(&self.state).cookies.get(name).cloned()
    }

    #[must_use]
    pub fn get_cookies(&self) -> Vec<Cookie> {
        read_state(&self.state).cookies.values().cloned().collect()
    }

    pub fn delete_cookie(&self, name: &str) {
        write_state(&self.state).cookies.remove(name);
    }

    pub fn clear_cookies(&self) {
        write_state(&self.state).cookies.clear();
    }

    /// Closes the underlying client. Further requests fail with
    /// [`Error::Closed`].
    pub async fn close(&self) {
        self.client.close().await;
    }
}
