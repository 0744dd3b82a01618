#![forbid(unsafe_code)]
//! courier: a programmable HTTP client core for server-side workloads.
//!
//! The interesting parts of an outbound HTTP stack are rarely the request
//! builder; they are the execution engine underneath. courier owns that
//! engine: connection pooling and TLS via the transport, DNS resolution with
//! SSRF defense (every resolved address is re-validated before the dial),
//! bounded-concurrency admission, retries with exponential backoff, jitter
//! and `Retry-After`, redirect chains with sensitive-header stripping,
//! per-domain cookie/header persistence, and resumable streaming downloads.
//!
//! # Getting started
//!
//! ```no_run
//! # async fn run() -> Result<(), courier::Error> {
//! let client = courier::Client::with_defaults()?;
//!
//! let response = client
//!     .get("https://httpbin.org/get")
//!     .header("X-Request-Id", "demo-1")
//!     .query("page", "2")
//!     .send()
//!     .await?;
//!
//! println!("{} in {:?}", response.status(), response.meta().duration);
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```
//!
//! A non-2xx status is **not** an error: inspect it with the status-class
//! predicates, or opt into exception-style handling with
//! [`Response::error_for_status`].
//!
//! # Configuration
//!
//! [`Config`] is a plain value; presets derive from the default profile:
//!
//! ```no_run
//! # async fn run() -> Result<(), courier::Error> {
//! use std::time::Duration;
//!
//! let config = courier::Config {
//!     timeout: Duration::from_secs(10),
//!     max_retries: 5,
//!     ..courier::Config::default()
//! };
//! let client = courier::Client::new(config)?;
//! # Ok(())
//! # }
//! ```
//!
//! The client keeps its own copy: mutating the source value after
//! construction changes nothing.
//!
//! # Per-domain state
//!
//! [`DomainClient`] pins a base URL and remembers cookies and headers across
//! calls, captured from requests and merged from responses:
//!
//! ```no_run
//! # async fn run() -> Result<(), courier::Error> {
//! let api = courier::DomainClient::new("https://api.example.com")?;
//! api.post("login").cookie_value("session", "abc").send().await?;
//! // Later calls carry `session` plus whatever the server set.
//! let me = api.get("me").send().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Downloads
//!
//! ```no_run
//! # async fn run() -> Result<(), courier::Error> {
//! use courier::DownloadOptions;
//!
//! let client = courier::Client::with_defaults()?;
//! let result = client
//!     .download_with_options(
//!         "https://example.com/dataset.tar.gz",
//!         DownloadOptions::new("/tmp/dataset.tar.gz").resume(true),
//!     )
//!     .await?;
//! println!("wrote {} bytes (resumed: {})", result.bytes_written, result.resumed);
//! # Ok(())
//! # }
//! ```

use std::sync::{OnceLock, RwLock};

pub use reqwest::Method;
pub use tokio_util::sync::CancellationToken;
pub use url::Url;

mod admission;
mod client;
mod config;
mod cookies;
mod domain;
mod download;
mod error;
mod execute;
mod redirect;
mod request;
mod response;
mod retry;
mod transport;
pub mod validate;

pub use client::Client;
pub use config::{Config, ProxyMode, TlsVersion, DEFAULT_USER_AGENT};
pub use cookies::{parse_cookie_list, Cookie, CookieJar};
pub use domain::DomainClient;
pub use download::{DownloadOptions, DownloadResult, ProgressCallback};
pub use error::{Error, TimeoutPhase};
pub use request::{BodyReader, MultipartForm, RequestBuilder};
pub use response::{Meta, Response};
pub use retry::{is_retryable_status, parse_retry_after};

/// Process-wide default client used by the package-level functions. Created
/// lazily with [`Config::default`]; swap it with [`set_default_client`].
static DEFAULT_CLIENT: OnceLock<RwLock<Option<Client>>> = OnceLock::new();

fn default_slot() -> &'static RwLock<Option<Client>> {
    DEFAULT_CLIENT.get_or_init(|| RwLock::new(None))
}

/// The process default client, creating it on first use.
pub fn default_client() -> Result<Client, Error> {
    {
        let slot = match default_slot().read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
    }

    let mut slot = match default_slot().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(client) = slot.as_ref() {
        return Ok(client.clone());
    }
    let client = Client::with_defaults()?;
    *slot = Some(client.clone());
    Ok(client)
}

/// Replaces the process default client. Requests already running on the old
/// client finish undisturbed, since clones share state by `Arc`.
pub fn set_default_client(client: Client) {
    let mut slot = match default_slot().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *slot = Some(client);
}

/// Closes and removes the process default client, draining its in-flight
/// requests. The next package-level call creates a fresh one.
pub async fn close_default_client() {
    let taken = {
        let mut slot = match default_slot().write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take()
    };
    if let Some(client) = taken {
        client.close().await;
    }
}

/// `GET` on the default client.
pub fn get(url: impl Into<String>) -> Result<RequestBuilder, Error> {
    Ok(default_client()?.get(url))
}

/// `POST` on the default client.
pub fn post(url: impl Into<String>) -> Result<RequestBuilder, Error> {
    Ok(default_client()?.post(url))
}

/// `PUT` on the default client.
pub fn put(url: impl Into<String>) -> Result<RequestBuilder, Error> {
    Ok(default_client()?.put(url))
}

/// `PATCH` on the default client.
pub fn patch(url: impl Into<String>) -> Result<RequestBuilder, Error> {
    Ok(default_client()?.patch(url))
}

/// `DELETE` on the default client.
pub fn delete(url: impl Into<String>) -> Result<RequestBuilder, Error> {
    Ok(default_client()?.delete(url))
}

/// `HEAD` on the default client.
pub fn head(url: impl Into<String>) -> Result<RequestBuilder, Error> {
    Ok(default_client()?.head(url))
}

/// `OPTIONS` on the default client.
pub fn options(url: impl Into<String>) -> Result<RequestBuilder, Error> {
    Ok(default_client()?.options(url))
}

/// Downloads on the default client.
pub async fn download(
    url: impl Into<String>,
    path: impl Into<std::path::PathBuf>,
) -> Result<DownloadResult, Error> {
    default_client()?.download(url, path).await
}
