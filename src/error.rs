//! Error handling for the courier client.
//!
//! Every failure the crate can produce is a variant of one [`Error`] enum,
//! grouped into the same families the pipeline treats differently:
//!
//! 1. **Validation** errors: bad URLs, headers, cookies, file paths, config.
//! 2. **Security** errors: SSRF blocks and path denials. Never retried.
//! 3. **Lifecycle** errors: closed client, canceled request.
//! 4. **Transport** errors: dialing, TLS, timeouts. Retried per policy.
//! 5. **Protocol** errors: redirect limits, oversized or malformed bodies.
//! 6. **HTTP** status errors: only materialized on demand; a non-2xx
//!    response is not an error by itself.
//! 7. **Download** errors: file collision and destination problems.
//!
//! Messages are safe to log: they never embed header values or body content.

use std::time::Duration;

use thiserror::Error;

/// The phase of a request in which a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Waiting for an admission permit.
    Admission,
    /// Establishing the TCP connection.
    Connect,
    /// TLS handshake with the remote.
    TlsHandshake,
    /// Waiting for response headers.
    ResponseHeaders,
    /// Reading the response body.
    Body,
    /// The overall per-attempt deadline.
    Global,
}

impl TimeoutPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admission => "admission",
            Self::Connect => "connect",
            Self::TlsHandshake => "tls handshake",
            Self::ResponseHeaders => "response headers",
            Self::Body => "body",
            Self::Global => "global",
        }
    }
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // -- Validation ---------------------------------------------------------
    #[error("invalid URL: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header {field:?}: {reason}")]
    InvalidHeader { field: String, reason: String },

    #[error("invalid cookie {field:?}: {reason}")]
    InvalidCookie { field: String, reason: String },

    #[error("invalid file path: {reason}")]
    InvalidFilePath { reason: String },

    #[error("invalid config field `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    // -- Security -----------------------------------------------------------
    #[error("request blocked: {target} resolves to a disallowed address")]
    SsrfBlocked { target: String },

    #[error("file path is inside a protected system location ({prefix})")]
    SystemPathDenied { prefix: String },

    #[error("file path escapes the working directory")]
    PathTraversalDenied,

    // -- Lifecycle ----------------------------------------------------------
    #[error("client is closed")]
    Closed,

    #[error("request canceled")]
    Canceled,

    // -- Transport ----------------------------------------------------------
    #[error("connection to {host} failed")]
    Dial {
        host: String,
        #[source]
        source: reqwest::Error,
    },

    /// Name resolution produced a definitive "no such host". Unlike
    /// resolution timeouts this is terminal: retrying cannot help.
    #[error("host {host} could not be resolved")]
    HostNotFound { host: String },

    #[error("TLS handshake failed")]
    TlsHandshake,

    #[error("connection limit reached for {host}")]
    ConnLimit { host: String },

    #[error("timeout during {phase} after {elapsed:?}")]
    Timeout {
        phase: TimeoutPhase,
        elapsed: Duration,
    },

    #[error("proxy failure: {reason}")]
    Proxy { reason: String },

    /// Transport errors that do not map onto a more specific variant.
    #[error("transport error")]
    Transport(#[source] reqwest::Error),

    // -- Protocol -----------------------------------------------------------
    #[error("stopped after {count} redirects")]
    TooManyRedirects { count: u32, chain: Vec<String> },

    #[error("response body exceeds the {limit} byte limit")]
    BodyTooLarge { limit: usize },

    #[error("unsupported content encoding {encoding:?}")]
    UnsupportedEncoding { encoding: String },

    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    // -- HTTP ---------------------------------------------------------------
    /// Constructed by [`Response::error_for_status`][crate::Response::error_for_status]
    /// and by the download engine for non-2xx results. Not produced by the
    /// pipeline for ordinary responses.
    #[error("HTTP {status} {status_text} for {method} {url}")]
    HttpStatus {
        status: u16,
        status_text: String,
        method: String,
        url: String,
    },

    // -- Download -----------------------------------------------------------
    #[error("file already exists: {path}")]
    FileExists { path: String },

    #[error("destination is not writable: {path}")]
    DestinationNotWritable { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: sanitize_fragment(url),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_header(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidHeader {
            field: sanitize_fragment(field),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_cookie(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidCookie {
            field: sanitize_fragment(field),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            reason: reason.into(),
        }
    }

    /// Converts a [`reqwest::Error`] into the closest typed variant.
    ///
    /// The guard resolver smuggles [`Error::SsrfBlocked`] through the
    /// connector's error chain; it is recovered here so callers see the
    /// security error instead of a generic connect failure.
    pub(crate) fn from_transport(err: reqwest::Error, host: &str) -> Self {
        if let Some(blocked) = find_ssrf_block(&err) {
            return blocked;
        }

        if find_host_not_found(&err) {
            return Self::HostNotFound {
                host: host.to_string(),
            };
        }

        if err.is_timeout() {
            let phase = if err.is_connect() {
                TimeoutPhase::Connect
            } else {
                TimeoutPhase::Global
            };
            return Self::Timeout {
                phase,
                elapsed: Duration::ZERO,
            };
        }

        if err.is_connect() {
            return Self::Dial {
                host: host.to_string(),
                source: err,
            };
        }

        Self::Transport(err)
    }

    /// Whether the retry engine is allowed to re-attempt after this error.
    ///
    /// Validation, security, lifecycle and protocol failures are terminal.
    /// Name-resolution timeouts retry; a positive NXDOMAIN does not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Dial { .. }
            | Self::TlsHandshake
            | Self::ConnLimit { .. }
            | Self::Timeout { .. } => true,
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether this failure was caused by cancellation.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Detects the guard resolver's NotFound marker (an empty answer set) in a
/// transport error's source chain. Ambiguous system-resolver failures do not
/// match and stay retryable.
fn find_host_not_found(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::NotFound {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

/// Walks a transport error's source chain looking for an [`Error::SsrfBlocked`]
/// planted by the guard resolver.
fn find_ssrf_block(err: &reqwest::Error) -> Option<Error> {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(Error::SsrfBlocked { target }) = cause.downcast_ref::<Error>() {
            return Some(Error::SsrfBlocked {
                target: target.clone(),
            });
        }
        source = cause.source();
    }
    None
}

/// Truncates a fragment destined for an error message so full header bodies
/// or URLs with embedded credentials never end up in logs.
fn sanitize_fragment(input: &str) -> String {
    const MAX: usize = 64;
    let cleaned: String = input
        .chars()
        .map(|c| if c.is_control() { '.' } else { c })
        .take(MAX)
        .collect();
    if input.chars().count() > MAX {
        format!("{cleaned}…")
    } else {
        cleaned
    }
}
