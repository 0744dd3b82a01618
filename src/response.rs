//! Materialized responses and per-call metadata.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use url::Url;

use crate::cookies::Cookie;
use crate::error::Error;

/// Execution metadata attached to every [`Response`] and
/// [`DownloadResult`][crate::DownloadResult].
#[derive(Debug, Clone)]
pub struct Meta {
    /// Method of the originating request.
    pub method: Method,
    /// URL the caller asked for.
    pub url: Url,
    /// URL that produced the final response (after redirects).
    pub final_url: Url,
    /// Wall time for the whole call, retries included.
    pub duration: Duration,
    /// Attempts made; at least 1, at most `max_retries + 1`.
    pub attempts: u32,
    /// Redirects followed by the final attempt.
    pub redirect_count: u32,
    /// Every URL visited by the final attempt, origin first.
    pub redirect_chain: Vec<Url>,
    /// Whether a download appended to an existing partial file.
    pub resumed: bool,
}

/// A fully materialized HTTP response.
///
/// Non-2xx statuses are *not* errors; use the status-class predicates or
/// [`Response::error_for_status`] when exception-style handling is wanted.
#[derive(Debug)]
pub struct Response {
    status: u16,
    status_text: String,
    protocol: String,
    headers: HeaderMap,
    raw: Vec<u8>,
    decoded: Vec<u8>,
    text: String,
    cookies: Vec<Cookie>,
    content_length: Option<u64>,
    meta: Meta,
}

impl Response {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        status: u16,
        status_text: String,
        protocol: String,
        headers: HeaderMap,
        raw: Vec<u8>,
        decoded: Vec<u8>,
        cookies: Vec<Cookie>,
        content_length: Option<u64>,
        meta: Meta,
    ) -> Self {
        let text = String::from_utf8_lossy(&decoded).into_owned();
        Self {
            status,
            status_text,
            protocol,
            headers,
            raw,
            decoded,
            text,
            cookies,
            content_length,
            meta,
        }
    }

    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    /// Protocol of the exchange, e.g. `HTTP/1.1` or `HTTP/2.0`.
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body bytes exactly as received on the wire (before decompression).
    #[must_use]
    pub fn raw_body(&self) -> &[u8] {
        &self.raw
    }

    /// Body bytes after any gzip/deflate decompression.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.decoded
    }

    /// Decompressed body decoded as (lossy) UTF-8.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Deserializes the decompressed body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.decoded).map_err(Error::Json)
    }

    /// Cookies set by the final response.
    #[must_use]
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// A response cookie by name.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name() == name)
    }

    /// `Content-Length` as reported by the server.
    #[must_use]
    pub const fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    #[must_use]
    pub const fn meta(&self) -> &Meta {
        &self.meta
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        self.status >= 300 && self.status < 400
    }

    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        self.status >= 400 && self.status < 500
    }

    #[must_use]
    pub const fn is_server_error(&self) -> bool {
        self.status >= 500 && self.status < 600
    }

    /// Turns a non-2xx response into [`Error::HttpStatus`]; passes 2xx
    /// through untouched.
    pub fn error_for_status(self) -> Result<Self, Error> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::HttpStatus {
                status: self.status,
                status_text: self.status_text,
                method: self.meta.method.to_string(),
                url: self.meta.url.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16) -> Response {
        let url = Url::parse("http://example.com/").unwrap();
        Response::new(
            status,
            "Test".to_string(),
            "HTTP/1.1".to_string(),
            HeaderMap::new(),
            b"body".to_vec(),
            b"body".to_vec(),
            Vec::new(),
            Some(4),
            Meta {
                method: Method::GET,
                url: url.clone(),
                final_url: url.clone(),
                duration: Duration::from_millis(5),
                attempts: 1,
                redirect_count: 0,
                redirect_chain: vec![url],
                resumed: false,
            },
        )
    }

    #[test]
    fn status_classes_partition() {
        for status in [200u16, 204, 299] {
            let r = response(status);
            assert!(r.is_success());
            assert!(!r.is_redirect() && !r.is_client_error() && !r.is_server_error());
        }
        for status in [300u16, 301, 399] {
            let r = response(status);
            assert!(r.is_redirect());
            assert!(!r.is_success() && !r.is_client_error() && !r.is_server_error());
        }
        for status in [400u16, 404, 499] {
            let r = response(status);
            assert!(r.is_client_error());
            assert!(!r.is_success() && !r.is_redirect() && !r.is_server_error());
        }
        for status in [500u16, 503, 599] {
            let r = response(status);
            assert!(r.is_server_error());
            assert!(!r.is_success() && !r.is_redirect() && !r.is_client_error());
        }
    }

    #[test]
    fn error_for_status_on_success_passes_through() {
        assert!(response(200).error_for_status().is_ok());
    }

    #[test]
    fn error_for_status_materializes_http_error() {
        let err = response(404).error_for_status().unwrap_err();
        match err {
            Error::HttpStatus { status, method, url, .. } => {
                assert_eq!(status, 404);
                assert_eq!(method, "GET");
                assert_eq!(url, "http://example.com/");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn text_is_lossy_utf8() {
        let url = Url::parse("http://example.com/").unwrap();
        let r = Response::new(
            200,
            "OK".into(),
            "HTTP/1.1".into(),
            HeaderMap::new(),
            vec![0xff, 0xfe],
            vec![0xff, 0xfe],
            Vec::new(),
            None,
            Meta {
                method: Method::GET,
                url: url.clone(),
                final_url: url.clone(),
                duration: Duration::ZERO,
                attempts: 1,
                redirect_count: 0,
                redirect_chain: vec![url],
                resumed: false,
            },
        );
        assert_eq!(r.text(), "\u{fffd}\u{fffd}");
    }
}
