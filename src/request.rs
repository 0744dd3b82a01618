//! Request descriptor, body variants and the request builder.
//!
//! A [`RequestBuilder`] is the option surface of the client: every method
//! mutates the underlying descriptor, later calls override earlier ones for
//! the same field, and nothing is validated until `send()` hands the request
//! to the pipeline. Builder methods that can fail (JSON serialization,
//! cookie-string parsing) defer their error to `send()` so call chains stay
//! ergonomic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use reqwest::Method;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::cookies::{self, Cookie};
use crate::domain::DomainState;
use crate::download::{DownloadOptions, DownloadResult};
use crate::error::Error;
use crate::response::Response;
use crate::{download, execute};

pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";
pub(crate) const CONTENT_TYPE_XML: &str = "application/xml";
pub(crate) const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";
pub(crate) const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
pub(crate) const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// A reader used as a streaming request body.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin + 'static>;

/// The request body, kept as a descriptor so retries can rebuild the wire
/// body from scratch on every attempt.
pub(crate) enum Body {
    None,
    Bytes {
        content_type: Option<String>,
        data: Vec<u8>,
    },
    Json(serde_json::Value),
    Xml(String),
    Text(String),
    Form(Vec<(String, String)>),
    Multipart(MultipartForm),
    /// Read lazily from disk at dispatch time.
    File(PathBuf),
    /// Consumed on first use; disables retries.
    Reader(Option<BodyReader>),
}

impl Body {
    /// The content type implied by the body tag, used unless the caller set
    /// an explicit `Content-Type` header.
    pub(crate) fn content_type(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Bytes { content_type, .. } => content_type.as_deref(),
            Self::Json(_) => Some(CONTENT_TYPE_JSON),
            Self::Xml(_) => Some(CONTENT_TYPE_XML),
            Self::Text(_) => Some(CONTENT_TYPE_TEXT),
            Self::Form(_) => Some(CONTENT_TYPE_FORM),
            // reqwest generates the boundary-qualified value itself.
            Self::Multipart(_) => None,
            Self::File(_) => Some(CONTENT_TYPE_OCTET_STREAM),
            Self::Reader(_) => None,
        }
    }

    /// Whether the body can be rebuilt for another attempt.
    pub(crate) const fn is_replayable(&self) -> bool {
        !matches!(self, Self::Reader(_))
    }

    pub(crate) const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("Body::None"),
            Self::Bytes { data, .. } => write!(f, "Body::Bytes({} bytes)", data.len()),
            Self::Json(_) => f.write_str("Body::Json"),
            Self::Xml(_) => f.write_str("Body::Xml"),
            Self::Text(_) => f.write_str("Body::Text"),
            Self::Form(pairs) => write!(f, "Body::Form({} fields)", pairs.len()),
            Self::Multipart(form) => write!(f, "Body::Multipart({} parts)", form.parts.len()),
            Self::File(path) => write!(f, "Body::File({})", path.display()),
            Self::Reader(_) => f.write_str("Body::Reader"),
        }
    }
}

/// A multipart form kept in materialized parts so every retry attempt can
/// rebuild the wire encoding.
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    parts: Vec<MultipartPart>,
}

#[derive(Debug, Clone)]
enum MultipartPart {
    Text { name: String, value: String },
    Bytes {
        name: String,
        data: Vec<u8>,
        filename: Option<String>,
        content_type: Option<String>,
    },
}

impl MultipartForm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plain text field.
    #[must_use]
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(MultipartPart::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Adds a binary field without filename metadata.
    #[must_use]
    pub fn bytes(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.parts.push(MultipartPart::Bytes {
            name: name.into(),
            data,
            filename: None,
            content_type: None,
        });
        self
    }

    /// Adds a file field with filename and content type.
    #[must_use]
    pub fn file_bytes(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.parts.push(MultipartPart::Bytes {
            name: name.into(),
            data,
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
        });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub(crate) fn to_reqwest(&self) -> Result<reqwest::multipart::Form, Error> {
        let mut form = reqwest::multipart::Form::new();
        for part in &self.parts {
            match part {
                MultipartPart::Text { name, value } => {
                    form = form.text(name.clone(), value.clone());
                }
                MultipartPart::Bytes {
                    name,
                    data,
                    filename,
                    content_type,
                } => {
                    let mut p = reqwest::multipart::Part::bytes(data.clone());
                    if let Some(filename) = filename {
                        p = p.file_name(filename.clone());
                    }
                    if let Some(content_type) = content_type {
                        p = p.mime_str(content_type).map_err(|_| {
                            Error::invalid_header("content-type", "invalid MIME type for part")
                        })?;
                    }
                    form = form.part(name.clone(), p);
                }
            }
        }
        Ok(form)
    }
}

/// Internal request descriptor assembled by the builder and consumed by the
/// execution pipeline.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) method: Method,
    pub(crate) raw_url: String,
    /// Lowercased name → value. Insertion order preserved, later writes win.
    pub(crate) headers: IndexMap<String, String>,
    /// Ordered multi-map; duplicate keys allowed.
    pub(crate) query: Vec<(String, String)>,
    pub(crate) body: Body,
    /// Cookies attached by the caller, by name, last writer wins.
    pub(crate) cookies: IndexMap<String, Cookie>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) follow_redirects: Option<bool>,
    pub(crate) max_redirects: Option<u32>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl Request {
    pub(crate) fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            raw_url: url.into(),
            headers: IndexMap::new(),
            query: Vec::new(),
            body: Body::None,
            cookies: IndexMap::new(),
            timeout: None,
            max_retries: None,
            follow_redirects: None,
            max_redirects: None,
            cancel: None,
        }
    }

    pub(crate) fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Builder for one request. Created by the verb methods on
/// [`Client`] and [`DomainClient`][crate::DomainClient].
#[must_use = "a request builder does nothing until you call send()"]
pub struct RequestBuilder {
    client: Client,
    request: Request,
    /// Present when the builder was created by a `DomainClient`; receives
    /// captured headers/cookies and response cookies.
    domain: Option<Arc<std::sync::RwLock<DomainState>>>,
    captured_headers: Vec<(String, String)>,
    captured_cookies: Vec<Cookie>,
    error: Option<Error>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, method: Method, url: impl Into<String>) -> Self {
        Self {
            client,
            request: Request::new(method, url),
            domain: None,
            captured_headers: Vec::new(),
            captured_cookies: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn with_domain(mut self, state: Arc<std::sync::RwLock<DomainState>>) -> Self {
        self.domain = Some(state);
        self
    }

    /// A builder that fails at `send()` with `error`. Used when the URL
    /// cannot even be resolved to something dispatchable.
    pub(crate) fn with_error(mut self, error: Error) -> Self {
        self.defer(error);
        self
    }

    /// Seeds state without marking it as caller-provided. Used by
    /// `DomainClient` auto-send so per-request options still override.
    pub(crate) fn seed_header(mut self, name: &str, value: &str) -> Self {
        self.request.set_header(name, value);
        self
    }

    pub(crate) fn seed_cookie(mut self, cookie: Cookie) -> Self {
        self.request.cookies.insert(cookie.name().to_string(), cookie);
        self
    }

    fn defer(&mut self, err: Error) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    // -- Headers ------------------------------------------------------------

    /// Sets a header, replacing any previous value for the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        self.captured_headers.push((name.clone(), value.clone()));
        self.request.set_header(&name, value);
        self
    }

    /// Sets several headers at once.
    pub fn headers<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in entries {
            self = self.header(name, value);
        }
        self
    }

    pub fn user_agent(self, value: impl Into<String>) -> Self {
        self.header("user-agent", value)
    }

    pub fn content_type(self, value: impl Into<String>) -> Self {
        self.header("content-type", value)
    }

    pub fn accept(self, value: impl Into<String>) -> Self {
        self.header("accept", value)
    }

    pub fn accept_json(self) -> Self {
        self.accept(CONTENT_TYPE_JSON)
    }

    pub fn accept_xml(self) -> Self {
        self.accept(CONTENT_TYPE_XML)
    }

    // -- Auth ---------------------------------------------------------------

    /// Sets `Authorization: Bearer <token>`.
    pub fn bearer_auth(self, token: impl AsRef<str>) -> Self {
        self.header("authorization", format!("Bearer {}", token.as_ref()))
    }

    /// Sets `Authorization: Basic <credentials>`.
    pub fn basic_auth(self, user: impl AsRef<str>, password: impl AsRef<str>) -> Self {
        use base64::Engine as _;
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", user.as_ref(), password.as_ref()));
        self.header("authorization", format!("Basic {credentials}"))
    }

    // -- Query --------------------------------------------------------------

    /// Appends one query parameter. Duplicate keys are kept in order.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.query.push((key.into(), value.into()));
        self
    }

    /// Appends several query parameters.
    pub fn query_pairs<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in pairs {
            self.request.query.push((key.into(), value.into()));
        }
        self
    }

    // -- Body ---------------------------------------------------------------

    /// JSON body; sets `Content-Type: application/json` unless overridden.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => self.request.body = Body::Json(v),
            Err(e) => self.defer(Error::Json(e)),
        }
        self
    }

    /// Pre-serialized XML body; sets `Content-Type: application/xml`.
    pub fn xml(mut self, xml: impl Into<String>) -> Self {
        self.request.body = Body::Xml(xml.into());
        self
    }

    /// URL-encoded form body.
    pub fn form<I, K, V>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.request.body = Body::Form(fields);
        self
    }

    /// Multipart form body.
    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.request.body = Body::Multipart(form);
        self
    }

    /// Plain text body.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.request.body = Body::Text(text.into());
        self
    }

    /// Binary body with a caller-supplied content type.
    pub fn binary(mut self, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.request.body = Body::Bytes {
            content_type: Some(content_type.into()),
            data,
        };
        self
    }

    /// Raw bytes without an implied content type.
    pub fn raw(mut self, data: Vec<u8>) -> Self {
        self.request.body = Body::Bytes {
            content_type: None,
            data,
        };
        self
    }

    /// Uploads a file from disk. The path goes through the same validation
    /// as download destinations; contents are read at dispatch time.
    pub fn file(mut self, path: impl AsRef<str>) -> Self {
        match crate::validate::file_path(path.as_ref()) {
            Ok(p) => self.request.body = Body::File(p),
            Err(e) => self.defer(e),
        }
        self
    }

    /// Streaming body. Disables retries for this request since the reader
    /// can only be consumed once.
    pub fn body_reader(mut self, reader: BodyReader) -> Self {
        self.request.body = Body::Reader(Some(reader));
        self
    }

    // -- Cookies ------------------------------------------------------------

    /// Attaches a cookie to this request.
    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.captured_cookies.push(cookie.clone());
        self.request.cookies.insert(cookie.name().to_string(), cookie);
        self
    }

    /// Attaches several cookies.
    pub fn cookies<I: IntoIterator<Item = Cookie>>(mut self, cookies: I) -> Self {
        for cookie in cookies {
            self = self.cookie(cookie);
        }
        self
    }

    /// Builds a cookie from a name/value pair and attaches it.
    pub fn cookie_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        match Cookie::new(name, value) {
            Ok(cookie) => self = self.cookie(cookie),
            Err(e) => self.defer(e),
        }
        self
    }

    /// Parses a `name=value; name=value` list and attaches every cookie.
    pub fn cookie_str(mut self, cookies: &str) -> Self {
        match cookies::parse_cookie_list(cookies) {
            Ok(parsed) => {
                for cookie in parsed {
                    self = self.cookie(cookie);
                }
            }
            Err(e) => self.defer(e),
        }
        self
    }

    // -- Timing and policy --------------------------------------------------

    /// Per-request deadline; combined with the config timeout by taking the
    /// minimum.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = Some(timeout);
        self
    }

    /// Overrides the configured retry budget for this request.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.request.max_retries = Some(retries);
        self
    }

    /// Cancellation token observed at every suspension point.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.request.cancel = Some(token);
        self
    }

    /// Per-request redirect policy.
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.request.follow_redirects = Some(follow);
        self
    }

    /// Per-request redirect ceiling, clamped to `[0, 50]`.
    pub fn max_redirects(mut self, max: u32) -> Self {
        if max > crate::config::MAX_REDIRECT_LIMIT {
            self.defer(Error::invalid_config(
                "max_redirects",
                "must be at most 50",
            ));
        } else {
            self.request.max_redirects = Some(max);
        }
        self
    }

    // -- Dispatch -----------------------------------------------------------

    /// Runs the request through the pipeline and materializes the response.
    pub async fn send(mut self) -> Result<Response, Error> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }

        if let Some(state) = &self.domain {
            DomainState::capture(state, &self.captured_headers, &self.captured_cookies)?;
        }

        let response = execute::execute(&self.client, self.request).await?;

        if let Some(state) = &self.domain {
            DomainState::absorb_response_cookies(state, response.cookies());
        }

        Ok(response)
    }

    /// Streams the response body to `path` with default download options.
    pub async fn download_to(self, path: impl Into<PathBuf>) -> Result<DownloadResult, Error> {
        self.download_with(DownloadOptions::new(path)).await
    }

    /// Streams the response body to disk per `options`.
    pub async fn download_with(mut self, options: DownloadOptions) -> Result<DownloadResult, Error> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }

        if let Some(state) = &self.domain {
            DomainState::capture(state, &self.captured_headers, &self.captured_cookies)?;
        }

        download::run(&self.client, self.request, options).await
    }
}

impl std::fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("method", &self.request.method)
            .field("url", &self.request.raw_url)
            .field("pending_error", &self.error.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_names_are_case_insensitive() {
        let mut request = Request::new(Method::GET, "http://example.com");
        request.set_header("X-Token", "one");
        request.set_header("x-token", "two");
        assert_eq!(request.header("X-TOKEN"), Some("two"));
        assert_eq!(request.headers.len(), 1);
    }

    #[test]
    fn body_content_types() {
        assert_eq!(
            Body::Json(serde_json::json!({})).content_type(),
            Some(CONTENT_TYPE_JSON)
        );
        assert_eq!(Body::Xml(String::new()).content_type(), Some(CONTENT_TYPE_XML));
        assert_eq!(Body::Form(vec![]).content_type(), Some(CONTENT_TYPE_FORM));
        assert_eq!(
            Body::Text(String::new()).content_type(),
            Some(CONTENT_TYPE_TEXT)
        );
        assert_eq!(Body::None.content_type(), None);
        assert_eq!(
            Body::Bytes {
                content_type: Some("image/png".into()),
                data: vec![]
            }
            .content_type(),
            Some("image/png")
        );
    }

    #[test]
    fn reader_bodies_are_not_replayable() {
        let reader: BodyReader = Box::new(std::io::Cursor::new(vec![1, 2, 3]));
        assert!(!Body::Reader(Some(reader)).is_replayable());
        assert!(Body::Text("x".into()).is_replayable());
        assert!(Body::Multipart(MultipartForm::new()).is_replayable());
    }

    #[test]
    fn multipart_form_collects_parts() {
        let form = MultipartForm::new()
            .text("field", "value")
            .file_bytes("upload", "a.bin", "application/octet-stream", vec![0u8; 8]);
        assert!(!form.is_empty());
        assert!(form.to_reqwest().is_ok());
    }

    #[test]
    fn multipart_rejects_bad_mime() {
        let form = MultipartForm::new().file_bytes("f", "a.bin", "not a mime\n", vec![]);
        assert!(form.to_reqwest().is_err());
    }
}
