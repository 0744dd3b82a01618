//! The execution pipeline: one logical request from descriptor to response.
//!
//! Order of operations per call: closed-client check → validation →
//! admission → retry loop, where each attempt claims a per-host slot and
//! runs the redirect loop around the transport round-trip. Every suspension
//! point (admission wait, round-trip, backoff sleep, body read) races the
//! caller's cancellation token.
//!
//! Downloads use [`dispatch`] directly and stream the body; everything else
//! goes through [`execute`], which materializes the body under the size cap
//! and decompresses gzip/deflate payloads.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::read::{MultiGzDecoder, ZlibDecoder};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE,
    COOKIE, SET_COOKIE, USER_AGENT,
};
use reqwest::Method;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::admission::GlobalPermit;
use crate::client::{Client, ClientInner, InFlightGuard};
use crate::cookies::Cookie;
use crate::error::Error;
use crate::redirect;
use crate::request::{Body, Request};
use crate::response::{Meta, Response};
use crate::retry::{self, RetryPolicy};
use crate::validate;

/// A dispatched request whose status and headers have arrived but whose
/// body has not been consumed. Holds the admission permit and the in-flight
/// guard so resource accounting spans body streaming.
pub(crate) struct Dispatched {
    pub(crate) response: reqwest::Response,
    pub(crate) meta: Meta,
    pub(crate) started: Instant,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) inner: Arc<ClientInner>,
    _permit: GlobalPermit,
    _guard: InFlightGuard,
}

/// Full pipeline: dispatch, then materialize the body.
pub(crate) async fn execute(client: &Client, request: Request) -> Result<Response, Error> {
    let dispatched = dispatch(client, request).await?;
    materialize(dispatched).await
}

/// Runs validation, admission and the retry/redirect loops, stopping as soon
/// as response headers are in.
pub(crate) async fn dispatch(client: &Client, mut request: Request) -> Result<Dispatched, Error> {
    let inner = client.inner();
    inner.ensure_open()?;
    let guard = InFlightGuard::new(Arc::clone(&inner));

    let started = Instant::now();
    let config = &inner.config;

    // -- Validation. Nothing reaches the retry loop unvalidated. -----------
    let mut url = validate::url(&request.raw_url, config.allow_private_ips)?;
    if !request.query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &request.query {
            pairs.append_pair(key, value);
        }
        drop(pairs);
    }
    for (name, value) in &request.headers {
        validate::header_name(name)?;
        validate::header_value(name, value)?;
    }

    // File bodies are read once up front so retries can replay the bytes.
    if let Body::File(path) = &request.body {
        let data = tokio::fs::read(path).await?;
        request.body = Body::Bytes {
            content_type: Some(crate::request::CONTENT_TYPE_OCTET_STREAM.to_string()),
            data,
        };
    }

    let host = url.host_str().unwrap_or_default().to_string();
    let cancel = request.cancel.clone();

    // -- Admission. A cancellation here never counts as an attempt. --------
    let permit = inner.admission.acquire(cancel.as_ref()).await?;

    let policy = {
        let policy = RetryPolicy::new(config, request.max_retries);
        if request.body.is_replayable() {
            policy
        } else {
            policy.single_attempt()
        }
    };
    let max_attempts = policy.max_retries + 1;
    let follow = request.follow_redirects.unwrap_or(config.follow_redirects);
    let max_redirects = request.max_redirects.unwrap_or(config.max_redirects);

    debug!(method = %request.method, url = %url, max_attempts, "dispatching request");

    let mut attempts = 0u32;
    let mut chain: Vec<Url> = Vec::new();

    let response = loop {
        attempts += 1;

        let attempt_result = match inner.admission.claim_host(&host) {
            Ok(_slot) => {
                attempt(&inner, &mut request, &url, follow, max_redirects, &mut chain, cancel.as_ref())
                    .await
            }
            Err(e) => Err(e),
        };

        match attempt_result {
            Ok(response) => {
                let status = response.status().as_u16();
                if retry::is_retryable_status(status) && attempts < max_attempts {
                    let retry_after = retry::parse_retry_after(response.headers());
                    let delay = policy.delay_for(attempts, retry_after);
                    info!(status, attempt = attempts, ?delay, "retrying on status");
                    drop(response);
                    sleep_cancellable(delay, cancel.as_ref()).await?;
                    continue;
                }
                break response;
            }
            Err(e) if e.is_retryable() && attempts < max_attempts => {
                let delay = policy.delay_for(attempts, None);
                warn!(error = %e, attempt = attempts, ?delay, "retrying on transport error");
                sleep_cancellable(delay, cancel.as_ref()).await?;
            }
            Err(e) => return Err(e),
        }
    };

    let redirect_count = u32::try_from(chain.len().saturating_sub(1)).unwrap_or(u32::MAX);
    let final_url = chain.last().cloned().unwrap_or_else(|| url.clone());

    let meta = Meta {
        method: request.method.clone(),
        url,
        final_url,
        duration: started.elapsed(),
        attempts,
        redirect_count,
        redirect_chain: chain,
        resumed: false,
    };

    Ok(Dispatched {
        response,
        meta,
        started,
        cancel,
        inner,
        _permit: permit,
        _guard: guard,
    })
}

/// One attempt: the redirect loop around transport round-trips.
async fn attempt(
    inner: &ClientInner,
    request: &mut Request,
    origin: &Url,
    follow: bool,
    max_redirects: u32,
    chain: &mut Vec<Url>,
    cancel: Option<&CancellationToken>,
) -> Result<reqwest::Response, Error> {
    chain.clear();
    chain.push(origin.clone());

    let mut current = origin.clone();
    let mut method = request.method.clone();
    let mut sensitive_allowed = true;
    let mut body_allowed = true;

    loop {
        let wire = build_wire_request(inner, request, &current, &method, sensitive_allowed, body_allowed)?;
        let host = current.host_str().unwrap_or_default().to_string();

        let round_trip = match cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => return Err(Error::Canceled),
                result = inner.http.execute(wire) => result,
            },
            None => inner.http.execute(wire).await,
        };
        let response = round_trip.map_err(|e| Error::from_transport(e, &host))?;

        if !follow {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let hop = redirect::evaluate(
            status,
            response.headers(),
            &current,
            &method,
            inner.config.allow_private_ips,
        )?;
        let Some(hop) = hop else {
            return Ok(response);
        };

        // Jar first: the hop response may scope cookies to the next origin.
        store_response_cookies(inner, &current, response.headers());

        let followed = u32::try_from(chain.len() - 1).unwrap_or(u32::MAX);
        if followed >= max_redirects {
            return Err(Error::TooManyRedirects {
                count: max_redirects,
                chain: chain.iter().map(Url::to_string).collect(),
            });
        }

        if !redirect::same_origin(&current, &hop.url) {
            sensitive_allowed = false;
        }
        if hop.strip_body {
            body_allowed = false;
        }

        info!(status, from = %current, to = %hop.url, "following redirect");
        method = hop.method;
        current = hop.url;
        chain.push(current.clone());
    }
}

/// Translates the request descriptor into a wire request for one hop.
fn build_wire_request(
    inner: &ClientInner,
    request: &mut Request,
    url: &Url,
    method: &Method,
    sensitive_allowed: bool,
    body_allowed: bool,
) -> Result<reqwest::Request, Error> {
    let config = &inner.config;
    let mut headers = HeaderMap::new();

    for (name, value) in &config.default_headers {
        insert_header(&mut headers, name, value)?;
    }
    for (name, value) in &request.headers {
        if !sensitive_allowed && redirect::SENSITIVE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        insert_header(&mut headers, name, value)?;
    }

    // Explicit request cookies (unless stripped cross-origin), then jar
    // cookies scoped to the current hop. Explicit names win.
    let mut cookie_pairs: Vec<(String, String)> = Vec::new();
    if sensitive_allowed {
        for cookie in request.cookies.values() {
            cookie_pairs.push((cookie.name().to_string(), cookie.value().to_string()));
        }
    }
    if config.enable_cookies {
        for (name, value) in inner.jar.cookies_for(url) {
            if !cookie_pairs.iter().any(|(existing, _)| *existing == name) {
                cookie_pairs.push((name, value));
            }
        }
    }
    if !cookie_pairs.is_empty() {
        let joined = cookie_pairs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        let value = HeaderValue::from_str(&joined)
            .map_err(|_| Error::invalid_cookie("cookie", "not a valid header value"))?;
        headers.insert(COOKIE, value);
    }

    if !headers.contains_key(USER_AGENT) {
        let value = HeaderValue::from_str(&config.user_agent)
            .map_err(|_| Error::invalid_config("user_agent", "not a valid header value"))?;
        headers.insert(USER_AGENT, value);
    }
    if !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    }
    if !headers.contains_key(ACCEPT_ENCODING) {
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));
    }
    if body_allowed && !headers.contains_key(CONTENT_TYPE) {
        if let Some(content_type) = request.body.content_type() {
            if let Ok(value) = HeaderValue::from_str(content_type) {
                headers.insert(CONTENT_TYPE, value);
            }
        }
    }

    let mut builder = inner.http.request(method.clone(), url.clone()).headers(headers);

    if let Some(timeout) = effective_timeout(config.timeout, request.timeout) {
        builder = builder.timeout(timeout);
    }

    if body_allowed {
        builder = match &mut request.body {
            Body::None => builder,
            Body::Bytes { data, .. } => builder.body(data.clone()),
            Body::Json(value) => builder.body(serde_json::to_vec(value)?),
            Body::Xml(text) | Body::Text(text) => builder.body(text.clone().into_bytes()),
            Body::Form(fields) => builder.body(encode_form(fields).into_bytes()),
            Body::Multipart(form) => builder.multipart(form.to_reqwest()?),
            Body::File(path) => builder.body(std::fs::read(path.as_path())?),
            Body::Reader(slot) => {
                let reader = slot.take().ok_or_else(|| {
                    Error::Io(std::io::Error::other(
                        "streaming request body was already consumed",
                    ))
                })?;
                builder.body(reqwest::Body::wrap_stream(ReaderStream::new(reader)))
            }
        };
    }

    builder.build().map_err(Error::Transport)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), Error> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::invalid_header(name, "not a valid header name"))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| Error::invalid_header(name.as_str(), "not a valid header value"))?;
    headers.insert(name, value);
    Ok(())
}

/// Percent-encodes form fields the same way a browser would.
fn encode_form(fields: &[(String, String)]) -> String {
    fields
        .iter()
        .map(|(key, value)| {
            format!("{}={}", urlencoding::encode(key), urlencoding::encode(value))
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// The engine ceiling and the per-request override combine by taking the
/// minimum; zero means unlimited.
fn effective_timeout(config_timeout: Duration, request_timeout: Option<Duration>) -> Option<Duration> {
    let ceiling = (!config_timeout.is_zero()).then_some(config_timeout);
    match (ceiling, request_timeout) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

async fn sleep_cancellable(
    delay: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<(), Error> {
    match cancel {
        Some(token) => tokio::select! {
            () = token.cancelled() => Err(Error::Canceled),
            () = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

fn store_response_cookies(inner: &ClientInner, url: &Url, headers: &HeaderMap) {
    if !inner.config.enable_cookies {
        return;
    }
    for cookie in parse_response_cookies(headers) {
        inner.jar.store(url, cookie);
    }
}

/// All `Set-Cookie` headers that parse; malformed ones are skipped.
fn parse_response_cookies(headers: &HeaderMap) -> Vec<Cookie> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| match Cookie::parse_set_cookie(value) {
            Ok(cookie) => Some(cookie),
            Err(e) => {
                debug!(error = %e, "ignoring malformed Set-Cookie");
                None
            }
        })
        .collect()
}

/// Reads the body under the configured cap, decompresses it, and assembles
/// the final [`Response`].
async fn materialize(dispatched: Dispatched) -> Result<Response, Error> {
    let Dispatched {
        mut response,
        mut meta,
        started,
        cancel,
        inner,
        _permit,
        _guard,
    } = dispatched;

    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or_default().to_string();
    let protocol = format!("{:?}", response.version());
    let headers = response.headers().clone();
    let content_length = response.content_length();

    let cookies = parse_response_cookies(&headers);
    if inner.config.enable_cookies {
        for cookie in &cookies {
            inner.jar.store(&meta.final_url, cookie.clone());
        }
    }

    let cap = inner.config.max_response_body_size;
    let host = meta.final_url.host_str().unwrap_or_default().to_string();

    let mut raw: Vec<u8> = Vec::new();
    loop {
        let chunk = match cancel.as_ref() {
            Some(token) => tokio::select! {
                () = token.cancelled() => return Err(Error::Canceled),
                chunk = response.chunk() => chunk,
            },
            None => response.chunk().await,
        };
        let Some(chunk) = chunk.map_err(|e| Error::from_transport(e, &host))? else {
            break;
        };
        if raw.len() + chunk.len() > cap {
            return Err(Error::BodyTooLarge { limit: cap });
        }
        raw.extend_from_slice(&chunk);
    }

    let decoded = decode_body(&headers, &raw, cap)?;

    meta.duration = started.elapsed();

    Ok(Response::new(
        status.as_u16(),
        status_text,
        protocol,
        headers,
        raw,
        decoded,
        cookies,
        content_length,
        meta,
    ))
}

/// Applies `Content-Encoding`. Only gzip, deflate and identity are
/// supported; anything else is [`Error::UnsupportedEncoding`].
fn decode_body(headers: &HeaderMap, raw: &[u8], cap: usize) -> Result<Vec<u8>, Error> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match encoding.as_str() {
        "" | "identity" => Ok(raw.to_vec()),
        "gzip" => decompress(MultiGzDecoder::new(raw), cap),
        "deflate" => decompress(ZlibDecoder::new(raw), cap),
        other => Err(Error::UnsupportedEncoding {
            encoding: other.to_string(),
        }),
    }
}

fn decompress<R: Read>(reader: R, cap: usize) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut limited = reader.take(cap as u64 + 1);
    limited
        .read_to_end(&mut out)
        .map_err(|e| Error::malformed(format!("decompression failed: {e}")))?;
    if out.len() > cap {
        return Err(Error::BodyTooLarge { limit: cap });
    }
    Ok(out)
}
