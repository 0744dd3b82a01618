//! Cookie model, `Set-Cookie` parsing and the process-wide jar.
//!
//! The jar only participates when [`Config::enable_cookies`][crate::Config]
//! is on (the default client ships with it off). Persistence is in-memory
//! only; nothing is written to disk.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use url::Url;

use crate::error::Error;
use crate::validate;

/// A single HTTP cookie.
///
/// Construction through [`Cookie::new`] validates name and value; parsing
/// through [`Cookie::parse_set_cookie`] additionally picks up attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    secure: bool,
    http_only: bool,
    expires: Option<SystemTime>,
    max_age: Option<i64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let value = value.into();
        validate::cookie_name(&name)?;
        validate::cookie_value(&name, &value)?;
        Ok(Self {
            name,
            value,
            domain: None,
            path: None,
            secure: false,
            http_only: false,
            expires: None,
            max_age: None,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.secure
    }

    #[must_use]
    pub const fn is_http_only(&self) -> bool {
        self.http_only
    }

    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(normalize_domain(&domain.into()));
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Parses one `Set-Cookie` header value.
    ///
    /// Unknown attributes (`SameSite`, `Priority`, …) are ignored. `Max-Age`
    /// wins over `Expires` when both are present.
    pub fn parse_set_cookie(header: &str) -> Result<Self, Error> {
        let mut parts = header.split(';');

        let pair = parts.next().unwrap_or_default().trim();
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::invalid_cookie(pair, "missing `=` in cookie pair"))?;
        let mut cookie = Self::new(name.trim(), trim_quotes(value.trim()))?;

        for attr in parts {
            let attr = attr.trim();
            let (key, val) = attr
                .split_once('=')
                .map_or((attr, ""), |(k, v)| (k.trim(), v.trim()));

            if key.eq_ignore_ascii_case("domain") {
                if !val.is_empty() {
                    cookie.domain = Some(normalize_domain(val));
                }
            } else if key.eq_ignore_ascii_case("path") {
                if val.starts_with('/') {
                    cookie.path = Some(val.to_string());
                }
            } else if key.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if key.eq_ignore_ascii_case("httponly") {
                cookie.http_only = true;
            } else if key.eq_ignore_ascii_case("max-age") {
                if let Ok(seconds) = val.parse::<i64>() {
                    cookie.max_age = Some(seconds);
                }
            } else if key.eq_ignore_ascii_case("expires") {
                if let Ok(when) = httpdate::parse_http_date(val) {
                    cookie.expires = Some(when);
                }
            }
        }

        Ok(cookie)
    }

    /// Absolute expiry, if the cookie is not a session cookie.
    #[must_use]
    pub fn expires_at(&self, received: SystemTime) -> Option<SystemTime> {
        if let Some(seconds) = self.max_age {
            let expiry = if seconds <= 0 {
                SystemTime::UNIX_EPOCH
            } else {
                received + Duration::from_secs(seconds.unsigned_abs())
            };
            return Some(expiry);
        }
        self.expires
    }

    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.expires_at(now) {
            Some(at) => at <= now,
            None => false,
        }
    }
}

fn trim_quotes(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn normalize_domain(domain: &str) -> String {
    domain.trim_start_matches('.').to_ascii_lowercase()
}

/// Parses a `name=value; name=value` cookie list.
///
/// Entries are trimmed; an entry without `=` or with an empty name is an
/// error; empty values are allowed. An empty input yields no cookies.
pub fn parse_cookie_list(input: &str) -> Result<Vec<Cookie>, Error> {
    let mut cookies = Vec::new();
    for entry in input.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| Error::invalid_cookie(entry, "cookie entry is missing `=`"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::invalid_cookie(entry, "cookie name is empty"));
        }
        cookies.push(Cookie::new(name, value.trim())?);
    }
    Ok(cookies)
}

#[derive(Debug, Clone)]
struct StoredCookie {
    cookie: Cookie,
    /// Effective domain: the cookie's declared domain or the response host.
    domain: String,
    path: String,
    expires: Option<SystemTime>,
}

/// Process-wide cookie store keyed by `(effective domain, path)`.
///
/// Reads dominate writes under steady traffic; a single `RwLock` around the
/// map keeps lookups concurrent. Expired entries are evicted on store.
#[derive(Debug, Default)]
pub struct CookieJar {
    entries: RwLock<HashMap<(String, String), HashMap<String, StoredCookie>>>,
}

impl CookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a response cookie against the URL that issued it.
    /// Last writer wins per `(domain, path, name)`.
    pub fn store(&self, url: &Url, cookie: Cookie) {
        let Some(host) = url.host_str() else { return };
        let now = SystemTime::now();

        let domain = cookie
            .domain
            .clone()
            .unwrap_or_else(|| host.to_ascii_lowercase());
        let path = cookie.path.clone().unwrap_or_else(|| "/".to_string());
        let expires = cookie.expires_at(now);

        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.retain(|_, bucket| {
            bucket.retain(|_, stored| stored.expires.is_none_or(|at| at > now));
            !bucket.is_empty()
        });

        let stored = StoredCookie {
            cookie: cookie.clone(),
            domain: domain.clone(),
            path: path.clone(),
            expires,
        };
        entries
            .entry((domain, path))
            .or_default()
            .insert(cookie.name.clone(), stored);
    }

    /// Cookies applicable to a request URL, as `(name, value)` pairs.
    #[must_use]
    pub fn cookies_for(&self, url: &Url) -> Vec<(String, String)> {
        let Some(host) = url.host_str() else {
            return Vec::new();
        };
        let host = host.to_ascii_lowercase();
        let request_path = url.path();
        let https = url.scheme() == "https";
        let now = SystemTime::now();

        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut matched = Vec::new();
        for bucket in entries.values() {
            for stored in bucket.values() {
                if stored.expires.is_some_and(|at| at <= now) {
                    continue;
                }
                if !domain_match(&host, &stored.domain) {
                    continue;
                }
                if !path_match(request_path, &stored.path) {
                    continue;
                }
                if stored.cookie.secure && !https {
                    continue;
                }
                matched.push((stored.cookie.name.clone(), stored.cookie.value.clone()));
            }
        }
        matched.sort();
        matched
    }

    /// Drops every stored cookie.
    pub fn clear(&self) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.clear();
    }
}

/// RFC 6265 domain matching. IP hosts must match exactly.
fn domain_match(host: &str, cookie_domain: &str) -> bool {
    if host == cookie_domain {
        return true;
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return false;
    }
    host.len() > cookie_domain.len()
        && host.ends_with(cookie_domain)
        && host.as_bytes()[host.len() - cookie_domain.len() - 1] == b'.'
}

/// RFC 6265 path matching.
fn path_match(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}
