//! Per-hop redirect decisions.
//!
//! The transport never follows redirects on its own; the pipeline calls
//! [`evaluate`] after each round-trip and decides whether to hop. Sensitive
//! headers are stripped by the pipeline *before* a cross-origin hop is
//! emitted, so there is no window in which credentials leak.

use reqwest::header::{HeaderMap, LOCATION};
use reqwest::Method;
use url::Url;

use crate::error::Error;
use crate::validate;

/// Headers that never cross an origin boundary on a redirect.
pub(crate) const SENSITIVE_HEADERS: [&str; 3] =
    ["authorization", "cookie", "proxy-authorization"];

/// The next hop of a redirect chain.
#[derive(Debug)]
pub(crate) struct Hop {
    pub(crate) url: Url,
    pub(crate) method: Method,
    /// True when standard semantics downgrade the method to GET and the
    /// request body must be dropped.
    pub(crate) strip_body: bool,
}

/// Inspects a response and computes the follow-up request, if any.
///
/// Returns `Ok(None)` for non-redirect responses and for 3xx responses
/// without a usable `Location`. The target is re-validated with the same
/// rules as a caller-supplied URL, so a redirect into private address space
/// fails with `SsrfBlocked` before any connection is dialed.
pub(crate) fn evaluate(
    status: u16,
    headers: &HeaderMap,
    current: &Url,
    method: &Method,
    allow_private_ips: bool,
) -> Result<Option<Hop>, Error> {
    if !matches!(status, 301 | 302 | 303 | 307 | 308) {
        return Ok(None);
    }

    let Some(location) = headers.get(LOCATION) else {
        return Ok(None);
    };
    let location = location
        .to_str()
        .map_err(|_| Error::malformed("Location header is not valid UTF-8"))?;

    let target = current
        .join(location)
        .map_err(|e| Error::malformed(format!("unresolvable Location header: {e}")))?;

    let target = validate::url(target.as_str(), allow_private_ips)?;

    let (next_method, strip_body) = next_method(status, method);

    Ok(Some(Hop {
        url: target,
        method: next_method,
        strip_body,
    }))
}

/// Standard method-rewrite semantics: `301/302/303` turn non-GET/HEAD
/// requests into body-less GETs; `307/308` preserve method and body.
fn next_method(status: u16, method: &Method) -> (Method, bool) {
    match status {
        301 | 302 | 303 => {
            if method == Method::GET || method == Method::HEAD {
                (method.clone(), false)
            } else {
                (Method::GET, true)
            }
        }
        _ => (method.clone(), false),
    }
}

/// Whether two URLs share an effective origin (scheme, host, port with
/// scheme defaults applied). Sensitive headers survive a hop only when they
/// do.
pub(crate) fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}
