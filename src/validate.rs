//! Security validators for URLs, headers, cookies, file paths and IPs.
//!
//! Everything in here is a pure predicate over its input: no allocation
//! beyond error construction, no I/O, no filesystem probing (file-path
//! normalization is lexical so not-yet-existing download targets validate).
//!
//! The IP blocklist backs three separate layers: literal-host checks during
//! URL validation, redirect target re-validation, and the dial-hook
//! re-validation of resolved addresses in the transport adapter.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Component, Path, PathBuf};

use url::Url;

use crate::error::Error;

/// Longest URL the client will accept, in bytes.
pub const MAX_URL_LENGTH: usize = 8192;

/// Longest file path the download engine will accept, in bytes.
pub const MAX_FILE_PATH_LENGTH: usize = 4096;

/// Filesystem prefixes that downloads may never target.
const DENIED_PATH_PREFIXES: &[&str] = &[
    "/etc/",
    "/sys/",
    "/proc/",
    "/dev/",
    "/boot/",
    "/root/",
    "/usr/bin/",
    "/usr/sbin/",
    "/bin/",
    "/sbin/",
    "/var/run/",
    "/system/",
    "/library/",
    "/applications/",
    "c:/windows/",
    "c:/program files/",
    "c:/program files (x86)/",
];

/// RFC 7230 token byte, the only bytes legal in header and cookie names.
#[must_use]
pub const fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z')
}

/// Validates a header name: non-empty, token bytes only.
///
/// CR, LF, colon and all control bytes are outside the token set and are
/// rejected by the same rule.
pub fn header_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::invalid_header(name, "header name is empty"));
    }
    if let Some(b) = name.bytes().find(|b| !is_token_byte(*b)) {
        return Err(Error::invalid_header(
            name,
            format!("header name contains illegal byte 0x{b:02x}"),
        ));
    }
    Ok(())
}

/// Validates a header value: visible ASCII, obs-text (0x80–0xFF) and
/// horizontal tab. CR, LF and NUL are rejected, as are CR/LF smuggled in
/// percent-encoded form.
pub fn header_value(field: &str, value: &str) -> Result<(), Error> {
    for b in value.bytes() {
        let ok = matches!(b, 0x20..=0x7E | 0x80..=0xFF | b'\t');
        if !ok {
            return Err(Error::invalid_header(
                field,
                format!("header value contains illegal byte 0x{b:02x}"),
            ));
        }
    }
    if contains_encoded_line_break(value) {
        return Err(Error::invalid_header(
            field,
            "header value contains an encoded line break",
        ));
    }
    Ok(())
}

/// Detects `%0d` / `%0a` sequences so CRLF injection cannot ride through
/// percent-decoding done by a downstream proxy.
fn contains_encoded_line_break(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.windows(3).any(|w| {
        w[0] == b'%'
            && matches!(w[1], b'0')
            && matches!(w[2], b'a' | b'A' | b'd' | b'D')
    })
}

/// Validates a cookie name: same token rule as header names.
pub fn cookie_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::invalid_cookie(name, "cookie name is empty"));
    }
    if let Some(b) = name.bytes().find(|b| !is_token_byte(*b)) {
        return Err(Error::invalid_cookie(
            name,
            format!("cookie name contains illegal byte 0x{b:02x}"),
        ));
    }
    Ok(())
}

/// Validates a cookie value: printable ASCII without `"`, `,`, `;` or `\`.
/// Empty values are legal.
pub fn cookie_value(name: &str, value: &str) -> Result<(), Error> {
    for b in value.bytes() {
        let ok = matches!(b, 0x21..=0x7E) && !matches!(b, b'"' | b',' | b';' | b'\\');
        if !ok {
            return Err(Error::invalid_cookie(
                name,
                format!("cookie value contains illegal byte 0x{b:02x}"),
            ));
        }
    }
    Ok(())
}

/// Validates and parses a URL.
///
/// Scheme must be `http` or `https`, the host non-empty, the whole URL at
/// most [`MAX_URL_LENGTH`] bytes. With `allow_private_ips` false, literal IP
/// hosts on the blocklist are refused here; hostnames are deferred to the
/// dial-hook re-validation once they resolve.
pub fn url(raw: &str, allow_private_ips: bool) -> Result<Url, Error> {
    if raw.len() > MAX_URL_LENGTH {
        return Err(Error::invalid_url(raw, "URL exceeds the length limit"));
    }

    let parsed = Url::parse(raw).map_err(|e| Error::invalid_url(raw, e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::invalid_url(
                raw,
                format!("unsupported scheme {other:?}"),
            ));
        }
    }

    match parsed.host() {
        None => return Err(Error::invalid_url(raw, "URL has no host")),
        Some(url::Host::Domain(d)) if d.is_empty() => {
            return Err(Error::invalid_url(raw, "URL has an empty host"));
        }
        Some(url::Host::Domain(_)) => {}
        Some(url::Host::Ipv4(ip)) => {
            if !allow_private_ips && is_blocked_ip(IpAddr::V4(ip)) {
                return Err(Error::SsrfBlocked {
                    target: ip.to_string(),
                });
            }
        }
        Some(url::Host::Ipv6(ip)) => {
            if !allow_private_ips && is_blocked_ip(IpAddr::V6(ip)) {
                return Err(Error::SsrfBlocked {
                    target: ip.to_string(),
                });
            }
        }
    }

    Ok(parsed)
}

/// Whether an address must never be dialed when private IPs are disallowed.
///
/// Covers loopback, RFC 1918 private, link-local, CGNAT shared space,
/// multicast, reserved, broadcast and unspecified ranges, plus their
/// IPv6 equivalents and v4-mapped forms.
#[must_use]
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        // "this network" 0.0.0.0/8
        || o[0] == 0
        // shared address space (CGNAT) 100.64.0.0/10
        || (o[0] == 100 && (o[1] & 0xc0) == 64)
        // reserved 240.0.0.0/4
        || o[0] >= 240
}

fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    let seg = ip.segments();

    // v4-mapped ::ffff:a.b.c.d falls back to the v4 rules.
    if seg[..5] == [0, 0, 0, 0, 0] && seg[5] == 0xffff {
        let v4 = Ipv4Addr::new(
            (seg[6] >> 8) as u8,
            (seg[6] & 0xff) as u8,
            (seg[7] >> 8) as u8,
            (seg[7] & 0xff) as u8,
        );
        return is_blocked_ipv4(v4);
    }

    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // unique local fc00::/7
        || (seg[0] & 0xfe00) == 0xfc00
        // link-local fe80::/10
        || (seg[0] & 0xffc0) == 0xfe80
}

/// Validates a download destination and returns its normalized absolute form.
///
/// Rules: at most [`MAX_FILE_PATH_LENGTH`] bytes, no NUL/CR/LF, no UNC
/// prefix, no system-path prefix, and relative paths must stay inside the
/// working directory after `..` resolution.
pub fn file_path(raw: &str) -> Result<PathBuf, Error> {
    if raw.is_empty() {
        return Err(Error::InvalidFilePath {
            reason: "path is empty".into(),
        });
    }
    if raw.len() > MAX_FILE_PATH_LENGTH {
        return Err(Error::InvalidFilePath {
            reason: "path exceeds the length limit".into(),
        });
    }
    if raw.bytes().any(|b| matches!(b, 0 | b'\r' | b'\n')) {
        return Err(Error::InvalidFilePath {
            reason: "path contains a control byte".into(),
        });
    }
    if raw.starts_with("\\\\") || raw.starts_with("//") {
        return Err(Error::InvalidFilePath {
            reason: "UNC paths are not allowed".into(),
        });
    }

    let candidate = Path::new(raw);
    let was_relative = candidate.is_relative();

    let cwd = std::env::current_dir().map_err(|e| Error::InvalidFilePath {
        reason: format!("working directory unavailable: {e}"),
    })?;

    let absolute = if was_relative {
        cwd.join(candidate)
    } else {
        candidate.to_path_buf()
    };
    let normalized = normalize_lexically(&absolute);

    if was_relative && !normalized.starts_with(&cwd) {
        return Err(Error::PathTraversalDenied);
    }

    if let Some(prefix) = denied_prefix(&normalized) {
        return Err(Error::SystemPathDenied {
            prefix: prefix.to_string(),
        });
    }

    Ok(normalized)
}

/// Resolves `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(std::path::MAIN_SEPARATOR_STR),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
        }
    }
    out
}

fn denied_prefix(path: &Path) -> Option<&'static str> {
    let mut comparable = path.to_string_lossy().replace('\\', "/").to_lowercase();
    if !comparable.ends_with('/') {
        comparable.push('/');
    }
    DENIED_PATH_PREFIXES
        .iter()
        .find(|prefix| comparable.starts_with(*prefix))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_names_follow_token_rules() {
        assert!(header_name("Content-Type").is_ok());
        assert!(header_name("x-custom_1").is_ok());
        assert!(header_name("").is_err());
        assert!(header_name("Bad:Name").is_err());
        assert!(header_name("Bad Name").is_err());
        assert!(header_name("Bad\r\nName").is_err());
        assert!(header_name("Bad\u{7f}").is_err());
    }

    #[test]
    fn header_values_reject_line_breaks() {
        assert!(header_value("X", "plain value").is_ok());
        assert!(header_value("X", "tab\tseparated").is_ok());
        assert!(header_value("X", "utf8 é ok").is_ok());
        assert!(header_value("X", "bad\r\nvalue").is_err());
        assert!(header_value("X", "bad\0value").is_err());
    }

    #[test]
    fn header_values_reject_encoded_line_breaks() {
        assert!(header_value("X", "evil%0d%0aSet-Cookie: x").is_err());
        assert!(header_value("X", "evil%0A").is_err());
        assert!(header_value("X", "benign%20encoded").is_ok());
    }

    #[test]
    fn cookie_rules() {
        assert!(cookie_name("session").is_ok());
        assert!(cookie_name("").is_err());
        assert!(cookie_name("se;sion").is_err());
        assert!(cookie_value("c", "abc123!").is_ok());
        assert!(cookie_value("c", "").is_ok());
        assert!(cookie_value("c", "with space").is_err());
        assert!(cookie_value("c", "semi;colon").is_err());
        assert!(cookie_value("c", "quo\"te").is_err());
        assert!(cookie_value("c", "back\\slash").is_err());
    }

    #[test]
    fn url_scheme_and_host() {
        assert!(url("http://example.com/a", false).is_ok());
        assert!(url("https://example.com", false).is_ok());
        assert!(url("ftp://example.com", false).is_err());
        assert!(url("file:///etc/passwd", false).is_err());
        assert!(url("http://", false).is_err());
        assert!(url("not a url", false).is_err());
    }

    #[test]
    fn url_length_limit() {
        let long = format!("http://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(matches!(
            url(&long, false),
            Err(Error::InvalidUrl { .. })
        ));
    }

    #[test]
    fn url_blocks_private_literals() {
        assert!(matches!(
            url("http://127.0.0.1/x", false),
            Err(Error::SsrfBlocked { .. })
        ));
        assert!(matches!(
            url("http://192.168.1.10/x", false),
            Err(Error::SsrfBlocked { .. })
        ));
        assert!(matches!(
            url("http://[::1]/x", false),
            Err(Error::SsrfBlocked { .. })
        ));
        // Permitted when the client opts in.
        assert!(url("http://127.0.0.1/x", true).is_ok());
        // Public literals pass either way.
        assert!(url("http://203.0.113.1/x", false).is_ok());
    }

    #[test]
    fn blocked_ipv4_ranges() {
        let blocked = [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.0.1",
            "169.254.1.1",
            "100.64.0.1",
            "100.127.255.255",
            "0.0.0.0",
            "0.1.2.3",
            "224.0.0.1",
            "240.0.0.1",
            "255.255.255.255",
        ];
        for ip in blocked {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip} should be blocked");
        }

        let allowed = ["8.8.8.8", "203.0.113.1", "1.1.1.1", "100.128.0.1", "172.32.0.1"];
        for ip in allowed {
            assert!(!is_blocked_ip(ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[test]
    fn blocked_ipv6_ranges() {
        let blocked = ["::1", "::", "fc00::1", "fdab::1", "fe80::1", "ff02::1", "::ffff:127.0.0.1", "::ffff:10.0.0.1"];
        for ip in blocked {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip} should be blocked");
        }
        let allowed = ["2606:4700::1111", "::ffff:8.8.8.8"];
        for ip in allowed {
            assert!(!is_blocked_ip(ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[test]
    fn file_path_control_bytes_and_unc() {
        assert!(file_path("").is_err());
        assert!(file_path("a\0b").is_err());
        assert!(file_path("a\nb").is_err());
        assert!(file_path("//server/share").is_err());
        assert!(file_path("\\\\server\\share").is_err());
    }

    #[test]
    fn file_path_system_prefixes() {
        for denied in ["/etc/passwd", "/proc/self/environ", "/dev/null", "/root/.ssh/id_rsa", "/bin/sh"] {
            assert!(
                matches!(file_path(denied), Err(Error::SystemPathDenied { .. })),
                "{denied} should be denied"
            );
        }
        assert!(file_path("/tmp/downloads/file.bin").is_ok());
    }

    #[test]
    fn file_path_traversal() {
        let escape = "../".repeat(40) + "etc/passwd";
        assert!(matches!(
            file_path(&escape),
            Err(Error::PathTraversalDenied)
        ));
    }

    #[test]
    fn file_path_normalizes_dotdot() {
        let ok = file_path("/tmp/a/b/../c.bin").unwrap();
        assert_eq!(ok, PathBuf::from("/tmp/a/c.bin"));
    }

    #[test]
    fn file_path_length_limit() {
        let long = format!("/tmp/{}", "a".repeat(MAX_FILE_PATH_LENGTH));
        assert!(file_path(&long).is_err());
    }
}
