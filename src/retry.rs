//! Retry classification and backoff computation.
//!
//! A request execution is a loop of at most `max_retries + 1` attempts. The
//! policy decides two things per failed attempt: whether the failure class
//! is retryable at all, and how long to sleep before the next attempt.

use std::time::{Duration, SystemTime};

use reqwest::header::HeaderMap;

use crate::config::Config;

/// Whether an HTTP status code is worth retrying.
/// The set is exactly 408, 429, 500, 502, 503 and 504.
#[must_use]
pub const fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Effective retry policy for one request, combining agent config with the
/// per-request override.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub(crate) max_retries: u32,
    base_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub(crate) fn new(config: &Config, request_override: Option<u32>) -> Self {
        Self {
            max_retries: request_override.unwrap_or(config.max_retries),
            base_delay: config.retry_delay,
            backoff_factor: config.backoff_factor,
            max_delay: config.max_retry_delay,
            jitter: config.retry_jitter,
        }
    }

    /// A policy that never retries, used when the body cannot be replayed.
    pub(crate) fn single_attempt(mut self) -> Self {
        self.max_retries = 0;
        self
    }

    /// Delay before retry `k` (1-indexed), honoring a server-provided
    /// `Retry-After` when it is larger than the computed backoff. The result
    /// never exceeds `max_delay`.
    pub(crate) fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.backoff(retry);
        let chosen = match retry_after {
            Some(server) if server > computed => server,
            _ => computed,
        };
        chosen.min(self.max_delay)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(30) as i32;
        let millis = (self.base_delay.as_millis() as f64)
            * self.backoff_factor.powi(exponent);
        let millis = millis.min(self.max_delay.as_millis() as f64);

        let millis = if self.jitter {
            // Uniform in [0.5, 1.0] to spread synchronized retry storms.
            millis * 0.5f64.mul_add(fastrand::f64(), 0.5)
        } else {
            millis
        };

        Duration::from_millis(millis as u64)
    }
}

/// Parses a `Retry-After` header: either delay-seconds or an HTTP-date.
/// Dates in the past and malformed values yield `None`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?;

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(value).ok()?;
    date.duration_since(SystemTime::now()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
            jitter,
        }
    }

    #[test]
    fn retryable_status_set_is_exact() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status));
        }
        for status in [200, 201, 301, 400, 401, 404, 422, 501, 505, 599] {
            assert!(!is_retryable_status(status), "{status} must not retry");
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let p = policy(false);
        assert_eq!(p.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, None), Duration::from_millis(400));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let p = policy(false);
        assert_eq!(p.delay_for(20, None), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_in_range() {
        let p = policy(true);
        for _ in 0..100 {
            let d = p.delay_for(2, None);
            assert!(d >= Duration::from_millis(100), "too small: {d:?}");
            assert!(d <= Duration::from_millis(200), "too large: {d:?}");
        }
    }

    #[test]
    fn retry_after_overrides_when_larger() {
        let p = policy(false);
        let d = p.delay_for(1, Some(Duration::from_secs(3)));
        assert_eq!(d, Duration::from_secs(3));
    }

    #[test]
    fn computed_backoff_wins_when_larger_than_retry_after() {
        let p = policy(false);
        let d = p.delay_for(3, Some(Duration::from_millis(50)));
        assert_eq!(d, Duration::from_millis(400));
    }

    #[test]
    fn retry_after_is_capped() {
        let p = policy(false);
        let d = p.delay_for(1, Some(Duration::from_secs(120)));
        assert_eq!(d, Duration::from_secs(5));
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("120"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn parses_retry_after_http_date_in_past_as_none() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "retry-after",
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn missing_or_malformed_retry_after_is_none() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("soon-ish"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn override_replaces_config_budget() {
        let config = Config::default();
        let p = RetryPolicy::new(&config, Some(7));
        assert_eq!(p.max_retries, 7);
        let p = RetryPolicy::new(&config, None);
        assert_eq!(p.max_retries, config.max_retries);
        let p = RetryPolicy::new(&config, Some(5)).single_attempt();
        assert_eq!(p.max_retries, 0);
    }
}
