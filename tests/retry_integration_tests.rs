//! Retry behavior: backoff, Retry-After, attempt accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier::{Client, Config, Error};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

fn test_client() -> Client {
    Client::new(Config::testing()).expect("client")
}

/// Fails `fail_count` times with `fail_status`, then answers 200.
struct FailThenSucceed {
    fail_count: usize,
    fail_status: u16,
    retry_after: Option<&'static str>,
    calls: Arc<AtomicUsize>,
}

impl FailThenSucceed {
    fn new(fail_count: usize, fail_status: u16) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                fail_count,
                fail_status,
                retry_after: None,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }

    fn with_retry_after(mut self, value: &'static str) -> Self {
        self.retry_after = Some(value);
        self
    }
}

impl Respond for FailThenSucceed {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        let seen = self.calls.fetch_add(1, Ordering::SeqCst);
        if seen < self.fail_count {
            let mut template = ResponseTemplate::new(self.fail_status);
            if let Some(value) = self.retry_after {
                template = template.insert_header("retry-after", value);
            }
            template
        } else {
            ResponseTemplate::new(200).set_body_string("ok")
        }
    }
}

#[tokio::test]
async fn retries_503_then_succeeds() {
    let server = MockServer::start().await;
    let (responder, calls) = FailThenSucceed::new(1, 503);
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(responder.with_retry_after("0"))
        .mount(&server)
        .await;

    let response = test_client()
        .get(format!("{}/flaky", server.uri()))
        .max_retries(2)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), "ok");
    assert_eq!(response.meta().attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_retries_return_the_last_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let response = test_client()
        .get(format!("{}/down", server.uri()))
        .max_retries(1)
        .send()
        .await
        .unwrap();

    // A non-2xx after the budget runs out is a response, not an error.
    assert_eq!(response.status(), 503);
    assert_eq!(response.meta().attempts, 2);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    let (responder, calls) = FailThenSucceed::new(5, 400);
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let response = test_client()
        .get(format!("{}/bad", server.uri()))
        .max_retries(3)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(response.meta().attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn each_retryable_status_is_retried() {
    for status in [408u16, 429, 500, 502, 504] {
        let server = MockServer::start().await;
        let (responder, calls) = FailThenSucceed::new(1, status);
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(responder)
            .mount(&server)
            .await;

        let response = test_client()
            .get(format!("{}/status", server.uri()))
            .max_retries(1)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200, "status {status} should retry");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

#[tokio::test]
async fn retry_after_seconds_delays_the_next_attempt() {
    let server = MockServer::start().await;
    let (responder, _calls) = FailThenSucceed::new(1, 429);
    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(responder.with_retry_after("1"))
        .mount(&server)
        .await;

    // The testing preset caps backoff at 250ms; raise the cap so the
    // server-requested pause is observable.
    let config = Config {
        max_retry_delay: Duration::from_secs(5),
        ..Config::testing()
    };
    let started = Instant::now();
    let response = Client::new(config)
        .unwrap()
        .get(format!("{}/limited", server.uri()))
        .max_retries(1)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    // The server asked for a 1s pause, longer than the 10ms test backoff.
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn zero_retries_means_one_attempt() {
    let server = MockServer::start().await;
    let (responder, calls) = FailThenSucceed::new(1, 503);
    Mock::given(method("GET"))
        .and(path("/once"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let response = test_client()
        .get(format!("{}/once", server.uri()))
        .max_retries(0)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.meta().attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn streaming_bodies_disable_retries() {
    let server = MockServer::start().await;
    let (responder, calls) = FailThenSucceed::new(1, 503);
    Mock::given(method("POST"))
        .and(path("/stream"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let reader: courier::BodyReader = Box::new(std::io::Cursor::new(b"streamed".to_vec()));
    let response = test_client()
        .post(format!("{}/stream", server.uri()))
        .body_reader(reader)
        .max_retries(3)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.meta().attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn replayable_bodies_are_resent_on_retry() {
    let server = MockServer::start().await;
    let (responder, calls) = FailThenSucceed::new(1, 502);
    Mock::given(method("POST"))
        .and(path("/replay"))
        .and(wiremock::matchers::body_string("payload"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let response = test_client()
        .post(format!("{}/replay", server.uri()))
        .text("payload")
        .max_retries(2)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    // Both attempts matched on the full body.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn connection_refused_is_a_retryable_dial_error() {
    // Nothing listens on port 1.
    let err = test_client()
        .get("http://127.0.0.1:1/unreachable")
        .max_retries(1)
        .send()
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(matches!(err, Error::Dial { .. } | Error::Transport(_)));
}

#[tokio::test]
async fn cancellation_aborts_between_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/always-503"))
        .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "30"))
        .mount(&server)
        .await;

    let token = courier::CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let err = test_client()
        .get(format!("{}/always-503", server.uri()))
        .max_retries(3)
        .cancel_token(token)
        .send()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Canceled));
    // Cancellation interrupted the 30s Retry-After sleep.
    assert!(started.elapsed() < Duration::from_secs(5));
}
