//! Cross-cutting engine properties: config immutability, admission
//! behavior under cancellation and saturation, multipart bodies.

use std::time::{Duration, Instant};

use courier::{CancellationToken, Client, Config, Error, MultipartForm};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn config_mutation_after_construction_is_invisible() {
    let mut config = Config::testing();
    let client = Client::new(config.clone()).unwrap();

    config.max_retries = 9;
    config.user_agent = "mutated/9.9".to_string();
    config.allow_private_ips = false;

    assert_eq!(client.config().max_retries, Config::testing().max_retries);
    assert_eq!(client.config().user_agent, Config::testing().user_agent);
    assert!(client.config().allow_private_ips);
}

#[tokio::test]
async fn cancellation_while_queued_for_admission() {
    let config = Config {
        max_concurrent_requests: 1,
        ..Config::testing()
    };
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/queued"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = Client::new(config).unwrap();

    // Occupy the only admission slot.
    let blocker = {
        let client = client.clone();
        let url = format!("{}/slow", server.uri());
        tokio::spawn(async move { client.get(url).send().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let err = client
        .get(format!("{}/queued", server.uri()))
        .cancel_token(token)
        .send()
        .await
        .unwrap_err();

    // Canceled promptly while waiting, long before the blocker finished.
    assert!(matches!(err, Error::Canceled));
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(blocker.await.unwrap().is_ok());
}

#[tokio::test]
async fn saturated_admission_still_serves_all_requests() {
    let config = Config {
        max_concurrent_requests: 2,
        ..Config::testing()
    };
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/work"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
        .mount(&server)
        .await;

    let client = Client::new(config).unwrap();
    let started = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        let url = format!("{}/work", server.uri());
        handles.push(tokio::spawn(async move { client.get(url).send().await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().status(), 200);
    }

    // Four 100ms requests through two slots need at least two waves.
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn multipart_bodies_carry_fields_and_files() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let form = MultipartForm::new()
        .text("description", "quarterly report")
        .file_bytes("file", "report.csv", "text/csv", b"a,b\n1,2\n".to_vec());

    let response = Client::new(Config::testing())
        .unwrap()
        .post(format!("{}/upload", server.uri()))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let requests = server.received_requests().await.unwrap();
    let upload = &requests[0];
    let content_type = upload
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("multipart/form-data; boundary="));

    let body = String::from_utf8_lossy(&upload.body);
    assert!(body.contains("quarterly report"));
    assert!(body.contains("filename=\"report.csv\""));
    assert!(body.contains("a,b"));
}

#[tokio::test]
async fn attempts_stay_within_bounds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/unstable"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    for max_retries in [0u32, 1, 3] {
        let response = Client::new(Config::testing())
            .unwrap()
            .get(format!("{}/unstable", server.uri()))
            .max_retries(max_retries)
            .send()
            .await
            .unwrap();

        let attempts = response.meta().attempts;
        assert!(attempts >= 1);
        assert!(attempts <= max_retries + 1);
        assert_eq!(attempts, max_retries + 1);
    }
}

#[tokio::test]
async fn timeout_option_bounds_slow_responses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/glacial"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let err = Client::new(Config::testing())
        .unwrap()
        .get(format!("{}/glacial", server.uri()))
        .timeout(Duration::from_millis(200))
        .max_retries(0)
        .send()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. } | Error::Transport(_)));
    assert!(err.is_retryable());
}
