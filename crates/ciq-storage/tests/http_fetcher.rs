use std::time::Duration;

use ciq_core::{Domain, FetchError};
use ciq_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, PageFetcher, TokenBucketConfig};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        max_redirects: 3,
        backoff: BackoffPolicy::none(),
        ..Default::default()
    })
    .expect("client")
}

fn server_domain(server: &MockServer) -> Domain {
    Domain::parse(&server.uri()).expect("server domain")
}

#[tokio::test]
async fn falls_back_to_plain_http_and_returns_the_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>Acme</body></html>"))
        .mount(&server)
        .await;

    let domain = server_domain(&server);
    let page = fetcher().fetch(&domain).await.expect("page");

    assert_eq!(page.domain, domain);
    assert_eq!(page.status_code, 200);
    assert!(page.url_fetched.starts_with("http://"));
    assert_eq!(page.html_bytes, b"<html><body>Acme</body></html>");
}

#[tokio::test]
async fn forbidden_is_bot_blocked() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = fetcher().fetch(&server_domain(&server)).await.unwrap_err();
    assert_eq!(err, FetchError::BotBlocked { status: 403 });
}

#[tokio::test]
async fn server_errors_are_classified_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        },
        ..Default::default()
    })
    .expect("client");

    let err = fetcher.fetch(&server_domain(&server)).await.unwrap_err();
    assert_eq!(err, FetchError::ServerError { status: 503 });
}

#[tokio::test]
async fn whitespace_body_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("  \n\t "))
        .mount(&server)
        .await;

    let err = fetcher().fetch(&server_domain(&server)).await.unwrap_err();
    assert_eq!(err, FetchError::EmptyBody);
}

#[tokio::test]
async fn redirect_loops_are_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/again"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/again"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/"))
        .mount(&server)
        .await;

    let err = fetcher().fetch(&server_domain(&server)).await.unwrap_err();
    assert_eq!(err, FetchError::RedirectLoopExceeded);
}

#[tokio::test]
async fn slow_servers_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html>late</html>")
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_millis(200),
        backoff: BackoffPolicy::none(),
        ..Default::default()
    })
    .expect("client");

    let err = fetcher.fetch(&server_domain(&server)).await.unwrap_err();
    assert_eq!(err, FetchError::Timeout);
}

#[tokio::test]
async fn token_bucket_paces_consecutive_fetches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .expect(3)
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy::none(),
        token_bucket: TokenBucketConfig::per_second(10),
        ..Default::default()
    })
    .expect("client");
    let domain = server_domain(&server);

    let started = std::time::Instant::now();
    for _ in 0..3 {
        fetcher.fetch(&domain).await.expect("page");
    }
    assert!(started.elapsed() >= Duration::from_millis(190));
}
