use std::time::Duration;

use ciq_extract::{InferenceClient, InferenceError, OllamaClient, OllamaConfig};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> OllamaClient {
    OllamaClient::new(OllamaConfig {
        endpoint: format!("{}/api/generate", server.uri()),
        timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .expect("client")
}

#[tokio::test]
async fn sends_a_non_streaming_request_and_reads_the_response_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({
            "model": "phi",
            "stream": false,
            "options": { "num_predict": 500, "top_k": 10 }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "phi",
            "response": "  {\"company_name\": \"C Inc\"}\n",
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let text = client_for(&server).generate("prompt").await.expect("text");
    assert_eq!(text, "{\"company_name\": \"C Inc\"}");
}

#[tokio::test]
async fn server_errors_mean_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = client_for(&server).generate("prompt").await.unwrap_err();
    assert!(matches!(err, InferenceError::Unavailable(_)));
}

#[tokio::test]
async fn missing_response_field_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "done": true })))
        .mount(&server)
        .await;

    let err = client_for(&server).generate("prompt").await.unwrap_err();
    assert!(matches!(err, InferenceError::Protocol(_)));
}

#[tokio::test]
async fn slow_model_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "response": "{}" }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let client = OllamaClient::new(OllamaConfig {
        endpoint: format!("{}/api/generate", server.uri()),
        timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .expect("client");
    let err = client.generate("prompt").await.unwrap_err();
    assert_eq!(err, InferenceError::Timeout);
}
