use futures_util::StreamExt;
use pretty_assertions::assert_eq;
use shellmux_llm_api::client::OpenAiCompatClient;
use shellmux_llm_api::{ChatMessage, ClientFactory, LlmClient, RequestLogger};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer, key: &str) -> OpenAiCompatClient {
    OpenAiCompatClient::new(
        "test",
        format!("{}/v1/chat/completions", server.uri()),
        key,
        "test-model",
    )
}

fn sse_body(events: &[&str]) -> String {
    let mut body = String::new();
    for delta in events {
        let event = serde_json::json!({
            "choices": [{"delta": {"content": delta}, "finish_reason": null}]
        });
        body.push_str(&format!("data: {event}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn test_chat_completion_returns_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(serde_json::json!({"model": "test-model", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "Try `ls -la`."}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let reply = client_for(&server, "secret")
        .chat_completion(&[ChatMessage::user("list files")], None)
        .await
        .unwrap();
    assert_eq!(reply, "Try `ls -la`.");
}

#[tokio::test]
async fn test_model_override_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"model": "other-model"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content": "ok"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let reply = client_for(&server, "")
        .chat_completion(&[ChatMessage::user("hi")], Some("other-model"))
        .await
        .unwrap();
    assert_eq!(reply, "ok");
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let err = client_for(&server, "")
        .chat_completion(&[ChatMessage::user("hi")], None)
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("429"), "{message}");
    assert!(message.contains("rate limited"), "{message}");
}

#[tokio::test]
async fn test_streaming_yields_deltas_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["Use ", "`du -sh`", "."]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let client = client_for(&server, "");
    assert!(client.supports_streaming());

    let mut stream = client
        .chat_streaming(vec![ChatMessage::user("disk usage?")], None)
        .await
        .unwrap();

    let mut deltas = Vec::new();
    let mut last_content = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        deltas.push(chunk.delta);
        last_content = chunk.content;
    }

    assert_eq!(deltas, vec!["Use ", "`du -sh`", "."]);
    assert_eq!(last_content, "Use `du -sh`.");
}

#[tokio::test]
async fn test_streaming_malformed_event_ends_with_error() {
    let server = MockServer::start().await;
    let body = format!("{}data: {{broken\n\n", sse_body(&["partial"]).replace("data: [DONE]\n\n", ""));
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let mut stream = client_for(&server, "")
        .chat_streaming(vec![ChatMessage::user("x")], None)
        .await
        .unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap().delta, "partial");
    assert!(stream.next().await.unwrap().is_err());
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_health_check_probes_models_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .mount(&server)
        .await;

    assert!(client_for(&server, "").health_check().await.is_ok());

    let unreachable = OpenAiCompatClient::new("down", "http://127.0.0.1:1/v1/chat/completions", "", "m");
    assert!(unreachable.health_check().await.is_err());
}

#[tokio::test]
async fn test_factory_builds_logged_client_from_spec() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content": "logged"}}]
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let logger = RequestLogger::new(dir.path()).unwrap();
    let spec = format!("local-model@llama({})", server.uri());

    let client = ClientFactory::from_spec(&spec, None, "primary", Some(logger)).unwrap();
    assert_eq!(client.name(), "primary");
    assert_eq!(client.default_model(), "local-model");
    assert_eq!(client.chat_completion(&[ChatMessage::user("hi")], None).await.unwrap(), "logged");

    let logged = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(logged, 2);
}

#[test]
fn test_factory_rejects_llama_without_url() {
    assert!(ClientFactory::from_spec("m@llama", None, "primary", None).is_err());
    assert!(ClientFactory::from_spec("@openai", None, "primary", None).is_err());
}
