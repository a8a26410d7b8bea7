use base64::{engine::general_purpose::STANDARD, Engine as _};
use gemini_gateway::{build_router, AppState, GatewayConfig, SharedLogger};
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "test-key";

/// Start the gateway on an ephemeral port, pointed at the mock upstream.
async fn spawn_gateway(upstream: &MockServer) -> String {
    spawn_gateway_at(upstream.uri(), SharedLogger::in_memory()).await
}

async fn spawn_gateway_at(upstream_uri: String, logger: SharedLogger) -> String {
    let mut config = GatewayConfig::default();
    config.upstream.base_url = upstream_uri;
    config.upstream.api_key_env = "GEMINI_GATEWAY_TEST_UNSET_KEY".to_string();
    config
        .models
        .insert("gpt-4o".to_string(), "gemini-2.5-pro".to_string());

    let state = Arc::new(AppState {
        config,
        client: reqwest::Client::new(),
        logger,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    format!("http://{addr}")
}

async fn post_chat(base: &str, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth(KEY)
        .json(&body)
        .send()
        .await
        .unwrap()
}

fn sse_payloads(text: &str) -> Vec<&str> {
    text.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .collect()
}

#[tokio::test]
async fn test_health() {
    let upstream = MockServer::start().await;
    let base = spawn_gateway(&upstream).await;

    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_non_streaming_chat() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-pro:generateContent"))
        .and(header("x-goog-api-key", KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Bonjour!"}]},
                "finishReason": "STOP",
                "index": 0
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3, "totalTokenCount": 15},
            "modelVersion": "gemini-2.5-pro"
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let base = spawn_gateway(&upstream).await;
    let resp = post_chat(
        &base,
        json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Answer in French."},
                {"role": "user", "content": "Hello"}
            ],
            "temperature": 0.2,
            "max_tokens": 50
        }),
    )
    .await;

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gemini-2.5-pro");
    assert_eq!(body["choices"][0]["message"]["content"], "Bonjour!");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 15);

    let sent = upstream.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(sent["system_instruction"]["parts"][0]["text"], "Answer in French.");
    assert_eq!(sent["contents"][0]["role"], "user");
    assert_eq!(sent["generationConfig"]["maxOutputTokens"], 50);
    assert_eq!(sent["safetySettings"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_streaming_chat() {
    let upstream = MockServer::start().await;
    let events = concat!(
        "data: {\"candidates\": [{\"content\": {\"parts\": [{\"text\": \"Hel\"}],\"role\": \"model\"},\"index\": 0}],",
        "\"usageMetadata\": {\"promptTokenCount\": 4,\"totalTokenCount\": 4}}\r\n\r\n",
        "data: {\"candidates\": [{\"content\": {\"parts\": [{\"text\": \"lo\"}],\"role\": \"model\"},\"finishReason\": \"STOP\",\"index\": 0}],",
        "\"usageMetadata\": {\"promptTokenCount\": 4,\"candidatesTokenCount\": 2,\"totalTokenCount\": 6}}\r\n\r\n"
    );
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
        .and(query_param("alt", "sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(events, "text/event-stream"))
        .mount(&upstream)
        .await;

    let base = spawn_gateway(&upstream).await;
    let resp = post_chat(
        &base,
        json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "Say hello"}],
            "stream": true,
            "stream_options": {"include_usage": true}
        }),
    )
    .await;

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    let text = resp.text().await.unwrap();
    assert!(text.ends_with("data: [DONE]\n\n"));

    let payloads = sse_payloads(&text);
    assert_eq!(payloads.last(), Some(&"[DONE]"));
    let chunks: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();

    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    let content: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "Hello");
    assert!(chunks[..3]
        .iter()
        .all(|c| c["choices"][0]["finish_reason"].is_null()));
    assert_eq!(chunks[3]["choices"][0]["finish_reason"], "stop");
    assert_eq!(chunks[3]["usage"]["completion_tokens"], 2);
}

#[tokio::test]
async fn test_upstream_error_is_forwarded() {
    let upstream = MockServer::start().await;
    let error = json!({"error": {"code": 429, "message": "Resource exhausted", "status": "RESOURCE_EXHAUSTED"}});
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(429).set_body_json(error.clone()))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&upstream)
        .await;

    let base = spawn_gateway(&upstream).await;

    let resp = post_chat(
        &base,
        json!({"messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 429);
    assert_eq!(resp.json::<Value>().await.unwrap(), error);

    let resp = post_chat(
        &base,
        json!({"messages": [{"role": "user", "content": "hi"}], "stream": true}),
    )
    .await;
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.text().await.unwrap(), "overloaded");
}

#[tokio::test]
async fn test_truncated_upstream_error_body_is_logged() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Upstream promises a longer body than it sends, then hangs up.
    let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_uri = format!("http://{}", upstream.local_addr().unwrap());
    tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-type: text/plain\r\ncontent-length: 100\r\n\r\npartial")
            .await
            .unwrap();
        socket.shutdown().await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("gateway.log");
    let base = spawn_gateway_at(upstream_uri, SharedLogger::new(&log_path).unwrap()).await;

    let resp = post_chat(
        &base,
        json!({"messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 502);
    assert_eq!(resp.text().await.unwrap(), "");

    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(log
        .lines()
        .any(|line| line.contains("Failed to read upstream 502 Bad Gateway error body")));
}

#[tokio::test]
async fn test_client_errors_never_reach_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let base = spawn_gateway(&upstream).await;

    let resp = post_chat(
        &base,
        json!({"messages": [{"role": "narrator", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert!(resp.text().await.unwrap().contains("narrator"));

    let resp = post_chat(
        &base,
        json!({
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{oops"}}
                ]}
            ]
        }),
    )
    .await;
    assert_eq!(resp.status(), 400);

    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_remote_image_is_inlined() {
    let upstream = MockServer::start().await;
    let png: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    Mock::given(method("GET"))
        .and(path("/images/cat.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png.to_vec(), "image/png"))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/images/missing.png"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"parts": [{"text": "A cat."}]}, "finishReason": "STOP"}]
        })))
        .mount(&upstream)
        .await;

    let base = spawn_gateway(&upstream).await;
    let image_message = |url: String| {
        json!({"messages": [{"role": "user", "content": [
            {"type": "image_url", "image_url": {"url": url}}
        ]}]})
    };

    let resp = post_chat(&base, image_message(format!("{}/images/cat.png", upstream.uri()))).await;
    assert_eq!(resp.status(), 200);

    let requests = upstream.received_requests().await.unwrap();
    let generate = requests
        .iter()
        .find(|r| r.url.path().ends_with(":generateContent"))
        .unwrap();
    let sent: Value = serde_json::from_slice(&generate.body).unwrap();
    let parts = &sent["contents"][0]["parts"];
    assert_eq!(parts[0]["inlineData"]["mimeType"], "image/png");
    assert_eq!(parts[0]["inlineData"]["data"], STANDARD.encode(png));
    assert_eq!(parts[1]["text"], "");

    let resp = post_chat(&base, image_message(format!("{}/images/missing.png", upstream.uri()))).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_models_list() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1beta/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                {"name": "models/gemini-2.5-flash", "displayName": "Gemini 2.5 Flash"},
                {"name": "models/gemini-embedding-001"}
            ]
        })))
        .mount(&upstream)
        .await;

    let base = spawn_gateway(&upstream).await;
    let body: Value = reqwest::get(format!("{base}/v1/models"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "gemini-2.5-flash");
    assert_eq!(body["data"][1]["object"], "model");
}

#[tokio::test]
async fn test_embeddings() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-embedding-001:batchEmbedContents"))
        .and(header("x-goog-api-key", KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [{"values": [0.25, -0.5]}, {"values": [1.0, 0.0]}]
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let base = spawn_gateway(&upstream).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/embeddings"))
        .bearer_auth(KEY)
        .json(&json!({"model": "text-embedding-3-small", "input": ["first", "second"]}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "list");
    assert_eq!(body["model"], "models/gemini-embedding-001");
    assert_eq!(body["data"][1]["index"], 1);
    assert_eq!(body["data"][0]["embedding"], json!([0.25, -0.5]));
}
