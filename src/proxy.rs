use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::logging::{LogLevel, RequestLogger};
use crate::models::{resolve_model, to_model_list};
use crate::translate::embeddings::{self, embedding_model};
use crate::translate::framer::{StreamFramer, Utf8Decoder};
use crate::translate::gemini_types::{BatchEmbedResponse, GenerateContentResponse, ModelsResponse};
use crate::translate::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingsRequest, EmbeddingsResponse, ModelList,
};
use crate::translate::request::openai_to_gemini;
use crate::translate::response::gemini_to_openai;
use crate::translate::streaming::{DownstreamFrame, StreamTranscoder};
use crate::translate::tool_calls::generate_id;

use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::pin::Pin;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// A non-2xx upstream answer, forwarded to the client as is.
#[derive(Debug, Clone)]
pub struct UpstreamFailure {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Outcome of proxying a request
pub enum ProxyResult<T> {
    Success(T),
    Upstream(UpstreamFailure),
}

/// Downstream event-stream body, already framed as `data: ...\n\n` bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send>>;

/// Everything a handler needs to talk to the upstream for one request.
pub struct Upstream<'a> {
    pub config: &'a GatewayConfig,
    pub client: &'a reqwest::Client,
    pub api_key: Option<&'a str>,
    pub log: &'a RequestLogger,
}

impl Upstream<'_> {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_root(), path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    /// Send, splitting off non-2xx answers as [`UpstreamFailure`].
    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<std::result::Result<reqwest::Response, UpstreamFailure>> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| GatewayError::upstream(format!("Request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(Ok(response));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                self.log.error(
                    "proxy",
                    format!("Failed to read upstream {status} error body: {e}"),
                );
                Bytes::new()
            }
        };

        self.log.log(
            LogLevel::Warn,
            "proxy",
            format!("Upstream returned {status}"),
            Some(serde_json::json!({ "body": truncate(&String::from_utf8_lossy(&body), 300) })),
        );

        Ok(Err(UpstreamFailure {
            status: status.as_u16(),
            content_type,
            body,
        }))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<ProxyResult<T>> {
        let response = match self.send(builder).await? {
            Ok(r) => r,
            Err(failure) => return Ok(ProxyResult::Upstream(failure)),
        };
        let body = response.bytes().await?;

        let parsed = serde_json::from_slice(&body).map_err(|e| {
            GatewayError::upstream(format!(
                "Failed to parse upstream response: {e}. Body: {}",
                truncate(&String::from_utf8_lossy(&body), 300)
            ))
        })?;
        Ok(ProxyResult::Success(parsed))
    }
}

/// Forward a non-streaming chat completion.
pub async fn proxy_chat(
    req: &ChatCompletionRequest,
    upstream: &Upstream<'_>,
) -> Result<ProxyResult<ChatCompletionResponse>> {
    let model = resolve_model(upstream.config, req.model.as_deref());
    let body = openai_to_gemini(req, upstream.client).await?;
    let url = upstream.url(&format!("models/{model}:generateContent"));

    upstream.log.info("proxy", format!("POST {url} model={model}"));

    let resp: GenerateContentResponse = match upstream
        .send_json(upstream.client.post(&url).json(&body))
        .await?
    {
        ProxyResult::Success(r) => r,
        ProxyResult::Upstream(failure) => return Ok(ProxyResult::Upstream(failure)),
    };

    let id = format!("chatcmpl-{}", generate_id());
    let out = gemini_to_openai(&resp, &model, &id);

    if let Some(ref usage) = out.usage {
        upstream.log.info(
            "proxy",
            format!(
                "Completed: prompt={} completion={} tokens",
                usage.prompt_tokens, usage.completion_tokens
            ),
        );
    }

    Ok(ProxyResult::Success(out))
}

/// Forward a streaming chat completion, returning the downstream event stream.
pub async fn proxy_chat_streaming(
    req: &ChatCompletionRequest,
    upstream: &Upstream<'_>,
) -> Result<ProxyResult<ByteStream>> {
    let model = resolve_model(upstream.config, req.model.as_deref());
    let body = openai_to_gemini(req, upstream.client).await?;
    let url = upstream.url(&format!("models/{model}:streamGenerateContent?alt=sse"));

    upstream
        .log
        .info("proxy", format!("POST {url} model={model} (streaming)"));

    let response = match upstream.send(upstream.client.post(&url).json(&body)).await? {
        Ok(r) => r,
        Err(failure) => return Ok(ProxyResult::Upstream(failure)),
    };

    let id = format!("chatcmpl-{}", generate_id());
    let stream = transcode_stream(
        response.bytes_stream(),
        StreamTranscoder::new(id, model, req.include_usage()),
        upstream.log.clone(),
    );

    Ok(ProxyResult::Success(Box::pin(stream)))
}

/// Run an upstream byte stream through decoder, framer and transcoder.
///
/// A transport error ends the output with an error instead of the sentinel,
/// so the client sees an aborted body rather than a clean end of stream.
pub fn transcode_stream<S, E>(
    byte_stream: S,
    mut transcoder: StreamTranscoder,
    log: RequestLogger,
) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut decoder = Utf8Decoder::new();
        let mut framer = StreamFramer::new();

        futures::pin_mut!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    log.error("stream", format!("Upstream read failed: {e}"));
                    yield Err(std::io::Error::other(format!("upstream read failed: {e}")));
                    return;
                }
            };

            let text = decoder.decode(&chunk);
            for frame in framer.push(&text) {
                for out in transcoder.process(&frame) {
                    yield encode(out);
                }
            }
        }

        let mut tail = framer.push(&decoder.finish());
        tail.extend(framer.finish());
        for frame in &tail {
            for out in transcoder.process(frame) {
                yield encode(out);
            }
        }

        for out in transcoder.flush() {
            yield encode(out);
        }

        log.info("stream", format!("Stream completed after {} events", transcoder.events_seen()));
    }
}

fn encode(frame: DownstreamFrame) -> std::result::Result<Bytes, std::io::Error> {
    frame.into_bytes().map_err(std::io::Error::other)
}

pub async fn proxy_embeddings(
    req: &EmbeddingsRequest,
    upstream: &Upstream<'_>,
) -> Result<ProxyResult<EmbeddingsResponse>> {
    let model = embedding_model(req.model.as_deref());
    let body = embeddings::openai_to_gemini(req, &model);
    let url = upstream.url(&format!("{model}:batchEmbedContents"));

    upstream.log.info(
        "proxy",
        format!("POST {url} inputs={}", body.requests.len()),
    );

    let resp: BatchEmbedResponse = match upstream
        .send_json(upstream.client.post(&url).json(&body))
        .await?
    {
        ProxyResult::Success(r) => r,
        ProxyResult::Upstream(failure) => return Ok(ProxyResult::Upstream(failure)),
    };

    Ok(ProxyResult::Success(embeddings::gemini_to_openai(resp, &model)))
}

pub async fn proxy_models(upstream: &Upstream<'_>) -> Result<ProxyResult<ModelList>> {
    let url = upstream.url("models");
    upstream.log.info("proxy", format!("GET {url}"));

    let resp: ModelsResponse = match upstream.send_json(upstream.client.get(&url)).await? {
        ProxyResult::Success(r) => r,
        ProxyResult::Upstream(failure) => return Ok(ProxyResult::Upstream(failure)),
    };

    Ok(ProxyResult::Success(to_model_list(resp)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
