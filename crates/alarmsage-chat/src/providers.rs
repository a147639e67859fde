//! External LLM provider streaming implementations.
//!
//! Each provider streams tokens and tool-call fragments via SSE. OpenAI and
//! Groq use the same format. Anthropic uses a different one.

use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tracing::{debug, error};

use crate::model::{BoxedStream, ChatModel};
use crate::types::{ChatMessage, LLMProvider, ModelRequest, StreamChunk, ToolCallDelta};
use alarmsage_core::{Error, Result};

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const GROQ_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A chat model reached over HTTP.
pub struct HttpChatModel {
    client: Client,
    provider: LLMProvider,
    model: String,
    api_key: String,
    url: String,
}

impl HttpChatModel {
    pub fn new(provider: LLMProvider, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        let url = match provider {
            LLMProvider::OpenAI => OPENAI_URL,
            LLMProvider::Groq => GROQ_URL,
            LLMProvider::Anthropic => ANTHROPIC_URL,
        };
        Self {
            client: Client::new(),
            provider,
            model: model.into(),
            api_key: api_key.into(),
            url: url.to_string(),
        }
    }

    /// Point the client at a different endpoint (proxies, test servers).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn provider(&self) -> LLMProvider {
        self.provider
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    fn stream(&self, request: ModelRequest) -> BoxedStream {
        match self.provider {
            LLMProvider::OpenAI | LLMProvider::Groq => Box::pin(stream_openai_compat(
                self.client.clone(),
                self.url.clone(),
                self.provider,
                request,
                self.model.clone(),
                self.api_key.clone(),
            )),
            LLMProvider::Anthropic => Box::pin(stream_anthropic(
                self.client.clone(),
                self.url.clone(),
                request,
                self.model.clone(),
                self.api_key.clone(),
            )),
        }
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Splits a byte stream into SSE `data:` payloads. Bytes are buffered until
/// a full line is available so multi-byte characters are never split.
#[derive(Default)]
pub(crate) struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn check_status(service: &str, response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let hint = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(500).collect();
    Err(Error::from_http_status(service, status, hint, &body))
}

fn openai_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m {
            ChatMessage::System(text) => json!({"role": "system", "content": text}),
            ChatMessage::User { text, images } if images.is_empty() => {
                json!({"role": "user", "content": text})
            }
            ChatMessage::User { text, images } => {
                let mut parts = vec![json!({"type": "text", "text": text})];
                parts.extend(
                    images
                        .iter()
                        .map(|url| json!({"type": "image_url", "image_url": {"url": url}})),
                );
                json!({"role": "user", "content": parts})
            }
            ChatMessage::Assistant { text, tool_calls } if tool_calls.is_empty() => {
                json!({"role": "assistant", "content": text})
            }
            ChatMessage::Assistant { text, tool_calls } => {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {"name": c.name, "arguments": c.arguments.to_string()},
                        })
                    })
                    .collect();
                let content = if text.is_empty() { Value::Null } else { json!(text) };
                json!({"role": "assistant", "content": content, "tool_calls": calls})
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
                ..
            } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
        })
        .collect()
}

/// Stream from OpenAI-compatible APIs (OpenAI, Groq).
fn stream_openai_compat(
    client: Client,
    url: String,
    provider: LLMProvider,
    request: ModelRequest,
    model: String,
    api_key: String,
) -> impl Stream<Item = Result<StreamChunk>> + Send + 'static {
    let service = provider.to_string();
    let mut body = json!({
        "model": model,
        "messages": openai_messages(&request.messages),
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "stream": true,
    });
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| json!({"type": "function", "function": t}))
            .collect();
        body["tools"] = json!(tools);
    }

    async_stream::try_stream! {
        debug!("Streaming from {} with model {}", url, model);

        let response = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::upstream(&service, format!("request failed: {}", e)))?;
        let response = check_status(&service, response).await?;

        let mut stream = response.bytes_stream();
        let mut lines = SseLines::default();
        let mut token_count = 0usize;

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| Error::upstream(&service, format!("stream read error: {}", e)))?;

            for data in lines.push(&bytes) {
                if data == "[DONE]" {
                    yield StreamChunk::Done { tokens_used: token_count };
                    return;
                }
                let parsed: Value = match serde_json::from_str(&data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if let Some(message) = parsed["error"]["message"].as_str() {
                    Err::<(), Error>(Error::upstream(&service, message))?;
                }
                let delta = &parsed["choices"][0]["delta"];
                if let Some(content) = delta["content"].as_str() {
                    if !content.is_empty() {
                        token_count += 1;
                        yield StreamChunk::Token(content.to_string());
                    }
                }
                if let Some(calls) = delta["tool_calls"].as_array() {
                    for call in calls {
                        yield StreamChunk::ToolCall(ToolCallDelta {
                            index: call["index"].as_u64().unwrap_or(0) as usize,
                            id: call["id"].as_str().map(String::from),
                            name: call["function"]["name"].as_str().map(String::from),
                            arguments: call["function"]["arguments"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string(),
                        });
                    }
                }
            }
        }

        yield StreamChunk::Done { tokens_used: token_count };
    }
}

/// Split a `data:` URL into media type and base64 payload.
fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some((media_type, data))
}

/// Anthropic takes the system prompt separately and requires tool results to
/// arrive as `tool_result` blocks in a user message; consecutive results are
/// merged into one message.
fn anthropic_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut out: Vec<Value> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    for m in messages {
        if !matches!(m, ChatMessage::Tool { .. }) && !pending_results.is_empty() {
            out.push(json!({"role": "user", "content": std::mem::take(&mut pending_results)}));
        }
        match m {
            ChatMessage::System(text) => {
                system = Some(match system.take() {
                    Some(prev) => format!("{}\n\n{}", prev, text),
                    None => text.clone(),
                });
            }
            ChatMessage::User { text, images } => {
                let mut blocks: Vec<Value> = images
                    .iter()
                    .filter_map(|url| split_data_url(url))
                    .map(|(media_type, data)| {
                        json!({
                            "type": "image",
                            "source": {"type": "base64", "media_type": media_type, "data": data},
                        })
                    })
                    .collect();
                blocks.push(json!({"type": "text", "text": text}));
                out.push(json!({"role": "user", "content": blocks}));
            }
            ChatMessage::Assistant { text, tool_calls } => {
                let mut blocks = Vec::new();
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for c in tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": c.id,
                        "name": c.name,
                        "input": c.arguments,
                    }));
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
                is_error,
                ..
            } => {
                pending_results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": content,
                    "is_error": is_error,
                }));
            }
        }
    }
    if !pending_results.is_empty() {
        out.push(json!({"role": "user", "content": pending_results}));
    }
    (system, out)
}

/// Stream from Anthropic's Messages API.
fn stream_anthropic(
    client: Client,
    url: String,
    request: ModelRequest,
    model: String,
    api_key: String,
) -> impl Stream<Item = Result<StreamChunk>> + Send + 'static {
    let (system, conv_msgs) = anthropic_messages(&request.messages);
    let mut body = json!({
        "model": model,
        "messages": conv_msgs,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "stream": true,
    });
    if let Some(sys) = system {
        body["system"] = json!(sys);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.parameters}))
            .collect();
        body["tools"] = json!(tools);
    }

    async_stream::try_stream! {
        debug!("Streaming from Anthropic with model {}", model);

        let response = client
            .post(&url)
            .header("x-api-key", &api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::upstream("anthropic", format!("request failed: {}", e)))?;
        let response = check_status("anthropic", response).await?;

        let mut stream = response.bytes_stream();
        let mut lines = SseLines::default();
        let mut token_count = 0usize;

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| Error::upstream("anthropic", format!("stream read error: {}", e)))?;

            // Anthropic uses "event: " lines followed by "data: " lines; the
            // data payload repeats the event type.
            for data in lines.push(&bytes) {
                let parsed: Value = match serde_json::from_str(&data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let index = parsed["index"].as_u64().unwrap_or(0) as usize;
                match parsed["type"].as_str() {
                    Some("content_block_start") => {
                        let block = &parsed["content_block"];
                        if block["type"] == "tool_use" {
                            yield StreamChunk::ToolCall(ToolCallDelta {
                                index,
                                id: block["id"].as_str().map(String::from),
                                name: block["name"].as_str().map(String::from),
                                arguments: String::new(),
                            });
                        }
                    }
                    Some("content_block_delta") => {
                        let delta = &parsed["delta"];
                        if let Some(text) = delta["text"].as_str() {
                            if !text.is_empty() {
                                token_count += 1;
                                yield StreamChunk::Token(text.to_string());
                            }
                        } else if let Some(partial) = delta["partial_json"].as_str() {
                            yield StreamChunk::ToolCall(ToolCallDelta {
                                index,
                                arguments: partial.to_string(),
                                ..Default::default()
                            });
                        }
                    }
                    Some("message_stop") => {
                        yield StreamChunk::Done { tokens_used: token_count };
                        return;
                    }
                    Some("error") => {
                        let msg = parsed["error"]["message"]
                            .as_str()
                            .unwrap_or("Unknown error")
                            .to_string();
                        error!("Anthropic error: {}", msg);
                        if parsed["error"]["type"] == "rate_limit_error" {
                            Err::<(), Error>(Error::RateLimited { service: "anthropic".into(), retry_after: None })?;
                        }
                        Err::<(), Error>(Error::upstream("anthropic", msg))?;
                    }
                    _ => {}
                }
            }
        }

        yield StreamChunk::Done { tokens_used: token_count };
    }
}
