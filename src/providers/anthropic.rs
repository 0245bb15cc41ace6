//! Anthropic Messages API provider (`/v1/messages`), including extended thinking and
//! prompt-caching headers/blocks and the named-SSE streaming protocol.
//!
//! The reference crate's `ClaudeClient` does not implement this wire format at all — it
//! proxies every call through its OpenAI-compatible `openai_rust2::Client` pointed at
//! `https://api.anthropic.com/v1`, which only works because Anthropic ships a thin
//! OpenAI-compatibility shim and loses thinking blocks, cache control, and the native event
//! stream entirely. This provider replaces that proxy with the real `/v1/messages` schema,
//! modeled on the SSE decoder/tagged-event pattern used by `rig-core`'s own Anthropic
//! provider (`providers/anthropic/{streaming,decoders/sse}.rs`).

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::model::{
    FinishReason, Message, MessageContent, Request, Response, Role, StreamChunk,
    StreamChunkType, ThinkingType, ToolCall, ToolCallFunction, Usage,
};
use crate::preparer::prepare;
use crate::provider::{shared_http_client, Provider, ProviderConfig};
use crate::sse::decode_sse_stream;
use crate::stream::ChunkStream;

const PROVIDER_NAME: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_BETA: &str = "prompt-caching-2024-07-31,extended-thinking-2025-01-01";

pub struct AnthropicProvider {
    config: ProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Self {
        AnthropicProvider { config }
    }

    pub fn from_env() -> Self {
        AnthropicProvider::new(ProviderConfig::new().with_api_key(
            std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
        ))
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn api_key<'a>(&'a self, req: &'a Request) -> Result<&'a str, LlmError> {
        self.config.resolve_api_key(req).ok_or_else(|| {
            LlmError::new(
                crate::error::ErrorKind::Auth,
                "no Anthropic API key configured",
                PROVIDER_NAME,
            )
        })
    }

    fn cache_control_block(cc: &crate::model::CacheControl) -> Value {
        let type_str = match cc.cache_type {
            crate::model::CacheControlType::Ephemeral => "ephemeral",
            crate::model::CacheControlType::Persistent => "persistent",
        };
        let mut v = json!({"type": type_str});
        if let Some(ttl) = &cc.ttl {
            v["ttl"] = json!(ttl);
        }
        v
    }

    /// Hoists system messages into a top-level `system` field (string, or array-of-blocks
    /// when any carries cache control or there is more than one) and converts the remaining
    /// turns into Anthropic content blocks.
    fn build_body(&self, req: &Request, messages: &[Message], stream: bool) -> Value {
        let system_msgs: Vec<&Message> = messages.iter().filter(|m| m.role == Role::System).collect();
        let turns: Vec<&Message> = messages.iter().filter(|m| m.role != Role::System).collect();

        let needs_blocks = system_msgs.len() > 1 || system_msgs.iter().any(|m| m.cache_control.is_some());
        let system_value = if system_msgs.is_empty() {
            None
        } else if needs_blocks {
            Some(json!(system_msgs
                .iter()
                .map(|m| {
                    let mut block = json!({"type": "text", "text": m.content});
                    if let Some(cc) = &m.cache_control {
                        block["cache_control"] = Self::cache_control_block(cc);
                    }
                    block
                })
                .collect::<Vec<_>>()))
        } else {
            Some(json!(system_msgs[0].content))
        };

        let wire_messages: Vec<Value> = turns
            .iter()
            .map(|m| self.message_to_wire(m))
            .collect();

        let mut body = json!({
            "model": req.model,
            "messages": wire_messages,
            "max_tokens": req.max_tokens.unwrap_or(4096),
        });
        if let Some(system) = system_value {
            body["system"] = system;
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if !req.stop.is_empty() {
            body["stop_sequences"] = json!(req.stop);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "input_schema": t.function.parameters,
                }))
                .collect::<Vec<_>>());
        }
        if let Some(thinking) = &req.thinking {
            let enabled = thinking.thinking_type == ThinkingType::Enabled;
            if enabled {
                let budget = thinking
                    .budget_tokens
                    .unwrap_or_else(|| {
                        let max = req.max_tokens.unwrap_or(4096);
                        std::cmp::min(1024, max)
                    });
                body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
            } else {
                body["thinking"] = json!({"type": "disabled"});
            }
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn message_to_wire(&self, m: &Message) -> Value {
        let role = match m.role {
            Role::Assistant => "assistant",
            // Anthropic has no top-level "tool" role: tool results are user-turn blocks.
            Role::Tool | Role::User => "user",
            Role::System => unreachable!("system messages are hoisted before this point"),
        };

        let mut blocks: Vec<Value> = Vec::new();
        if m.role == Role::Tool {
            let mut block = json!({
                "type": "tool_result",
                "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                "content": m.content,
            });
            if m.is_error {
                block["is_error"] = json!(true);
            }
            blocks.push(block);
        } else if let Some(contents) = &m.contents {
            for c in contents {
                match c {
                    MessageContent::Text { text } => blocks.push(json!({"type": "text", "text": text})),
                    MessageContent::ImageUrl { url, .. } => blocks.push(json!({
                        "type": "image",
                        "source": {"type": "url", "url": url},
                    })),
                }
            }
        } else if !m.content.is_empty() {
            blocks.push(json!({"type": "text", "text": m.content}));
        }

        for tc in &m.tool_calls {
            let mut input = serde_json::from_str::<Value>(&tc.function.arguments)
                .unwrap_or_else(|_| json!({}));
            if !input.is_object() {
                input = json!({});
            }
            blocks.push(json!({
                "type": "tool_use",
                "id": tc.id,
                "name": tc.function.name,
                "input": input,
            }));
        }

        let mut wire = json!({"role": role, "content": blocks});
        if let Some(cc) = &m.cache_control {
            if let Some(last) = wire["content"].as_array_mut().and_then(|a| a.last_mut()) {
                last["cache_control"] = Self::cache_control_block(cc);
            }
        }
        wire
    }

    async fn post(&self, req: &Request, body: &Value) -> Result<reqwest::Response, LlmError> {
        if let Some(cb) = &req.on_payload {
            cb(body);
        }
        let key = self.api_key(req)?;
        let url = format!("{}/v1/messages", self.base_url());
        let resp = shared_http_client()
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", ANTHROPIC_BETA)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::network(e.to_string(), PROVIDER_NAME))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let headers: HashMap<String, String> = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect();
            let text = resp.text().await.unwrap_or_default();
            log::error!("anthropic request failed with status {}: {}", status, text);
            return Err(LlmError::from_http_status(
                status,
                &headers,
                &text,
                PROVIDER_NAME,
                Some(&req.model),
            ));
        }
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("anthropic request to {}/v1/messages, model={}", self.base_url(), req.model);
        }
        Ok(resp)
    }

    fn parse_response(&self, req: &Request, value: &Value) -> Response {
        let mut text_parts = Vec::new();
        let mut thinking_parts = Vec::new();
        let mut tool_calls = Vec::new();
        if let Some(blocks) = value["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => {
                        if let Some(t) = block["text"].as_str() {
                            text_parts.push(t.to_string());
                        }
                    }
                    Some("thinking") => {
                        if let Some(t) = block["thinking"].as_str() {
                            thinking_parts.push(t.to_string());
                        }
                    }
                    Some("tool_use") => {
                        if let Some(id) = block["id"].as_str() {
                            tool_calls.push(ToolCall {
                                id: id.to_string(),
                                function: ToolCallFunction {
                                    name: block["name"].as_str().unwrap_or("").to_string(),
                                    arguments: block["input"].to_string(),
                                },
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        let stop_reason = value["stop_reason"].as_str().unwrap_or("end_turn");
        let finish_reason = match crate::model::normalize_finish_reason(stop_reason).as_str() {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };
        let usage = Usage {
            prompt_tokens: value["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: (value["usage"]["input_tokens"].as_u64().unwrap_or(0)
                + value["usage"]["output_tokens"].as_u64().unwrap_or(0)) as u32,
            reasoning_tokens: 0,
            cache_creation_input_tokens: value["usage"]["cache_creation_input_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
            cache_read_input_tokens: value["usage"]["cache_read_input_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
        };
        Response {
            content: text_parts.join("\n\n"),
            contents: None,
            tool_calls,
            usage,
            model: value["model"].as_str().unwrap_or(&req.model).to_string(),
            provider: PROVIDER_NAME.to_string(),
            finish_reason,
            reasoning: if thinking_parts.is_empty() {
                None
            } else {
                Some(crate::model::ReasoningData {
                    content: Some(thinking_parts.join("\n\n")),
                    ..Default::default()
                })
            },
            extra: None,
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn chat(&self, req: &Request) -> Result<Response, LlmError> {
        req.validate()?;
        let messages = prepare(&req.messages);
        let body = self.build_body(req, &messages, false);
        let resp = self.post(req, &body).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::network(e.to_string(), PROVIDER_NAME))?;
        Ok(self.parse_response(req, &value))
    }

    async fn stream(&self, req: &Request) -> Result<ChunkStream, LlmError> {
        req.validate()?;
        let messages = prepare(&req.messages);
        let body = self.build_body(req, &messages, true);
        let resp = self.post(req, &body).await?;
        let byte_stream = resp.bytes_stream().map(|r| r.map_err(|e| e.to_string()));
        let sse_stream = decode_sse_stream(byte_stream);

        let out = async_stream::try_stream! {
            futures_util::pin_mut!(sse_stream);
            let mut prompt_tokens: u32 = 0;
            let mut completion_tokens: u32 = 0;
            let mut cache_creation: u32 = 0;
            let mut cache_read: u32 = 0;

            while let Some(event) = sse_stream.next().await {
                let event = event.map_err(|e| LlmError::network(e, PROVIDER_NAME))?;
                let value: Value = match serde_json::from_str(&event.data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                match event.event.as_deref().unwrap_or("") {
                    "message_start" => {
                        prompt_tokens = value["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
                        cache_creation = value["message"]["usage"]["cache_creation_input_tokens"].as_u64().unwrap_or(0) as u32;
                        cache_read = value["message"]["usage"]["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32;
                    }
                    "content_block_delta" => {
                        match value["delta"]["type"].as_str() {
                            Some("text_delta") => {
                                yield StreamChunk {
                                    chunk_type: Some(StreamChunkType::Content),
                                    content: value["delta"]["text"].as_str().unwrap_or("").to_string(),
                                    ..Default::default()
                                };
                            }
                            Some("thinking_delta") => {
                                yield StreamChunk {
                                    chunk_type: Some(StreamChunkType::Reasoning),
                                    content: value["delta"]["thinking"].as_str().unwrap_or("").to_string(),
                                    ..Default::default()
                                };
                            }
                            Some("input_json_delta") => {
                                yield StreamChunk {
                                    chunk_type: Some(StreamChunkType::ToolCallDelta),
                                    tool_call_arguments: Some(value["delta"]["partial_json"].as_str().unwrap_or("").to_string()),
                                    ..Default::default()
                                };
                            }
                            // signature_delta is silently dropped.
                            _ => {}
                        }
                    }
                    "content_block_start" => {
                        if value["content_block"]["type"] == "tool_use" {
                            yield StreamChunk {
                                chunk_type: Some(StreamChunkType::OutputItemAdded),
                                tool_call_id: value["content_block"]["id"].as_str().map(|s| s.to_string()),
                                tool_call_name: value["content_block"]["name"].as_str().map(|s| s.to_string()),
                                ..Default::default()
                            };
                        }
                    }
                    "message_delta" => {
                        completion_tokens = value["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;
                        if let Some(stop_reason) = value["delta"]["stop_reason"].as_str() {
                            let normalized = crate::model::normalize_finish_reason(stop_reason);
                            let finish = match normalized.as_str() {
                                "stop" => FinishReason::Stop,
                                "length" => FinishReason::Length,
                                "tool_calls" => FinishReason::ToolCalls,
                                _ => FinishReason::Stop,
                            };
                            yield StreamChunk { finish_reason: Some(finish), ..Default::default() };
                        }
                    }
                    "message_stop" => {
                        yield StreamChunk {
                            done: true,
                            usage: Some(Usage {
                                prompt_tokens,
                                completion_tokens,
                                total_tokens: prompt_tokens + completion_tokens,
                                reasoning_tokens: 0,
                                cache_creation_input_tokens: cache_creation,
                                cache_read_input_tokens: cache_read,
                            }),
                            ..Default::default()
                        };
                    }
                    // content_block_stop and ping are informational.
                    _ => {}
                }
            }
        };
        Ok(Box::pin(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_budget_defaults_to_min_of_1024_and_max_tokens() {
        let provider = AnthropicProvider::new(ProviderConfig::new().with_api_key("k"));
        let req = Request {
            max_tokens: Some(500),
            thinking: Some(crate::model::ThinkingConfig::enabled()),
            ..Request::new("claude-3-7-sonnet", vec![Message::user("hi")])
        };
        let messages = prepare(&req.messages);
        let body = provider.build_body(&req, &messages, false);
        assert_eq!(body["thinking"]["budget_tokens"], json!(500));
    }

    #[test]
    fn system_messages_are_hoisted_to_top_level() {
        let provider = AnthropicProvider::new(ProviderConfig::new().with_api_key("k"));
        let req = Request::new(
            "claude-3-7-sonnet",
            vec![Message::system("be terse"), Message::user("hi")],
        );
        let messages = prepare(&req.messages);
        let body = provider.build_body(&req, &messages, false);
        assert_eq!(body["system"], json!("be terse"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn tool_role_becomes_user_turn_tool_result_block() {
        let provider = AnthropicProvider::new(ProviderConfig::new().with_api_key("k"));
        let msg = Message::tool_result("call_1", "42");
        let wire = provider.message_to_wire(&msg);
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"][0]["type"], "tool_result");
        assert_eq!(wire["content"][0]["tool_use_id"], "call_1");
    }
}
