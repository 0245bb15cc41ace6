//! OpenAI provider: Chat Completions (`/v1/chat/completions`) and the Responses API
//! (`/v1/responses`) on one base URL, selected explicitly via [`OpenAiProvider::chat`] vs
//! [`OpenAiProvider::responses`] rather than an implicit heuristic.
//!
//! Wire JSON is hand-built with `serde_json::json!` and posted with `reqwest` directly,
//! following the pattern the reference crate already uses in
//! `cloudllm::clients::common::send_with_native_tools` and its image-generation endpoints,
//! rather than going through a generated SDK client — this is the only way to reach the
//! Responses API's named-SSE `sequence_number` semantics the SDK the reference crate
//! otherwise depends on (`openai-rust2`) does not expose.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::model::{
    normalize_finish_reason, FinishReason, Message, Request, Response, ResponseFormat, Role,
    StreamChunk, StreamChunkType, ToolCall, ToolCallFunction, Usage,
};
use crate::preparer::prepare;
use crate::provider::{shared_http_client, Provider, ProviderConfig};
use crate::sse::decode_sse_stream;
use crate::stream::ChunkStream;

const PROVIDER_NAME: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// True for model names OpenAI classifies as "reasoning models": `o1`, `o3`, `o4`, and the
/// `gpt-5` family use `max_completion_tokens` and never receive `temperature`.
pub fn is_reasoning_model(model: &str) -> bool {
    let m = model.to_lowercase();
    m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4") || m.starts_with("gpt-5")
}

pub struct OpenAiProvider {
    config: ProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Self {
        OpenAiProvider { config }
    }

    pub fn from_env() -> Self {
        let key = std::env::var("OPENAI_API_KEY").ok();
        OpenAiProvider::new(ProviderConfig {
            api_key: key,
            base_url: None,
            extra: HashMap::new(),
        })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn api_key<'a>(&'a self, req: &'a Request) -> Result<&'a str, LlmError> {
        self.config.resolve_api_key(req).ok_or_else(|| {
            LlmError::new(
                crate::error::ErrorKind::Auth,
                "no OpenAI API key configured",
                PROVIDER_NAME,
            )
        })
    }

    fn message_to_wire(&self, m: &Message) -> Value {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let mut obj = json!({ "role": role });
        if let Some(contents) = &m.contents {
            let parts: Vec<Value> = contents
                .iter()
                .map(|c| match c {
                    crate::model::MessageContent::Text { text } => {
                        json!({"type": "text", "text": text})
                    }
                    crate::model::MessageContent::ImageUrl { url, detail } => {
                        let detail_str = match detail {
                            crate::model::ImageDetail::Auto => "auto",
                            crate::model::ImageDetail::Low => "low",
                            crate::model::ImageDetail::High => "high",
                        };
                        json!({"type": "image_url", "image_url": {"url": url, "detail": detail_str}})
                    }
                })
                .collect();
            obj["content"] = json!(parts);
        } else {
            obj["content"] = json!(m.content);
        }
        if let Some(id) = &m.tool_call_id {
            obj["tool_call_id"] = json!(id);
        }
        if !m.tool_calls.is_empty() {
            obj["tool_calls"] = json!(m
                .tool_calls
                .iter()
                .map(|tc| json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {"name": tc.function.name, "arguments": tc.function.arguments},
                }))
                .collect::<Vec<_>>());
        }
        obj
    }

    fn response_format_to_wire(format: &ResponseFormat) -> Value {
        match format {
            ResponseFormat::Text => json!({"type": "text"}),
            ResponseFormat::JsonObject => json!({"type": "json_object"}),
            ResponseFormat::JsonSchema {
                name,
                description,
                schema,
                strict,
            } => {
                let mut cleaned = schema.clone();
                super::clean_json_schema(&mut cleaned);
                if *strict {
                    super::clean_json_schema(&mut cleaned);
                }
                let mut json_schema = json!({
                    "name": name,
                    "schema": cleaned,
                    "strict": strict,
                });
                if let Some(desc) = description {
                    json_schema["description"] = json!(desc);
                }
                json!({"type": "json_schema", "json_schema": json_schema})
            }
        }
    }

    fn build_chat_body(&self, req: &Request, messages: &[Message], stream: bool) -> Value {
        let mut body = json!({
            "model": req.model,
            "messages": messages.iter().map(|m| self.message_to_wire(m)).collect::<Vec<_>>(),
        });

        if is_reasoning_model(&req.model) {
            if let Some(mt) = req.max_tokens {
                body["max_completion_tokens"] = json!(mt);
            }
        } else {
            if let Some(mt) = req.max_tokens {
                body["max_tokens"] = json!(mt);
            }
            if let Some(t) = req.temperature {
                body["temperature"] = json!(t);
            }
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if !req.stop.is_empty() {
            body["stop"] = json!(req.stop);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req
                .tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {
                        "name": t.function.name,
                        "description": t.function.description,
                        "parameters": t.function.parameters,
                    }
                }))
                .collect::<Vec<_>>());
        }
        if let Some(format) = &req.response_format {
            body["response_format"] = Self::response_format_to_wire(format);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    async fn post(&self, req: &Request, path: &str, body: &Value) -> Result<reqwest::Response, LlmError> {
        if let Some(cb) = &req.on_payload {
            cb(body);
        }
        let key = self.api_key(req)?;
        let url = format!("{}{}", self.base_url(), path);
        let resp = shared_http_client()
            .post(&url)
            .bearer_auth(key)
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
            log::error!("openai request to {} failed with status {}: {}", path, status, text);
            return Err(LlmError::from_http_status(
                status,
                &headers,
                &text,
                PROVIDER_NAME,
                Some(&req.model),
            ));
        }
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("openai request to {}, model={}", path, req.model);
        }
        Ok(resp)
    }

    fn parse_chat_response(&self, req: &Request, value: &Value) -> Response {
        let choice = &value["choices"][0];
        let message = &choice["message"];
        let content = message["content"].as_str().unwrap_or("").to_string();
        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        Some(ToolCall {
                            id: tc["id"].as_str()?.to_string(),
                            function: ToolCallFunction {
                                name: tc["function"]["name"].as_str()?.to_string(),
                                arguments: tc["function"]["arguments"].as_str()?.to_string(),
                            },
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let finish_raw = choice["finish_reason"].as_str().unwrap_or("stop");
        let finish_reason = map_finish_reason(&normalize_finish_reason(finish_raw));
        let usage = Usage {
            prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: value["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
            reasoning_tokens: value["usage"]["completion_tokens_details"]["reasoning_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: value["usage"]["prompt_tokens_details"]["cached_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
        };
        Response {
            content,
            contents: None,
            tool_calls,
            usage,
            model: value["model"].as_str().unwrap_or(&req.model).to_string(),
            provider: PROVIDER_NAME.to_string(),
            finish_reason,
            reasoning: None,
            extra: None,
        }
    }
}

fn map_finish_reason(normalized: &str) -> FinishReason {
    match normalized {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" => FinishReason::ToolCalls,
        "safety" => FinishReason::Safety,
        _ => FinishReason::Error,
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn chat(&self, req: &Request) -> Result<Response, LlmError> {
        req.validate()?;
        let messages = prepare(&req.messages);
        let body = self.build_chat_body(req, &messages, false);
        let resp = self.post(req, "/v1/chat/completions", &body).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::network(e.to_string(), PROVIDER_NAME))?;
        Ok(self.parse_chat_response(req, &value))
    }

    async fn stream(&self, req: &Request) -> Result<ChunkStream, LlmError> {
        req.validate()?;
        let messages = prepare(&req.messages);
        let body = self.build_chat_body(req, &messages, true);
        let resp = self.post(req, "/v1/chat/completions", &body).await?;
        let byte_stream = resp.bytes_stream().map(|r| r.map_err(|e| e.to_string()));
        let sse_stream = decode_sse_stream(byte_stream);

        let out = async_stream::try_stream! {
            futures_util::pin_mut!(sse_stream);
            let mut tool_call_names: HashMap<usize, String> = HashMap::new();
            let mut tool_call_ids: HashMap<usize, String> = HashMap::new();
            while let Some(event) = sse_stream.next().await {
                let event = event.map_err(|e| LlmError::network(e, PROVIDER_NAME))?;
                if event.data.trim() == "[DONE]" {
                    yield StreamChunk::terminal();
                    break;
                }
                let value: Value = match serde_json::from_str(&event.data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let choice = &value["choices"][0];
                if let Some(content) = choice["delta"]["content"].as_str() {
                    if !content.is_empty() {
                        yield StreamChunk {
                            chunk_type: Some(StreamChunkType::Content),
                            content: content.to_string(),
                            ..Default::default()
                        };
                    }
                }
                if let Some(deltas) = choice["delta"]["tool_calls"].as_array() {
                    for delta in deltas {
                        let index = delta["index"].as_u64().unwrap_or(0) as usize;
                        if let Some(id) = delta["id"].as_str() {
                            tool_call_ids.insert(index, id.to_string());
                        }
                        if let Some(name) = delta["function"]["name"].as_str() {
                            tool_call_names.insert(index, name.to_string());
                        }
                        let args = delta["function"]["arguments"].as_str().unwrap_or("");
                        yield StreamChunk {
                            chunk_type: Some(StreamChunkType::ToolCallDelta),
                            tool_call_id: tool_call_ids.get(&index).cloned(),
                            tool_call_name: tool_call_names.get(&index).cloned(),
                            tool_call_arguments: Some(args.to_string()),
                            ..Default::default()
                        };
                    }
                }
                if let Some(reason) = choice["finish_reason"].as_str() {
                    let normalized = normalize_finish_reason(reason);
                    yield StreamChunk {
                        finish_reason: Some(map_finish_reason(&normalized)),
                        ..Default::default()
                    };
                }
                if value["usage"].is_object() && !value["usage"].is_null() && choice.get("delta").is_none() {
                    let usage = Usage {
                        prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                        completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
                        total_tokens: value["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
                        reasoning_tokens: value["usage"]["completion_tokens_details"]["reasoning_tokens"].as_u64().unwrap_or(0) as u32,
                        cache_creation_input_tokens: 0,
                        cache_read_input_tokens: value["usage"]["prompt_tokens_details"]["cached_tokens"].as_u64().unwrap_or(0) as u32,
                    };
                    yield StreamChunk {
                        chunk_type: Some(StreamChunkType::Metadata),
                        usage: Some(usage),
                        ..Default::default()
                    };
                }
            }
        };
        Ok(Box::pin(out))
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(Vec::new())
    }
}

impl OpenAiProvider {
    /// The Responses API (`/v1/responses`) is a dedicated method, never an implicit
    /// fallback from [`Provider::chat`]. Handles the named-SSE event taxonomy with
    /// `sequence_number` dedup described in the component design.
    pub async fn responses(&self, req: &Request) -> Result<Response, LlmError> {
        req.validate()?;
        let messages = prepare(&req.messages);
        let body = self.build_responses_body(req, &messages, false);
        let resp = self.post(req, "/v1/responses", &body).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::network(e.to_string(), PROVIDER_NAME))?;
        Ok(self.parse_responses_value(req, &value))
    }

    pub async fn responses_stream(&self, req: &Request) -> Result<ChunkStream, LlmError> {
        req.validate()?;
        let messages = prepare(&req.messages);
        let body = self.build_responses_body(req, &messages, true);
        let resp = self.post(req, "/v1/responses", &body).await?;
        let byte_stream = resp.bytes_stream().map(|r| r.map_err(|e| e.to_string()));
        let sse_stream = decode_sse_stream(byte_stream);

        let out = async_stream::try_stream! {
            futures_util::pin_mut!(sse_stream);
            let mut last_sequence: i64 = -1;
            let mut seen_delta_for_item: std::collections::HashSet<String> = std::collections::HashSet::new();
            while let Some(event) = sse_stream.next().await {
                let event = event.map_err(|e| LlmError::network(e, PROVIDER_NAME))?;
                let value: Value = match serde_json::from_str(&event.data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let seq = value["sequence_number"].as_i64().unwrap_or(i64::MAX);
                if seq <= last_sequence {
                    continue;
                }
                last_sequence = seq;

                let event_name = event.event.as_deref().unwrap_or(value["type"].as_str().unwrap_or(""));
                match event_name {
                    "response.output_text.delta" => {
                        yield StreamChunk {
                            chunk_type: Some(StreamChunkType::Content),
                            content: value["delta"].as_str().unwrap_or("").to_string(),
                            item_id: value["item_id"].as_str().map(|s| s.to_string()),
                            ..Default::default()
                        };
                    }
                    "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
                        yield StreamChunk {
                            chunk_type: Some(StreamChunkType::Reasoning),
                            content: value["delta"].as_str().unwrap_or("").to_string(),
                            ..Default::default()
                        };
                    }
                    "response.reasoning_text.done" | "response.reasoning_summary_text.done" => {
                        yield StreamChunk {
                            chunk_type: Some(StreamChunkType::ReasoningDone),
                            ..Default::default()
                        };
                    }
                    "response.refusal.delta" => {
                        yield StreamChunk {
                            chunk_type: Some(StreamChunkType::Refusal),
                            content: value["delta"].as_str().unwrap_or("").to_string(),
                            ..Default::default()
                        };
                    }
                    "response.function_call_arguments.delta" => {
                        let item_id = value["item_id"].as_str().unwrap_or("").to_string();
                        seen_delta_for_item.insert(item_id.clone());
                        yield StreamChunk {
                            chunk_type: Some(StreamChunkType::ToolCallDelta),
                            item_id: Some(item_id),
                            tool_call_arguments: Some(value["delta"].as_str().unwrap_or("").to_string()),
                            ..Default::default()
                        };
                    }
                    "response.function_call_arguments.done" => {
                        let item_id = value["item_id"].as_str().unwrap_or("").to_string();
                        if seen_delta_for_item.remove(&item_id) {
                            yield StreamChunk {
                                chunk_type: Some(StreamChunkType::ToolCallEnd),
                                item_id: Some(item_id),
                                ..Default::default()
                            };
                        } else {
                            yield StreamChunk {
                                chunk_type: Some(StreamChunkType::ToolCallDelta),
                                item_id: Some(item_id),
                                tool_call_arguments: value["arguments"].as_str().map(|s| s.to_string()),
                                ..Default::default()
                            };
                        }
                    }
                    "response.output_item.added" => {
                        yield StreamChunk {
                            chunk_type: Some(StreamChunkType::OutputItemAdded),
                            item_id: value["item"]["id"].as_str().map(|s| s.to_string()),
                            ..Default::default()
                        };
                    }
                    "response.code_interpreter_call.code.delta" => {
                        yield StreamChunk {
                            chunk_type: Some(StreamChunkType::CodeInterpreterDelta),
                            content: value["delta"].as_str().unwrap_or("").to_string(),
                            ..Default::default()
                        };
                    }
                    "response.completed" => {
                        yield StreamChunk { done: true, finish_reason: Some(FinishReason::Stop), ..Default::default() };
                    }
                    "response.incomplete" => {
                        yield StreamChunk { done: true, finish_reason: Some(FinishReason::Length), ..Default::default() };
                    }
                    "response.failed" | "error" => {
                        Err(LlmError::new(crate::error::ErrorKind::Provider, "response.failed event received", PROVIDER_NAME))?;
                    }
                    // lifecycle / informational events are silently consumed.
                    _ => {}
                }
            }
        };
        Ok(Box::pin(out))
    }

    fn build_responses_body(&self, req: &Request, messages: &[Message], stream: bool) -> Value {
        let mut body = json!({
            "model": req.model,
            "input": messages.iter().map(|m| self.message_to_wire(m)).collect::<Vec<_>>(),
        });
        if is_reasoning_model(&req.model) {
            if let Some(mt) = req.max_tokens {
                body["max_completion_tokens"] = json!(mt);
            }
        } else if let Some(mt) = req.max_tokens {
            body["max_output_tokens"] = json!(mt);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req
                .tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "name": t.function.name,
                    "description": t.function.description,
                    "parameters": t.function.parameters,
                }))
                .collect::<Vec<_>>());
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn parse_responses_value(&self, req: &Request, value: &Value) -> Response {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        if let Some(output) = value["output"].as_array() {
            for item in output {
                if item["type"] == "message" {
                    if let Some(parts) = item["content"].as_array() {
                        for part in parts {
                            if let Some(text) = part["text"].as_str() {
                                content.push_str(text);
                            }
                        }
                    }
                } else if item["type"] == "function_call" {
                    if let (Some(id), Some(name), Some(args)) = (
                        item["call_id"].as_str().or(item["id"].as_str()),
                        item["name"].as_str(),
                        item["arguments"].as_str(),
                    ) {
                        tool_calls.push(ToolCall {
                            id: id.to_string(),
                            function: ToolCallFunction {
                                name: name.to_string(),
                                arguments: args.to_string(),
                            },
                        });
                    }
                }
            }
        }
        let status = value["status"].as_str().unwrap_or("completed");
        let finish_reason = if status == "incomplete" {
            FinishReason::Length
        } else if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        let usage = Usage {
            prompt_tokens: value["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: value["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
            reasoning_tokens: value["usage"]["output_tokens_details"]["reasoning_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        };
        Response {
            content,
            contents: None,
            tool_calls,
            usage,
            model: value["model"].as_str().unwrap_or(&req.model).to_string(),
            provider: PROVIDER_NAME.to_string(),
            finish_reason,
            reasoning: None,
            extra: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_models_are_detected_by_prefix() {
        assert!(is_reasoning_model("o1-mini"));
        assert!(is_reasoning_model("o3"));
        assert!(is_reasoning_model("o4-mini-high"));
        assert!(is_reasoning_model("gpt-5"));
        assert!(is_reasoning_model("GPT-5.2-Pro"));
        assert!(!is_reasoning_model("gpt-4o"));
        assert!(!is_reasoning_model("gpt-4.1-nano"));
    }

    #[test]
    fn reasoning_model_body_omits_temperature_and_max_tokens() {
        let provider = OpenAiProvider::new(ProviderConfig::new().with_api_key("k"));
        let req = Request {
            max_tokens: Some(500),
            temperature: Some(0.5),
            ..Request::new("o3-mini", vec![Message::user("hi")])
        };
        let messages = prepare(&req.messages);
        let body = provider.build_chat_body(&req, &messages, false);
        assert_eq!(body["max_completion_tokens"], json!(500));
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn non_reasoning_model_body_keeps_temperature_and_max_tokens() {
        let provider = OpenAiProvider::new(ProviderConfig::new().with_api_key("k"));
        let req = Request {
            max_tokens: Some(5),
            temperature: Some(0.2),
            ..Request::new("gpt-4o-mini", vec![Message::user("Say pong")])
        };
        let messages = prepare(&req.messages);
        let body = provider.build_chat_body(&req, &messages, false);
        assert_eq!(body["max_tokens"], json!(5));
        assert_eq!(body["temperature"], json!(0.2));
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn parses_simple_chat_response() {
        let provider = OpenAiProvider::new(ProviderConfig::new().with_api_key("k"));
        let req = Request::new("gpt-4o-mini", vec![Message::user("Say pong")]);
        let value = json!({
            "model": "gpt-4o-mini",
            "choices": [{"message": {"content": "pong"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10},
        });
        let resp = provider.parse_chat_response(&req, &value);
        assert_eq!(resp.content, "pong");
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.usage.prompt_tokens, 9);
        assert_eq!(resp.usage.total_tokens, 10);
        assert_eq!(resp.provider, "openai");
    }
}
