//! A single parameterized provider for the family of OpenAI-compatible chat-completions
//! vendors (DeepSeek, OpenRouter, Qwen/DashScope, GLM/ZhiPu).
//!
//! Grounded on [`super::openai::OpenAiProvider`]'s request/response shape — these vendors
//! speak the same Chat Completions schema OpenAI does — generalized the way the reference
//! crate's `send_with_native_tools` in `cloudllm::clients::common` already treats "OpenAI
//! wire format" as a reusable shape rather than one bespoke struct per vendor. Per-vendor
//! quirks live entirely in the `Compat` data record instead of a new struct/trait impl.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::model::{
    normalize_finish_reason, FinishReason, Message, MessageContent, Request, Response,
    ResponseFormat, Role, StreamChunk, StreamChunkType, ToolCall, ToolCallFunction, Usage,
};
use crate::preparer::prepare;
use crate::provider::{shared_http_client, Provider, ProviderConfig};
use crate::sse::decode_sse_stream;
use crate::stream::ChunkStream;

/// Where a vendor accepts `json_schema` structured output, if at all.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SchemaPolicy {
    Omit,
    JsonObjectOnly,
    Native { strict_cleaner: bool },
    InjectIntoLastUserMessage,
}

/// When a vendor's reasoning field should be read. `ModelContains` restricts extraction to
/// models whose name contains the given substring (e.g. Qwen's "thinking" variants).
#[derive(Clone)]
pub enum ReasoningCondition {
    Always,
    ModelContains(String),
}

/// Per-vendor behavior for the shared OpenAI-compatible engine. See the module docs for the
/// reasoning behind keeping this as one data record rather than one struct per vendor.
#[derive(Clone)]
pub struct Compat {
    pub name: &'static str,
    pub base_url: &'static str,
    pub env_var: &'static str,
    pub token_limit_field: &'static str,
    pub include_stream_usage: bool,
    pub extra_headers: &'static [(&'static str, &'static str)],
    pub schema_policy: SchemaPolicy,
    pub reasoning_fields: &'static [&'static str],
    pub reasoning_condition: ReasoningCondition,
    pub has_completion_token_details: bool,
    pub has_cache_tokens: bool,
    pub omit_stop: bool,
    pub stop_ceiling: Option<usize>,
    pub sse_data_prefix: &'static str,
    pub model_from_response: bool,
}

impl Compat {
    fn reasoning_applies(&self, model: &str) -> bool {
        match &self.reasoning_condition {
            ReasoningCondition::Always => true,
            ReasoningCondition::ModelContains(sub) => model.contains(sub.as_str()),
        }
    }
}

pub struct CompatProvider {
    compat: Compat,
    config: ProviderConfig,
}

impl CompatProvider {
    pub fn new(compat: Compat, config: ProviderConfig) -> Self {
        CompatProvider { compat, config }
    }

    fn with_env(compat: Compat, config: ProviderConfig) -> Self {
        let mut config = config;
        if config.api_key.is_none() {
            config.api_key = std::env::var(compat.env_var).ok();
        }
        CompatProvider::new(compat, config)
    }

    pub fn deepseek(config: ProviderConfig) -> Self {
        CompatProvider::with_env(
            Compat {
                name: "deepseek",
                base_url: "https://api.deepseek.com",
                env_var: "DEEPSEEK_API_KEY",
                token_limit_field: "max_tokens",
                include_stream_usage: true,
                extra_headers: &[],
                schema_policy: SchemaPolicy::JsonObjectOnly,
                reasoning_fields: &["reasoning_content", "reasoning", "reasoning_text"],
                reasoning_condition: ReasoningCondition::Always,
                has_completion_token_details: true,
                has_cache_tokens: true,
                omit_stop: false,
                stop_ceiling: None,
                sse_data_prefix: "data: ",
                model_from_response: true,
            },
            config,
        )
    }

    pub fn openrouter(config: ProviderConfig) -> Self {
        CompatProvider::with_env(
            Compat {
                name: "openrouter",
                base_url: "https://openrouter.ai/api/v1",
                env_var: "OPENROUTER_API_KEY",
                token_limit_field: "max_tokens",
                include_stream_usage: true,
                extra_headers: &[("HTTP-Referer", "https://github.com/CloudLLM-ai/llm-core"), ("X-Title", "llm-core")],
                schema_policy: SchemaPolicy::Native { strict_cleaner: true },
                reasoning_fields: &["reasoning", "reasoning_content", "reasoning_text"],
                reasoning_condition: ReasoningCondition::Always,
                has_completion_token_details: false,
                has_cache_tokens: false,
                omit_stop: false,
                stop_ceiling: None,
                sse_data_prefix: "data: ",
                model_from_response: false,
            },
            config,
        )
    }

    pub fn qwen(config: ProviderConfig) -> Self {
        CompatProvider::with_env(
            Compat {
                name: "qwen",
                base_url: "https://dashscope.aliyuncs.com/api/v1",
                env_var: "DASHSCOPE_API_KEY",
                token_limit_field: "max_tokens",
                include_stream_usage: false,
                extra_headers: &[],
                schema_policy: SchemaPolicy::JsonObjectOnly,
                reasoning_fields: &["reasoning_content", "reasoning", "reasoning_text"],
                reasoning_condition: ReasoningCondition::ModelContains("thinking".to_string()),
                has_completion_token_details: false,
                has_cache_tokens: false,
                omit_stop: false,
                stop_ceiling: Some(4),
                sse_data_prefix: "data: ",
                model_from_response: false,
            },
            config,
        )
    }

    pub fn glm(config: ProviderConfig) -> Self {
        CompatProvider::with_env(
            Compat {
                name: "glm",
                base_url: "https://open.bigmodel.cn/api/paas/v4",
                env_var: "ZHIPU_API_KEY",
                token_limit_field: "max_tokens",
                include_stream_usage: false,
                extra_headers: &[],
                schema_policy: SchemaPolicy::InjectIntoLastUserMessage,
                reasoning_fields: &["reasoning_content"],
                reasoning_condition: ReasoningCondition::Always,
                has_completion_token_details: false,
                has_cache_tokens: false,
                omit_stop: false,
                stop_ceiling: None,
                sse_data_prefix: "data: ",
                model_from_response: false,
            },
            config,
        )
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(self.compat.base_url)
    }

    fn api_key<'a>(&'a self, req: &'a Request) -> Result<&'a str, LlmError> {
        self.config.resolve_api_key(req).ok_or_else(|| {
            LlmError::new(
                crate::error::ErrorKind::Auth,
                format!("no {} API key configured", self.compat.name),
                self.compat.name,
            )
        })
    }

    fn reasoning_applies(&self, model: &str) -> bool {
        match &self.compat.reasoning_condition {
            ReasoningCondition::Always => true,
            ReasoningCondition::ModelContains(sub) => model.contains(sub.as_str()),
        }
    }

    /// Per §8 scenario 6's Open Question resolution: the first non-empty field in
    /// `reasoning_fields` wins, falling through to `content` only if none are present.
    fn extract_reasoning<'v>(&self, message: &'v Value, model: &str) -> Option<&'v str> {
        if !self.reasoning_applies(model) {
            return None;
        }
        self.compat
            .reasoning_fields
            .iter()
            .find_map(|field| message[*field].as_str())
            .filter(|s| !s.is_empty())
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
            let mut parts: Vec<Value> = contents
                .iter()
                .map(|c| match c {
                    MessageContent::Text { text } => json!({"type": "text", "text": text}),
                    MessageContent::ImageUrl { url, .. } => {
                        json!({"type": "image_url", "image_url": {"url": url}})
                    }
                })
                .collect();
            if matches!(self.compat.schema_policy, SchemaPolicy::Native { .. }) {
                if let Some(cache) = &m.cache_control {
                    if let Some(last) = parts.last_mut() {
                        last["cache_control"] = json!({"type": match cache.cache_type {
                            crate::model::CacheControlType::Ephemeral => "ephemeral",
                            crate::model::CacheControlType::Persistent => "persistent",
                        }});
                    }
                }
            }
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

    fn apply_response_format(&self, body: &mut Value, req: &Request, messages: &mut Vec<Value>) {
        let Some(format) = &req.response_format else { return };
        match (&self.compat.schema_policy, format) {
            (SchemaPolicy::Omit, _) => {}
            (SchemaPolicy::JsonObjectOnly, ResponseFormat::JsonObject)
            | (SchemaPolicy::JsonObjectOnly, ResponseFormat::JsonSchema { .. }) => {
                body["response_format"] = json!({"type": "json_object"});
            }
            (SchemaPolicy::JsonObjectOnly, ResponseFormat::Text) => {}
            (SchemaPolicy::Native { strict_cleaner }, ResponseFormat::JsonSchema { name, description, schema, strict }) => {
                let mut cleaned = schema.clone();
                if *strict_cleaner {
                    super::clean_json_schema(&mut cleaned);
                    if *strict {
                        super::clean_json_schema(&mut cleaned);
                    }
                }
                let mut json_schema = json!({"name": name, "schema": cleaned, "strict": strict});
                if let Some(desc) = description {
                    json_schema["description"] = json!(desc);
                }
                body["response_format"] = json!({"type": "json_schema", "json_schema": json_schema});
            }
            (SchemaPolicy::Native { .. }, ResponseFormat::JsonObject) => {
                body["response_format"] = json!({"type": "json_object"});
            }
            (SchemaPolicy::Native { .. }, ResponseFormat::Text) => {}
            (SchemaPolicy::InjectIntoLastUserMessage, ResponseFormat::JsonSchema { schema, .. }) => {
                if let Some(last) = messages.iter_mut().rev().find(|m| m["role"] == "user") {
                    let existing = last["content"].as_str().unwrap_or("").to_string();
                    let injected = format!(
                        "{}\n\nRespond only with JSON matching this schema:\n{}",
                        existing, schema
                    );
                    last["content"] = json!(injected);
                }
            }
            (SchemaPolicy::InjectIntoLastUserMessage, _) => {}
        }
    }

    fn build_body(&self, req: &Request, messages: &[Message], stream: bool) -> Value {
        let mut wire_messages: Vec<Value> = messages.iter().map(|m| self.message_to_wire(m)).collect();
        let mut body = json!({ "model": req.model });

        if let Some(mt) = req.max_tokens {
            body[self.compat.token_limit_field] = json!(mt);
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if !req.stop.is_empty() && !self.compat.omit_stop {
            let stop = match self.compat.stop_ceiling {
                Some(n) => req.stop.iter().take(n).cloned().collect::<Vec<_>>(),
                None => req.stop.clone(),
            };
            body["stop"] = json!(stop);
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
        if let Some(thinking) = &req.thinking {
            body["thinking"] = json!({"type": match thinking.thinking_type {
                crate::model::ThinkingType::Enabled => "enabled",
                crate::model::ThinkingType::Disabled => "disabled",
            }});
        }
        self.apply_response_format(&mut body, req, &mut wire_messages);
        body["messages"] = json!(wire_messages);

        if stream {
            body["stream"] = json!(true);
            if self.compat.include_stream_usage {
                body["stream_options"] = json!({"include_usage": true});
            }
        }
        body
    }

    fn parse_usage(&self, value: &Value) -> Usage {
        let reasoning_tokens = if self.compat.has_completion_token_details {
            value["usage"]["completion_tokens_details"]["reasoning_tokens"].as_u64().unwrap_or(0) as u32
        } else {
            0
        };
        let (cache_read, cache_creation) = if self.compat.has_cache_tokens {
            let deepseek_read = value["usage"]["prompt_cache_hit_tokens"].as_u64();
            let deepseek_write = value["usage"]["prompt_cache_miss_tokens"].as_u64();
            let openai_read = value["usage"]["prompt_tokens_details"]["cached_tokens"].as_u64();
            (
                deepseek_read.or(openai_read).unwrap_or(0) as u32,
                deepseek_write.unwrap_or(0) as u32,
            )
        } else {
            (0, 0)
        };
        Usage {
            prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: value["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
            reasoning_tokens,
            cache_creation_input_tokens: cache_creation,
            cache_read_input_tokens: cache_read,
        }
    }

    fn parse_chat_response(&self, req: &Request, value: &Value) -> Response {
        let choice = &value["choices"][0];
        let message = &choice["message"];
        let content = message["content"].as_str().unwrap_or("").to_string();
        let reasoning_text = self.extract_reasoning(message, &req.model).map(|s| s.to_string());
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
        let usage = self.parse_usage(value);
        let model = if self.compat.model_from_response {
            value["model"].as_str().unwrap_or(&req.model).to_string()
        } else {
            req.model.clone()
        };
        Response {
            content,
            contents: None,
            tool_calls,
            usage,
            model,
            provider: self.compat.name.to_string(),
            finish_reason,
            reasoning: reasoning_text.map(|text| crate::model::ReasoningData {
                summary: None,
                content: Some(text),
                tokens_used: None,
                done: true,
            }),
            extra: None,
        }
    }

    async fn post(&self, req: &Request, body: &Value) -> Result<reqwest::Response, LlmError> {
        if let Some(cb) = &req.on_payload {
            cb(body);
        }
        let key = self.api_key(req)?;
        let url = format!("{}/chat/completions", self.base_url());
        let mut builder = shared_http_client().post(&url).bearer_auth(key).json(body);
        for (name, value) in self.compat.extra_headers {
            builder = builder.header(*name, *value);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| LlmError::network(e.to_string(), self.compat.name))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let headers: HashMap<String, String> = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect();
            let text = resp.text().await.unwrap_or_default();
            log::error!("{} request failed with status {}: {}", self.compat.name, status, text);
            return Err(LlmError::from_http_status(status, &headers, &text, self.compat.name, Some(&req.model)));
        }
        Ok(resp)
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
impl Provider for CompatProvider {
    fn name(&self) -> &str {
        self.compat.name
    }

    async fn chat(&self, req: &Request) -> Result<Response, LlmError> {
        req.validate()?;
        let messages = prepare(&req.messages);
        let body = self.build_body(req, &messages, false);
        let resp = self.post(req, &body).await?;
        let value: Value = resp.json().await.map_err(|e| LlmError::network(e.to_string(), self.compat.name))?;
        Ok(self.parse_chat_response(req, &value))
    }

    async fn stream(&self, req: &Request) -> Result<ChunkStream, LlmError> {
        req.validate()?;
        let messages = prepare(&req.messages);
        let body = self.build_body(req, &messages, true);
        let resp = self.post(req, &body).await?;
        let byte_stream = resp.bytes_stream().map(|r| r.map_err(|e| e.to_string()));
        let sse_stream = decode_sse_stream(byte_stream);
        let compat = self.compat.clone();
        let model = req.model.clone();

        let out = async_stream::try_stream! {
            futures_util::pin_mut!(sse_stream);
            let mut tool_call_names: HashMap<usize, String> = HashMap::new();
            let mut tool_call_ids: HashMap<usize, String> = HashMap::new();
            while let Some(event) = sse_stream.next().await {
                let event = event.map_err(|e| LlmError::network(e, compat.name))?;
                if event.data.trim() == "[DONE]" {
                    yield StreamChunk::terminal();
                    break;
                }
                let value: Value = match serde_json::from_str(&event.data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let choice = &value["choices"][0];
                let delta = &choice["delta"];

                let reasoning_piece = if compat.reasoning_applies(&model) {
                    compat.reasoning_fields.iter().find_map(|field| delta[*field].as_str()).filter(|s| !s.is_empty())
                } else {
                    None
                };
                if let Some(text) = reasoning_piece {
                    yield StreamChunk {
                        chunk_type: Some(StreamChunkType::Reasoning),
                        content: text.to_string(),
                        ..Default::default()
                    };
                } else if let Some(content) = delta["content"].as_str() {
                    if !content.is_empty() {
                        yield StreamChunk {
                            chunk_type: Some(StreamChunkType::Content),
                            content: content.to_string(),
                            ..Default::default()
                        };
                    }
                }
                if let Some(deltas) = delta["tool_calls"].as_array() {
                    for d in deltas {
                        let index = d["index"].as_u64().unwrap_or(0) as usize;
                        if let Some(id) = d["id"].as_str() {
                            tool_call_ids.insert(index, id.to_string());
                        }
                        if let Some(name) = d["function"]["name"].as_str() {
                            tool_call_names.insert(index, name.to_string());
                        }
                        let args = d["function"]["arguments"].as_str().unwrap_or("");
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
                    yield StreamChunk {
                        finish_reason: Some(map_finish_reason(&normalize_finish_reason(reason))),
                        ..Default::default()
                    };
                }
                if value["usage"].is_object() && delta.get("content").is_none() && delta.get("role").is_none() {
                    yield StreamChunk {
                        chunk_type: Some(StreamChunkType::Metadata),
                        usage: Some(Usage {
                            prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                            completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
                            total_tokens: value["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
                            reasoning_tokens: if compat.has_completion_token_details {
                                value["usage"]["completion_tokens_details"]["reasoning_tokens"].as_u64().unwrap_or(0) as u32
                            } else { 0 },
                            cache_creation_input_tokens: if compat.has_cache_tokens {
                                value["usage"]["prompt_cache_miss_tokens"].as_u64().unwrap_or(0) as u32
                            } else { 0 },
                            cache_read_input_tokens: if compat.has_cache_tokens {
                                value["usage"]["prompt_cache_hit_tokens"].as_u64()
                                    .or(value["usage"]["prompt_tokens_details"]["cached_tokens"].as_u64())
                                    .unwrap_or(0) as u32
                            } else { 0 },
                        }),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deepseek_usage_parses_cache_and_reasoning_tokens() {
        let provider = CompatProvider::deepseek(ProviderConfig::new().with_api_key("k"));
        let req = Request::new("deepseek-chat", vec![Message::user("hi")]);
        let value = json!({
            "choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}],
            "usage": {
                "prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150,
                "prompt_cache_hit_tokens": 40, "prompt_cache_miss_tokens": 60,
                "completion_tokens_details": {"reasoning_tokens": 20},
            },
        });
        let resp = provider.parse_chat_response(&req, &value);
        assert_eq!(resp.usage.cache_read_input_tokens, 40);
        assert_eq!(resp.usage.cache_creation_input_tokens, 60);
        assert_eq!(resp.usage.reasoning_tokens, 20);
    }

    #[test]
    fn glm_injects_schema_into_last_user_message() {
        let provider = CompatProvider::glm(ProviderConfig::new().with_api_key("k"));
        let req = Request {
            response_format: Some(ResponseFormat::JsonSchema {
                name: "answer".to_string(),
                description: None,
                schema: json!({"type": "object"}),
                strict: true,
            }),
            ..Request::new("glm-4", vec![Message::user("what is the weather")])
        };
        let messages = prepare(&req.messages);
        let body = provider.build_body(&req, &messages, false);
        let content = body["messages"][0]["content"].as_str().unwrap();
        assert!(content.contains("what is the weather"));
        assert!(content.contains("Respond only with JSON"));
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn qwen_reasoning_extraction_is_gated_by_model_name() {
        let provider = CompatProvider::qwen(ProviderConfig::new().with_api_key("k"));
        assert!(provider.reasoning_applies("qwen-thinking-max"));
        assert!(!provider.reasoning_applies("qwen-turbo"));
    }

    #[test]
    fn openrouter_sends_required_extra_headers() {
        let provider = CompatProvider::openrouter(ProviderConfig::new().with_api_key("k"));
        assert!(provider.compat.extra_headers.iter().any(|(k, _)| *k == "HTTP-Referer"));
        assert!(provider.compat.extra_headers.iter().any(|(k, _)| *k == "X-Title"));
    }

    #[test]
    fn qwen_stop_sequences_are_capped_at_ceiling() {
        let provider = CompatProvider::qwen(ProviderConfig::new().with_api_key("k"));
        let req = Request {
            stop: vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()],
            ..Request::new("qwen-max", vec![Message::user("hi")])
        };
        let messages = prepare(&req.messages);
        let body = provider.build_body(&req, &messages, false);
        assert_eq!(body["stop"].as_array().unwrap().len(), 4);
    }
}
