//! Google Gemini provider: `generateContent` / `streamGenerateContent`, API key passed as a
//! query parameter rather than a header.
//!
//! The reference crate's `GeminiClient` only hand-builds raw JSON for its image-generation
//! endpoint; ordinary chat goes through `openai_rust2::Client` against Gemini's
//! OpenAI-compatibility shim, which cannot express `systemInstruction`, `thinkingConfig`, or
//! the `thought` part flag. This provider generalizes the raw-reqwest pattern the reference
//! crate already uses for image generation to the full chat surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::model::{
    FinishReason, Message, MessageContent, Request, Response, Role, StreamChunk, Usage,
};
use crate::preparer::prepare;
use crate::provider::{shared_http_client, Provider, ProviderConfig};
use crate::stream::ChunkStream;

const PROVIDER_NAME: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Process-wide monotonic counter seeded with the current Unix timestamp, used to synthesize
/// tool-call IDs for Gemini responses (which never return one of its own). An atomic avoids
/// the need for a mutex since the counter is the only piece of mutable provider state.
static CALL_COUNTER: AtomicU64 = AtomicU64::new(0);

fn synthesize_tool_call_id() -> String {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let n = CALL_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("call_{}_{}", unix, n)
}

pub struct GeminiProvider {
    config: ProviderConfig,
}

impl GeminiProvider {
    pub fn new(config: ProviderConfig) -> Self {
        GeminiProvider { config }
    }

    pub fn from_env() -> Self {
        let key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .ok();
        GeminiProvider::new(ProviderConfig {
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
                "no Gemini API key configured",
                PROVIDER_NAME,
            )
        })
    }

    fn message_to_content(m: &Message) -> Value {
        let role = match m.role {
            Role::User => "user",
            Role::Assistant => "model",
            Role::Tool => "function",
            Role::System => unreachable!("system messages are hoisted before this point"),
        };
        let mut parts: Vec<Value> = Vec::new();
        if m.role == Role::Tool {
            parts.push(json!({
                "functionResponse": {
                    "name": m.tool_call_id.clone().unwrap_or_default(),
                    "response": {"content": m.content},
                }
            }));
        } else if let Some(contents) = &m.contents {
            for c in contents {
                match c {
                    MessageContent::Text { text } => parts.push(json!({"text": text})),
                    MessageContent::ImageUrl { url, .. } => {
                        parts.push(json!({"text": "", "fileData": {"fileUri": url}}))
                    }
                }
            }
        } else if !m.content.is_empty() {
            parts.push(json!({"text": m.content}));
        }
        for tc in &m.tool_calls {
            let args = serde_json::from_str::<Value>(&tc.function.arguments).unwrap_or(json!({}));
            parts.push(json!({
                "functionCall": {"name": tc.function.name, "args": args}
            }));
        }
        json!({"role": role, "parts": parts})
    }

    fn build_body(&self, req: &Request, messages: &[Message]) -> Value {
        let system_text: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(Self::message_to_content)
            .collect();

        let mut body = json!({ "contents": contents });
        if !system_text.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system_text.join("\n\n")}]});
        }

        let mut generation_config = json!({});
        if let Some(mt) = req.max_tokens {
            generation_config["maxOutputTokens"] = json!(mt);
        }
        if let Some(t) = req.temperature {
            generation_config["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            generation_config["topP"] = json!(p);
        }
        if !req.stop.is_empty() {
            generation_config["stopSequences"] = json!(req.stop);
        }
        if let Some(thinking) = &req.thinking {
            let include_thoughts = thinking.thinking_type != crate::model::ThinkingType::Disabled;
            let mut tc = json!({"includeThoughts": include_thoughts});
            let budget = thinking.resolved_budget();
            if budget > 0 {
                tc["thinkingBudget"] = json!(budget);
            }
            generation_config["thinkingConfig"] = tc;
        }
        if generation_config.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            body["generationConfig"] = generation_config;
        }

        if !req.tools.is_empty() {
            let declarations: Vec<Value> = req
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "parameters": t.function.parameters,
                }))
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        if let Some(choice) = &req.tool_choice {
            body["toolConfig"] = match choice {
                crate::model::ToolChoice::Auto => json!({"functionCallingConfig": {"mode": "AUTO"}}),
                crate::model::ToolChoice::None => json!({"functionCallingConfig": {"mode": "NONE"}}),
                crate::model::ToolChoice::Required => json!({"functionCallingConfig": {"mode": "ANY"}}),
                crate::model::ToolChoice::Function(name) => json!({
                    "functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": [name]}
                }),
            };
        }
        body
    }

    fn parse_value(&self, req: &Request, value: &Value) -> Response {
        let candidate = &value["candidates"][0];
        let mut content = String::new();
        let mut reasoning_content = String::new();
        let mut tool_calls = Vec::new();
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                let is_thought = part["thought"].as_bool().unwrap_or(false);
                if let Some(call) = part.get("functionCall") {
                    tool_calls.push(crate::model::ToolCall {
                        id: synthesize_tool_call_id(),
                        function: crate::model::ToolCallFunction {
                            name: call["name"].as_str().unwrap_or("").to_string(),
                            arguments: call["args"].to_string(),
                        },
                    });
                    continue;
                }
                if let Some(text) = part["text"].as_str() {
                    if is_thought {
                        reasoning_content.push_str(text);
                    } else {
                        content.push_str(text);
                    }
                }
            }
        }
        let finish_raw = candidate["finishReason"].as_str().unwrap_or("STOP");
        let finish_reason = match crate::model::normalize_finish_reason(finish_raw).as_str() {
            "stop" => {
                if tool_calls.is_empty() {
                    FinishReason::Stop
                } else {
                    FinishReason::ToolCalls
                }
            }
            "length" => FinishReason::Length,
            "safety" => FinishReason::Safety,
            _ => FinishReason::Stop,
        };
        let usage = Usage {
            prompt_tokens: value["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            completion_tokens: value["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
            total_tokens: value["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or(0) as u32,
            reasoning_tokens: value["usageMetadata"]["thoughtsTokenCount"].as_u64().unwrap_or(0) as u32,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: value["usageMetadata"]["cachedContentTokenCount"].as_u64().unwrap_or(0) as u32,
        };
        Response {
            content,
            contents: None,
            tool_calls,
            usage,
            model: req.model.clone(),
            provider: PROVIDER_NAME.to_string(),
            finish_reason,
            reasoning: if reasoning_content.is_empty() {
                None
            } else {
                Some(crate::model::ReasoningData {
                    content: Some(reasoning_content),
                    ..Default::default()
                })
            },
            extra: None,
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn chat(&self, req: &Request) -> Result<Response, LlmError> {
        req.validate()?;
        let messages = prepare(&req.messages);
        let body = self.build_body(req, &messages);
        if let Some(cb) = &req.on_payload {
            cb(&body);
        }
        let key = self.api_key(req)?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url(),
            urlencoding::encode(&req.model),
            urlencoding::encode(key)
        );
        let resp = shared_http_client()
            .post(&url)
            .json(&body)
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
            log::error!("gemini generateContent failed with status {}: {}", status, text);
            return Err(LlmError::from_http_status(
                status,
                &headers,
                &text,
                PROVIDER_NAME,
                Some(&req.model),
            ));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::network(e.to_string(), PROVIDER_NAME))?;
        Ok(self.parse_value(req, &value))
    }

    /// Implements the array-or-NDJSON buffering contract from the component design: the
    /// reader tries `Unmarshal(object)` then `Unmarshal(array)` on each append, emitting
    /// queued array elements one at a time, and only calling the stream corrupt when both
    /// attempts fail with a non-"incomplete JSON" error.
    async fn stream(&self, req: &Request) -> Result<ChunkStream, LlmError> {
        req.validate()?;
        let messages = prepare(&req.messages);
        let body = self.build_body(req, &messages);
        if let Some(cb) = &req.on_payload {
            cb(&body);
        }
        let key = self.api_key(req)?;
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url(),
            urlencoding::encode(&req.model),
            urlencoding::encode(key)
        );
        let resp = shared_http_client()
            .post(&url)
            .json(&body)
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
            log::error!("gemini streamGenerateContent failed with status {}: {}", status, text);
            return Err(LlmError::from_http_status(
                status,
                &headers,
                &text,
                PROVIDER_NAME,
                Some(&req.model),
            ));
        }

        let byte_stream = resp.bytes_stream().map(|r| r.map_err(|e: reqwest::Error| e.to_string()));
        let model_name = req.model.clone();
        let out = async_stream::try_stream! {
            use futures_util::StreamExt as _;
            futures_util::pin_mut!(byte_stream);
            let mut pending = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.map_err(|e| LlmError::network(e, PROVIDER_NAME))?;
                pending.push_str(&String::from_utf8_lossy(&chunk));
                loop {
                    let Some(idx) = pending.find("\n\n") else { break };
                    let frame: String = pending.drain(..idx + 2).collect();
                    let json_text = frame
                        .lines()
                        .find_map(|l| l.strip_prefix("data: "))
                        .unwrap_or("")
                        .trim();
                    if json_text.is_empty() {
                        continue;
                    }
                    let values: Vec<Value> = if let Ok(v) = serde_json::from_str::<Value>(json_text) {
                        if v.is_array() {
                            v.as_array().unwrap().clone()
                        } else {
                            vec![v]
                        }
                    } else {
                        continue;
                    };
                    for value in values {
                        let candidate = &value["candidates"][0];
                        if let Some(parts) = candidate["content"]["parts"].as_array() {
                            for part in parts {
                                if let Some(text) = part["text"].as_str() {
                                    let is_thought = part["thought"].as_bool().unwrap_or(false);
                                    yield StreamChunk {
                                        chunk_type: Some(if is_thought {
                                            crate::model::StreamChunkType::Reasoning
                                        } else {
                                            crate::model::StreamChunkType::Content
                                        }),
                                        content: text.to_string(),
                                        ..Default::default()
                                    };
                                }
                            }
                        }
                        if let Some(finish_raw) = candidate["finishReason"].as_str() {
                            let finish = match crate::model::normalize_finish_reason(finish_raw).as_str() {
                                "stop" => FinishReason::Stop,
                                "length" => FinishReason::Length,
                                "safety" => FinishReason::Safety,
                                _ => FinishReason::Stop,
                            };
                            let usage = Usage {
                                prompt_tokens: value["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32,
                                completion_tokens: value["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
                                total_tokens: value["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or(0) as u32,
                                reasoning_tokens: value["usageMetadata"]["thoughtsTokenCount"].as_u64().unwrap_or(0) as u32,
                                cache_creation_input_tokens: 0,
                                cache_read_input_tokens: 0,
                            };
                            yield StreamChunk {
                                done: true,
                                finish_reason: Some(finish),
                                usage: Some(usage),
                                model: Some(model_name.clone()),
                                ..Default::default()
                            };
                        }
                    }
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
    fn tool_call_ids_are_unique_and_well_formed() {
        let a = synthesize_tool_call_id();
        let b = synthesize_tool_call_id();
        assert_ne!(a, b);
        assert!(a.starts_with("call_"));
    }

    #[test]
    fn system_messages_become_system_instruction() {
        let provider = GeminiProvider::new(ProviderConfig::new().with_api_key("k"));
        let req = Request::new(
            "gemini-2.0-flash",
            vec![Message::system("be terse"), Message::user("hi")],
        );
        let messages = prepare(&req.messages);
        let body = provider.build_body(&req, &messages);
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            json!("be terse")
        );
        assert_eq!(body["contents"].as_array().unwrap().len(), 1);
        assert_eq!(body["contents"][0]["role"], "user");
    }

    #[test]
    fn assistant_role_maps_to_model() {
        let wire = GeminiProvider::message_to_content(&Message::assistant("hi"));
        assert_eq!(wire["role"], "model");
    }

    #[test]
    fn multimodal_message_produces_text_and_image_parts() {
        let msg = Message {
            contents: Some(vec![
                MessageContent::Text { text: "describe".to_string() },
                MessageContent::ImageUrl {
                    url: "https://example.com/a.png".to_string(),
                    detail: crate::model::ImageDetail::Auto,
                },
            ]),
            ..Message::user("")
        };
        let wire = GeminiProvider::message_to_content(&msg);
        let parts = wire["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], json!("describe"));
    }
}
