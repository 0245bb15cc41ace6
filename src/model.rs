//! The unified request/response/streaming vocabulary every provider translates to and from.
//!
//! Callers build one [`Request`] regardless of backend; providers are responsible for
//! converting it into their own wire schema and converting replies back into [`Response`]
//! or a stream of [`StreamChunk`]s.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Chat role. `Tool` carries the call ID it is responding to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Detail level requested for an image part, mirroring OpenAI's vision parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDetail {
    Auto,
    Low,
    High,
}

/// One part of a multimodal message. Superset of what any single provider accepts; a
/// provider drops what it cannot express rather than erroring.
#[derive(Debug, Clone)]
pub enum MessageContent {
    Text {
        text: String,
    },
    ImageUrl {
        url: String,
        detail: ImageDetail,
    },
}

/// Cache-control hint attached to a message or a system block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheControlType {
    Ephemeral,
    Persistent,
}

#[derive(Debug, Clone)]
pub struct CacheControl {
    pub cache_type: CacheControlType,
    pub ttl: Option<String>,
}

/// A function-call request emitted by the assistant.
#[derive(Debug, Clone)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON-encoded argument object, exactly as the provider returned it.
    pub arguments: String,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub function: ToolCallFunction,
}

/// One chat turn. `contents`, when present, supersedes `content` for multimodal parts.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub contents: Option<Vec<MessageContent>>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
    pub is_error: bool,
    pub cache_control: Option<CacheControl>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: content.into(),
            contents: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
            cache_control: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
            contents: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
            cache_control: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
            contents: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
            cache_control: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: content.into(),
            contents: None,
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            is_error: false,
            cache_control: None,
        }
    }
}

/// JSON-Schema-backed function tool declaration.
#[derive(Debug, Clone)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct Tool {
    pub function: ToolFunction,
}

/// Mirrors the OpenAI `tool_choice` sum type: a mode keyword or a pinned function name.
#[derive(Debug, Clone)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Function(String),
}

/// Structured-output policy for the response.
#[derive(Debug, Clone)]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema {
        name: String,
        description: Option<String>,
        schema: Value,
        strict: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingType {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingLevel {
    Minimal,
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    /// `minimal`→1024, `low`→2048, `medium`→8192, `high`→16384.
    pub fn default_budget(self) -> u32 {
        match self {
            ThinkingLevel::Minimal => 1024,
            ThinkingLevel::Low => 2048,
            ThinkingLevel::Medium => 8192,
            ThinkingLevel::High => 16384,
        }
    }
}

/// Maps a level keyword to its default token budget. Unknown inputs return 0.
pub fn level_to_budget(level: &str) -> u32 {
    match level {
        "minimal" => 1024,
        "low" => 2048,
        "medium" => 8192,
        "high" => 16384,
        _ => 0,
    }
}

#[derive(Debug, Clone)]
pub struct ThinkingConfig {
    pub thinking_type: ThinkingType,
    pub level: Option<ThinkingLevel>,
    pub budget_tokens: Option<u32>,
}

impl ThinkingConfig {
    pub fn enabled() -> Self {
        ThinkingConfig {
            thinking_type: ThinkingType::Enabled,
            level: None,
            budget_tokens: None,
        }
    }

    pub fn disabled() -> Self {
        ThinkingConfig {
            thinking_type: ThinkingType::Disabled,
            level: None,
            budget_tokens: None,
        }
    }

    /// Resolves the effective budget: explicit `budget_tokens`, else the level's default,
    /// else 0.
    pub fn resolved_budget(&self) -> u32 {
        self.budget_tokens
            .unwrap_or_else(|| self.level.map(|l| l.default_budget()).unwrap_or(0))
    }
}

/// Callback invoked with the serialized wire payload right before it is sent, primarily for
/// logging/debugging. Mirrors the `OnPayload` hook from the source design.
pub type OnPayload = Arc<dyn Fn(&Value) + Send + Sync>;

/// The single request type every provider accepts.
#[derive(Clone)]
pub struct Request {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop: Vec<String>,
    pub tools: Vec<Tool>,
    pub tool_choice: Option<ToolChoice>,
    pub response_format: Option<ResponseFormat>,
    pub thinking: Option<ThinkingConfig>,
    pub api_key: Option<String>,
    pub extra: HashMap<String, Value>,
    pub on_payload: Option<OnPayload>,
}

impl Request {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Request {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: Vec::new(),
            tools: Vec::new(),
            tool_choice: None,
            response_format: None,
            thinking: None,
            api_key: None,
            extra: HashMap::new(),
            on_payload: None,
        }
    }

    /// Validates the invariants from the data model: non-empty model/messages, temperature
    /// range, positive max_tokens, and a well-formed thinking type.
    pub fn validate(&self) -> Result<(), crate::error::LlmError> {
        use crate::error::LlmError;
        if self.model.trim().is_empty() {
            return Err(LlmError::validation("model must not be empty", None, None));
        }
        if self.messages.is_empty() {
            return Err(LlmError::validation(
                "messages must not be empty",
                None,
                None,
            ));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(LlmError::validation(
                    "temperature must be within [0, 2]",
                    None,
                    None,
                ));
            }
        }
        if let Some(mt) = self.max_tokens {
            if mt == 0 {
                return Err(LlmError::validation(
                    "max_tokens must be > 0 when present",
                    None,
                    None,
                ));
            }
        }
        Ok(())
    }
}

/// Token accounting. `total_tokens` is never recomputed locally when the server supplies it.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub reasoning_tokens: u32,
    pub cache_creation_input_tokens: u32,
    pub cache_read_input_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ReasoningData {
    pub summary: Option<String>,
    pub content: Option<String>,
    pub tokens_used: Option<u32>,
    pub done: bool,
}

/// Canonical finish-reason set every provider's own vocabulary normalizes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
    Safety,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Error => "error",
            FinishReason::Safety => "safety",
        }
    }
}

/// Normalizes a provider-specific finish reason string into the canonical set.
/// Idempotent: re-normalizing an already-canonical string returns it unchanged; unknown
/// values pass through unchanged too.
pub fn normalize_finish_reason(raw: &str) -> String {
    match raw {
        "stop" | "end_turn" | "STOP" | "stop_sequence" => "stop".to_string(),
        "length" | "max_tokens" | "MAX_TOKENS" | "incomplete" => "length".to_string(),
        "tool_calls" | "tool_use" | "function_call" => "tool_calls".to_string(),
        "error" | "ERROR" => "error".to_string(),
        "safety" | "SAFETY" | "content_filter" | "ContentFiltered" => "safety".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub content: String,
    pub contents: Option<Vec<MessageContent>>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub model: String,
    pub provider: String,
    pub finish_reason: FinishReason,
    pub reasoning: Option<ReasoningData>,
    pub extra: Option<Value>,
}

/// One semantic unit emitted by a stream reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunkType {
    Content,
    Reasoning,
    ReasoningDone,
    Refusal,
    ToolCallDelta,
    ToolCallEnd,
    OutputItemAdded,
    CodeInterpreterDelta,
    Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub chunk_type: Option<StreamChunkType>,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_call_name: Option<String>,
    pub tool_call_arguments: Option<String>,
    pub item_id: Option<String>,
    pub output_index: Option<u32>,
    pub content_index: Option<u32>,
    pub done: bool,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
    pub model: Option<String>,
}

impl StreamChunk {
    pub fn terminal() -> Self {
        StreamChunk {
            done: true,
            ..Default::default()
        }
    }
}
