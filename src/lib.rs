//! One request/response vocabulary and one streaming contract, translated into the native
//! wire protocol of OpenAI (Chat Completions + Responses), Anthropic Messages, Google
//! Gemini, Amazon Bedrock Converse, and the family of OpenAI-compatible vendors (DeepSeek,
//! OpenRouter, Qwen, GLM).
//!
//! ```no_run
//! use llm_core::{build_provider, Message, ProviderConfig, Request};
//!
//! # async fn run() -> Result<(), llm_core::LlmError> {
//! let provider = build_provider("openai", ProviderConfig::new().with_api_key("sk-..."))?;
//! let req = Request::new("gpt-4o-mini", vec![Message::user("ping")]);
//! let resp = provider.chat(&req).await?;
//! println!("{}", resp.content);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod logging;
pub mod model;
pub mod preparer;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod sse;
pub mod stream;

pub use error::{ErrorKind, LlmError};
pub use logging::init_logger;
pub use model::{
    CacheControl, CacheControlType, FinishReason, ImageDetail, Message, MessageContent,
    ReasoningData, Request, Response, ResponseFormat, Role, StreamChunk, StreamChunkType,
    ThinkingConfig, ThinkingLevel, ThinkingType, Tool, ToolCall, ToolCallFunction, ToolChoice,
    ToolFunction, Usage,
};
pub use preparer::prepare;
pub use provider::{shared_http_client, Provider, ProviderConfig, ProviderFactory};
pub use registry::{build_provider, ProviderRegistry};
pub use stream::ChunkStream;
