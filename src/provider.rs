//! Base Provider: the shared HTTP client, config resolution, and `Extra` validation every
//! concrete provider builds on.
//!
//! The shared client mirrors the reference crate's `SHARED_HTTP_CLIENT` `lazy_static!`
//! singleton in `cloudllm::clients::common` — one pooled `reqwest::Client` reused by every
//! provider instance rather than one per call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::Value;

use crate::error::LlmError;
use crate::model::{Request, Response};
use crate::stream::ChunkStream;

lazy_static! {
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Duration::from_secs(60))
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build shared HTTP client");
}

/// Returns the process-wide pooled HTTP client shared by every provider instance.
pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Per-provider construction config. No on-disk file format is introduced; callers build
/// this directly or via a provider's `from_env` convenience constructor.
#[derive(Clone, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub extra: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// `req.api_key` if set, else `self.api_key`. Lets a single long-lived provider instance
    /// serve requests under rotating per-call keys without reconstruction.
    pub fn resolve_api_key<'a>(&'a self, req: &'a Request) -> Option<&'a str> {
        req.api_key
            .as_deref()
            .or(self.api_key.as_deref())
    }

    /// Fails closed: with no allow-list, any non-empty `extra` is an error; with an
    /// allow-list, only listed keys pass.
    pub fn validate_extra(
        extra: &HashMap<String, Value>,
        allowed_keys: Option<&[&str]>,
        provider: &str,
    ) -> Result<(), LlmError> {
        match allowed_keys {
            None => {
                if extra.is_empty() {
                    Ok(())
                } else {
                    Err(LlmError::validation(
                        format!(
                            "provider {} does not accept any Extra keys, got: {:?}",
                            provider,
                            extra.keys().collect::<Vec<_>>()
                        ),
                        Some(provider),
                        None,
                    ))
                }
            }
            Some(allowed) => {
                for key in extra.keys() {
                    if !allowed.contains(&key.as_str()) {
                        return Err(LlmError::validation(
                            format!("provider {} does not accept Extra key '{}'", provider, key),
                            Some(provider),
                            None,
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

/// The capability set every concrete provider implements: a name, validation, and the two
/// core operations (`chat`, `stream`). `list_models` is optional; providers that cannot list
/// models return an empty vec by default.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, req: &Request) -> Result<(), LlmError> {
        req.validate()
    }

    async fn chat(&self, req: &Request) -> Result<Response, LlmError>;

    async fn stream(&self, req: &Request) -> Result<ChunkStream, LlmError>;

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(Vec::new())
    }
}

/// Factory signature used by the [`crate::registry::ProviderRegistry`].
pub type ProviderFactory = Arc<dyn Fn(ProviderConfig) -> Arc<dyn Provider> + Send + Sync>;
