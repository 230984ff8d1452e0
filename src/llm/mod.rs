//! The sole seam to an external LLM provider.
//!
//! Nothing above this module knows what model is being called, how it is
//! authenticated, or what HTTP client sits underneath it. The agent runner,
//! policy agent, and qualitative forecast resolver all take `&dyn LlmClient`
//! / `&dyn StructuredExtractor` rather than constructing a concrete provider.

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::error::SitsimResult;

pub mod mock;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub prompt: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: String::new(),
            prompt: prompt.into(),
            temperature: 0.7,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    /// USD cost observed for this single call; the only field the cost
    /// manager reads.
    pub cost_usd: f64,
}

/// Free-form text generation.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> SitsimResult<CompletionResponse>;
}

#[async_trait]
impl LlmClient for std::sync::Arc<dyn LlmClient> {
    async fn complete(&self, request: CompletionRequest) -> SitsimResult<CompletionResponse> {
        (**self).complete(request).await
    }
}

/// Parses free text into a typed value, optionally guided by a JSON schema
/// and additional natural-language instructions.
#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    async fn extract_json(
        &self,
        raw_text: &str,
        schema: &schemars::schema::RootSchema,
        instructions: &str,
    ) -> SitsimResult<serde_json::Value>;
}

/// Convenience wrapper over [`StructuredExtractor::extract_json`] that
/// deserializes the result into `T`.
pub async fn extract<T>(
    extractor: &dyn StructuredExtractor,
    raw_text: &str,
    instructions: &str,
) -> SitsimResult<T>
where
    T: DeserializeOwned + JsonSchema,
{
    let schema = schemars::schema_for!(T);
    let value = extractor.extract_json(raw_text, &schema, instructions).await?;
    serde_json::from_value(value)
        .map_err(|e| crate::error::LlmError::Extraction(e.to_string()).into())
}
