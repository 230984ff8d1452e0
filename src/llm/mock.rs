//! Scripted stand-ins for [`super::LlmClient`] and [`super::StructuredExtractor`],
//! used by tests and by callers that want deterministic wiring without a
//! real provider behind the trait.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{LlmError, SitsimResult};

use super::{CompletionRequest, CompletionResponse, LlmClient, StructuredExtractor};

/// Replays a fixed sequence of completions, one per call, in order.
/// Panics (via an error, not a panic) once exhausted.
pub struct ScriptedLlmClient {
    responses: Mutex<std::collections::VecDeque<CompletionResponse>>,
}

impl ScriptedLlmClient {
    pub fn new(responses: impl IntoIterator<Item = CompletionResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }

    pub fn constant(text: impl Into<String>, cost_usd: f64) -> Self {
        Self::new(std::iter::once(CompletionResponse {
            text: text.into(),
            cost_usd,
        }))
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _request: CompletionRequest) -> SitsimResult<CompletionResponse> {
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .pop_front()
            .ok_or_else(|| LlmError::EmptyResponse.into())
    }
}

/// Replays a fixed sequence of already-structured JSON values, bypassing any
/// actual text parsing — useful for testing callers of
/// [`super::extract`] without depending on a real extraction model.
pub struct ScriptedStructuredExtractor {
    values: Mutex<std::collections::VecDeque<serde_json::Value>>,
}

impl ScriptedStructuredExtractor {
    pub fn new(values: impl IntoIterator<Item = serde_json::Value>) -> Self {
        Self {
            values: Mutex::new(values.into_iter().collect()),
        }
    }
}

#[async_trait]
impl StructuredExtractor for ScriptedStructuredExtractor {
    async fn extract_json(
        &self,
        _raw_text: &str,
        _schema: &schemars::schema::RootSchema,
        _instructions: &str,
    ) -> SitsimResult<serde_json::Value> {
        self.values
            .lock()
            .expect("mock lock poisoned")
            .pop_front()
            .ok_or_else(|| LlmError::EmptyResponse.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_client_replays_in_order() {
        let client = ScriptedLlmClient::new([
            CompletionResponse {
                text: "first".into(),
                cost_usd: 0.01,
            },
            CompletionResponse {
                text: "second".into(),
                cost_usd: 0.02,
            },
        ]);

        let first = client
            .complete(CompletionRequest::new("test-model", "p"))
            .await
            .unwrap();
        assert_eq!(first.text, "first");

        let second = client
            .complete(CompletionRequest::new("test-model", "p"))
            .await
            .unwrap();
        assert_eq!(second.text, "second");

        assert!(client.complete(CompletionRequest::new("test-model", "p")).await.is_err());
    }
}
