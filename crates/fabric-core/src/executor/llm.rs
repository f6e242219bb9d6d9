//! The LLM port the Task Executor's analyze/plan/review phases call through.
//!
//! Per spec.md §9: "treat the provider as a pure `Complete({prompt, model,
//! max_tokens}) -> {text, tokens_used, cost_estimate}` interface. Caching,
//! retry, and cost tracking wrap this port and are testable without a real
//! provider." Shares the `#[async_trait]` + compile-time object-safety
//! assertion template used for [`crate::agents::Agent`] and
//! [`crate::workflow::StepExecutor`].

use async_trait::async_trait;

use crate::error::FabricError;

/// A single completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
}

/// A provider's response to a [`CompletionRequest`].
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_estimate: f64,
}

#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, FabricError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn LlmPort) {}
};
