//! Placeholder provider
//!
//! Answers every prompt with `Received prompt: <prompt>` without touching the
//! network. Usage is reported as character counts and costs nothing.

use async_trait::async_trait;

use super::{Provider, ProviderRequest, ProviderResponse, ProviderResult};
use crate::colony::Usage;

#[derive(Debug, Clone, Default)]
pub struct EchoProvider;

impl EchoProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: ProviderRequest) -> ProviderResult<ProviderResponse> {
        let prompt = request.last_user_prompt().unwrap_or_default();
        let content = format!("Received prompt: {}", prompt);
        let usage = Usage {
            input_tokens: prompt.chars().count() as u64,
            output_tokens: content.chars().count() as u64,
            cost_usd: 0.0,
        };

        Ok(ProviderResponse::text(content).with_usage(usage))
    }
}
