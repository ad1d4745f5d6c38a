//! Test double that replays canned provider turns

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{EchoProvider, Provider, ProviderRequest, ProviderResponse, ProviderResult};

/// Replays queued responses in order, then falls back to echoing
#[derive(Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ProviderResult<ProviderResponse>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn then(self, step: ProviderResult<ProviderResponse>) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    /// Requests seen so far
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> ProviderResult<ProviderResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.requests.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(step) => step,
            None => EchoProvider::new().complete(request).await,
        }
    }
}
