//! Provider gateway for OpenRouter chat completions.

pub mod catalog;
pub mod error;
pub mod openrouter;
pub mod types;
pub mod usage;

use std::sync::Arc;

use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use catalog::{ModelCatalog, DEFAULT_CATALOG_TTL};
pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, StderrUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Gateway that forwards chat requests to OpenRouter and records every call
/// through a [`UsageSink`].
///
/// Deliberately single-shot: the council absorbs member failures by dropping
/// the member, and the vision extractor has its own fallback chain, so no
/// retry loop lives at this layer.
pub struct ProviderGateway<U: UsageSinkTrait> {
    openrouter: OpenRouterAdapter,
    usage_sink: Arc<U>,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let openrouter = OpenRouterAdapter::from_env()?;
        Ok(Self {
            openrouter,
            usage_sink,
        })
    }

    pub fn new(openrouter: OpenRouterAdapter, usage_sink: Arc<U>) -> Self {
        Self {
            openrouter,
            usage_sink,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        match self.openrouter.chat(&req).await {
            Ok(resp) => {
                let record = self
                    .base_record(&req)
                    .tokens(resp.input_tokens as i32, resp.output_tokens as i32)
                    .latency(resp.latency.as_millis() as i32);
                self.usage_sink.record(record).await;
                Ok(resp)
            }
            Err(err) => {
                let record = self.base_record(&req).error(err.code());
                self.usage_sink.record(record).await;
                Err(err)
            }
        }
    }

    fn base_record(&self, req: &ChatRequest) -> ProviderCallRecord {
        ProviderCallRecord::new(
            req.model.provider(),
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .user(req.attribution.user_id)
        .request(req.attribution.request_id)
    }
}
