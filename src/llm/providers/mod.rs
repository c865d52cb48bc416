//! Concrete [`LlmProvider`](crate::llm::LlmProvider) implementations

pub mod anthropic;

pub use anthropic::*;

use crate::config::LlmSection;
use crate::llm::provider::{LlmError, LlmProvider};
use std::sync::Arc;
use std::time::Duration;

/// Build the provider named in the `[llm]` config section
pub fn create_provider(section: &LlmSection) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match section.provider.to_lowercase().as_str() {
        "anthropic" => {
            let api_key = std::env::var(&section.api_key_env).map_err(|_| {
                LlmError::NotConfigured(format!(
                    "environment variable {} is not set",
                    section.api_key_env
                ))
            })?;

            let mut config = AnthropicConfig {
                api_key,
                timeout: Duration::from_secs(section.timeout_secs),
                ..Default::default()
            };
            if let Some(base_url) = &section.base_url {
                config.base_url = base_url.clone();
            }

            Ok(Arc::new(AnthropicProvider::new(config)?))
        }
        other => Err(LlmError::NotConfigured(format!(
            "unsupported provider: {other}"
        ))),
    }
}
