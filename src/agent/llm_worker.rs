//! Agent worker backed by a reasoning provider

use crate::agent::confidence::extract_confidence;
use crate::agent::structured::{parse_structured_response, ResponseSchema};
use crate::agent::task::{AgentContext, ProcessOutput};
use crate::agent::worker::AgentWorker;
use crate::config::AgentSection;
use crate::error::AgentError;
use crate::llm::provider::{CompletionRequest, LlmProvider, Message, ResponseFormat};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Sends the task input, plus earlier stage results, to a provider and turns
/// the reply into a confidence-scored output
pub struct LlmWorker {
    agent_type: String,
    provider: Arc<dyn LlmProvider>,
    model: String,
    instructions: String,
    schema: Option<ResponseSchema>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl LlmWorker {
    pub fn new(
        agent_type: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            provider,
            model: model.into(),
            instructions: String::new(),
            schema: None,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Worker for an `[agents.<type>]` table; the agent's own model wins over
    /// `default_model`
    pub fn from_section(
        agent_type: impl Into<String>,
        section: &AgentSection,
        provider: Arc<dyn LlmProvider>,
        default_model: &str,
    ) -> Self {
        let config = &section.configuration;
        let mut worker = Self::new(
            agent_type,
            provider,
            config.model.as_deref().unwrap_or(default_model),
        )
        .with_instructions(section.instructions.clone());
        worker.schema = section.response_schema.clone();
        worker.temperature = config.temperature;
        worker.max_tokens = config.max_tokens;
        worker
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_schema(mut self, schema: ResponseSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    fn system_prompt(&self) -> String {
        let mut prompt = if self.instructions.is_empty() {
            format!("You are the {} agent in an email processing pipeline.", self.agent_type)
        } else {
            self.instructions.clone()
        };

        match &self.schema {
            Some(schema) if !schema.is_empty() => {
                prompt.push_str(&format!(
                    "\n\nReply with a JSON object with these fields: {{{}}}. \
                     Include a \"confidence\" between 0 and 1 if you can.",
                    schema.describe()
                ));
            }
            _ => prompt.push_str(
                "\n\nState how confident you are, for example \"I am 80% confident\".",
            ),
        }
        prompt
    }

    fn user_prompt(&self, input: &Value, context: &AgentContext) -> String {
        let mut prompt = format!(
            "Email:\n{}",
            serde_json::to_string_pretty(input).unwrap_or_else(|_| input.to_string())
        );

        let earlier: Map<String, Value> = context
            .previous_results
            .iter()
            .filter(|(_, result)| result.is_success())
            .map(|(key, result)| {
                (
                    key.clone(),
                    json!({ "confidence": result.confidence, "data": result.data }),
                )
            })
            .collect();
        if !earlier.is_empty() {
            prompt.push_str(&format!(
                "\n\nResults from earlier stages:\n{}",
                Value::Object(earlier)
            ));
        }
        prompt
    }

    fn build_request(&self, input: &Value, context: &AgentContext) -> CompletionRequest {
        let mut request = CompletionRequest::new(
            self.model.clone(),
            vec![
                Message::system(self.system_prompt()),
                Message::user(self.user_prompt(input, context)),
            ],
        );
        request.max_tokens = Some(self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS));
        request.temperature = self.temperature;
        if self.schema.is_some() {
            request.response_format = Some(ResponseFormat::Json);
        }
        request
            .metadata
            .insert("execution_id".to_string(), context.execution_id.to_string());
        request
            .metadata
            .insert("stage_id".to_string(), context.stage_id.clone());
        request
    }

    fn interpret(&self, text: &str) -> (f64, Value) {
        let Some(schema) = &self.schema else {
            return (extract_confidence(text), json!({ "text": text }));
        };

        let parsed = parse_structured_response(text, schema);
        let confidence = parsed
            .get("confidence")
            .and_then(Value::as_f64)
            .map(|c| if c > 1.0 && c <= 100.0 { c / 100.0 } else { c })
            .unwrap_or_else(|| extract_confidence(text));
        (confidence, Value::Object(parsed))
    }
}

#[async_trait]
impl AgentWorker for LlmWorker {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn model_name(&self) -> Option<String> {
        Some(self.model.clone())
    }

    fn validate_input(&self, input: &Value) -> Result<(), AgentError> {
        match input {
            Value::Object(map) if !map.is_empty() => Ok(()),
            Value::Object(_) => Err(AgentError::validation("agent input is an empty object")),
            _ => Err(AgentError::validation("agent input must be a JSON object")),
        }
    }

    async fn process(
        &self,
        input: &Value,
        context: &AgentContext,
        cancel: CancellationToken,
    ) -> Result<ProcessOutput, AgentError> {
        let request = self.build_request(input, context);
        debug!(
            agent_type = %self.agent_type,
            provider = self.provider.name(),
            model = %self.model,
            "Sending completion request"
        );

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            response = self.provider.complete(request) => response?,
        };

        let text = response.content.unwrap_or_default();
        if text.trim().is_empty() {
            return Err(AgentError::execution_failed("provider returned an empty response"));
        }

        let (confidence, data) = self.interpret(&text);
        Ok(ProcessOutput::new(confidence, data, text)
            .with_metadata("provider", json!(self.provider.name()))
            .with_metadata("prompt_tokens", json!(response.usage.prompt_tokens))
            .with_metadata("completion_tokens", json!(response.usage.completion_tokens))
            .with_metadata("finish_reason", json!(response.finish_reason)))
    }

    async fn health_check(&self) -> Result<(), AgentError> {
        self.provider.health_check().await.map_err(AgentError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::structured::FieldType;
    use crate::agent::task::{AgentResult, AgentStatus};
    use crate::email::Email;
    use crate::llm::provider::MessageRole;
    use crate::testing::mocks::MockLlmProvider;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn context() -> AgentContext {
        let email = Email::new("msg-1", "alice@example.com", "Invoice", "Please pay");
        AgentContext::new(Uuid::new_v4(), "triage", Arc::new(email))
    }

    fn input() -> Value {
        json!({"subject": "Invoice", "body": "Please pay"})
    }

    #[tokio::test]
    async fn test_free_text_uses_confidence_heuristic() {
        let provider = Arc::new(MockLlmProvider::single_response(
            "This is billing. I am 85% confident.",
        ));
        let worker = LlmWorker::new("classifier", provider, "mock-model");

        let output = worker
            .process(&input(), &context(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.confidence, 0.85);
        assert_eq!(output.data["text"], "This is billing. I am 85% confident.");
        assert_eq!(output.metadata["prompt_tokens"], json!(10));
    }

    #[tokio::test]
    async fn test_schema_response_is_parsed() {
        let provider = Arc::new(MockLlmProvider::single_response(
            r#"Sure: {"category": "billing", "confidence": 0.7}"#,
        ));
        let schema = ResponseSchema::new()
            .with_field("category", FieldType::String)
            .with_field("confidence", FieldType::Number);
        let worker =
            LlmWorker::new("classifier", provider.clone(), "mock-model").with_schema(schema);

        let output = worker
            .process(&input(), &context(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.confidence, 0.7);
        assert_eq!(output.data["category"], "billing");
        let requests = provider.recorded_requests().await;
        assert_eq!(requests[0].response_format, Some(ResponseFormat::Json));
    }

    #[tokio::test]
    async fn test_previous_results_reach_the_prompt() {
        let provider = Arc::new(MockLlmProvider::single_response("ok"));
        let worker = LlmWorker::new("router", provider.clone(), "mock-model");

        let mut previous = BTreeMap::new();
        let mut triage = AgentResult::failure("c-1", "classifier", "", 1);
        triage.status = AgentStatus::Success;
        triage.confidence = 0.9;
        triage.data = json!({"category": "billing"});
        previous.insert("triage:classifier".to_string(), triage);
        let context = context().with_previous_results(previous);

        worker
            .process(&input(), &context, CancellationToken::new())
            .await
            .unwrap();

        let requests = provider.recorded_requests().await;
        let user = &requests[0].messages[1];
        assert_eq!(user.role, MessageRole::User);
        assert!(user.content.contains("triage:classifier"));
        assert!(user.content.contains("billing"));
    }

    #[tokio::test]
    async fn test_provider_error_becomes_agent_error() {
        let worker = LlmWorker::new("classifier", Arc::new(MockLlmProvider::with_failure()), "m");
        let error = worker
            .process(&input(), &context(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, AgentError::Llm(_)));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_the_call() {
        let provider = Arc::new(
            MockLlmProvider::single_response("late").with_delay(std::time::Duration::from_secs(5)),
        );
        let worker = LlmWorker::new("classifier", provider, "m");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = worker.process(&input(), &context(), cancel).await.unwrap_err();
        assert!(matches!(error, AgentError::Cancelled));
    }

    #[test]
    fn test_non_object_input_rejected() {
        let worker = LlmWorker::new("classifier", Arc::new(MockLlmProvider::new(vec![])), "m");
        assert!(worker.validate_input(&json!("text")).is_err());
        assert!(worker.validate_input(&json!({})).is_err());
        assert!(worker.validate_input(&input()).is_ok());
    }
}
