//! services/api/src/adapters/text_llm.rs
//!
//! This module contains the adapter for the language backend used by the story
//! planner, the story formatter, the scene describer and prompt refinement.
//! It implements the `TextGenerationService` port from the `core` crate.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use storybook_core::{
    domain::{PromptMessage, PromptRole},
    ports::{PortError, PortResult, TextGenerationService},
};
use tracing::debug;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `TextGenerationService` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiTextAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiTextAdapter {
    /// Creates a new `OpenAiTextAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }
}

fn to_request_message(message: &PromptMessage) -> PortResult<ChatCompletionRequestMessage> {
    let content = message.content.clone();
    let built: Result<ChatCompletionRequestMessage, OpenAIError> = match message.role {
        PromptRole::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()
            .map(Into::into),
        PromptRole::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map(Into::into),
        PromptRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()
            .map(Into::into),
    };
    built.map_err(|e| PortError::Unexpected(e.to_string()))
}

//=========================================================================================
// `TextGenerationService` Trait Implementation
//=========================================================================================

#[async_trait]
impl TextGenerationService for OpenAiTextAdapter {
    async fn generate(&self, messages: &[PromptMessage], temperature: f32) -> PortResult<String> {
        let messages = messages
            .iter()
            .map(to_request_message)
            .collect::<PortResult<Vec<_>>>()?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(temperature)
            .n(1)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e: OpenAIError| PortError::Upstream(e.to_string()))?;

        if let Some(usage) = &response.usage {
            debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Chat completion finished"
            );
        }

        match response.choices.into_iter().next() {
            Some(choice) => choice.message.content.ok_or_else(|| {
                PortError::Upstream("Language model response contained no text content.".to_string())
            }),
            None => Err(PortError::Upstream(
                "Language model returned no choices in its response.".to_string(),
            )),
        }
    }
}
