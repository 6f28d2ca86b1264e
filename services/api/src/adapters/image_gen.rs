//! services/api/src/adapters/image_gen.rs
//!
//! This module contains the adapter for the text-to-image backend. It speaks the
//! Stability-style `text-to-image` JSON protocol over `reqwest` and implements
//! the `ImageGenerationService` port from the `core` crate.

use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use storybook_core::{
    domain::SamplerParams,
    ports::{ImageGenerationService, PortError, PortResult},
};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

//=========================================================================================
// Wire Types
//=========================================================================================

#[derive(Serialize)]
struct TextPrompt<'a> {
    text: &'a str,
    weight: f32,
}

#[derive(Serialize)]
struct TextToImageRequest<'a> {
    text_prompts: Vec<TextPrompt<'a>>,
    cfg_scale: f32,
    height: u32,
    width: u32,
    samples: u32,
    steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

impl<'a> TextToImageRequest<'a> {
    fn new(prompt: &'a str, params: &'a SamplerParams) -> Self {
        let mut text_prompts = vec![TextPrompt {
            text: prompt,
            weight: 1.0,
        }];
        if let Some(negative) = params.negative_prompt.as_deref() {
            text_prompts.push(TextPrompt {
                text: negative,
                weight: -1.0,
            });
        }
        Self {
            text_prompts,
            cfg_scale: params.cfg_scale,
            height: params.height,
            width: params.width,
            samples: 1,
            steps: params.steps,
            seed: params.seed,
        }
    }
}

#[derive(Deserialize)]
struct Artifact {
    base64: String,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct TextToImageResponse {
    artifacts: Vec<Artifact>,
}

/// Extracts the PNG bytes of the first artifact.
fn decode_first_artifact(response: TextToImageResponse) -> PortResult<Bytes> {
    let artifact = response
        .artifacts
        .into_iter()
        .next()
        .ok_or_else(|| PortError::Upstream("Image backend returned no artifacts.".to_string()))?;

    if let Some(reason) = artifact.finish_reason.as_deref() {
        if reason != "SUCCESS" {
            return Err(PortError::Upstream(format!(
                "Image backend finished with {}",
                reason
            )));
        }
    }

    general_purpose::STANDARD
        .decode(artifact.base64)
        .map(Bytes::from)
        .map_err(|e| PortError::Upstream(format!("Failed to base64-decode image: {}", e)))
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `ImageGenerationService` over HTTP.
#[derive(Clone)]
pub struct HttpImageAdapter {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpImageAdapter {
    /// Creates a new `HttpImageAdapter` posting to `endpoint`.
    pub fn new(endpoint: String, api_key: Option<String>) -> PortResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

//=========================================================================================
// `ImageGenerationService` Trait Implementation
//=========================================================================================

#[async_trait]
impl ImageGenerationService for HttpImageAdapter {
    async fn generate(&self, prompt: &str, params: &SamplerParams) -> PortResult<Bytes> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&TextToImageRequest::new(prompt, params));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PortError::Upstream(format!("Image request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PortError::Upstream(format!(
                "Image backend error: HTTP {} {}",
                status, detail
            )));
        }

        let body: TextToImageResponse = response
            .json()
            .await
            .map_err(|e| PortError::Upstream(format!("Image response parse error: {}", e)))?;
        let bytes = decode_first_artifact(body)?;
        debug!(size = bytes.len(), "Image generated");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_sampler_settings_and_negative_prompt() {
        let params = SamplerParams {
            negative_prompt: Some("text, watermark".to_string()),
            seed: Some(7),
            ..SamplerParams::default()
        };
        let json = serde_json::to_value(TextToImageRequest::new("a fox", &params)).unwrap();
        assert_eq!(json["width"], 1024);
        assert_eq!(json["steps"], 30);
        assert_eq!(json["samples"], 1);
        assert_eq!(json["seed"], 7);
        assert_eq!(json["text_prompts"][0]["text"], "a fox");
        assert_eq!(json["text_prompts"][1]["weight"], -1.0);
    }

    #[test]
    fn first_artifact_is_decoded() {
        let body: TextToImageResponse = serde_json::from_value(serde_json::json!({
            "artifacts": [{ "base64": general_purpose::STANDARD.encode(b"png"), "finishReason": "SUCCESS" }]
        }))
        .unwrap();
        assert_eq!(decode_first_artifact(body).unwrap(), Bytes::from_static(b"png"));
    }

    #[test]
    fn filtered_or_missing_artifacts_are_upstream_errors() {
        let filtered: TextToImageResponse = serde_json::from_value(serde_json::json!({
            "artifacts": [{ "base64": "", "finishReason": "CONTENT_FILTERED" }]
        }))
        .unwrap();
        assert!(matches!(decode_first_artifact(filtered), Err(PortError::Upstream(_))));

        let empty = TextToImageResponse { artifacts: vec![] };
        assert!(matches!(decode_first_artifact(empty), Err(PortError::Upstream(_))));
    }
}
