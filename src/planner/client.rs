use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use super::PlanDrafter;
use super::error::PlannerError;
use super::prompt::{system_prompt, user_content};
use super::types::{ChatMessage, ChatRequest, ChatResponse, PlanRequest, ResponseFormat};
use crate::config::PlannerConfig;

/// Drafts edit plans through an OpenAI-compatible chat completions API.
pub struct ChatPlanner {
    api_key: String,
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl ChatPlanner {
    pub fn new(config: &PlannerConfig) -> Result<Self, PlannerError> {
        if config.api_key.is_empty() {
            return Err(PlannerError::MissingApiKey);
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            api_key: config.api_key.clone(),
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    pub async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, PlannerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(PlannerError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(PlannerError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<ChatResponse>().await?)
    }
}

impl PlanDrafter for ChatPlanner {
    async fn draft(&self, request: &PlanRequest) -> Result<Value, PlannerError> {
        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(system_prompt(request.assets.as_ref())),
                ChatMessage::user(user_content(request)),
            ],
            response_format: Some(ResponseFormat::json_object()),
            temperature: self.temperature,
        };
        debug!(model = %self.model, scenes = request.inventory.len(), "requesting edit plan");

        let response = self.complete(&req).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or(PlannerError::EmptyResponse)?;
        let plan: Value =
            serde_json::from_str(&choice.message.content).map_err(PlannerError::InvalidJson)?;
        if !plan.is_object() {
            return Err(PlannerError::InvalidJson(serde::de::Error::custom(
                "expected a JSON object",
            )));
        }
        info!(model = %response.model, "edit plan drafted");
        Ok(plan)
    }
}
