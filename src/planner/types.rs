//! Wire types for OpenAI-compatible `/chat/completions`, plus the input
//! handed to a plan drafter.

use serde::{Deserialize, Serialize};

use crate::dsl::{AssetLibrary, SceneInventory};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

impl ResponseFormat {
    pub fn json_object() -> Self {
        Self {
            format_type: "json_object".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Seconds from the start of the source clip.
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Everything the model sees when drafting an edit plan.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub inventory: SceneInventory,
    pub transcript: Vec<TranscriptSegment>,
    pub style_prompt: String,
    pub assets: Option<AssetLibrary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_format_type_field_renames_correctly() {
        let json = serde_json::to_string(&ResponseFormat::json_object()).unwrap();
        assert_eq!(json, r#"{"type":"json_object"}"#);
    }

    #[test]
    fn chat_response_deserialize_from_api_format() {
        let api_json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "{\"editing_plan\": {}}"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 15, "total_tokens": 20}
        }"#;
        let resp: ChatResponse = serde_json::from_str(api_json).unwrap();
        assert_eq!(resp.id, "chatcmpl-123");
        assert_eq!(resp.choices[0].message.role, "assistant");
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.unwrap().completion_tokens, 15);
    }

    #[test]
    fn chat_response_without_usage() {
        let resp: ChatResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"role": "assistant", "content": "{}"}}]}"#,
        )
        .unwrap();
        assert!(resp.usage.is_none());
        assert_eq!(resp.choices[0].finish_reason, None);
    }

    #[test]
    fn request_omits_missing_response_format() {
        let req = ChatRequest {
            model: "local".into(),
            messages: vec![ChatMessage::user("hi")],
            response_format: None,
            temperature: 0.7,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("response_format").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
