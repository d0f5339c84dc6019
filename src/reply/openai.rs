//! Chat-completions reply generator.

use crate::config::ReplyConfig;
use crate::error::{RelayError, Result};
use crate::reply::generator::ReplyGenerator;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Sends `[system, user]` to `{base_url}/chat/completions` and returns the
/// first choice.
pub struct OpenAiReplyGenerator {
    client: Client,
    config: ReplyConfig,
}

impl OpenAiReplyGenerator {
    pub fn new(config: ReplyConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RelayError::Generator {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn request<'a>(&'a self, transcript: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.config.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: transcript,
                },
            ],
            temperature: self.config.temperature,
        }
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiReplyGenerator {
    async fn generate(&self, transcript: &str) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RelayError::Generator {
                message: "no reply API key configured (set OPENAI_API_KEY)".to_string(),
            })?;

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&self.request(transcript))
            .send()
            .await
            .map_err(|e| RelayError::Generator {
                message: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(RelayError::Generator {
                message: format!("HTTP {status}: {detail}"),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| RelayError::Generator {
            message: format!("unreadable response: {e}"),
        })?;
        debug!(choices = parsed.choices.len(), "chat completion received");

        extract_reply(parsed)
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

fn extract_reply(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| RelayError::Generator {
            message: "response contained no reply text".to_string(),
        })
}
