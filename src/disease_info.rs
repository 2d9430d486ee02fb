use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SYSTEM_PROMPT: &str = "You are a professional medical assistant";

#[derive(Debug, Error)]
pub enum DiseaseInfoError {
    #[error("no API key configured for the disease information service")]
    NotConfigured,
    #[error("request to disease information service failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("disease information service returned {0}")]
    Status(StatusCode),
    #[error("disease information service returned no content")]
    EmptyResponse,
}

/// Free-text information about a diagnosis, keyed only by its label.
#[async_trait]
pub trait DiseaseInfo: Send + Sync {
    async fn describe(&self, disease_name: &str) -> Result<String, DiseaseInfoError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Chat-completions client for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiDiseaseInfo {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiDiseaseInfo {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
            model: model.into(),
        }
    }

    fn request_body<'a>(&'a self, disease_name: &str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt(disease_name),
                },
            ],
            temperature: 0.3,
            max_tokens: 500,
        }
    }
}

fn user_prompt(disease_name: &str) -> String {
    format!(
        "Provide detailed information about {disease_name} including:\n\
         1. Definition\n\
         2. Common Symptoms\n\
         3. Causes\n\
         4. Prevention Methods\n\
         5. Recommended Treatments\n\
         6. When to see a doctor\n\
         Use clear medical terminology and structured format."
    )
}

#[async_trait]
impl DiseaseInfo for OpenAiDiseaseInfo {
    async fn describe(&self, disease_name: &str) -> Result<String, DiseaseInfoError> {
        let api_key = self.api_key.as_deref().ok_or(DiseaseInfoError::NotConfigured)?;
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        tracing::debug!(disease = disease_name, "Requesting disease information");
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&self.request_body(disease_name))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DiseaseInfoError::Status(response.status()));
        }

        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(DiseaseInfoError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_carries_prompt_and_sampling() {
        let client = OpenAiDiseaseInfo::new("https://example.invalid/v1", Some("k".into()), "gpt-4");
        let body = serde_json::to_value(client.request_body("Tuberculosis")).unwrap();

        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["max_tokens"], 500);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], SYSTEM_PROMPT);
        let prompt = body["messages"][1]["content"].as_str().unwrap();
        assert!(prompt.contains("Tuberculosis"));
        assert!(prompt.contains("When to see a doctor"));
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let client = OpenAiDiseaseInfo::new("https://example.invalid/v1", Some(String::new()), "gpt-4");
        assert!(matches!(
            client.describe("Edema").await,
            Err(DiseaseInfoError::NotConfigured)
        ));
    }

    #[test]
    fn reply_without_choices_parses() {
        let body: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(body.choices.is_empty());
    }
}
