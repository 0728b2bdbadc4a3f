use crate::tutor::UpstreamError;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// A text-completion provider. Given a model name and a fully built prompt, returns the
/// model's reply text.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, UpstreamError>;
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        UpstreamError::Request(err.to_string())
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, UpstreamError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<T>().await?)
}

fn non_blank(text: String) -> Result<String, UpstreamError> {
    if text.trim().is_empty() {
        Err(UpstreamError::EmptyReply)
    } else {
        Ok(text)
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiResponse {
    fn into_text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        Some(content.parts.into_iter().filter_map(|part| part.text).collect())
    }
}

/// Google Gemini `generateContent` client.
pub struct GeminiBackend {
    client: Client,
    api_key: SecretString,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl CompletionBackend for GeminiBackend {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, UpstreamError> {
        let body = serde_json::json!({
            "contents": [
                { "parts": [ { "text": prompt } ] }
            ]
        });
        let url = format!("{}/models/{model}:generateContent", self.base_url);
        tracing::debug!(%url, "Requesting Gemini completion.");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;
        let parsed: GeminiResponse = read_json(response).await?;
        non_blank(parsed.into_text().ok_or(UpstreamError::EmptyReply)?)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// OpenAI chat completions client.
pub struct OpenAiBackend {
    client: Client,
    api_key: SecretString,
    base_url: String,
}

impl OpenAiBackend {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: OPENAI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, UpstreamError> {
        let body = serde_json::json!({
            "model": model,
            "messages": [
                { "role": "user", "content": prompt }
            ]
        });
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(%url, "Requesting OpenAI completion.");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;
        let parsed: ChatResponse = read_json(response).await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(UpstreamError::EmptyReply)?;
        non_blank(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn gemini_reply_joins_all_parts_of_first_candidate() {
        let parsed: GeminiResponse = serde_json::from_value(serde_json::json!({
            "candidates": [
                { "content": { "parts": [ { "text": "Inertia is " }, { "text": "resistance." } ] } },
                { "content": { "parts": [ { "text": "ignored" } ] } }
            ]
        }))
        .unwrap();
        assert_eq!(parsed.into_text().as_deref(), Some("Inertia is resistance."));
    }

    #[test]
    fn gemini_reply_without_candidates_is_empty() {
        let parsed: GeminiResponse =
            serde_json::from_value(serde_json::json!({ "promptFeedback": {} })).unwrap();
        assert_eq!(parsed.into_text(), None);
    }

    #[test]
    fn blank_text_is_an_empty_reply() {
        assert_eq!(non_blank("  \n".to_string()), Err(UpstreamError::EmptyReply));
        assert_eq!(non_blank("ok".to_string()), Ok("ok".to_string()));
    }

    #[test]
    fn base_url_override_drops_trailing_slash() {
        let backend = OpenAiBackend::new(SecretString::from("key".to_string())).with_base_url("http://localhost:8080/v1/");
        assert_eq!(backend.base_url, "http://localhost:8080/v1");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_request_error() {
        let backend =
            GeminiBackend::new(SecretString::from("key".to_string())).with_base_url("http://127.0.0.1:9");
        let result = backend.complete("gemini-1.5-flash", "hello").await;
        assert!(matches!(result, Err(UpstreamError::Request(_))));
    }

    #[tokio::test]
    #[ignore]
    async fn test_gemini_live_completion() {
        dotenvy::dotenv_override().ok();
        let api_key = env::var("GEMINI_API_KEY").expect("GEMINI_API_KEY not set");
        let backend = GeminiBackend::new(SecretString::from(api_key));

        let reply = backend
            .complete("gemini-1.5-flash", "Reply with the single word: ready")
            .await
            .expect("Gemini request failed");
        println!("Gemini replied: {reply}");
        assert!(!reply.trim().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_openai_live_completion() {
        dotenvy::dotenv_override().ok();
        let api_key = env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY not set");
        let backend = OpenAiBackend::new(SecretString::from(api_key));

        let reply = backend
            .complete("gpt-4o", "Reply with the single word: ready")
            .await
            .expect("OpenAI request failed");
        println!("OpenAI replied: {reply}");
        assert!(!reply.trim().is_empty());
    }
}
